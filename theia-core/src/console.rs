//! Coloured status lines for the terminal.
//!
//! Training status goes to stdout in colour so it stands apart from the
//! progress bar and from `tracing` output on stderr.

use crossterm::style::{StyledContent, Stylize};

/// Kind of status line, each with its own colour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Object construction finished (dark green).
    Created,
    /// Operation succeeded (green).
    Success,
    /// Neutral notice about how the run is set up (dark yellow).
    Info,
    /// Configuration that probably isn't what the user wants (yellow).
    Warning,
}

/// Apply the colour for `status` to `message`.
pub fn styled(status: Status, message: &str) -> StyledContent<&str> {
    match status {
        Status::Created => message.dark_green(),
        Status::Success => message.green(),
        Status::Info => message.dark_yellow(),
        Status::Warning => message.yellow(),
    }
}

/// Print a coloured status line to stdout.
pub fn print(status: Status, message: impl AsRef<str>) {
    println!("{}", styled(status, message.as_ref()));
}

pub fn created(message: impl AsRef<str>) {
    print(Status::Created, message);
}

pub fn success(message: impl AsRef<str>) {
    print(Status::Success, message);
}

pub fn info(message: impl AsRef<str>) {
    print(Status::Info, message);
}

/// Print a warning prefixed with `WARNING: `.
pub fn warn(message: impl AsRef<str>) {
    print(Status::Warning, format!("WARNING: {}", message.as_ref()));
}
