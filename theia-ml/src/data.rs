//! In-memory image datasets and batching.
//!
//! Images are stored as f32 scaled to `[0, 1]`, labels as class indices.
//! MNIST-style IDX files can be read directly.

use crate::error::{MlError, Result};
use candle_core::{Device, Tensor};
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use std::path::Path;

/// IDX type code for unsigned bytes.
const IDX_UBYTE: u8 = 0x08;

/// Which MNIST file pair to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Split {
    Train,
    Test,
}

impl Split {
    fn prefix(self) -> &'static str {
        match self {
            Self::Train => "train",
            Self::Test => "t10k",
        }
    }
}

/// A labelled image dataset held in memory.
#[derive(Debug, Clone)]
pub struct Dataset {
    images: Vec<f32>,
    labels: Vec<u32>,
    sample_shape: Vec<usize>,
}

/// One batch ready for the network.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[batch, ..sample_shape]`, f32.
    pub images: Tensor,
    /// `[batch]`, u32.
    pub labels: Tensor,
}

impl Dataset {
    pub fn new(images: Vec<f32>, labels: Vec<u32>, sample_shape: Vec<usize>) -> Result<Self> {
        let sample_len: usize = sample_shape.iter().product();
        if sample_len == 0 {
            return Err(MlError::dataset("sample shape must have positive dimensions"));
        }
        if images.len() != labels.len() * sample_len {
            return Err(MlError::dataset(format!(
                "{} image values do not fit {} samples of shape {sample_shape:?}",
                images.len(),
                labels.len()
            )));
        }
        Ok(Self {
            images,
            labels,
            sample_shape,
        })
    }

    /// Load an IDX image file and its IDX label file.
    pub fn from_idx(images_path: &Path, labels_path: &Path) -> Result<Self> {
        let (sample_shape, images) = load_idx_images(images_path)?;
        let labels = load_idx_labels(labels_path)?;
        let sample_len: usize = sample_shape.iter().product();
        if images.len() != labels.len() * sample_len {
            return Err(MlError::dataset(format!(
                "{} images but {} labels",
                images.len() / sample_len.max(1),
                labels.len()
            )));
        }
        Self::new(images, labels, sample_shape)
    }

    /// Load the standard MNIST file pair from `dir`, e.g.
    /// `train-images-idx3-ubyte` and `train-labels-idx1-ubyte`.
    pub fn mnist(dir: &Path, split: Split) -> Result<Self> {
        let prefix = split.prefix();
        let images = dir.join(format!("{prefix}-images-idx3-ubyte"));
        let labels = dir.join(format!("{prefix}-labels-idx1-ubyte"));
        for path in [&images, &labels] {
            if !path.exists() {
                return Err(MlError::not_found(format!("{}", path.display())));
            }
        }
        let dataset = Self::from_idx(&images, &labels)?;
        tracing::info!(split = prefix, samples = dataset.len(), "Loaded MNIST");
        Ok(dataset)
    }

    /// Reinterpret every sample with a new shape holding the same number of
    /// values, e.g. `[28, 28]` as `[28, 28, 1]`.
    pub fn with_sample_shape(mut self, shape: &[usize]) -> Result<Self> {
        let len: usize = shape.iter().product();
        if len != self.sample_len() {
            return Err(MlError::dataset(format!(
                "cannot view samples of shape {:?} as {shape:?}",
                self.sample_shape
            )));
        }
        self.sample_shape = shape.to_vec();
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn sample_shape(&self) -> &[usize] {
        &self.sample_shape
    }

    pub fn sample_len(&self) -> usize {
        self.sample_shape.iter().product()
    }

    pub fn labels(&self) -> &[u32] {
        &self.labels
    }

    /// Batches per pass, counting a trailing partial batch.
    pub fn num_batches(&self, batch_size: usize) -> usize {
        self.len().div_ceil(batch_size.max(1))
    }

    /// Keep only the first `n` samples.
    pub fn take(mut self, n: usize) -> Self {
        let n = n.min(self.len());
        self.images.truncate(n * self.sample_len());
        self.labels.truncate(n);
        self
    }

    /// Split off the last `fraction` of samples as a validation set.
    pub fn split(mut self, fraction: f64) -> Result<(Self, Self)> {
        if !(0.0..1.0).contains(&fraction) || fraction == 0.0 {
            return Err(MlError::invalid_input(format!(
                "validation fraction {fraction} must be in (0, 1)"
            )));
        }
        let held_out = ((self.len() as f64) * fraction).round() as usize;
        let keep = self.len() - held_out;
        let sample_len = self.sample_len();

        let val_images = self.images.split_off(keep * sample_len);
        let val_labels = self.labels.split_off(keep);
        let validation = Self {
            images: val_images,
            labels: val_labels,
            sample_shape: self.sample_shape.clone(),
        };
        Ok((self, validation))
    }

    /// All images as one `[n, ..sample_shape]` tensor.
    pub fn images_tensor(&self, device: &Device) -> Result<Tensor> {
        let mut shape = vec![self.len()];
        shape.extend_from_slice(&self.sample_shape);
        Ok(Tensor::from_slice(&self.images, shape, device)?)
    }

    /// Iterate over batches, shuffled when a seed is given.
    pub fn batches<'a>(
        &'a self,
        batch_size: usize,
        shuffle_seed: Option<u64>,
        device: &'a Device,
    ) -> Batches<'a> {
        let mut order: Vec<usize> = (0..self.len()).collect();
        if let Some(seed) = shuffle_seed {
            order.shuffle(&mut StdRng::seed_from_u64(seed));
        }
        Batches {
            dataset: self,
            order,
            batch_size: batch_size.max(1),
            position: 0,
            device,
        }
    }

    fn gather(&self, indices: &[usize], device: &Device) -> Result<Batch> {
        let sample_len = self.sample_len();
        let mut images = Vec::with_capacity(indices.len() * sample_len);
        let mut labels = Vec::with_capacity(indices.len());
        for &index in indices {
            images.extend_from_slice(&self.images[index * sample_len..(index + 1) * sample_len]);
            labels.push(self.labels[index]);
        }

        let mut shape = vec![indices.len()];
        shape.extend_from_slice(&self.sample_shape);
        Ok(Batch {
            images: Tensor::from_vec(images, shape, device)?,
            labels: Tensor::from_vec(labels, indices.len(), device)?,
        })
    }
}

/// Iterator over the batches of a [`Dataset`].
pub struct Batches<'a> {
    dataset: &'a Dataset,
    order: Vec<usize>,
    batch_size: usize,
    position: usize,
    device: &'a Device,
}

impl Iterator for Batches<'_> {
    type Item = Result<Batch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.position >= self.order.len() {
            return None;
        }
        let end = (self.position + self.batch_size).min(self.order.len());
        let batch = self
            .dataset
            .gather(&self.order[self.position..end], self.device);
        self.position = end;
        Some(batch)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.order.len() - self.position).div_ceil(self.batch_size);
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Batches<'_> {}

/// Read an IDX image file (`[n, rows, cols]` or deeper) as pixels scaled to
/// `[0, 1]`. Returns the shape of one sample and the flat pixel data.
pub fn load_idx_images(path: &Path) -> Result<(Vec<usize>, Vec<f32>)> {
    let (dims, pixels) = read_idx(path)?;
    if dims.len() < 2 {
        return Err(MlError::dataset(format!(
            "{}: expected an image file, found rank {}",
            path.display(),
            dims.len()
        )));
    }
    let images = pixels.into_iter().map(|p| f32::from(p) / 255.0).collect();
    Ok((dims[1..].to_vec(), images))
}

/// Read an IDX label file as class indices.
pub fn load_idx_labels(path: &Path) -> Result<Vec<u32>> {
    let (dims, labels) = read_idx(path)?;
    if dims.len() != 1 {
        return Err(MlError::dataset(format!(
            "{}: expected a label file, found rank {}",
            path.display(),
            dims.len()
        )));
    }
    Ok(labels.into_iter().map(u32::from).collect())
}

/// Parse an unsigned-byte IDX file into its dimensions and payload.
pub fn read_idx(path: &Path) -> Result<(Vec<usize>, Vec<u8>)> {
    let bytes = std::fs::read(path)?;
    parse_idx(&bytes).map_err(|e| match e {
        MlError::Dataset(msg) => MlError::dataset(format!("{}: {msg}", path.display())),
        other => other,
    })
}

/// Parse IDX bytes: two zero bytes, a type code, the rank, big-endian u32
/// dimensions, then the data.
pub fn parse_idx(bytes: &[u8]) -> Result<(Vec<usize>, Vec<u8>)> {
    if bytes.len() < 4 || bytes[0] != 0 || bytes[1] != 0 {
        return Err(MlError::dataset("not an IDX file"));
    }
    if bytes[2] != IDX_UBYTE {
        return Err(MlError::dataset(format!(
            "unsupported IDX element type 0x{:02x}",
            bytes[2]
        )));
    }

    let rank = bytes[3] as usize;
    let header_len = 4 + rank * 4;
    if bytes.len() < header_len {
        return Err(MlError::dataset("truncated IDX header"));
    }
    let dims: Vec<usize> = bytes[4..header_len]
        .chunks_exact(4)
        .map(|chunk| u32::from_be_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]) as usize)
        .collect();

    let expected = dims
        .iter()
        .try_fold(1usize, |acc, &dim| acc.checked_mul(dim))
        .ok_or_else(|| MlError::dataset("IDX dimensions overflow"))?;
    let payload = &bytes[header_len..];
    if payload.len() != expected {
        return Err(MlError::dataset(format!(
            "IDX payload has {} bytes, header declares {expected}",
            payload.len()
        )));
    }
    Ok((dims, payload.to_vec()))
}

/// Encode an unsigned-byte IDX file. Inverse of [`parse_idx`].
pub fn encode_idx(dims: &[usize], data: &[u8]) -> Vec<u8> {
    let mut bytes = vec![0, 0, IDX_UBYTE, dims.len() as u8];
    for &dim in dims {
        bytes.extend_from_slice(&(dim as u32).to_be_bytes());
    }
    bytes.extend_from_slice(data);
    bytes
}
