use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{Array, ArrayD, Dimension, IxDyn};
use safetensors::tensor::TensorView;
use safetensors::{serialize, Dtype, SafeTensors};

use crate::error::{FitError, Result};

/// An owned tensor payload held in an [`Artifact`].
///
/// Bytes are kept in the on-disk encoding so a read-merge-rewrite cycle never
/// re-encodes entries it does not touch.
#[derive(Debug, Clone, PartialEq)]
pub struct Tensor {
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Tensor {
    pub fn from_f64<D: Dimension>(array: &Array<f64, D>) -> Self {
        let values: Vec<f64> = array.iter().copied().collect();
        Self {
            dtype: Dtype::F64,
            shape: array.shape().to_vec(),
            bytes: bytemuck::cast_slice(&values).to_vec(),
        }
    }

    pub fn from_u32<D: Dimension>(array: &Array<u32, D>) -> Self {
        let values: Vec<u32> = array.iter().copied().collect();
        Self {
            dtype: Dtype::U32,
            shape: array.shape().to_vec(),
            bytes: bytemuck::cast_slice(&values).to_vec(),
        }
    }

    pub fn scalar_f64(value: f64) -> Self {
        Self {
            dtype: Dtype::F64,
            shape: Vec::new(),
            bytes: bytemuck::cast_slice(&[value]).to_vec(),
        }
    }

    pub fn scalar_i64(value: i64) -> Self {
        Self {
            dtype: Dtype::I64,
            shape: Vec::new(),
            bytes: bytemuck::cast_slice(&[value]).to_vec(),
        }
    }

    pub fn scalar_u64(value: u64) -> Self {
        Self {
            dtype: Dtype::U64,
            shape: Vec::new(),
            bytes: bytemuck::cast_slice(&[value]).to_vec(),
        }
    }

    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Decodes the payload as a float array of any rank.
    pub fn to_f64(&self, key: &str) -> Result<ArrayD<f64>> {
        self.expect(key, Dtype::F64)?;
        let count = self.element_count(key, std::mem::size_of::<f64>())?;
        let mut values = vec![0f64; count];
        bytemuck::cast_slice_mut::<f64, u8>(&mut values).copy_from_slice(&self.bytes);
        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|e| FitError::BadArtifact {
            key: key.to_string(),
            detail: e.to_string(),
        })
    }

    pub fn to_u32(&self, key: &str) -> Result<ArrayD<u32>> {
        self.expect(key, Dtype::U32)?;
        let count = self.element_count(key, std::mem::size_of::<u32>())?;
        let mut values = vec![0u32; count];
        bytemuck::cast_slice_mut::<u32, u8>(&mut values).copy_from_slice(&self.bytes);
        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|e| FitError::BadArtifact {
            key: key.to_string(),
            detail: e.to_string(),
        })
    }

    pub fn as_scalar_f64(&self, key: &str) -> Result<f64> {
        self.expect_scalar(key, Dtype::F64)?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes))
    }

    pub fn as_scalar_i64(&self, key: &str) -> Result<i64> {
        self.expect_scalar(key, Dtype::I64)?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes))
    }

    pub fn as_scalar_u64(&self, key: &str) -> Result<u64> {
        self.expect_scalar(key, Dtype::U64)?;
        Ok(bytemuck::pod_read_unaligned(&self.bytes))
    }

    fn expect(&self, key: &str, dtype: Dtype) -> Result<()> {
        if self.dtype != dtype {
            return Err(FitError::BadArtifact {
                key: key.to_string(),
                detail: format!("dtype is {:?}, expected {:?}", self.dtype, dtype),
            });
        }
        Ok(())
    }

    fn expect_scalar(&self, key: &str, dtype: Dtype) -> Result<()> {
        self.expect(key, dtype)?;
        if !self.shape.is_empty() {
            return Err(FitError::BadArtifact {
                key: key.to_string(),
                detail: format!("shape is {:?}, expected a rank-0 scalar", self.shape),
            });
        }
        Ok(())
    }

    fn element_count(&self, key: &str, elem_size: usize) -> Result<usize> {
        let count: usize = self.shape.iter().product();
        if self.bytes.len() != count * elem_size {
            return Err(FitError::BadArtifact {
                key: key.to_string(),
                detail: format!(
                    "payload holds {} bytes, shape {:?} needs {}",
                    self.bytes.len(),
                    self.shape,
                    count * elem_size
                ),
            });
        }
        Ok(count)
    }
}

/// In-memory image of one safetensors file.
///
/// Tensor names use `/` as a path separator to form a hierarchy inside the
/// flat name space, and free-form string annotations ride along in the file
/// header. Writing replaces the file atomically: the payload goes to a
/// sibling temp file first and is renamed over the destination, so a crash
/// mid-write never leaves a half-written artifact behind.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Artifact {
    tensors: BTreeMap<String, Tensor>,
    annotations: BTreeMap<String, String>,
}

impl Artifact {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a whole artifact from disk.
    pub fn read(path: &Path) -> Result<Self> {
        let buffer = fs::read(path)?;

        let mut annotations = BTreeMap::new();
        let (_, header) = SafeTensors::read_metadata(&buffer)?;
        if let Some(info) = header.metadata() {
            for (key, value) in info {
                annotations.insert(key.clone(), value.clone());
            }
        }

        let parsed = SafeTensors::deserialize(&buffer)?;
        let mut tensors = BTreeMap::new();
        for (name, view) in parsed.tensors() {
            tensors.insert(
                name,
                Tensor {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                    bytes: view.data().to_vec(),
                },
            );
        }

        Ok(Self {
            tensors,
            annotations,
        })
    }

    /// Serializes every entry and atomically replaces the file at `path`.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut views = Vec::with_capacity(self.tensors.len());
        for (name, tensor) in &self.tensors {
            let view = TensorView::new(tensor.dtype, tensor.shape.clone(), &tensor.bytes)?;
            views.push((name.as_str(), view));
        }

        let data_info = if self.annotations.is_empty() {
            None
        } else {
            Some(
                self.annotations
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect::<HashMap<_, _>>(),
            )
        };

        let payload = serialize(views, &data_info)?;
        let tmp = temp_sibling(path);
        fs::write(&tmp, payload)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn insert(&mut self, key: impl Into<String>, tensor: Tensor) {
        self.tensors.insert(key.into(), tensor);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.tensors.get(key)
    }

    /// Like [`get`](Self::get) but a missing key is an error.
    pub fn require(&self, key: &str) -> Result<&Tensor> {
        self.tensors.get(key).ok_or_else(|| FitError::BadArtifact {
            key: key.to_string(),
            detail: "missing".to_string(),
        })
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.tensors.keys().map(String::as_str)
    }

    /// Full names of every entry nested under `prefix/`.
    pub fn keys_under<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> {
        self.tensors.keys().filter_map(move |key| {
            key.strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .map(|_| key.as_str())
        })
    }

    /// Drops every entry nested under `prefix/`, returning how many went.
    pub fn remove_under(&mut self, prefix: &str) -> usize {
        let before = self.tensors.len();
        let full = format!("{prefix}/");
        self.tensors.retain(|key, _| !key.starts_with(&full));
        before - self.tensors.len()
    }

    pub fn annotate(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.annotations.insert(key.into(), value.into());
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".tmp");
    PathBuf::from(name)
}

/// Fixes the rank of a freshly decoded array, blaming the artifact entry on
/// failure.
pub(crate) fn into_dim<A, D: Dimension>(key: &str, array: ArrayD<A>) -> Result<Array<A, D>> {
    array
        .into_dimensionality::<D>()
        .map_err(|e| FitError::BadArtifact {
            key: key.to_string(),
            detail: e.to_string(),
        })
}
