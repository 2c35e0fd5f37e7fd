//! A minimal dense tensor used to carry latents between the schedulers and
//! the model collaborators.
//!
//! Only the handful of elementwise operations the denoising loop needs are
//! provided, general tensor algebra is left to the inference backends.
use rand::Rng;
use rand_distr::StandardNormal;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TensorError {
    #[error("shape {shape:?} holds {expected} elements but {actual} were provided")]
    ElementCount { shape: Vec<usize>, expected: usize, actual: usize },

    #[error("shape mismatch, {lhs:?} vs {rhs:?}")]
    ShapeMismatch { lhs: Vec<usize>, rhs: Vec<usize> },

    #[error("cannot split shape {shape:?} into {chunks} batch chunks")]
    BatchSplit { shape: Vec<usize>, chunks: usize },
}

/// A flat `f32` buffer tagged with a row-major shape.
#[derive(Debug, Clone, PartialEq)]
pub struct FloatTensor {
    shape: Vec<usize>,
    data: Vec<f32>,
}

impl FloatTensor {
    pub fn zeros(shape: &[usize]) -> Self {
        let numel = shape.iter().product();
        Self { shape: shape.to_vec(), data: vec![0f32; numel] }
    }

    pub fn from_vec(data: Vec<f32>, shape: &[usize]) -> Result<Self, TensorError> {
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(TensorError::ElementCount {
                shape: shape.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { shape: shape.to_vec(), data })
    }

    /// Samples every element from a standard normal distribution, in
    /// row-major order.
    pub fn randn<R: Rng>(shape: &[usize], rng: &mut R) -> Self {
        let numel: usize = shape.iter().product();
        let data = (0..numel).map(|_| rng.sample::<f32, _>(StandardNormal)).collect();
        Self { shape: shape.to_vec(), data }
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<f32> {
        self.data
    }

    /// Multiplies every element by `factor`, in place.
    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|v| *v *= factor);
    }

    /// `self += other * factor`, in place.
    pub fn add_scaled(&mut self, other: &FloatTensor, factor: f32) -> Result<(), TensorError> {
        self.check_same_shape(other)?;
        for (v, o) in self.data.iter_mut().zip(other.data.iter()) {
            *v += o * factor;
        }
        Ok(())
    }

    pub(crate) fn check_same_shape(&self, other: &FloatTensor) -> Result<(), TensorError> {
        if self.shape != other.shape {
            return Err(TensorError::ShapeMismatch {
                lhs: self.shape.clone(),
                rhs: other.shape.clone(),
            });
        }
        Ok(())
    }

    /// Builds a new tensor of the same shape by combining `self` and `other`
    /// element by element.
    pub(crate) fn zip_map<F>(&self, other: &FloatTensor, f: F) -> Result<FloatTensor, TensorError>
    where
        F: Fn(f32, f32) -> f32,
    {
        self.check_same_shape(other)?;
        let data = self.data.iter().zip(other.data.iter()).map(|(&a, &b)| f(a, b)).collect();
        Ok(FloatTensor { shape: self.shape.clone(), data })
    }

    /// Concatenates tensors along the leading (batch) dimension.
    pub fn cat(tensors: &[&FloatTensor]) -> Result<FloatTensor, TensorError> {
        let first = match tensors.first() {
            Some(first) => first,
            None => return Ok(FloatTensor::zeros(&[0])),
        };
        let inner = &first.shape[1.min(first.shape.len())..];
        let mut batch = 0;
        let mut data = Vec::with_capacity(tensors.iter().map(|t| t.num_elements()).sum());
        for t in tensors {
            if t.shape.is_empty() || &t.shape[1..] != inner {
                return Err(TensorError::ShapeMismatch {
                    lhs: first.shape.clone(),
                    rhs: t.shape.clone(),
                });
            }
            batch += t.shape[0];
            data.extend_from_slice(&t.data);
        }
        let mut shape = Vec::with_capacity(first.shape.len());
        shape.push(batch);
        shape.extend_from_slice(inner);
        Ok(FloatTensor { shape, data })
    }

    /// Splits the leading (batch) dimension into `chunks` equally sized parts.
    pub fn chunk(&self, chunks: usize) -> Result<Vec<FloatTensor>, TensorError> {
        let batch = match self.shape.first() {
            Some(&batch) => batch,
            None => return Err(TensorError::BatchSplit { shape: vec![], chunks }),
        };
        if chunks == 0 || batch % chunks != 0 {
            return Err(TensorError::BatchSplit { shape: self.shape.clone(), chunks });
        }
        let mut shape = self.shape.clone();
        shape[0] = batch / chunks;
        let chunk_len = self.data.len() / chunks;
        let parts = (0..chunks)
            .map(|i| FloatTensor {
                shape: shape.clone(),
                data: self.data[i * chunk_len..(i + 1) * chunk_len].to_vec(),
            })
            .collect();
        Ok(parts)
    }
}

#[cfg(feature = "torch")]
impl TryFrom<&tch::Tensor> for FloatTensor {
    type Error = tch::TchError;

    fn try_from(tensor: &tch::Tensor) -> Result<Self, Self::Error> {
        let shape = tensor.size().iter().map(|&d| d as usize).collect();
        let flat = tensor.to_kind(tch::Kind::Float).flatten(0, -1);
        let data = Vec::<f32>::try_from(flat)?;
        Ok(Self { shape, data })
    }
}

#[cfg(feature = "torch")]
impl From<&FloatTensor> for tch::Tensor {
    fn from(tensor: &FloatTensor) -> Self {
        let shape: Vec<i64> = tensor.shape.iter().map(|&d| d as i64).collect();
        tch::Tensor::from_slice(&tensor.data).view(shape.as_slice())
    }
}
