// Host-side dense tensors exchanged between the decode loop, the model and
// the pipeline link.
//
// Layout is row-major. Axis conventions used across the workspace:
//   activations  [sequence, batch, hidden]
//   logits       [batch, sequence, vocab]
//   tokens       [batch, sequence]
//   kv cache     [sequence, batch, heads, head_dim]

use std::fmt::Debug;

use serde::{Deserialize, Serialize};

use crate::error::{CascadeError, Result};

// ── Dtype ────────────────────────────────────────────────────────────────────

/// Element type of a tensor on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum TensorDtype {
    F32 = 0,
    I64 = 1,
    U8  = 2,
}

impl TensorDtype {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::F32),
            1 => Some(Self::I64),
            2 => Some(Self::U8),
            _ => None,
        }
    }

    /// Bytes per element for this dtype.
    pub fn element_bytes(&self) -> usize {
        match self {
            Self::F32 => 4,
            Self::I64 => 8,
            Self::U8 => 1,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::I64 => "i64",
            Self::U8 => "u8",
        }
    }
}

/// Scalar types a [`Tensor`] can hold.
pub trait Element: Copy + Default + PartialEq + Debug + Send + Sync + 'static {
    const DTYPE: TensorDtype;
}

impl Element for f32 {
    const DTYPE: TensorDtype = TensorDtype::F32;
}

impl Element for i64 {
    const DTYPE: TensorDtype = TensorDtype::I64;
}

impl Element for u8 {
    const DTYPE: TensorDtype = TensorDtype::U8;
}

// ── Tensor ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor<T> {
    shape: Vec<usize>,
    data: Vec<T>,
}

impl<T: Element> Tensor<T> {
    pub fn zeros(shape: &[usize]) -> Self {
        Self::full(shape, T::default())
    }

    pub fn full(shape: &[usize], value: T) -> Self {
        Self {
            shape: shape.to_vec(),
            data: vec![value; shape.iter().product()],
        }
    }

    /// Wrap `data` as a tensor of `shape`. Fails if the element count differs.
    pub fn from_vec(shape: &[usize], data: Vec<T>) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if numel != data.len() {
            return Err(CascadeError::InvalidShape(format!(
                "shape {shape:?} holds {numel} elements, got {}",
                data.len()
            )));
        }
        Ok(Self {
            shape: shape.to_vec(),
            data,
        })
    }

    /// One-element tensor of shape `[1]`.
    pub fn scalar(value: T) -> Self {
        Self {
            shape: vec![1],
            data: vec![value],
        }
    }

    pub fn dtype(&self) -> TensorDtype {
        T::DTYPE
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self, axis: usize) -> usize {
        self.shape.get(axis).copied().unwrap_or(1)
    }

    pub fn numel(&self) -> usize {
        self.data.len()
    }

    pub fn data(&self) -> &[T] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [T] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<T> {
        self.data
    }

    /// Return an error unless this tensor's shape is exactly `expected`.
    pub fn check_shape(&self, expected: &[usize]) -> Result<()> {
        if self.shape != expected {
            return Err(CascadeError::Shape {
                expected: expected.to_vec(),
                got: self.shape.clone(),
            });
        }
        Ok(())
    }

    pub fn reshape(self, shape: &[usize]) -> Result<Self> {
        Self::from_vec(shape, self.data)
    }

    /// Contiguous slice along axis 0.
    pub fn row(&self, index: usize) -> &[T] {
        let inner = self.numel() / self.dim(0).max(1);
        &self.data[index * inner..(index + 1) * inner]
    }

    pub fn row_mut(&mut self, index: usize) -> &mut [T] {
        let inner = self.numel() / self.dim(0).max(1);
        &mut self.data[index * inner..(index + 1) * inner]
    }

    /// Copy of `[start, start + len)` along `axis`.
    pub fn narrow(&self, axis: usize, start: usize, len: usize) -> Result<Self> {
        let (outer, dim, inner) = self.split(axis)?;
        if start + len > dim {
            return Err(CascadeError::InvalidShape(format!(
                "narrow [{start}, {}) out of bounds for axis {axis} of size {dim}",
                start + len
            )));
        }
        let mut data = Vec::with_capacity(outer * len * inner);
        for o in 0..outer {
            let base = o * dim * inner + start * inner;
            data.extend_from_slice(&self.data[base..base + len * inner]);
        }
        let mut shape = self.shape.clone();
        shape[axis] = len;
        Ok(Self { shape, data })
    }

    /// Overwrite `[start, start + src.dim(axis))` along `axis` with `src`.
    /// All other axes must match.
    pub fn write_narrow(&mut self, axis: usize, start: usize, src: &Tensor<T>) -> Result<()> {
        let (outer, dim, inner) = self.split(axis)?;
        let len = src.dim(axis);
        let mut expected = self.shape.clone();
        expected[axis] = len;
        src.check_shape(&expected)?;
        if start + len > dim {
            return Err(CascadeError::InvalidShape(format!(
                "write [{start}, {}) out of bounds for axis {axis} of size {dim}",
                start + len
            )));
        }
        for o in 0..outer {
            let dst = o * dim * inner + start * inner;
            let from = o * len * inner;
            self.data[dst..dst + len * inner].copy_from_slice(&src.data[from..from + len * inner]);
        }
        Ok(())
    }

    /// Gather entries along `axis` in the order given by `indices`.
    /// Indices may repeat (beam search duplicates surviving beams).
    pub fn index_select(&self, axis: usize, indices: &[usize]) -> Result<Self> {
        let (outer, dim, inner) = self.split(axis)?;
        if let Some(&bad) = indices.iter().find(|&&i| i >= dim) {
            return Err(CascadeError::InvalidShape(format!(
                "index {bad} out of bounds for axis {axis} of size {dim}"
            )));
        }
        let mut data = Vec::with_capacity(outer * indices.len() * inner);
        for o in 0..outer {
            for &i in indices {
                let base = o * dim * inner + i * inner;
                data.extend_from_slice(&self.data[base..base + inner]);
            }
        }
        let mut shape = self.shape.clone();
        shape[axis] = indices.len();
        Ok(Self { shape, data })
    }

    /// `(outer, dim, inner)` element counts around `axis`.
    fn split(&self, axis: usize) -> Result<(usize, usize, usize)> {
        if axis >= self.shape.len() {
            return Err(CascadeError::InvalidShape(format!(
                "axis {axis} out of range for rank {}",
                self.shape.len()
            )));
        }
        let outer = self.shape[..axis].iter().product();
        let inner = self.shape[axis + 1..].iter().product();
        Ok((outer, self.shape[axis], inner))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
