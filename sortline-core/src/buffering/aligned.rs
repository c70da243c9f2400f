//! Fixed-shape, start-aligned numeric buffers handed to the inference engine.

use ndarray::{ArrayViewD, IxDyn};

use crate::error::{Result, SortlineError};

/// Element type tag carried alongside every staged tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    I32,
}

/// Numeric element types a buffer may hold.
pub trait Element: Copy + Default + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    const DTYPE: DType;
}

impl Element for f32 {
    const DTYPE: DType = DType::F32;
}

impl Element for i32 {
    const DTYPE: DType = DType::I32;
}

/// A contiguous buffer whose first element sits on an `alignment`-byte boundary.
///
/// The backing `Vec` is over-allocated by one alignment's worth of elements and
/// never grows, so the aligned window stays put for the buffer's lifetime.
pub struct AlignedBuffer<T: Element> {
    storage: Vec<T>,
    offset: usize,
    capacity: usize,
    shape: Vec<usize>,
    alignment: usize,
}

impl<T: Element> AlignedBuffer<T> {
    pub(crate) fn new(shape: &[usize], alignment: usize) -> Result<Self> {
        if shape.is_empty() {
            return Err(SortlineError::allocation(shape, "shape has no dimensions"));
        }
        if let Some(axis) = shape.iter().position(|&d| d == 0) {
            return Err(SortlineError::allocation(
                shape,
                format!("dimension {axis} is zero"),
            ));
        }
        let capacity = shape
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .filter(|n| n.checked_mul(std::mem::size_of::<T>()).is_some())
            .ok_or_else(|| SortlineError::allocation(shape, "element count overflows usize"))?;

        let slack = (alignment / std::mem::size_of::<T>()).max(1);
        let total = capacity
            .checked_add(slack)
            .ok_or_else(|| SortlineError::allocation(shape, "element count overflows usize"))?;

        let mut storage: Vec<T> = Vec::new();
        storage
            .try_reserve_exact(total)
            .map_err(|e| SortlineError::allocation(shape, e.to_string()))?;
        storage.resize(total, T::default());

        let offset = storage.as_ptr().align_offset(alignment);
        if offset > slack {
            return Err(SortlineError::allocation(
                shape,
                format!("allocator cannot satisfy {alignment}-byte alignment"),
            ));
        }

        Ok(Self {
            storage,
            offset,
            capacity,
            shape: shape.to_vec(),
            alignment,
        })
    }

    pub fn as_slice(&self) -> &[T] {
        &self.storage[self.offset..self.offset + self.capacity]
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.storage[self.offset..self.offset + self.capacity]
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Total element count (product of the shape).
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Length of the time axis: the dimension after the leading batch axis,
    /// or the only dimension of a 1-D buffer.
    pub fn rows(&self) -> usize {
        match self.shape.as_slice() {
            [only] => *only,
            [_, rows, ..] => *rows,
            [] => 0,
        }
    }

    pub fn dtype(&self) -> DType {
        T::DTYPE
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    pub fn is_aligned(&self) -> bool {
        (self.as_slice().as_ptr() as usize) % self.alignment == 0
    }

    /// Shaped read-only view over the buffer.
    pub fn view(&self) -> ArrayViewD<'_, T> {
        ArrayViewD::from_shape(IxDyn(&self.shape), self.as_slice())
            .expect("shape product equals capacity by construction")
    }
}

impl<T: Element> std::fmt::Debug for AlignedBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlignedBuffer")
            .field("dtype", &T::DTYPE)
            .field("shape", &self.shape)
            .field("alignment", &self.alignment)
            .finish_non_exhaustive()
    }
}

/// A one-element i32 buffer telling the engine how many leading rows of a
/// paired buffer hold real data.
#[derive(Debug)]
pub struct LengthScalar {
    cell: AlignedBuffer<i32>,
    limit: usize,
}

impl LengthScalar {
    pub(crate) fn new(cell: AlignedBuffer<i32>, limit: usize) -> Self {
        Self { cell, limit }
    }

    pub fn get(&self) -> usize {
        self.cell.as_slice()[0].max(0) as usize
    }

    /// Highest value this scalar may hold (row capacity of the paired buffer).
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Writes `min(len, limit)`; returns `true` when clamping occurred.
    pub(crate) fn set(&mut self, len: usize) -> bool {
        let stored = len.min(self.limit).min(i32::MAX as usize);
        super::copy_padded(&[stored as i32], &mut self.cell, 0);
        stored != len
    }

    pub fn buffer(&self) -> &AlignedBuffer<i32> {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_zero_dimension() {
        let err = AlignedBuffer::<f32>::new(&[1, 0, 4], 64).unwrap_err();
        assert!(matches!(err, SortlineError::AllocationFailed { .. }));
    }

    #[test]
    fn rejects_empty_shape() {
        assert!(AlignedBuffer::<i32>::new(&[], 64).is_err());
    }

    #[test]
    fn rejects_overflowing_shape() {
        let err = AlignedBuffer::<f32>::new(&[usize::MAX, 2], 64).unwrap_err();
        assert!(matches!(err, SortlineError::AllocationFailed { .. }));
    }

    #[test]
    fn start_is_aligned() {
        for alignment in [16, 32, 64, 128] {
            let buf = AlignedBuffer::<f32>::new(&[1, 3, 5], alignment).unwrap();
            assert!(buf.is_aligned(), "alignment {alignment}");
            assert_eq!(buf.capacity(), 15);
            assert_eq!(buf.as_slice().len(), 15);
        }
    }

    #[test]
    fn view_carries_shape() {
        let buf = AlignedBuffer::<f32>::new(&[1, 4, 2], 64).unwrap();
        assert_eq!(buf.view().shape(), &[1, 4, 2]);
        assert_eq!(buf.dtype(), DType::F32);
        assert_eq!(buf.rows(), 4);
        assert_eq!(AlignedBuffer::<i32>::new(&[1], 64).unwrap().rows(), 1);
    }

    #[test]
    fn length_scalar_clamps_to_limit() {
        let cell = AlignedBuffer::<i32>::new(&[1], 64).unwrap();
        let mut len = LengthScalar::new(cell, 3);
        assert!(!len.set(2));
        assert_eq!(len.get(), 2);
        assert!(len.set(7));
        assert_eq!(len.get(), 3);
        assert_eq!(len.buffer().as_slice(), &[3]);
    }
}
