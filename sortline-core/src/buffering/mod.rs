//! Aligned buffer pool.
//!
//! Every staged tensor is allocated once through a [`BufferPool`] and then
//! refilled in place with [`copy_padded`] on every chunk. Nothing on the
//! per-chunk path allocates.

pub mod aligned;

pub use aligned::{AlignedBuffer, DType, Element, LengthScalar};

use tracing::debug;

use crate::error::{Result, SortlineError};

/// Result of one [`copy_padded`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CopyReport {
    /// Source elements written into the buffer.
    pub copied: usize,
    /// Source elements that did not fit and were dropped.
    pub dropped: usize,
}

impl CopyReport {
    pub fn truncated(&self) -> bool {
        self.dropped > 0
    }
}

/// Copy `source` into `into` from offset 0 and fill the remaining capacity
/// with `pad`. Source elements past capacity are dropped.
pub fn copy_padded<T: Element>(source: &[T], into: &mut AlignedBuffer<T>, pad: T) -> CopyReport {
    let dst = into.as_mut_slice();
    let copied = source.len().min(dst.len());
    dst[..copied].copy_from_slice(&source[..copied]);
    dst[copied..].fill(pad);
    CopyReport {
        copied,
        dropped: source.len() - copied,
    }
}

/// Allocator for accelerator-aligned buffers.
#[derive(Debug)]
pub struct BufferPool {
    alignment: usize,
    allocated_bytes: usize,
    buffer_count: usize,
}

impl BufferPool {
    /// Cache-line / SIMD friendly default.
    pub const DEFAULT_ALIGNMENT: usize = 64;

    pub fn new() -> Self {
        Self {
            alignment: Self::DEFAULT_ALIGNMENT,
            allocated_bytes: 0,
            buffer_count: 0,
        }
    }

    /// # Errors
    /// `AllocationFailed` unless `alignment` is a power of two of at least 4 bytes.
    pub fn with_alignment(alignment: usize) -> Result<Self> {
        if !alignment.is_power_of_two() || alignment < std::mem::align_of::<f32>() {
            return Err(SortlineError::allocation(
                &[],
                format!("alignment {alignment} is not a power of two >= 4"),
            ));
        }
        Ok(Self {
            alignment,
            ..Self::new()
        })
    }

    /// Allocate a buffer of `shape` holding `T`. Contents are unspecified
    /// until the first [`copy_padded`].
    pub fn allocate<T: Element>(&mut self, shape: &[usize]) -> Result<AlignedBuffer<T>> {
        let buf = AlignedBuffer::<T>::new(shape, self.alignment)?;
        let bytes = buf.capacity() * std::mem::size_of::<T>();
        self.allocated_bytes += bytes;
        self.buffer_count += 1;
        debug!(?shape, dtype = ?T::DTYPE, bytes, "allocated aligned buffer");
        Ok(buf)
    }

    /// Allocate a one-element length scalar paired with a buffer of `limit` rows.
    pub fn allocate_length(&mut self, limit: usize) -> Result<LengthScalar> {
        let cell = self.allocate::<i32>(&[1])?;
        Ok(LengthScalar::new(cell, limit))
    }

    pub fn alignment(&self) -> usize {
        self.alignment
    }

    /// Payload bytes handed out so far (alignment slack excluded).
    pub fn allocated_bytes(&self) -> usize {
        self.allocated_bytes
    }

    pub fn buffer_count(&self) -> usize {
        self.buffer_count
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(capacity: usize) -> AlignedBuffer<f32> {
        BufferPool::new().allocate::<f32>(&[capacity]).unwrap()
    }

    #[test]
    fn short_source_is_padded() {
        let mut buf = buffer(6);
        let report = copy_padded(&[0.1, 0.2], &mut buf, 0.0);
        assert_eq!(buf.as_slice(), &[0.1, 0.2, 0.0, 0.0, 0.0, 0.0]);
        assert_eq!(report, CopyReport { copied: 2, dropped: 0 });
    }

    #[test]
    fn exact_source_needs_no_padding() {
        let mut buf = buffer(4);
        let report = copy_padded(&[1.0, 2.0, 3.0, 4.0], &mut buf, -1.0);
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
        assert!(!report.truncated());
    }

    #[test]
    fn long_source_is_truncated() {
        let mut buf = buffer(3);
        let report = copy_padded(&[1.0, 2.0, 3.0, 4.0, 5.0], &mut buf, 0.0);
        assert_eq!(buf.as_slice(), &[1.0, 2.0, 3.0]);
        assert_eq!(report.dropped, 2);
        assert!(report.truncated());
    }

    #[test]
    fn empty_source_fills_with_pad() {
        let mut buf = buffer(3);
        copy_padded(&[9.0, 9.0, 9.0], &mut buf, 0.0);
        copy_padded(&[], &mut buf, 0.5);
        assert_eq!(buf.as_slice(), &[0.5, 0.5, 0.5]);
    }

    #[test]
    fn refill_overwrites_previous_contents() {
        let mut buf = buffer(4);
        copy_padded(&[1.0, 1.0, 1.0, 1.0], &mut buf, 0.0);
        copy_padded(&[2.0], &mut buf, 0.0);
        assert_eq!(buf.as_slice(), &[2.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn pool_tracks_payload_bytes() {
        let mut pool = BufferPool::new();
        pool.allocate::<f32>(&[1, 4, 2]).unwrap();
        pool.allocate_length(4).unwrap();
        assert_eq!(pool.allocated_bytes(), 8 * 4 + 4);
        assert_eq!(pool.buffer_count(), 2);
    }

    #[test]
    fn rejects_bad_alignment() {
        assert!(BufferPool::with_alignment(48).is_err());
        assert!(BufferPool::with_alignment(2).is_err());
        assert_eq!(BufferPool::with_alignment(128).unwrap().alignment(), 128);
    }
}
