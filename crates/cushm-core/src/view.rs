//! Typed zero-copy views over shared memory segments

use crate::array::{byte_len, overflow};
use crate::dtype::{DType, Element};
use crate::shm::SharedMemory;
use crate::{Error, Result};

/// Access mode for a view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    ReadWrite,
}

/// A segment's bytes interpreted as a fixed-shape array.
///
/// Element access aliases the segment directly. Views in other processes
/// see writes immediately and without synchronization; coordinating
/// concurrent writers is up to the caller.
#[derive(Debug)]
pub struct ArrayView {
    shm: SharedMemory,
    shape: Vec<usize>,
    dtype: DType,
    nbytes: usize,
    mode: AccessMode,
}

impl ArrayView {
    /// Bind `shape` and `dtype` to the segment's leading bytes.
    pub fn bind(shm: SharedMemory, shape: Vec<usize>, dtype: DType, mode: AccessMode) -> Result<Self> {
        let nbytes = byte_len(&shape, dtype).ok_or_else(|| overflow(&shape, dtype))?;
        if nbytes > shm.size() {
            return Err(Error::SizeMismatch {
                key: shm.name().to_string(),
                expected: nbytes,
                actual: shm.size(),
            });
        }
        Ok(Self {
            shm,
            shape,
            dtype,
            nbytes,
            mode,
        })
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.nbytes / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Size in bytes
    pub fn nbytes(&self) -> usize {
        self.nbytes
    }

    /// Underlying segment
    pub fn segment(&self) -> &SharedMemory {
        &self.shm
    }

    pub fn segment_mut(&mut self) -> &mut SharedMemory {
        &mut self.shm
    }

    pub fn into_segment(self) -> SharedMemory {
        self.shm
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.shm.as_slice()[..self.nbytes()]
    }

    /// Mutable bytes, requires ReadWrite mode
    pub fn as_bytes_mut(&mut self) -> Result<&mut [u8]> {
        if self.mode == AccessMode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        let nbytes = self.nbytes();
        Ok(&mut self.shm.as_mut_slice()[..nbytes])
    }

    fn check_type<T: Element>(&self) -> Result<()> {
        if T::DTYPE != self.dtype {
            return Err(Error::TypeMismatch {
                expected: self.dtype.to_string(),
                actual: T::DTYPE.to_string(),
            });
        }
        Ok(())
    }

    /// Elements as `T`, row-major.
    pub fn as_slice<T: Element>(&self) -> Result<&[T]> {
        self.check_type::<T>()?;
        // Mappings are page aligned, which satisfies every element type.
        Ok(unsafe { std::slice::from_raw_parts(self.shm.as_ptr() as *const T, self.len()) })
    }

    /// Mutable elements as `T`, requires ReadWrite mode.
    pub fn as_mut_slice<T: Element>(&mut self) -> Result<&mut [T]> {
        if self.mode == AccessMode::ReadOnly {
            return Err(Error::ReadOnly);
        }
        self.check_type::<T>()?;
        let len = self.len();
        Ok(unsafe { std::slice::from_raw_parts_mut(self.shm.as_mut_ptr() as *mut T, len) })
    }

    /// Copy into an owned vector.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        Ok(self.as_slice::<T>()?.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(tag: &str, size: usize) -> SharedMemory {
        use std::time::{SystemTime, UNIX_EPOCH};
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        SharedMemory::create(&format!("cushm_view_test.{}.{}.{}", tag, std::process::id(), ts), size).unwrap()
    }

    #[test]
    fn test_bind_and_write_through() {
        let shm = segment("rw", 24);
        let mut view = ArrayView::bind(shm, vec![2, 3], DType::Int32, AccessMode::ReadWrite).unwrap();
        view.as_mut_slice::<i32>().unwrap().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
        assert_eq!(view.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert_eq!(&view.segment().as_slice()[..4], &1i32.to_ne_bytes());
        assert_eq!(view.nbytes(), 24);
    }

    #[test]
    fn test_bind_rejects_oversized_shape() {
        let shm = segment("big", 16);
        let err = ArrayView::bind(shm, vec![5], DType::Float32, AccessMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::SizeMismatch { expected: 20, actual: 16, .. }));
    }

    #[test]
    fn test_bind_rejects_overflowing_shape() {
        let shm = segment("overflow", 16);
        let err = ArrayView::bind(shm, vec![1 << 62, 8], DType::UInt8, AccessMode::ReadOnly).unwrap_err();
        assert!(matches!(err, Error::InvalidShape(_)), "{err}");
    }

    #[test]
    fn test_type_and_mode_checks() {
        let shm = segment("mode", 8);
        let mut view = ArrayView::bind(shm, vec![2], DType::Float32, AccessMode::ReadOnly).unwrap();
        assert!(matches!(view.as_slice::<i32>(), Err(Error::TypeMismatch { .. })));
        assert!(matches!(view.as_bytes_mut(), Err(Error::ReadOnly)));
        assert_eq!(view.as_slice::<f32>().unwrap(), &[0.0, 0.0]);
    }
}
