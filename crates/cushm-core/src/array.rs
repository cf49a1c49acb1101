//! Owned host arrays handed to the registry for publication

use crate::dtype::{DType, Element};
use crate::meta::AttrValue;
use crate::{Error, Result};
use std::collections::BTreeMap;

/// Number of elements for a shape; an empty shape is a scalar.
///
/// `None` when the count does not fit in `usize`.
pub fn numel(shape: &[usize]) -> Option<usize> {
    shape.iter().try_fold(1usize, |n, &dim| n.checked_mul(dim))
}

/// Bytes needed for `shape` elements of `dtype`, `None` on overflow.
pub fn byte_len(shape: &[usize], dtype: DType) -> Option<usize> {
    numel(shape)?.checked_mul(dtype.size())
}

pub(crate) fn overflow(shape: &[usize], dtype: DType) -> Error {
    Error::InvalidShape(format!("shape {:?} of {} overflows the address space", shape, dtype))
}

/// A typed, fixed-shape array owned by the calling process.
#[derive(Debug, Clone, PartialEq)]
pub struct Array {
    shape: Vec<usize>,
    dtype: DType,
    data: Vec<u8>,
    attrs: BTreeMap<String, AttrValue>,
}

impl Array {
    /// Build an array from raw native-endian bytes.
    pub fn from_bytes(shape: Vec<usize>, dtype: DType, data: Vec<u8>) -> Result<Self> {
        let expected = byte_len(&shape, dtype).ok_or_else(|| overflow(&shape, dtype))?;
        if data.len() != expected {
            return Err(Error::InvalidShape(format!(
                "shape {:?} of {} needs {} bytes, got {}",
                shape,
                dtype,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            shape,
            dtype,
            data,
            attrs: BTreeMap::new(),
        })
    }

    /// Build an array from typed elements.
    pub fn from_vec<T: Element>(shape: Vec<usize>, values: Vec<T>) -> Result<Self> {
        let count = numel(&shape).ok_or_else(|| overflow(&shape, T::DTYPE))?;
        if count != values.len() {
            return Err(Error::InvalidShape(format!(
                "shape {:?} holds {} elements, got {}",
                shape,
                count,
                values.len()
            )));
        }
        let bytes = unsafe {
            std::slice::from_raw_parts(
                values.as_ptr() as *const u8,
                values.len() * std::mem::size_of::<T>(),
            )
        };
        Self::from_bytes(shape, T::DTYPE, bytes.to_vec())
    }

    /// Zero-filled array.
    pub fn zeros(shape: Vec<usize>, dtype: DType) -> Result<Self> {
        let len = byte_len(&shape, dtype).ok_or_else(|| overflow(&shape, dtype))?;
        Ok(Self {
            shape,
            dtype,
            data: vec![0; len],
            attrs: BTreeMap::new(),
        })
    }

    /// Attach an attribute, carried into the segment descriptor.
    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn attrs(&self) -> &BTreeMap<String, AttrValue> {
        &self.attrs
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Size in bytes
    pub fn nbytes(&self) -> usize {
        self.data.len()
    }

    /// Element count
    pub fn len(&self) -> usize {
        self.data.len() / self.dtype.size()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy the elements out as `T`, checking the dtype.
    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        if T::DTYPE != self.dtype {
            return Err(Error::TypeMismatch {
                expected: self.dtype.to_string(),
                actual: T::DTYPE.to_string(),
            });
        }
        let mut out = Vec::<T>::with_capacity(self.len());
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.data.as_ptr(),
                out.as_mut_ptr() as *mut u8,
                self.data.len(),
            );
            out.set_len(self.len());
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_vec_checks_shape() {
        let array = Array::from_vec(vec![2, 3], vec![1i32, 2, 3, 4, 5, 6]).unwrap();
        assert_eq!(array.nbytes(), 24);
        assert_eq!(array.dtype(), DType::Int32);
        assert_eq!(array.to_vec::<i32>().unwrap(), vec![1, 2, 3, 4, 5, 6]);

        assert!(Array::from_vec(vec![4], vec![1.0f32; 3]).is_err());
        assert!(array.to_vec::<f32>().is_err());
    }

    #[test]
    fn test_scalar_and_empty_shapes() {
        let scalar = Array::zeros(vec![], DType::Float64).unwrap();
        assert_eq!(scalar.len(), 1);
        assert_eq!(scalar.nbytes(), 8);

        let empty = Array::zeros(vec![0, 5], DType::Int16).unwrap();
        assert!(empty.is_empty());
        assert_eq!(empty.nbytes(), 0);
    }

    #[test]
    fn test_from_bytes_size_check() {
        assert!(Array::from_bytes(vec![3], DType::UInt16, vec![0; 6]).is_ok());
        assert!(Array::from_bytes(vec![3], DType::UInt16, vec![0; 5]).is_err());
    }

    #[test]
    fn test_overflowing_shapes_rejected() {
        let huge = vec![1usize << 62, 8];
        assert_eq!(numel(&huge), None);
        assert_eq!(byte_len(&[1usize << 61], DType::Float64), None);
        assert_eq!(byte_len(&[3, 0, usize::MAX], DType::Int8), Some(0));

        assert!(matches!(
            Array::from_bytes(huge.clone(), DType::UInt8, Vec::new()),
            Err(Error::InvalidShape(_))
        ));
        assert!(matches!(Array::zeros(huge.clone(), DType::UInt8), Err(Error::InvalidShape(_))));
        assert!(matches!(Array::from_vec(huge, Vec::<u8>::new()), Err(Error::InvalidShape(_))));
    }
}
