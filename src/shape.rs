//! Tensor shapes: dimensions, the scalar broadcast rule and index flattening.

use std::fmt;

use crate::error::{Error, Result};

/// Row-major tensor shape.
///
/// A shape whose element count is 1 is a *scalar*, whatever its rank; scalars
/// broadcast against any other shape.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct Shape {
    dims: Vec<usize>,
}

impl Shape {
    pub fn new(dims: impl Into<Vec<usize>>) -> Self {
        Shape { dims: dims.into() }
    }

    /// The canonical scalar shape `[1]`.
    pub fn scalar() -> Self {
        Shape { dims: vec![1] }
    }

    #[inline]
    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    #[inline]
    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    /// Number of elements (1 for rank 0).
    #[inline]
    pub fn len(&self) -> usize {
        self.dims.iter().product()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_scalar(&self) -> bool {
        self.len() == 1
    }

    /// Result shape of an elementwise operation over `self` and `other`.
    ///
    /// A scalar takes the other operand's shape; two non-scalar shapes must be
    /// identical.
    pub fn broadcast(&self, other: &Shape) -> Result<Shape> {
        if self.is_scalar() {
            Ok(other.clone())
        } else if other.is_scalar() || self == other {
            Ok(self.clone())
        } else {
            Err(Error::ShapeMismatch {
                left: self.clone(),
                right: other.clone(),
            })
        }
    }

    /// Row-major flat offset of a coordinate.
    pub fn flatten(&self, index: &[usize]) -> Result<usize> {
        if index.len() != self.dims.len() {
            return Err(self.out_of_range(index));
        }
        let mut flat = 0;
        for (&i, &d) in index.iter().zip(&self.dims) {
            if i >= d {
                return Err(self.out_of_range(index));
            }
            flat = flat * d + i;
        }
        Ok(flat)
    }

    /// Inverse of [`flatten`](Self::flatten).
    pub fn unflatten(&self, flat: usize) -> Result<Vec<usize>> {
        if flat >= self.len() {
            return Err(self.out_of_range(&[flat]));
        }
        let mut index = vec![0; self.dims.len()];
        let mut rest = flat;
        for (slot, &d) in index.iter_mut().zip(&self.dims).rev() {
            *slot = rest % d;
            rest /= d;
        }
        Ok(index)
    }

    /// Distance in flat offsets between neighbours along `axis`.
    pub fn stride(&self, axis: usize) -> Result<usize> {
        self.check_axis(axis)?;
        Ok(self.dims[axis + 1..].iter().product())
    }

    /// Copy of `self` with the size of `axis` replaced.
    pub fn with_dim(&self, axis: usize, size: usize) -> Result<Shape> {
        self.check_axis(axis)?;
        let mut dims = self.dims.clone();
        dims[axis] = size;
        Ok(Shape { dims })
    }

    pub fn check_axis(&self, axis: usize) -> Result<()> {
        if axis < self.dims.len() {
            Ok(())
        } else {
            Err(Error::AxisOutOfRange {
                axis,
                rank: self.dims.len(),
            })
        }
    }

    fn out_of_range(&self, index: &[usize]) -> Error {
        Error::IndexOutOfRange {
            index: index.to_vec(),
            shape: self.clone(),
        }
    }
}

impl fmt::Display for Shape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{d}")?;
        }
        write!(f, "]")
    }
}

impl From<Vec<usize>> for Shape {
    fn from(dims: Vec<usize>) -> Self {
        Shape { dims }
    }
}

impl From<&[usize]> for Shape {
    fn from(dims: &[usize]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }
}

impl<const N: usize> From<[usize; N]> for Shape {
    fn from(dims: [usize; N]) -> Self {
        Shape {
            dims: dims.to_vec(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_broadcasts_both_ways() {
        let s = Shape::scalar();
        let v = Shape::new([2, 3]);
        assert_eq!(s.broadcast(&v).unwrap(), v);
        assert_eq!(v.broadcast(&s).unwrap(), v);
        assert_eq!(Shape::new([1, 1]).broadcast(&v).unwrap(), v);
    }

    #[test]
    fn mismatched_shapes_fail() {
        let err = Shape::new([2, 3]).broadcast(&Shape::new([3, 2])).unwrap_err();
        assert!(matches!(err, Error::ShapeMismatch { .. }));
    }

    #[test]
    fn flatten_unflatten_agree() {
        let s = Shape::new([2, 3, 4]);
        for flat in 0..s.len() {
            let idx = s.unflatten(flat).unwrap();
            assert_eq!(s.flatten(&idx).unwrap(), flat);
        }
        assert_eq!(s.flatten(&[1, 2, 3]).unwrap(), 23);
    }

    #[test]
    fn out_of_bounds_coordinates() {
        let s = Shape::new([2, 3]);
        assert!(matches!(
            s.flatten(&[2, 0]),
            Err(Error::IndexOutOfRange { .. })
        ));
        assert!(matches!(s.flatten(&[0]), Err(Error::IndexOutOfRange { .. })));
        assert!(matches!(s.unflatten(6), Err(Error::IndexOutOfRange { .. })));
    }

    #[test]
    fn strides_and_axis_edits() {
        let s = Shape::new([2, 3, 4]);
        assert_eq!(s.stride(0).unwrap(), 12);
        assert_eq!(s.stride(2).unwrap(), 1);
        assert_eq!(s.with_dim(1, 1).unwrap(), Shape::new([2, 1, 4]));
        assert!(matches!(
            s.with_dim(3, 1),
            Err(Error::AxisOutOfRange { axis: 3, rank: 3 })
        ));
    }

    #[test]
    fn display_lists_dims() {
        assert_eq!(Shape::new([4, 2]).to_string(), "[4, 2]");
    }
}
