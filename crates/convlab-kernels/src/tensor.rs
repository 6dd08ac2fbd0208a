//! Fixed-shape tensor with a dynamic leading extent and an optional device
//! mirror.
//!
//! The rank is a const generic. Extents are fixed at construction; only the
//! leading extent (`n0`, the batch occupancy) moves at runtime, bounded by
//! the construction-time capacity `dims[0]`. Element offsets are row-major
//! over the full extents, so changing `n0` never moves data.
//!
//! Host and device copies are synchronized only by explicit calls.

use crate::device::{CudaKernel, DeviceBuffer};
use convlab_common::{KernelError, RandomGen, Real, Result, ShapeError};
use std::fmt;
use std::ops::{Index, IndexMut};

pub struct Tensor<const R: usize> {
    dims: [usize; R],
    n0: usize,
    data: Vec<Real>,
    device: Option<DeviceBuffer>,
}

/// Read view over a tensor's active elements and its mirror.
pub struct Flat<'a> {
    pub host: &'a [Real],
    pub device: Option<&'a DeviceBuffer>,
}

/// Write view over a tensor's active elements and its mirror.
pub struct FlatMut<'a> {
    pub host: &'a mut [Real],
    pub device: Option<&'a mut DeviceBuffer>,
}

impl<const R: usize> Tensor<R> {
    pub fn zeros(dims: [usize; R]) -> Self {
        assert!(R > 0, "tensor rank must be at least 1");
        let len = dims.iter().product();
        Self { dims, n0: dims[0], data: vec![0.0; len], device: None }
    }

    pub fn from_vec(dims: [usize; R], data: Vec<Real>) -> std::result::Result<Self, ShapeError> {
        let expected: usize = dims.iter().product();
        if data.len() != expected {
            return Err(ShapeError::DataLength {
                dims: dims.to_vec(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self { dims, n0: dims[0], data, device: None })
    }

    /// Construction-time extents; `dims()[0]` is the capacity.
    pub fn dims(&self) -> [usize; R] {
        self.dims
    }

    /// Current extents, with the active leading extent in front.
    pub fn shape(&self) -> [usize; R] {
        let mut s = self.dims;
        s[0] = self.n0;
        s
    }

    pub fn leading_extent(&self) -> usize {
        self.n0
    }

    pub fn capacity(&self) -> usize {
        self.dims[0]
    }

    /// Elements in one leading-axis row.
    pub fn row_len(&self) -> usize {
        self.dims[1..].iter().product()
    }

    pub fn len(&self) -> usize {
        self.n0 * self.row_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn set_leading_extent(&mut self, n: usize) -> std::result::Result<(), ShapeError> {
        if n > self.dims[0] {
            return Err(ShapeError::BatchTooLarge { requested: n, max: self.dims[0] });
        }
        self.n0 = n;
        Ok(())
    }

    #[inline]
    fn offset(&self, idx: [usize; R]) -> usize {
        let mut off = 0;
        for axis in 0..R {
            let extent = if axis == 0 { self.n0 } else { self.dims[axis] };
            assert!(
                idx[axis] < extent,
                "index {} out of bounds for axis {} with extent {}",
                idx[axis],
                axis,
                extent
            );
            off = off * self.dims[axis] + idx[axis];
        }
        off
    }

    /// `L` consecutive elements along the innermost axis, starting at `idx`.
    #[inline]
    pub fn wide<const L: usize>(&self, idx: [usize; R]) -> &[Real; L] {
        let off = self.wide_offset::<L>(idx);
        match self.data[off..].first_chunk::<L>() {
            Some(chunk) => chunk,
            None => unreachable!("wide_offset checked the lane span"),
        }
    }

    /// Mutable `L`-lane view along the innermost axis, starting at `idx`.
    #[inline]
    pub fn wide_mut<const L: usize>(&mut self, idx: [usize; R]) -> &mut [Real; L] {
        let off = self.wide_offset::<L>(idx);
        match self.data[off..].first_chunk_mut::<L>() {
            Some(chunk) => chunk,
            None => unreachable!("wide_offset checked the lane span"),
        }
    }

    #[inline]
    fn wide_offset<const L: usize>(&self, idx: [usize; R]) -> usize {
        let last = R - 1;
        assert!(
            idx[last] + L <= self.dims[last],
            "{} lanes from {} overrun innermost extent {}",
            L,
            idx[last],
            self.dims[last]
        );
        self.offset(idx)
    }

    /// Active elements in row-major order.
    pub fn as_slice(&self) -> &[Real] {
        &self.data[..self.len()]
    }

    pub fn as_mut_slice(&mut self) -> &mut [Real] {
        let len = self.len();
        &mut self.data[..len]
    }

    pub fn flat(&self) -> Flat<'_> {
        Flat { host: self.as_slice(), device: self.device.as_ref() }
    }

    pub fn flat_mut(&mut self) -> FlatMut<'_> {
        let len = self.len();
        FlatMut { host: &mut self.data[..len], device: self.device.as_mut() }
    }

    /// Set `n0 = count` and fill the active rows from `U[lo, hi)`.
    pub fn init_uniform(
        &mut self,
        count: usize,
        rng: &mut RandomGen,
        lo: Real,
        hi: Real,
    ) -> std::result::Result<(), ShapeError> {
        self.set_leading_extent(count)?;
        for v in self.as_mut_slice() {
            *v = rng.uniform(lo, hi);
        }
        Ok(())
    }

    /// Set `n0 = count` and fill the active rows with `value`.
    pub fn init_const(&mut self, count: usize, value: Real) -> std::result::Result<(), ShapeError> {
        self.set_leading_extent(count)?;
        self.as_mut_slice().fill(value);
        Ok(())
    }

    /// `self += alpha * other`
    pub fn add_scaled(&mut self, alpha: Real, other: &Self) -> std::result::Result<(), ShapeError> {
        self.same_shape("add_scaled operand", other)?;
        for (a, b) in self.as_mut_slice().iter_mut().zip(other.as_slice()) {
            *a += alpha * b;
        }
        Ok(())
    }

    /// Inner product over the active elements, accumulated in `f64`.
    pub fn dot(&self, other: &Self) -> std::result::Result<f64, ShapeError> {
        self.same_shape("dot operand", other)?;
        Ok(self.as_slice().iter().zip(other.as_slice()).map(|(&a, &b)| a as f64 * b as f64).sum())
    }

    /// Copy the active rows (and the leading extent) of `other`.
    pub fn copy_from(&mut self, other: &Self) -> std::result::Result<(), ShapeError> {
        if self.dims != other.dims {
            return Err(ShapeError::mismatch("copy source", &self.dims, &other.dims));
        }
        self.n0 = other.n0;
        let len = self.len();
        self.data[..len].copy_from_slice(other.as_slice());
        Ok(())
    }

    fn same_shape(&self, what: &str, other: &Self) -> std::result::Result<(), ShapeError> {
        if self.shape() != other.shape() {
            return Err(ShapeError::mismatch(what, &self.shape(), &other.shape()));
        }
        Ok(())
    }

    pub fn is_mirrored(&self) -> bool {
        self.device.is_some()
    }

    pub fn device_buffer(&self) -> Option<&DeviceBuffer> {
        self.device.as_ref()
    }

    pub fn device_buffer_mut(&mut self) -> Option<&mut DeviceBuffer> {
        self.device.as_mut()
    }

    /// Allocate the device mirror and upload the full host buffer.
    pub fn to_device(&mut self, gpu: &CudaKernel) -> Result<()> {
        self.device = Some(DeviceBuffer::from_host(gpu, &self.data)?);
        Ok(())
    }

    /// Host to device, all `dims[0]` rows.
    pub fn sync_to_device(&mut self) -> Result<()> {
        match self.device.as_mut() {
            Some(buf) => buf.upload(&self.data),
            None => Err(KernelError::NotMirrored { what: "tensor".into() }.into()),
        }
    }

    /// Device to host, all `dims[0]` rows.
    pub fn sync_to_host(&mut self) -> Result<()> {
        match self.device.as_ref() {
            Some(buf) => buf.download(&mut self.data),
            None => Err(KernelError::NotMirrored { what: "tensor".into() }.into()),
        }
    }
}

impl<const R: usize> Index<[usize; R]> for Tensor<R> {
    type Output = Real;

    #[inline]
    fn index(&self, idx: [usize; R]) -> &Real {
        &self.data[self.offset(idx)]
    }
}

impl<const R: usize> IndexMut<[usize; R]> for Tensor<R> {
    #[inline]
    fn index_mut(&mut self, idx: [usize; R]) -> &mut Real {
        let off = self.offset(idx);
        &mut self.data[off]
    }
}

/// Copies host data only; the clone has no device mirror.
impl<const R: usize> Clone for Tensor<R> {
    fn clone(&self) -> Self {
        Self { dims: self.dims, n0: self.n0, data: self.data.clone(), device: None }
    }
}

impl<const R: usize> fmt::Debug for Tensor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Tensor")
            .field("dims", &self.dims)
            .field("n0", &self.n0)
            .field("mirrored", &self.device.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_are_row_major_over_full_extents() {
        let mut t = Tensor::<3>::zeros([4, 2, 3]);
        t[[1, 1, 2]] = 5.0;
        assert_eq!(t.as_slice()[6 + 3 + 2], 5.0);

        t.set_leading_extent(2).unwrap();
        assert_eq!(t[[1, 1, 2]], 5.0);
        assert_eq!(t.len(), 12);
    }

    #[test]
    fn leading_extent_is_bounded_by_capacity() {
        let mut t = Tensor::<2>::zeros([3, 5]);
        assert!(t.set_leading_extent(3).is_ok());
        assert_eq!(
            t.set_leading_extent(4).unwrap_err(),
            ShapeError::BatchTooLarge { requested: 4, max: 3 }
        );
        assert_eq!(t.shape(), [3, 5]);
    }

    #[test]
    #[should_panic(expected = "out of bounds")]
    fn index_past_active_rows_panics() {
        let mut t = Tensor::<2>::zeros([3, 2]);
        t.set_leading_extent(1).unwrap();
        let _ = t[[1, 0]];
    }

    #[test]
    fn from_vec_checks_length() {
        let err = Tensor::<2>::from_vec([2, 2], vec![1.0; 3]).unwrap_err();
        assert!(matches!(err, ShapeError::DataLength { expected: 4, actual: 3, .. }));
    }

    #[test]
    fn wide_views_alias_the_innermost_axis() {
        let mut t = Tensor::<2>::from_vec([2, 6], (0..12).map(|v| v as Real).collect()).unwrap();
        assert_eq!(t.wide::<4>([1, 2]), &[8.0, 9.0, 10.0, 11.0]);
        t.wide_mut::<2>([0, 0])[1] = -1.0;
        assert_eq!(t[[0, 1]], -1.0);
    }

    #[test]
    #[should_panic(expected = "overrun")]
    fn wide_view_cannot_cross_a_row() {
        let t = Tensor::<2>::zeros([2, 6]);
        let _ = t.wide::<4>([0, 3]);
    }

    #[test]
    fn init_uniform_sets_rows_and_range() {
        let mut rng = RandomGen::new(1);
        let mut t = Tensor::<2>::zeros([8, 4]);
        t.init_uniform(3, &mut rng, -0.5, 0.5).unwrap();
        assert_eq!(t.shape(), [3, 4]);
        assert!(t.as_slice().iter().all(|v| (-0.5..=0.5).contains(v)));
        assert!(t.init_uniform(9, &mut rng, 0.0, 1.0).is_err());
    }

    #[test]
    fn add_scaled_and_dot() {
        let mut a = Tensor::<1>::from_vec([3], vec![1.0, 2.0, 3.0]).unwrap();
        let b = Tensor::<1>::from_vec([3], vec![1.0, 1.0, 1.0]).unwrap();
        a.add_scaled(-2.0, &b).unwrap();
        assert_eq!(a.as_slice(), &[-1.0, 0.0, 1.0]);
        assert_eq!(a.dot(&b).unwrap(), 0.0);

        let c = Tensor::<1>::zeros([4]);
        assert!(a.add_scaled(1.0, &c).is_err());
    }

    #[test]
    fn copy_from_takes_leading_extent() {
        let mut src = Tensor::<2>::from_vec([3, 2], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).unwrap();
        src.set_leading_extent(2).unwrap();
        let mut dst = Tensor::<2>::zeros([3, 2]);
        dst.copy_from(&src).unwrap();
        assert_eq!(dst.shape(), [2, 2]);
        assert_eq!(dst.as_slice(), &[1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn clone_is_host_only() {
        let t = Tensor::<1>::from_vec([2], vec![1.0, 2.0]).unwrap();
        let c = t.clone();
        assert!(!c.is_mirrored());
        assert_eq!(c.as_slice(), t.as_slice());
    }

    #[test]
    fn sync_without_mirror_is_an_error() {
        let mut t = Tensor::<1>::zeros([2]);
        assert!(t.sync_to_device().is_err());
        assert!(t.sync_to_host().is_err());
    }
}
