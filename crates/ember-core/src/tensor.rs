use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::backprop::{self, GradStore};
use crate::device::{Device, DeviceBuffer, Residency};
use crate::error::{Error, Result};
use crate::kernels::{self, MatmulKernel, Naive};
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::shape::Shape;
use crate::storage::Storage;

// Tensor — The fundamental data structure
//
// A Tensor is an n-dimensional array of f32 values that:
//
//   1. Lives in host memory or in the memory of a Device
//   2. Has a shape and a layout (strides + offset) into its storage
//   3. Optionally tracks the operation that created it (for autograd)
//   4. Optionally owns a gradient buffer of the same element count
//
// MEMORY MODEL:
//
//   The inner data is wrapped in Arc, so cloning a Tensor is cheap and every
//   clone is the same tensor (same id, same gradient buffer).
//
//   Storage is behind Arc<RwLock<Storage>> so that views (view, slice, a
//   contiguous reshape, detach) share it with their source. Writing through
//   one view, e.g. with fill(), is visible through every other view of the
//   same storage. Storage is released when the last tensor referencing it is
//   dropped; device storage goes back to its device's pool.
//
// RESIDENCY:
//
//   There is no ambient "current device". A tensor is placed on a device
//   only through Tensor::device or to_device, both of which take the Device
//   explicitly. Binary ops require both operands in the same place and fail
//   with DeviceMismatch otherwise. Kernels for a device-resident tensor run
//   on that device's workers; host tensors run kernels on the caller's
//   thread (and rayon's global pool).
//
// GRADIENTS:
//
//   Every op records an Op (see op.rs) when any input requires grad. The
//   result then requires grad too. backward() fills the gradient buffer of
//   every tracked tensor in the graph, adding to what is already there.

/// Inner data of a tensor, shared via Arc.
struct TensorInner {
    id: TensorId,
    storage: Arc<RwLock<Storage>>,
    layout: Layout,
    /// The device the storage lives on; None for host memory.
    device: Option<Device>,
    /// The operation that created this tensor. Op::None for leaves.
    op: Op,
    requires_grad: AtomicBool,
    /// Allocated on first use, in the same memory space as the data.
    grad: RwLock<Option<Storage>>,
}

/// An n-dimensional array of f32 with reverse-mode autograd.
///
/// # Example
/// ```
/// use ember_core::Tensor;
///
/// let a = Tensor::new((2, 3));
/// a.fill(1.0)?;
/// let b = Tensor::new((3, 2));
/// b.fill(1.0)?;
/// let c = a.matmul(&b)?;
/// assert_eq!(c.to_vec()?, vec![3.0; 4]);
/// # Ok::<(), ember_core::Error>(())
/// ```
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorInner>,
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Tensor(id={:?}, shape={}, {}, op={})",
            self.inner.id,
            self.inner.layout.shape(),
            self.location(),
            self.inner.op.name(),
        )
    }
}

impl Tensor {
    // Internal constructors

    /// Wrap freshly computed contiguous storage. Tracking is enabled iff
    /// some input of `op` requires grad; otherwise the op is dropped.
    fn from_storage(storage: Storage, shape: Shape, op: Op) -> Self {
        let device = storage.device().cloned();
        Self::build(
            Arc::new(RwLock::new(storage)),
            Layout::contiguous(shape),
            device,
            op,
        )
    }

    /// Create a view sharing this tensor's storage with a different layout.
    fn view_with_layout(&self, layout: Layout, op: Op) -> Self {
        Self::build(
            Arc::clone(&self.inner.storage),
            layout,
            self.inner.device.clone(),
            op,
        )
    }

    fn build(storage: Arc<RwLock<Storage>>, layout: Layout, device: Option<Device>, op: Op) -> Self {
        let track = op.inputs().iter().any(|t| t.requires_grad());
        let op = if track { op } else { Op::None };
        Tensor {
            inner: Arc::new(TensorInner {
                id: TensorId::new(),
                storage,
                layout,
                device,
                op,
                requires_grad: AtomicBool::new(track),
                grad: RwLock::new(None),
            }),
        }
    }

    // Public constructors

    /// A zero-filled host tensor.
    pub fn new(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        Self::from_storage(Storage::Host(vec![0.0; shape.size()]), shape, Op::None)
    }

    /// A zero-filled host tensor with the given dimensions.
    pub fn from_dims(dims: &[usize]) -> Self {
        Self::new(dims)
    }

    /// A zero-filled tensor allocated in `device` memory.
    pub fn device(shape: impl Into<Shape>, device: &Device) -> Result<Self> {
        Self::zeros(shape, Some(device))
    }

    /// A zero-filled tensor on `device`, or on the host when `None`.
    pub fn zeros(shape: impl Into<Shape>, device: Option<&Device>) -> Result<Self> {
        let shape = shape.into();
        let storage = Storage::zeros(shape.size(), device)?;
        Ok(Self::from_storage(storage, shape, Op::None))
    }

    /// A host tensor holding `data` in row-major order.
    pub fn from_vec(data: Vec<f32>, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if data.len() != shape.size() {
            return Err(Error::ElementCountMismatch {
                expected: shape.size(),
                got: data.len(),
                shape,
            });
        }
        Ok(Self::from_storage(Storage::Host(data), shape, Op::None))
    }

    /// A device tensor that takes ownership of `buf`.
    pub fn from_buffer(buf: DeviceBuffer, shape: impl Into<Shape>) -> Result<Self> {
        let shape = shape.into();
        if buf.len() != shape.size() {
            return Err(Error::ElementCountMismatch {
                expected: shape.size(),
                got: buf.len(),
                shape,
            });
        }
        Ok(Self::from_storage(Storage::Device(buf), shape, Op::None))
    }

    // Accessors

    pub fn id(&self) -> TensorId {
        self.inner.id
    }

    pub fn shape(&self) -> &Shape {
        self.inner.layout.shape()
    }

    pub fn dims(&self) -> &[usize] {
        self.inner.layout.dims()
    }

    pub fn ndim(&self) -> usize {
        self.shape().ndim()
    }

    /// Number of elements; always `shape().size()`.
    pub fn size(&self) -> usize {
        self.inner.layout.size()
    }

    pub fn layout(&self) -> &Layout {
        &self.inner.layout
    }

    pub fn is_contiguous(&self) -> bool {
        self.inner.layout.is_contiguous()
    }

    /// The op that created this tensor.
    pub fn op(&self) -> &Op {
        &self.inner.op
    }

    pub fn residency(&self) -> Residency {
        match self.inner.device {
            Some(_) => Residency::Device,
            None => Residency::Host,
        }
    }

    pub fn is_device(&self) -> bool {
        self.inner.device.is_some()
    }

    /// The device holding this tensor's storage, if it is not on the host.
    pub fn placement(&self) -> Option<&Device> {
        self.inner.device.as_ref()
    }

    fn location(&self) -> String {
        match &self.inner.device {
            Some(dev) => dev.name(),
            None => "host".to_string(),
        }
    }

    pub(crate) fn dims2(&self) -> Result<(usize, usize)> {
        match self.dims() {
            &[r, c] => Ok((r, c)),
            d => Err(Error::RankMismatch {
                expected: 2,
                got: d.len(),
            }),
        }
    }

    /// (rows, cols) when viewed as a matrix over the last dimension.
    pub(crate) fn rows_cols(&self) -> (usize, usize) {
        let cols = self.dims().last().copied().unwrap_or(1);
        let rows = if cols == 0 { 0 } else { self.size() / cols };
        (rows, cols)
    }

    fn read_storage(&self) -> Result<RwLockReadGuard<'_, Storage>> {
        self.inner
            .storage
            .read()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    fn write_storage(&self) -> Result<RwLockWriteGuard<'_, Storage>> {
        self.inner
            .storage
            .write()
            .map_err(|_| Error::msg("storage lock poisoned"))
    }

    /// Run a kernel where this tensor lives: on its device's workers, or
    /// directly on the calling thread for host tensors.
    pub(crate) fn launch<R, F>(&self, kernel: F) -> R
    where
        F: FnOnce() -> R + Send,
        R: Send,
    {
        match &self.inner.device {
            Some(dev) => dev.launch(kernel),
            None => kernel(),
        }
    }

    fn check_same_place(&self, other: &Tensor) -> Result<()> {
        match (&self.inner.device, &other.inner.device) {
            (None, None) => Ok(()),
            (Some(a), Some(b)) if a.same_device(b) => Ok(()),
            _ => Err(Error::DeviceMismatch {
                lhs: self.location(),
                rhs: other.location(),
            }),
        }
    }

    fn check_same_shape(&self, other: &Tensor) -> Result<()> {
        if self.shape() != other.shape() {
            return Err(Error::ShapeMismatch {
                expected: self.shape().clone(),
                got: other.shape().clone(),
            });
        }
        Ok(())
    }

    // Data access

    /// Copy the elements out in logical (row-major) order.
    ///
    /// For a device tensor this is the synchronizing read-back: every kernel
    /// launched on it has completed by the time the copy is made.
    pub fn to_vec(&self) -> Result<Vec<f32>> {
        let storage = self.read_storage()?;
        let data = storage.as_slice();
        Ok(match self.inner.layout.dense_range() {
            Some(range) => data[range].to_vec(),
            None => self
                .inner
                .layout
                .strided_indices()
                .map(|i| data[i])
                .collect(),
        })
    }

    /// The single value of a one-element tensor.
    pub fn item(&self) -> Result<f32> {
        if self.size() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        Ok(self.to_vec()?[0])
    }

    /// Set every element covered by this tensor to `value`, in place.
    pub fn fill(&self, value: f32) -> Result<()> {
        let mut storage = self.write_storage()?;
        let data = storage.as_mut_slice();
        match self.inner.layout.dense_range() {
            Some(range) => data[range].fill(value),
            None => {
                for i in self.inner.layout.strided_indices() {
                    data[i] = value;
                }
            }
        }
        Ok(())
    }

    /// Fill with values drawn uniformly from `[min, max]`, in place.
    pub fn random(&self, min: f32, max: f32) -> Result<()> {
        self.random_with(min, max, &mut rand::thread_rng())
    }

    /// Like [`Tensor::random`] with a caller-supplied generator.
    pub fn random_with<R: Rng + ?Sized>(&self, min: f32, max: f32, rng: &mut R) -> Result<()> {
        if !(min.is_finite() && max.is_finite() && min <= max) {
            crate::bail!("random: invalid range [{min}, {max}]");
        }
        let dist = Uniform::new_inclusive(min, max);
        let mut storage = self.write_storage()?;
        let data = storage.as_mut_slice();
        for i in self.inner.layout.strided_indices() {
            data[i] = dist.sample(rng);
        }
        Ok(())
    }

    // Gradient tracking

    /// Enable or disable gradient tracking and return the tensor.
    ///
    /// Only affects operations recorded after the call.
    pub fn requires_grad_(&self, flag: bool) -> Tensor {
        self.inner.requires_grad.store(flag, Ordering::Relaxed);
        self.clone()
    }

    pub fn requires_grad(&self) -> bool {
        self.inner.requires_grad.load(Ordering::Relaxed)
    }

    /// A copy of the accumulated gradient, if one has been allocated.
    pub fn grad(&self) -> Option<Vec<f32>> {
        let slot = self.inner.grad.read().unwrap_or_else(PoisonError::into_inner);
        slot.as_ref().map(|g| g.as_slice().to_vec())
    }

    /// Reset this tensor's gradient to zeros. Parents are not touched.
    pub fn zero_grad(&self) -> Result<()> {
        let mut slot = self.inner.grad.write().unwrap_or_else(PoisonError::into_inner);
        match slot.as_mut() {
            Some(g) => g.as_mut_slice().fill(0.0),
            None if self.requires_grad() => {
                *slot = Some(Storage::zeros(self.size(), self.placement())?);
            }
            None => {}
        }
        Ok(())
    }

    /// Add `grad` (logical order) into the persistent gradient buffer.
    pub(crate) fn accumulate_grad(&self, grad: &[f32]) -> Result<()> {
        let mut slot = self.inner.grad.write().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(Storage::zeros(self.size(), self.placement())?);
        }
        if let Some(buf) = slot.as_mut() {
            for (d, &g) in buf.as_mut_slice().iter_mut().zip(grad) {
                *d += g;
            }
        }
        Ok(())
    }

    /// Backpropagate from this scalar tensor.
    ///
    /// Adds d(self)/d(t) into the gradient of every tensor `t` in the graph
    /// that requires grad, and returns this pass's gradients.
    pub fn backward(&self) -> Result<GradStore> {
        if !self.requires_grad() {
            return Err(Error::GradNotTracked);
        }
        if self.size() != 1 {
            return Err(Error::NotAScalar {
                shape: self.shape().clone(),
            });
        }
        backprop::backward(self, vec![1.0])
    }

    /// Backpropagate from a tensor of any shape, with `seed` as its gradient.
    pub fn backward_with(&self, seed: &[f32]) -> Result<GradStore> {
        if !self.requires_grad() {
            return Err(Error::GradNotTracked);
        }
        if seed.len() != self.size() {
            return Err(Error::ElementCountMismatch {
                shape: self.shape().clone(),
                expected: self.size(),
                got: seed.len(),
            });
        }
        backprop::backward(self, seed.to_vec())
    }

    /// Same data, no gradient tracking, no parents.
    pub fn detach(&self) -> Tensor {
        self.view_with_layout(self.inner.layout.clone(), Op::None)
    }

    // Shape operations

    fn check_numel(&self, shape: &Shape) -> Result<()> {
        if shape.size() != self.size() {
            return Err(Error::ReshapeElementMismatch {
                src: self.size(),
                dst: shape.size(),
                dst_shape: shape.clone(),
            });
        }
        Ok(())
    }

    /// A tensor of `shape` over the same storage. Never copies; fails with
    /// `NotContiguous` if this tensor's elements are not one dense run.
    pub fn view(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        self.check_numel(&shape)?;
        let range = self
            .inner
            .layout
            .dense_range()
            .ok_or(Error::NotContiguous { op: "view" })?;
        let strides = shape.strides();
        Ok(self.view_with_layout(
            Layout::new(shape, strides, range.start),
            Op::Reshape {
                input: self.clone(),
            },
        ))
    }

    /// A tensor of `shape` with the same elements. Shares storage when the
    /// layout allows a view, otherwise copies into fresh storage.
    pub fn reshape(&self, shape: impl Into<Shape>) -> Result<Tensor> {
        let shape = shape.into();
        self.check_numel(&shape)?;
        if self.inner.layout.dense_range().is_some() {
            return self.view(shape);
        }
        let data = self.to_vec()?;
        let storage = Storage::from_vec(data, self.placement())?;
        Ok(Self::from_storage(
            storage,
            shape,
            Op::Reshape {
                input: self.clone(),
            },
        ))
    }

    /// A view of elements `start..end` along `dim`.
    pub fn slice(&self, start: usize, end: usize, dim: usize) -> Result<Tensor> {
        let layout = self.inner.layout.slice(dim, start, end)?;
        Ok(self.view_with_layout(
            layout,
            Op::Slice {
                input: self.clone(),
                dim,
                start,
                end,
            },
        ))
    }

    /// The transpose of a 2-D tensor, in fresh contiguous storage.
    pub fn transpose(&self) -> Result<Tensor> {
        let (rows, cols) = self.dims2()?;
        let x = self.to_vec()?;
        let mut out = Storage::zeros(x.len(), self.placement())?;
        self.launch(|| kernels::transpose(&x, out.as_mut_slice(), rows, cols))?;
        Ok(Self::from_storage(
            out,
            Shape::from((cols, rows)),
            Op::Transpose {
                input: self.clone(),
            },
        ))
    }

    // Residency transfers

    /// Copy into a new tensor in `device` memory.
    ///
    /// The returned tensor owns its own buffer. This tensor is left as it
    /// was; its storage is released when the caller drops it.
    pub fn to_device(&self, device: &Device) -> Result<Tensor> {
        let data = self.to_vec()?;
        let buf = device.upload(&data)?;
        Ok(Self::from_storage(
            Storage::Device(buf),
            self.shape().clone(),
            Op::Transfer {
                input: self.clone(),
            },
        ))
    }

    /// Copy into a new host tensor. Blocks until the data is available.
    ///
    /// As with [`Tensor::to_device`], the source is left untouched.
    pub fn to_host(&self) -> Result<Tensor> {
        let data = self.to_vec()?;
        if let Some(dev) = &self.inner.device {
            log::trace!("{}: device -> host copy of {} floats", dev.name(), data.len());
        }
        Ok(Self::from_storage(
            Storage::Host(data),
            self.shape().clone(),
            Op::Transfer {
                input: self.clone(),
            },
        ))
    }

    // Arithmetic

    /// Matrix product with the reference kernel.
    pub fn matmul(&self, rhs: &Tensor) -> Result<Tensor> {
        self.matmul_with(rhs, &Naive)
    }

    /// Matrix product of [M×K] and [K×N] with the given kernel.
    pub fn matmul_with(&self, rhs: &Tensor, kernel: &dyn MatmulKernel) -> Result<Tensor> {
        let (m, k) = self.dims2()?;
        let (k2, n) = rhs.dims2()?;
        if k != k2 {
            return Err(Error::MatmulShapeMismatch { m, k1: k, k2, n });
        }
        self.check_same_place(rhs)?;
        let a = self.to_vec()?;
        let b = rhs.to_vec()?;
        let mut out = Storage::zeros(m * n, self.placement())?;
        self.launch(|| kernel.run(&a, &b, out.as_mut_slice(), m, n, k))?;
        Ok(Self::from_storage(
            out,
            Shape::from((m, n)),
            Op::Matmul {
                lhs: self.clone(),
                rhs: rhs.clone(),
            },
        ))
    }

    fn binary<F>(&self, rhs: &Tensor, op: Op, kernel: F) -> Result<Tensor>
    where
        F: FnOnce(&[f32], &[f32], &mut [f32], usize) -> Result<()> + Send,
    {
        self.check_same_shape(rhs)?;
        self.check_same_place(rhs)?;
        let a = self.to_vec()?;
        let b = rhs.to_vec()?;
        let mut out = Storage::zeros(a.len(), self.placement())?;
        self.launch(|| kernel(&a, &b, out.as_mut_slice(), a.len()))?;
        Ok(Self::from_storage(out, self.shape().clone(), op))
    }

    fn unary<F>(&self, op: Op, kernel: F) -> Result<Tensor>
    where
        F: FnOnce(&[f32], &mut [f32], usize) -> Result<()> + Send,
    {
        let x = self.to_vec()?;
        let mut out = Storage::zeros(x.len(), self.placement())?;
        self.launch(|| kernel(&x, out.as_mut_slice(), x.len()))?;
        Ok(Self::from_storage(out, self.shape().clone(), op))
    }

    /// Element-wise sum of two tensors of the same shape.
    pub fn add(&self, rhs: &Tensor) -> Result<Tensor> {
        let op = Op::Add {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        self.binary(rhs, op, kernels::add_residual)
    }

    /// Element-wise product of two tensors of the same shape.
    pub fn mul(&self, rhs: &Tensor) -> Result<Tensor> {
        let op = Op::Mul {
            lhs: self.clone(),
            rhs: rhs.clone(),
        };
        self.binary(rhs, op, kernels::mul)
    }

    pub fn relu(&self) -> Result<Tensor> {
        let op = Op::Relu {
            input: self.clone(),
        };
        self.unary(op, kernels::relu)
    }

    /// Multiply every element by `factor`.
    pub fn scale(&self, factor: f32) -> Result<Tensor> {
        let op = Op::Scale {
            input: self.clone(),
            factor,
        };
        self.unary(op, move |x, out, n| kernels::scale(x, out, 1, n, factor))
    }

    /// Softmax over the last dimension.
    pub fn softmax(&self) -> Result<Tensor> {
        let (rows, cols) = self.rows_cols();
        let x = self.to_vec()?;
        let mut out = Storage::zeros(x.len(), self.placement())?;
        self.launch(|| kernels::softmax_rows(&x, out.as_mut_slice(), rows, cols))?;
        let op = Op::Softmax {
            input: self.clone(),
            output: out.as_slice().to_vec(),
        };
        Ok(Self::from_storage(out, self.shape().clone(), op))
    }

    /// Layer normalization over the last dimension, with `gamma` and `beta`
    /// 1-D tensors of that dimension's size.
    pub fn layer_norm(&self, gamma: &Tensor, beta: &Tensor) -> Result<Tensor> {
        let (rows, cols) = self.rows_cols();
        for p in [gamma, beta] {
            if p.dims() != [cols] {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from(cols),
                    got: p.shape().clone(),
                });
            }
            self.check_same_place(p)?;
        }
        let x = self.to_vec()?;
        let g = gamma.to_vec()?;
        let b = beta.to_vec()?;
        let mut out = Storage::zeros(x.len(), self.placement())?;
        self.launch(|| kernels::layer_norm(&x, &g, &b, out.as_mut_slice(), rows, cols))?;
        Ok(Self::from_storage(
            out,
            self.shape().clone(),
            Op::LayerNorm {
                input: self.clone(),
                gamma: gamma.clone(),
                beta: beta.clone(),
            },
        ))
    }

    /// Sum of all elements as a scalar (shape `[]`).
    pub fn sum(&self) -> Result<Tensor> {
        let total: f32 = self.to_vec()?.iter().sum();
        let storage = Storage::from_vec(vec![total], self.placement())?;
        Ok(Self::from_storage(
            storage,
            Shape::from(()),
            Op::Sum {
                input: self.clone(),
            },
        ))
    }
}

impl fmt::Display for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tensor(shape={}, {}, data=", self.shape(), self.location())?;
        match self.to_vec() {
            Ok(data) if data.len() <= 16 => write!(f, "{data:?}")?,
            Ok(data) => write!(f, "{:?} ... ({} total)", &data[..8], data.len())?,
            Err(_) => write!(f, "<unavailable>")?,
        }
        if self.requires_grad() {
            write!(f, ", requires_grad")?;
        }
        write!(f, ")")
    }
}
