// Backpropagation — Reverse-mode automatic differentiation
//
// HOW IT WORKS:
//
//   1. Forward pass: tensor operations record an Op naming their inputs,
//      which forms a DAG from the loss back to the leaves.
//
//   2. backward() topologically sorts the DAG with a depth-first search, so
//      every tensor appears after all of its inputs.
//
//   3. Starting with grad(root) = seed (1.0 for a scalar loss), the graph is
//      walked in reverse order. When a tensor is reached, every consumer has
//      already contributed to its gradient, so its rule runs exactly once and
//      passes a contribution to each input.
//
//   4. The per-pass gradients are then added into the persistent gradient
//      buffer of every tensor that requires grad. Nothing is ever cleared
//      implicitly: two backward() calls without zero_grad() in between leave
//      twice the gradient.
//
// GRADIENT RULES (g = gradient of the result):
//
//   Matmul:     grad_A += g · Bᵀ,  grad_B += Aᵀ · g
//   Add:        grad_a += g,       grad_b += g
//   Mul:        grad_a += g ⊙ b,   grad_b += g ⊙ a
//   Relu:       grad_x += g where x > 0
//   Scale:      grad_x += g * factor
//   Transpose:  grad_x += gᵀ
//   Softmax:    grad_x += y ⊙ (g - Σ g ⊙ y)    per row
//   LayerNorm:  see kernels::layer_norm_backward
//   Sum:        grad_x += g (broadcast)
//   Reshape:    grad_x += g (same logical order)
//   Slice:      grad_x += g scattered into the sliced window
//   Transfer:   grad_x += g
//
// ACCUMULATION: If a tensor is used in several operations, its gradient is
// the SUM of the contributions from each use (multivariate chain rule).
// For example: c = a * a gives grad_a = g ⊙ a + g ⊙ a = 2 * a * g.
//
// All gradients are flat f32 vectors in the tensor's logical (row-major)
// order, whatever its storage layout.

use std::collections::{HashMap, HashSet};

use crate::error::Result;
use crate::kernels;
use crate::layout::Layout;
use crate::op::{Op, TensorId};
use crate::tensor::Tensor;

/// Stores the gradients computed by one backward pass.
///
/// The persistent per-tensor gradient (see [`Tensor::grad`]) accumulates
/// across passes; a GradStore holds just the gradients of the pass that
/// returned it.
#[derive(Debug, Clone, Default)]
pub struct GradStore {
    grads: HashMap<TensorId, Vec<f32>>,
}

impl GradStore {
    pub fn new() -> Self {
        GradStore {
            grads: HashMap::new(),
        }
    }

    /// Get the gradient of a tensor (if one flowed to it).
    pub fn get(&self, tensor: &Tensor) -> Option<&[f32]> {
        self.grads.get(&tensor.id()).map(Vec::as_slice)
    }

    /// Number of tensors that received a gradient.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Add `grad` to the gradient stored for `id`.
    pub fn accumulate(&mut self, id: TensorId, grad: Vec<f32>) {
        match self.grads.get_mut(&id) {
            Some(existing) => {
                for (e, g) in existing.iter_mut().zip(grad) {
                    *e += g;
                }
            }
            None => {
                self.grads.insert(id, grad);
            }
        }
    }
}

/// Build a topological ordering of the computation graph.
///
/// Depth-first from the root; leaves first, root last.
fn build_topo(root: &Tensor) -> Vec<Tensor> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();

    fn visit(t: &Tensor, visited: &mut HashSet<TensorId>, order: &mut Vec<Tensor>) {
        if !visited.insert(t.id()) {
            return;
        }
        for input in t.op().inputs() {
            visit(input, visited, order);
        }
        order.push(t.clone());
    }

    visit(root, &mut visited, &mut order);
    order
}

/// Propagate `seed` (the gradient of `root`) back through the graph.
///
/// Called by [`Tensor::backward`] and [`Tensor::backward_with`], which
/// validate the root and the seed.
pub(crate) fn backward(root: &Tensor, seed: Vec<f32>) -> Result<GradStore> {
    let topo = build_topo(root);
    log::trace!(
        "backward from tensor {:?}: {} nodes in graph",
        root.id(),
        topo.len()
    );

    let mut grads = GradStore::new();
    grads.grads.insert(root.id(), seed);

    for tensor in topo.iter().rev() {
        let grad_output = match grads.grads.get(&tensor.id()) {
            Some(g) => g.clone(),
            None => continue,
        };
        for (input, grad) in input_grads(tensor, &grad_output)? {
            grads.accumulate(input, grad);
        }
    }

    for tensor in &topo {
        if !tensor.requires_grad() {
            continue;
        }
        if let Some(g) = grads.grads.get(&tensor.id()) {
            tensor.accumulate_grad(g)?;
        }
    }
    Ok(grads)
}

/// Apply the gradient rule of `tensor`'s op to `g`, returning one
/// contribution per input that requires grad.
fn input_grads(tensor: &Tensor, g: &[f32]) -> Result<Vec<(TensorId, Vec<f32>)>> {
    let mut out = Vec::new();
    let wants = |t: &Tensor| t.requires_grad();

    match tensor.op() {
        Op::None => {}

        Op::Matmul { lhs, rhs } => {
            let (m, k) = lhs.dims2()?;
            let n = rhs.dims()[1];
            if wants(lhs) {
                let b = rhs.to_vec()?;
                let mut ga = vec![0.0; m * k];
                tensor.launch(|| kernels::matmul_backward_a(g, &b, &mut ga, m, n, k))?;
                out.push((lhs.id(), ga));
            }
            if wants(rhs) {
                let a = lhs.to_vec()?;
                let mut gb = vec![0.0; k * n];
                tensor.launch(|| kernels::matmul_backward_b(&a, g, &mut gb, m, n, k))?;
                out.push((rhs.id(), gb));
            }
        }

        Op::Add { lhs, rhs } => {
            for t in [lhs, rhs] {
                if wants(t) {
                    out.push((t.id(), g.to_vec()));
                }
            }
        }

        Op::Mul { lhs, rhs } => {
            for (t, other) in [(lhs, rhs), (rhs, lhs)] {
                if wants(t) {
                    let o = other.to_vec()?;
                    let mut gt = vec![0.0; g.len()];
                    tensor.launch(|| kernels::mul(g, &o, &mut gt, g.len()))?;
                    out.push((t.id(), gt));
                }
            }
        }

        Op::Relu { input } => {
            if wants(input) {
                let x = input.to_vec()?;
                let mut gx = vec![0.0; g.len()];
                tensor.launch(|| kernels::relu_backward(&x, g, &mut gx, g.len()))?;
                out.push((input.id(), gx));
            }
        }

        Op::Scale { input, factor } => {
            if wants(input) {
                let mut gx = vec![0.0; g.len()];
                tensor.launch(|| kernels::scale(g, &mut gx, 1, g.len(), *factor))?;
                out.push((input.id(), gx));
            }
        }

        Op::Transpose { input } => {
            if wants(input) {
                // g has the result's shape; its transpose has the input's
                let (rows, cols) = tensor.dims2()?;
                let mut gx = vec![0.0; g.len()];
                tensor.launch(|| kernels::transpose(g, &mut gx, rows, cols))?;
                out.push((input.id(), gx));
            }
        }

        Op::Softmax { input, output } => {
            if wants(input) {
                let (rows, cols) = input.rows_cols();
                let mut gx = vec![0.0; g.len()];
                tensor.launch(|| kernels::softmax_rows_backward(output, g, &mut gx, rows, cols))?;
                out.push((input.id(), gx));
            }
        }

        Op::LayerNorm { input, gamma, beta } => {
            let (rows, cols) = input.rows_cols();
            let x = input.to_vec()?;
            let gm = gamma.to_vec()?;
            let mut gx = vec![0.0; rows * cols];
            let mut gg = vec![0.0; cols];
            let mut gb = vec![0.0; cols];
            tensor.launch(|| {
                kernels::layer_norm_backward(&x, &gm, g, &mut gx, &mut gg, &mut gb, rows, cols)
            })?;
            for (t, grad) in [(input, gx), (gamma, gg), (beta, gb)] {
                if wants(t) {
                    out.push((t.id(), grad));
                }
            }
        }

        Op::Sum { input } => {
            if wants(input) {
                out.push((input.id(), vec![g[0]; input.size()]));
            }
        }

        Op::Reshape { input } | Op::Transfer { input } => {
            if wants(input) {
                out.push((input.id(), g.to_vec()));
            }
        }

        Op::Slice {
            input,
            dim,
            start,
            end,
        } => {
            if wants(input) {
                let window = Layout::contiguous(input.shape().clone()).slice(*dim, *start, *end)?;
                let mut gx = vec![0.0; input.size()];
                for (idx, &v) in window.strided_indices().zip(g) {
                    gx[idx] += v;
                }
                out.push((input.id(), gx));
            }
        }
    }

    Ok(out)
}
