// Matrix multiplication kernels
//
//   C[M×N] = A[M×K] · B[K×N]
//
// Two forward implementations share one contract:
//   - matmul:        the reference triple loop, one output row per task
//   - tiled_matmul:  TILE×TILE blocking over rows, k and columns
//
// Both accumulate each C[i][j] over k in ascending order starting from 0.0,
// so on identical inputs they produce bit-identical results. The tiled
// variant only changes memory access order, never the summation order.
//
// Backward (C = A·B, upstream gradient dC):
//   dA[M×K] = dC · Bᵀ     → matmul_backward_a
//   dB[K×N] = Aᵀ · dC     → matmul_backward_b
// Both overwrite their output; the autograd engine does the accumulation.

use rayon::prelude::*;

use super::{check_len, TILE};
use crate::error::Result;

/// A matrix multiplication implementation.
///
/// Implementations must compute exactly `C = A·B` for row-major buffers;
/// they differ only in performance.
pub trait MatmulKernel: Send + Sync {
    fn name(&self) -> &'static str;

    #[allow(clippy::too_many_arguments)]
    fn run(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize)
        -> Result<()>;
}

/// Reference triple-loop matmul.
#[derive(Debug, Clone, Copy, Default)]
pub struct Naive;

/// Cache-blocked matmul.
#[derive(Debug, Clone, Copy, Default)]
pub struct Tiled;

impl MatmulKernel for Naive {
    fn name(&self) -> &'static str {
        "naive"
    }

    fn run(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) -> Result<()> {
        matmul(a, b, c, m, n, k)
    }
}

impl MatmulKernel for Tiled {
    fn name(&self) -> &'static str {
        "tiled"
    }

    fn run(&self, a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) -> Result<()> {
        tiled_matmul(a, b, c, m, n, k)
    }
}

fn check_operands(a: &[f32], b: &[f32], c: &[f32], m: usize, n: usize, k: usize) -> Result<()> {
    check_len("a", a.len(), m * k)?;
    check_len("b", b.len(), k * n)?;
    check_len("c", c.len(), m * n)
}

/// C[M×N] = A[M×K] · B[K×N], reference implementation.
pub fn matmul(a: &[f32], b: &[f32], c: &mut [f32], m: usize, n: usize, k: usize) -> Result<()> {
    check_operands(a, b, c, m, n, k)?;
    if n == 0 {
        return Ok(());
    }
    c[..m * n]
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(i, row)| {
            let a_row = &a[i * k..(i + 1) * k];
            for (j, out) in row.iter_mut().enumerate() {
                let mut acc = 0.0f32;
                for (p, &av) in a_row.iter().enumerate() {
                    acc += av * b[p * n + j];
                }
                *out = acc;
            }
        });
    Ok(())
}

/// C[M×N] = A[M×K] · B[K×N], blocked in TILE×TILE tiles.
pub fn tiled_matmul(
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
) -> Result<()> {
    check_operands(a, b, c, m, n, k)?;
    if n == 0 {
        return Ok(());
    }
    c[..m * n]
        .par_chunks_mut(TILE * n)
        .enumerate()
        .for_each(|(block, c_block)| {
            let i0 = block * TILE;
            let rows = c_block.len() / n;
            c_block.fill(0.0);
            for p0 in (0..k).step_by(TILE) {
                let p1 = (p0 + TILE).min(k);
                for j0 in (0..n).step_by(TILE) {
                    let j1 = (j0 + TILE).min(n);
                    for ii in 0..rows {
                        let a_row = &a[(i0 + ii) * k..(i0 + ii + 1) * k];
                        let c_row = &mut c_block[ii * n..(ii + 1) * n];
                        for p in p0..p1 {
                            let av = a_row[p];
                            let b_row = &b[p * n..(p + 1) * n];
                            for j in j0..j1 {
                                c_row[j] += av * b_row[j];
                            }
                        }
                    }
                }
            }
        });
    Ok(())
}

/// grad_A[M×K] = grad_C[M×N] · Bᵀ, where B is [K×N].
pub fn matmul_backward_a(
    grad_c: &[f32],
    b: &[f32],
    grad_a: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
) -> Result<()> {
    check_len("grad_c", grad_c.len(), m * n)?;
    check_len("b", b.len(), k * n)?;
    check_len("grad_a", grad_a.len(), m * k)?;
    if k == 0 {
        return Ok(());
    }
    grad_a[..m * k]
        .par_chunks_mut(k)
        .enumerate()
        .for_each(|(i, row)| {
            let g_row = &grad_c[i * n..(i + 1) * n];
            for (p, out) in row.iter_mut().enumerate() {
                let b_row = &b[p * n..(p + 1) * n];
                *out = g_row.iter().zip(b_row).map(|(&g, &bv)| g * bv).sum();
            }
        });
    Ok(())
}

/// grad_B[K×N] = Aᵀ · grad_C[M×N], where A is [M×K].
pub fn matmul_backward_b(
    a: &[f32],
    grad_c: &[f32],
    grad_b: &mut [f32],
    m: usize,
    n: usize,
    k: usize,
) -> Result<()> {
    check_len("a", a.len(), m * k)?;
    check_len("grad_c", grad_c.len(), m * n)?;
    check_len("grad_b", grad_b.len(), k * n)?;
    if n == 0 {
        return Ok(());
    }
    grad_b[..k * n]
        .par_chunks_mut(n)
        .enumerate()
        .for_each(|(p, row)| {
            row.fill(0.0);
            for i in 0..m {
                let av = a[i * k + p];
                let g_row = &grad_c[i * n..(i + 1) * n];
                for (out, &g) in row.iter_mut().zip(g_row) {
                    *out += av * g;
                }
            }
        });
    Ok(())
}
