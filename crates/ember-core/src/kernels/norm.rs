// Layer normalization over the last dimension
//
// FORMULA (per row of `cols` elements):
//   mean = Σ x / cols
//   var  = Σ (x - mean)² / cols            (biased, as in the forward pass of
//                                           every transformer implementation)
//   y    = γ ⊙ (x - mean) / sqrt(var + ε) + β
//
// ε = LN_EPS keeps a constant row (var = 0) from dividing by zero.
//
// BACKWARD (x̂ = (x - mean) * rstd, rstd = 1/sqrt(var + ε), g = dL/dy):
//   dβ[j] = Σ_rows g[r, j]
//   dγ[j] = Σ_rows g[r, j] * x̂[r, j]
//   dx̂    = g ⊙ γ
//   dx    = rstd * (dx̂ - mean(dx̂) - x̂ * mean(dx̂ ⊙ x̂))

use rayon::prelude::*;

use super::check_len;
use crate::error::Result;

/// Epsilon added to the variance before the square root.
pub const LN_EPS: f32 = 1e-5;

fn row_stats(row: &[f32]) -> (f32, f32) {
    let n = row.len() as f32;
    let mean = row.iter().sum::<f32>() / n;
    let var = row.iter().map(|&v| (v - mean) * (v - mean)).sum::<f32>() / n;
    (mean, 1.0 / (var + LN_EPS).sqrt())
}

/// y = γ ⊙ normalize(x) + β for each row of a [rows × cols] buffer.
pub fn layer_norm(
    x: &[f32],
    gamma: &[f32],
    beta: &[f32],
    y: &mut [f32],
    rows: usize,
    cols: usize,
) -> Result<()> {
    let size = rows * cols;
    check_len("x", x.len(), size)?;
    check_len("gamma", gamma.len(), cols)?;
    check_len("beta", beta.len(), cols)?;
    check_len("y", y.len(), size)?;
    if cols == 0 {
        return Ok(());
    }
    y[..size]
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(r, out)| {
            let row = &x[r * cols..(r + 1) * cols];
            let (mean, rstd) = row_stats(row);
            for (j, o) in out.iter_mut().enumerate() {
                *o = gamma[j] * (row[j] - mean) * rstd + beta[j];
            }
        });
    Ok(())
}

/// Gradients of [`layer_norm`] with respect to x, γ and β.
/// All three outputs are overwritten.
#[allow(clippy::too_many_arguments)]
pub fn layer_norm_backward(
    x: &[f32],
    gamma: &[f32],
    grad_y: &[f32],
    grad_x: &mut [f32],
    grad_gamma: &mut [f32],
    grad_beta: &mut [f32],
    rows: usize,
    cols: usize,
) -> Result<()> {
    let size = rows * cols;
    check_len("x", x.len(), size)?;
    check_len("gamma", gamma.len(), cols)?;
    check_len("grad_y", grad_y.len(), size)?;
    check_len("grad_x", grad_x.len(), size)?;
    check_len("grad_gamma", grad_gamma.len(), cols)?;
    check_len("grad_beta", grad_beta.len(), cols)?;
    if cols == 0 {
        return Ok(());
    }

    grad_x[..size]
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(r, out)| {
            let row = &x[r * cols..(r + 1) * cols];
            let g = &grad_y[r * cols..(r + 1) * cols];
            let (mean, rstd) = row_stats(row);
            let n = cols as f32;
            let mut sum_dxhat = 0.0f32;
            let mut sum_dxhat_xhat = 0.0f32;
            for j in 0..cols {
                let xhat = (row[j] - mean) * rstd;
                let dxhat = g[j] * gamma[j];
                sum_dxhat += dxhat;
                sum_dxhat_xhat += dxhat * xhat;
            }
            for (j, o) in out.iter_mut().enumerate() {
                let xhat = (row[j] - mean) * rstd;
                let dxhat = g[j] * gamma[j];
                *o = rstd * (dxhat - sum_dxhat / n - xhat * sum_dxhat_xhat / n);
            }
        });

    grad_gamma[..cols].fill(0.0);
    grad_beta[..cols].fill(0.0);
    for r in 0..rows {
        let row = &x[r * cols..(r + 1) * cols];
        let g = &grad_y[r * cols..(r + 1) * cols];
        let (mean, rstd) = row_stats(row);
        for j in 0..cols {
            grad_gamma[j] += g[j] * (row[j] - mean) * rstd;
            grad_beta[j] += g[j];
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_row() {
        let x = [1.0, 2.0, 3.0, 4.0];
        let mut y = [0.0; 4];
        layer_norm(&x, &[1.0; 4], &[0.0; 4], &mut y, 1, 4).unwrap();
        let expected = [-1.342, -0.447, 0.447, 1.342];
        for (a, e) in y.iter().zip(expected) {
            assert!((a - e).abs() < 1e-3, "{a} vs {e}");
        }
        let mean: f32 = y.iter().sum::<f32>() / 4.0;
        let var: f32 = y.iter().map(|v| v * v).sum::<f32>() / 4.0;
        assert!(mean.abs() < 1e-6);
        assert!((var - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_constant_row_is_finite() {
        let mut y = [1.0; 3];
        layer_norm(&[5.0; 3], &[2.0; 3], &[0.5; 3], &mut y, 1, 3).unwrap();
        assert_eq!(y, [0.5; 3]);
    }

    #[test]
    fn test_gamma_beta_applied() {
        let x = [1.0, 3.0];
        let mut y = [0.0; 2];
        layer_norm(&x, &[2.0, 2.0], &[1.0, -1.0], &mut y, 1, 2).unwrap();
        // normalized row is ±1 (up to ε)
        assert!((y[0] - (-1.0)).abs() < 1e-4);
        assert!((y[1] - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_grad_beta_is_column_sum() {
        let x = [1.0, 2.0, 4.0, 0.0];
        let g = [1.0, 2.0, 3.0, 4.0];
        let (mut gx, mut gg, mut gb) = ([0.0; 4], [0.0; 2], [0.0; 2]);
        layer_norm_backward(&x, &[1.0, 1.0], &g, &mut gx, &mut gg, &mut gb, 2, 2).unwrap();
        assert_eq!(gb, [4.0, 6.0]);
        // normalized rows: [-1, 1] and [1, -1]
        assert!((gg[0] - (-1.0 + 3.0)).abs() < 1e-3);
        assert!((gg[1] - (2.0 - 4.0)).abs() < 1e-3);
    }
}
