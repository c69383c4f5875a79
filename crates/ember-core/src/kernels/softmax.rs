// Row-wise softmax
//
//   y[r, j] = exp(x[r, j] - max_r) / Σ_j exp(x[r, j] - max_r)
//
// Subtracting the row max keeps every exponent ≤ 0, so large logits do not
// overflow and the result is unchanged by adding a constant to a row.
//
// Backward, with upstream gradient g:
//   dx[r, j] = y[r, j] * (g[r, j] - Σ_k g[r, k] * y[r, k])

use rayon::prelude::*;

use super::check_len;
use crate::error::Result;

/// Numerically stable softmax over each row of a [rows × cols] buffer.
pub fn softmax_rows(input: &[f32], output: &mut [f32], rows: usize, cols: usize) -> Result<()> {
    let size = rows * cols;
    check_len("input", input.len(), size)?;
    check_len("output", output.len(), size)?;
    if cols == 0 {
        return Ok(());
    }
    output[..size].copy_from_slice(&input[..size]);
    output[..size].par_chunks_mut(cols).for_each(softmax_in_place);
    Ok(())
}

/// Softmax of one row, in place.
pub(crate) fn softmax_in_place(row: &mut [f32]) {
    let max = row.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in row.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    let inv = 1.0 / sum;
    for v in row.iter_mut() {
        *v *= inv;
    }
}

/// Gradient of [`softmax_rows`] given its output `y` and upstream `grad_y`.
pub fn softmax_rows_backward(
    y: &[f32],
    grad_y: &[f32],
    grad_x: &mut [f32],
    rows: usize,
    cols: usize,
) -> Result<()> {
    let size = rows * cols;
    check_len("y", y.len(), size)?;
    check_len("grad_y", grad_y.len(), size)?;
    check_len("grad_x", grad_x.len(), size)?;
    if cols == 0 {
        return Ok(());
    }
    grad_x[..size]
        .par_chunks_mut(cols)
        .enumerate()
        .for_each(|(r, out)| {
            let y_row = &y[r * cols..(r + 1) * cols];
            let g_row = &grad_y[r * cols..(r + 1) * cols];
            let dot: f32 = y_row.iter().zip(g_row).map(|(&a, &b)| a * b).sum();
            for ((o, &yv), &gv) in out.iter_mut().zip(y_row).zip(g_row) {
                *o = yv * (gv - dot);
            }
        });
    Ok(())
}
