// Element-wise and data-movement kernels

use rayon::prelude::*;

use super::check_len;
use crate::error::Result;

/// output[j, i] = input[i, j] for a [rows × cols] input.
pub fn transpose(input: &[f32], output: &mut [f32], rows: usize, cols: usize) -> Result<()> {
    check_len("input", input.len(), rows * cols)?;
    check_len("output", output.len(), rows * cols)?;
    if rows == 0 {
        return Ok(());
    }
    output[..rows * cols]
        .par_chunks_mut(rows)
        .enumerate()
        .for_each(|(j, out_row)| {
            for (i, out) in out_row.iter_mut().enumerate() {
                *out = input[i * cols + j];
            }
        });
    Ok(())
}

/// b = a * factor over an [m × n] buffer.
pub fn scale(a: &[f32], b: &mut [f32], m: usize, n: usize, factor: f32) -> Result<()> {
    let size = m * n;
    check_len("a", a.len(), size)?;
    check_len("b", b.len(), size)?;
    b[..size]
        .par_iter_mut()
        .zip(&a[..size])
        .for_each(|(out, &x)| *out = x * factor);
    Ok(())
}

/// output[i] = max(0, x[i])
pub fn relu(x: &[f32], output: &mut [f32], size: usize) -> Result<()> {
    check_len("x", x.len(), size)?;
    check_len("output", output.len(), size)?;
    output[..size]
        .par_iter_mut()
        .zip(&x[..size])
        .for_each(|(out, &v)| *out = v.max(0.0));
    Ok(())
}

/// Gate an upstream gradient by the forward input of relu:
/// grad_input[i] = grad_output[i] if input[i] > 0, else 0.
///
/// `input` is the tensor relu was applied to, not its output. The two agree
/// on the sign test everywhere except that neither passes gradient at 0.
pub fn relu_backward(
    input: &[f32],
    grad_output: &[f32],
    grad_input: &mut [f32],
    size: usize,
) -> Result<()> {
    check_len("input", input.len(), size)?;
    check_len("grad_output", grad_output.len(), size)?;
    check_len("grad_input", grad_input.len(), size)?;
    grad_input[..size]
        .par_iter_mut()
        .zip(input[..size].par_iter().zip(&grad_output[..size]))
        .for_each(|(out, (&x, &g))| *out = if x > 0.0 { g } else { 0.0 });
    Ok(())
}

/// output[i] = x[i] + residual[i]
pub fn add_residual(x: &[f32], residual: &[f32], output: &mut [f32], size: usize) -> Result<()> {
    check_len("x", x.len(), size)?;
    check_len("residual", residual.len(), size)?;
    check_len("output", output.len(), size)?;
    output[..size]
        .par_iter_mut()
        .zip(x[..size].par_iter().zip(&residual[..size]))
        .for_each(|(out, (&a, &b))| *out = a + b);
    Ok(())
}

/// output[i] = x[i] * y[i]
pub fn mul(x: &[f32], y: &[f32], output: &mut [f32], size: usize) -> Result<()> {
    check_len("x", x.len(), size)?;
    check_len("y", y.len(), size)?;
    check_len("output", output.len(), size)?;
    output[..size]
        .par_iter_mut()
        .zip(x[..size].par_iter().zip(&y[..size]))
        .for_each(|(out, (&a, &b))| *out = a * b);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transpose_2x3() {
        let input = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = [0.0; 6];
        transpose(&input, &mut out, 2, 3).unwrap();
        assert_eq!(out, [1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
        let mut back = [0.0; 6];
        transpose(&out, &mut back, 3, 2).unwrap();
        assert_eq!(back, input);
    }

    #[test]
    fn test_relu_and_backward() {
        let x = [-1.0, 0.0, 2.0, -3.0];
        let mut y = [9.0; 4];
        relu(&x, &mut y, 4).unwrap();
        assert_eq!(y, [0.0, 0.0, 2.0, 0.0]);

        let mut g = [9.0; 4];
        relu_backward(&x, &[1.0; 4], &mut g, 4).unwrap();
        assert_eq!(g, [0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn test_scale_add_mul() {
        let a = [1.0, -2.0, 3.0, 0.5];
        let mut out = [0.0; 4];
        scale(&a, &mut out, 2, 2, 2.0).unwrap();
        assert_eq!(out, [2.0, -4.0, 6.0, 1.0]);
        add_residual(&a, &[1.0; 4], &mut out, 4).unwrap();
        assert_eq!(out, [2.0, -1.0, 4.0, 1.5]);
        mul(&a, &a, &mut out, 4).unwrap();
        assert_eq!(out, [1.0, 4.0, 9.0, 0.25]);
    }

    #[test]
    fn test_only_leading_elements_touched() {
        let mut out = [7.0; 5];
        relu(&[1.0, -1.0, 1.0], &mut out, 3).unwrap();
        assert_eq!(out, [1.0, 0.0, 1.0, 7.0, 7.0]);
    }
}
