// Scaled dot-product attention
//
//   scores = Q · Kᵀ * (1 / sqrt(d))
//   P      = softmax_rows(scores)
//   out    = P · V
//
// with Q, K, V and out all [seq_len × d] row-major. Multi-head attention
// splits the d_model columns into `num_heads` slices of width
// d_head = d_model / num_heads and runs the same routine on each slice,
// scaling by 1/sqrt(d_head).
//
// WORKSPACE CONTRACT (floats):
//
//   attention:            seq² + seq·d_model
//                         [ scores (seq×seq) | Kᵀ (d_model×seq) ]
//
//   multihead_attention:  num_heads·seq² + 4·seq·d_model
//                         one region per head, each
//                         [ scores | Q_h | K_hᵀ | V_h | out_h ]
//                         = seq² + 4·seq·d_head
//
// Heads are independent, so their regions are processed in parallel and
// the per-head outputs are scattered back into their output columns.

use rayon::prelude::*;

use super::matmul::matmul;
use super::softmax::softmax_in_place;
use super::{check_len, elementwise::transpose};
use crate::error::{Error, Result};

/// Minimum workspace length for [`attention`].
pub fn attention_workspace_len(seq_len: usize, d_model: usize) -> usize {
    seq_len * seq_len + seq_len * d_model
}

/// Minimum workspace length for [`multihead_attention`].
pub fn multihead_workspace_len(seq_len: usize, d_model: usize, num_heads: usize) -> usize {
    num_heads * seq_len * seq_len + 4 * seq_len * d_model
}

fn check_workspace(op: &'static str, got: usize, required: usize) -> Result<()> {
    if got < required {
        return Err(Error::WorkspaceTooSmall { op, required, got });
    }
    Ok(())
}

/// One attention head over pre-transposed keys.
fn attend(
    q: &[f32],
    kt: &[f32],
    v: &[f32],
    scores: &mut [f32],
    out: &mut [f32],
    seq_len: usize,
    d: usize,
) -> Result<()> {
    matmul(q, kt, scores, seq_len, seq_len, d)?;
    let scale = 1.0 / (d as f32).sqrt();
    for row in scores[..seq_len * seq_len].chunks_mut(seq_len) {
        for s in row.iter_mut() {
            *s *= scale;
        }
        softmax_in_place(row);
    }
    matmul(scores, v, out, seq_len, d, seq_len)
}

/// Single-head attention: output = softmax(Q·Kᵀ / sqrt(d_model)) · V.
#[allow(clippy::too_many_arguments)]
pub fn attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    output: &mut [f32],
    workspace: &mut [f32],
    seq_len: usize,
    d_model: usize,
) -> Result<()> {
    let size = seq_len * d_model;
    check_len("q", q.len(), size)?;
    check_len("k", k.len(), size)?;
    check_len("v", v.len(), size)?;
    check_len("output", output.len(), size)?;
    check_workspace(
        "attention",
        workspace.len(),
        attention_workspace_len(seq_len, d_model),
    )?;
    if seq_len == 0 || d_model == 0 {
        return Ok(());
    }

    let (scores, rest) = workspace.split_at_mut(seq_len * seq_len);
    let kt = &mut rest[..size];
    transpose(k, kt, seq_len, d_model)?;
    attend(q, kt, v, scores, output, seq_len, d_model)
}

/// Multi-head attention over `num_heads` equal column slices of d_model.
///
/// Fails with `HeadsMismatch` when `num_heads` is zero or does not divide
/// `d_model`. See [`multihead_workspace_len`] for the workspace size.
#[allow(clippy::too_many_arguments)]
pub fn multihead_attention(
    q: &[f32],
    k: &[f32],
    v: &[f32],
    output: &mut [f32],
    workspace: &mut [f32],
    seq_len: usize,
    d_model: usize,
    num_heads: usize,
) -> Result<()> {
    if num_heads == 0 || d_model % num_heads != 0 {
        return Err(Error::HeadsMismatch { d_model, num_heads });
    }
    let size = seq_len * d_model;
    check_len("q", q.len(), size)?;
    check_len("k", k.len(), size)?;
    check_len("v", v.len(), size)?;
    check_len("output", output.len(), size)?;
    check_workspace(
        "multihead_attention",
        workspace.len(),
        multihead_workspace_len(seq_len, d_model, num_heads),
    )?;
    if seq_len == 0 || d_model == 0 {
        return Ok(());
    }

    let dh = d_model / num_heads;
    let head_len = seq_len * dh;
    let region = seq_len * seq_len + 4 * head_len;

    workspace[..num_heads * region]
        .par_chunks_mut(region)
        .enumerate()
        .try_for_each(|(h, ws)| -> Result<()> {
            let (scores, ws) = ws.split_at_mut(seq_len * seq_len);
            let (q_h, ws) = ws.split_at_mut(head_len);
            let (kt_h, ws) = ws.split_at_mut(head_len);
            let (v_h, out_h) = ws.split_at_mut(head_len);

            let col = h * dh;
            for i in 0..seq_len {
                let src = i * d_model + col;
                q_h[i * dh..(i + 1) * dh].copy_from_slice(&q[src..src + dh]);
                v_h[i * dh..(i + 1) * dh].copy_from_slice(&v[src..src + dh]);
                for c in 0..dh {
                    kt_h[c * seq_len + i] = k[src + c];
                }
            }
            attend(q_h, kt_h, v_h, scores, &mut out_h[..head_len], seq_len, dh)
        })?;

    for h in 0..num_heads {
        let out_h = &workspace[h * region + seq_len * seq_len + 3 * head_len..][..head_len];
        let col = h * dh;
        for i in 0..seq_len {
            output[i * d_model + col..i * d_model + col + dh]
                .copy_from_slice(&out_h[i * dh..(i + 1) * dh]);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(n: usize, scale: f32) -> Vec<f32> {
        (0..n).map(|i| ((i * 5 % 13) as f32 - 6.0) * scale).collect()
    }

    #[test]
    fn test_identical_keys_average_values() {
        // every score is equal, so each output row is the mean of V's rows
        let (s, d) = (3, 2);
        let q = seq(s * d, 0.1);
        let k = vec![1.0; s * d];
        let v = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let mut out = vec![0.0; s * d];
        let mut ws = vec![0.0; attention_workspace_len(s, d)];
        attention(&q, &k, &v, &mut out, &mut ws, s, d).unwrap();
        for row in out.chunks(d) {
            assert!((row[0] - 3.0).abs() < 1e-5);
            assert!((row[1] - 4.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_single_head_matches_attention() {
        let (s, d) = (5, 8);
        let q = seq(s * d, 0.21);
        let k = seq(s * d, 0.17);
        let v = seq(s * d, 0.05);
        let mut a = vec![0.0; s * d];
        let mut b = vec![0.0; s * d];
        let mut ws = vec![0.0; multihead_workspace_len(s, d, 1)];
        attention(&q, &k, &v, &mut a, &mut ws, s, d).unwrap();
        multihead_attention(&q, &k, &v, &mut b, &mut ws, s, d, 1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_heads_are_independent_slices() {
        let (s, d, h) = (4, 6, 2);
        let dh = d / h;
        let q = seq(s * d, 0.3);
        let k = seq(s * d, 0.2);
        let v = seq(s * d, 0.1);
        let mut out = vec![0.0; s * d];
        let mut ws = vec![0.0; multihead_workspace_len(s, d, h)];
        multihead_attention(&q, &k, &v, &mut out, &mut ws, s, d, h).unwrap();

        let slice = |x: &[f32], hd: usize| -> Vec<f32> {
            (0..s)
                .flat_map(|i| x[i * d + hd * dh..i * d + (hd + 1) * dh].to_vec())
                .collect()
        };
        for hd in 0..h {
            let mut expect = vec![0.0; s * dh];
            let mut ws1 = vec![0.0; attention_workspace_len(s, dh)];
            attention(
                &slice(&q, hd),
                &slice(&k, hd),
                &slice(&v, hd),
                &mut expect,
                &mut ws1,
                s,
                dh,
            )
            .unwrap();
            assert_eq!(slice(&out, hd), expect);
        }
    }

    #[test]
    fn test_heads_must_divide_d_model() {
        let x = vec![0.0; 12];
        let mut out = vec![0.0; 12];
        let mut ws = vec![0.0; 1024];
        for heads in [0, 5] {
            let err = multihead_attention(&x, &x, &x, &mut out, &mut ws, 2, 6, heads).unwrap_err();
            assert!(matches!(err, Error::HeadsMismatch { d_model: 6, .. }));
        }
    }

    #[test]
    fn test_small_workspace_rejected() {
        let x = vec![0.0; 8];
        let mut out = vec![0.0; 8];
        let mut ws = vec![0.0; attention_workspace_len(2, 4) - 1];
        let err = attention(&x, &x, &x, &mut out, &mut ws, 2, 4).unwrap_err();
        assert!(matches!(
            err,
            Error::WorkspaceTooSmall { op: "attention", .. }
        ));
    }
}
