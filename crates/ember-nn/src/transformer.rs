// TransformerBlock — One layer of the Transformer architecture
//
// ARCHITECTURE (post-norm, as in the original Transformer):
//
//   ┌────────────────────────────────┐
//   │ Input: x [seq_len, d_model]    │
//   └───────────────┬────────────────┘
//                   │
//          ┌────────┴────────┐
//          │ Q = x·W_q       │
//          │ K = x·W_k       │
//          │ V = x·W_v       │
//          │   ↓             │
//          │ MHA(Q, K, V)    │  ← multi-head self-attention
//          │   ↓             │
//          │ ·W_o            │
//          └────────┬────────┘
//                   │ + x        ← residual connection
//              LayerNorm 1       → x1
//                   │
//          ┌────────┴────────┐
//          │ x1·W_ff1        │  d_model → d_ff
//          │ ReLU            │
//          │ ·W_ff2          │  d_ff → d_model
//          └────────┬────────┘
//                   │ + x1       ← residual connection
//              LayerNorm 2       → output
//
// WEIGHT LAYOUT: every weight is row-major [in × out], so a projection is
// a plain `activations · W` matmul with no transpose.
//
// WORKSPACE LAYOUT (floats, s = seq_len, d = d_model):
//
//   [ x1 (s·d) | phase scratch ]
//
//   attention phase:     Q, K, V, attn, proj, res  (6·s·d)
//                        + multihead_workspace_len(s, d, num_heads)
//   feed-forward phase:  h_pre, h (2·s·d_ff) + f, res2 (2·s·d)
//
// x1 survives from the first phase into the second; the two phases reuse
// the same scratch region. See TransformerBlock::workspace_len.
//
// OWNERSHIP: HostTransformerBlock is a plain host-memory template.
// TransformerBlock::allocate copies it into device buffers that the block
// owns; free() (or dropping the block) returns them to the device pool.
// Both consume the block, so use after free does not compile.

use ember_core::kernels::{
    add_residual, layer_norm, matmul, multihead_attention, multihead_workspace_len, relu,
};
use ember_core::{Device, DeviceBuffer, Error, Result, Shape, Tensor};
use rand::distributions::{Distribution, Uniform};
use rand::Rng;

use crate::config::{check_heads, TransformerConfig};
use crate::workspace::Workspace;

/// Host-resident initial values for one block.
#[derive(Debug, Clone, PartialEq)]
pub struct HostTransformerBlock {
    pub config: TransformerConfig,
    /// [d_model × d_model]
    pub w_q: Vec<f32>,
    /// [d_model × d_model]
    pub w_k: Vec<f32>,
    /// [d_model × d_model]
    pub w_v: Vec<f32>,
    /// [d_model × d_model]
    pub w_o: Vec<f32>,
    /// [d_model × d_ff]
    pub w_ff1: Vec<f32>,
    /// [d_ff × d_model]
    pub w_ff2: Vec<f32>,
    pub ln1_gamma: Vec<f32>,
    pub ln1_beta: Vec<f32>,
    pub ln2_gamma: Vec<f32>,
    pub ln2_beta: Vec<f32>,
}

impl HostTransformerBlock {
    /// Every weight set to `value`; layer norms start as the identity
    /// (gamma = 1, beta = 0).
    pub fn filled(config: TransformerConfig, value: f32) -> Result<Self> {
        Self::build(config, |n| vec![value; n])
    }

    /// Weights drawn uniformly from `[min, max]`.
    pub fn uniform(config: TransformerConfig, min: f32, max: f32) -> Result<Self> {
        Self::uniform_with(config, min, max, &mut rand::thread_rng())
    }

    /// Like [`HostTransformerBlock::uniform`] with a caller-supplied generator.
    pub fn uniform_with<R: Rng + ?Sized>(
        config: TransformerConfig,
        min: f32,
        max: f32,
        rng: &mut R,
    ) -> Result<Self> {
        if !(min.is_finite() && max.is_finite() && min <= max) {
            ember_core::bail!("uniform init: invalid range [{min}, {max}]");
        }
        let dist = Uniform::new_inclusive(min, max);
        Self::build(config, |n| (0..n).map(|_| dist.sample(rng)).collect())
    }

    fn build(config: TransformerConfig, mut weight: impl FnMut(usize) -> Vec<f32>) -> Result<Self> {
        config.validate()?;
        let (d, dff) = (config.d_model, config.d_ff);
        Ok(HostTransformerBlock {
            config,
            w_q: weight(d * d),
            w_k: weight(d * d),
            w_v: weight(d * d),
            w_o: weight(d * d),
            w_ff1: weight(d * dff),
            w_ff2: weight(dff * d),
            ln1_gamma: vec![1.0; d],
            ln1_beta: vec![0.0; d],
            ln2_gamma: vec![1.0; d],
            ln2_beta: vec![0.0; d],
        })
    }

    /// (name, values, expected shape) for every parameter, in a fixed order.
    fn parameters(&self) -> [(&'static str, &[f32], Shape); 10] {
        let (d, dff) = (self.config.d_model, self.config.d_ff);
        [
            ("w_q", self.w_q.as_slice(), Shape::from((d, d))),
            ("w_k", self.w_k.as_slice(), Shape::from((d, d))),
            ("w_v", self.w_v.as_slice(), Shape::from((d, d))),
            ("w_o", self.w_o.as_slice(), Shape::from((d, d))),
            ("w_ff1", self.w_ff1.as_slice(), Shape::from((d, dff))),
            ("w_ff2", self.w_ff2.as_slice(), Shape::from((dff, d))),
            ("ln1_gamma", self.ln1_gamma.as_slice(), Shape::from(d)),
            ("ln1_beta", self.ln1_beta.as_slice(), Shape::from(d)),
            ("ln2_gamma", self.ln2_gamma.as_slice(), Shape::from(d)),
            ("ln2_beta", self.ln2_beta.as_slice(), Shape::from(d)),
        ]
    }
}

/// One transformer layer whose parameters live in device memory.
pub struct TransformerBlock {
    config: TransformerConfig,
    device: Device,
    w_q: DeviceBuffer,
    w_k: DeviceBuffer,
    w_v: DeviceBuffer,
    w_o: DeviceBuffer,
    w_ff1: DeviceBuffer,
    w_ff2: DeviceBuffer,
    ln1_gamma: DeviceBuffer,
    ln1_beta: DeviceBuffer,
    ln2_gamma: DeviceBuffer,
    ln2_beta: DeviceBuffer,
}

impl TransformerBlock {
    /// Copy every parameter of `host` into fresh `device` buffers.
    ///
    /// Fails if the configuration is invalid or any host array has the wrong
    /// length, before anything is uploaded.
    pub fn allocate(device: &Device, host: &HostTransformerBlock) -> Result<Self> {
        host.config.validate()?;
        for (name, values, shape) in host.parameters() {
            if values.len() != shape.size() {
                log::warn!("{name}: expected {} values, got {}", shape.size(), values.len());
                return Err(Error::ElementCountMismatch {
                    expected: shape.size(),
                    got: values.len(),
                    shape,
                });
            }
        }

        let block = TransformerBlock {
            config: host.config,
            device: device.clone(),
            w_q: device.upload(&host.w_q)?,
            w_k: device.upload(&host.w_k)?,
            w_v: device.upload(&host.w_v)?,
            w_o: device.upload(&host.w_o)?,
            w_ff1: device.upload(&host.w_ff1)?,
            w_ff2: device.upload(&host.w_ff2)?,
            ln1_gamma: device.upload(&host.ln1_gamma)?,
            ln1_beta: device.upload(&host.ln1_beta)?,
            ln2_gamma: device.upload(&host.ln2_gamma)?,
            ln2_beta: device.upload(&host.ln2_beta)?,
        };
        log::debug!(
            "{}: allocated transformer block (d_model={}, heads={}, d_ff={}, {} parameters)",
            device.name(),
            block.config.d_model,
            block.config.num_heads,
            block.config.d_ff,
            block.config.parameter_count()
        );
        Ok(block)
    }

    /// Release the block's device buffers.
    pub fn free(self) {
        drop(self)
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn d_model(&self) -> usize {
        self.config.d_model
    }

    pub fn num_heads(&self) -> usize {
        self.config.num_heads
    }

    pub fn d_ff(&self) -> usize {
        self.config.d_ff
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Minimum workspace length, in floats, for [`TransformerBlock::forward`]:
    ///
    /// `s·d + max(6·s·d + multihead_workspace_len(s, d, num_heads), 2·s·d_ff + 2·s·d)`
    pub fn workspace_len(&self, seq_len: usize, num_heads: usize) -> usize {
        let (d, dff) = (self.config.d_model, self.config.d_ff);
        let sd = seq_len * d;
        let attention = 6 * sd + multihead_workspace_len(seq_len, d, num_heads);
        let feed_forward = 2 * seq_len * dff + 2 * sd;
        sd + attention.max(feed_forward)
    }

    /// Run the block on a `[seq_len × d_model]` input.
    ///
    /// `num_heads` must divide `d_model`; the weights do not depend on it.
    /// `workspace` must hold at least [`TransformerBlock::workspace_len`]
    /// floats. Kernels run on the block's device.
    pub fn forward(
        &self,
        input: &[f32],
        output: &mut [f32],
        workspace: &mut [f32],
        seq_len: usize,
        num_heads: usize,
    ) -> Result<()> {
        let (d, dff) = (self.config.d_model, self.config.d_ff);
        let sd = seq_len * d;
        check_heads(d, num_heads)?;
        if input.len() != sd {
            return Err(Error::ElementCountMismatch {
                shape: Shape::from((seq_len, d)),
                expected: sd,
                got: input.len(),
            });
        }
        if output.len() < sd {
            return Err(Error::BufferTooSmall {
                name: "output",
                required: sd,
                got: output.len(),
            });
        }
        let required = self.workspace_len(seq_len, num_heads);
        if workspace.len() < required {
            return Err(Error::WorkspaceTooSmall {
                op: "transformer_block",
                required,
                got: workspace.len(),
            });
        }
        if seq_len == 0 {
            return Ok(());
        }

        self.device.launch(|| {
            let (x1, scratch) = workspace.split_at_mut(sd);

            // attention sub-layer
            {
                let (q, rest) = scratch.split_at_mut(sd);
                let (k, rest) = rest.split_at_mut(sd);
                let (v, rest) = rest.split_at_mut(sd);
                let (attn, rest) = rest.split_at_mut(sd);
                let (proj, rest) = rest.split_at_mut(sd);
                let (res, mha_ws) = rest.split_at_mut(sd);

                matmul(input, &self.w_q, q, seq_len, d, d)?;
                matmul(input, &self.w_k, k, seq_len, d, d)?;
                matmul(input, &self.w_v, v, seq_len, d, d)?;
                multihead_attention(q, k, v, attn, mha_ws, seq_len, d, num_heads)?;
                matmul(attn, &self.w_o, proj, seq_len, d, d)?;
                add_residual(proj, input, res, sd)?;
                layer_norm(res, &self.ln1_gamma, &self.ln1_beta, x1, seq_len, d)?;
            }

            // feed-forward sub-layer
            let (h_pre, rest) = scratch.split_at_mut(seq_len * dff);
            let (h, rest) = rest.split_at_mut(seq_len * dff);
            let (f, rest) = rest.split_at_mut(sd);
            let res2 = &mut rest[..sd];

            matmul(x1, &self.w_ff1, h_pre, seq_len, dff, d)?;
            relu(h_pre, h, seq_len * dff)?;
            matmul(h, &self.w_ff2, f, seq_len, d, dff)?;
            add_residual(f, x1, res2, sd)?;
            layer_norm(res2, &self.ln2_gamma, &self.ln2_beta, output, seq_len, d)
        })
    }

    /// Tensor-level [`TransformerBlock::forward`]: `input` must be a
    /// `[seq_len, d_model]` tensor on this block's device. Returns a new
    /// device tensor of the same shape.
    ///
    /// If `input` requires grad, the block is evaluated with recorded tensor
    /// operations instead of the fused kernels, so `backward()` on anything
    /// computed from the result reaches `input`. The workspace is not used
    /// on that path. The block's parameters are constants either way.
    pub fn forward_tensor(
        &self,
        input: &Tensor,
        workspace: &mut Workspace,
        num_heads: usize,
    ) -> Result<Tensor> {
        let seq_len = match input.dims() {
            &[s, d] if d == self.config.d_model => s,
            &[s, _] => {
                return Err(Error::ShapeMismatch {
                    expected: Shape::from((s, self.config.d_model)),
                    got: input.shape().clone(),
                })
            }
            dims => {
                return Err(Error::RankMismatch {
                    expected: 2,
                    got: dims.len(),
                })
            }
        };
        match input.placement() {
            Some(dev) if dev.same_device(&self.device) => {}
            other => {
                return Err(Error::DeviceMismatch {
                    lhs: self.device.name(),
                    rhs: other.map_or_else(|| "host".to_string(), Device::name),
                })
            }
        }
        if !workspace.device().same_device(&self.device) {
            return Err(Error::DeviceMismatch {
                lhs: self.device.name(),
                rhs: workspace.device().name(),
            });
        }

        if input.requires_grad() {
            return self.forward_graph(input, num_heads);
        }
        let x = input.to_vec()?;
        let mut out = self.device.alloc(x.len())?;
        self.forward(&x, &mut out, workspace, seq_len, num_heads)?;
        Tensor::from_buffer(out, input.shape().clone())
    }

    /// The forward pipeline as differentiable tensor operations.
    fn forward_graph(&self, x: &Tensor, num_heads: usize) -> Result<Tensor> {
        let (d, dff) = (self.config.d_model, self.config.d_ff);
        check_heads(d, num_heads)?;
        let dh = d / num_heads;
        log::trace!(
            "{}: recording transformer block graph ({num_heads} heads)",
            self.device.name()
        );

        let q = x.matmul(&self.param(&self.w_q, (d, d))?)?;
        let k = x.matmul(&self.param(&self.w_k, (d, d))?)?;
        let v = x.matmul(&self.param(&self.w_v, (d, d))?)?;
        let w_o = self.param(&self.w_o, (d, d))?;

        // concat(heads)·W_o is the sum over heads of head_h · W_o[rows of h]
        let mut proj = attention_head(&q, &k, &v, &w_o, 0, dh)?;
        for h in 1..num_heads {
            proj = proj.add(&attention_head(&q, &k, &v, &w_o, h, dh)?)?;
        }
        let x1 = proj.add(x)?.layer_norm(
            &self.param(&self.ln1_gamma, d)?,
            &self.param(&self.ln1_beta, d)?,
        )?;

        let f = x1
            .matmul(&self.param(&self.w_ff1, (d, dff))?)?
            .relu()?
            .matmul(&self.param(&self.w_ff2, (dff, d))?)?;
        f.add(&x1)?.layer_norm(
            &self.param(&self.ln2_gamma, d)?,
            &self.param(&self.ln2_beta, d)?,
        )
    }

    /// An untracked device tensor holding a copy of one parameter buffer.
    fn param(&self, buf: &DeviceBuffer, shape: impl Into<Shape>) -> Result<Tensor> {
        Tensor::from_buffer(self.device.upload(buf)?, shape)
    }
}

/// One head of self-attention over columns `h·dh..(h+1)·dh`, already
/// multiplied by the matching rows of `w_o`.
fn attention_head(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    w_o: &Tensor,
    h: usize,
    dh: usize,
) -> Result<Tensor> {
    let (start, end) = (h * dh, (h + 1) * dh);
    let scores = q
        .slice(start, end, 1)?
        .matmul(&k.slice(start, end, 1)?.transpose()?)?
        .scale(1.0 / (dh as f32).sqrt())?
        .softmax()?;
    scores
        .matmul(&v.slice(start, end, 1)?)?
        .matmul(&w_o.slice(start, end, 0)?)
}

impl Drop for TransformerBlock {
    fn drop(&mut self) {
        log::debug!(
            "{}: released transformer block (d_model={})",
            self.device.name(),
            self.config.d_model
        );
    }
}

impl std::fmt::Debug for TransformerBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformerBlock")
            .field("config", &self.config)
            .field("device", &self.device)
            .finish()
    }
}
