//! Attention math for the four-lane batch.
//!
//! Standard scaled dot-product attention, `softmax(QK^T / sqrt(d)) V`,
//! computed per lane even though the lanes travel batched together. The
//! injection layer only changes which keys/values a lane sees; the math
//! here never mixes lanes on its own.
//!
//! When an edited call is in flight (`edit_map`), the output lane's
//! attention distribution is sharpened before multiplying by V: injected
//! keys/values flatten the distribution, and the contrast transform
//! counteracts that. All other lanes always use the plain softmax output.

use candle::{DType, Device, Result, Tensor, D};

use crate::config::RunConfig;
use crate::lanes::{self, OUT_INDEX};

/// Verify at construction time that the device can run the fused attention
/// path (batched matmul + softmax). A failing probe is a hard environment
/// precondition, reported before any denoising step executes.
pub fn ensure_fused_attention(device: &Device) -> Result<()> {
    let probe = (|| -> Result<()> {
        let q = Tensor::ones((1, 1, 2, 2), DType::F32, device)?;
        let logits = q.matmul(&q.transpose(D::Minus2, D::Minus1)?)?;
        let weights = candle_nn::ops::softmax_last_dim(&logits)?;
        let _ = weights.matmul(&q)?;
        Ok(())
    })();
    if let Err(e) = probe {
        candle::bail!(
            "scaled dot-product attention is not supported on {:?}: {e}",
            device
        );
    }
    Ok(())
}

/// Decide whether a self-attention layer is eligible for cross-lane mixing
/// at the current step.
///
/// Mixing is resolution-gated: 32x32 layers mix inside
/// `cross_attn_32_range`, 64x64 layers inside `cross_attn_64_range`, and
/// every other resolution never mixes. These two ranges are the injection's
/// main precision knob; swapping this predicate requires no changes
/// elsewhere in the pipeline.
pub fn should_mix_keys_and_values(config: &RunConfig, step: usize, seq_len: usize) -> bool {
    let in_32 = config.cross_attn_32_range.contains(step) && seq_len == 32 * 32;
    let in_64 = config.cross_attn_64_range.contains(step) && seq_len == 64 * 64;
    in_32 || in_64
}

/// Sharpen an attention-weight distribution around its per-row mean.
///
/// `w' = (w - mean(w)) * factor + mean(w)`, with the mean taken over the
/// key dimension. Factors above 1 concentrate mass on the strongest keys.
pub fn enhance_contrast(weights: &Tensor, factor: f64) -> Result<Tensor> {
    let mean = weights.mean_keepdim(D::Minus1)?;
    (weights.broadcast_sub(&mean)? * factor)?.broadcast_add(&mean)
}

/// Compute scaled dot-product attention over a four-lane batch.
///
/// # Shapes
///
/// - `q`: `[4, heads, seq_q, head_dim]`
/// - `k`, `v`: `[4, heads, seq_kv, head_dim]`
/// - `attention_mask`: optional additive mask broadcastable to
///   `[4, heads, seq_q, seq_kv]`, added to the logits before softmax
///
/// # Returns
///
/// `(hidden_states, raw_weights)` where `hidden_states` is
/// `[4, heads, seq_q, head_dim]` and `raw_weights` is the pre-sharpening
/// `[4, heads, seq_q, seq_kv]` softmax output needed by the segmentation
/// accumulator.
pub fn compute_attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    attention_mask: Option<&Tensor>,
    is_cross: bool,
    edit_map: bool,
    contrast_strength: f64,
) -> Result<(Tensor, Tensor)> {
    lanes::check_lane_batch(q)?;
    let head_dim = q.dim(D::Minus1)?;
    let scale = 1.0 / (head_dim as f64).sqrt();

    let logits = (q.contiguous()?.matmul(&k.transpose(D::Minus2, D::Minus1)?.contiguous()?)? * scale)?;
    let logits = match attention_mask {
        Some(mask) => logits.broadcast_add(mask)?,
        None => logits,
    };
    let raw_weights = candle_nn::ops::softmax_last_dim(&logits)?;

    // Only the output lane is sharpened, and only on edited self-attention
    // calls; the reference lanes keep their plain distributions.
    let weights = if edit_map && !is_cross {
        let out = lanes::lane(&raw_weights, OUT_INDEX)?;
        let sharpened = enhance_contrast(&out, contrast_strength)?.clamp(0f32, 1f32)?;
        lanes::overwrite_lane(&raw_weights, OUT_INDEX, &sharpened)?
    } else {
        raw_weights.clone()
    };

    let hidden_states = weights.contiguous()?.matmul(&v.contiguous()?)?;
    Ok((hidden_states, raw_weights))
}
