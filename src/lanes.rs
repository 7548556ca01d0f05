//! Fixed four-lane batch layout.
//!
//! Every per-step tensor in this crate (latents, queries, keys, values,
//! attention weights) packs four conceptually distinct images into its
//! leading dimension so the denoising network processes them in one pass:
//!
//! | index | lane      | contents                                   |
//! |-------|-----------|--------------------------------------------|
//! | 0     | OUTPUT    | the image being generated                  |
//! | 1     | STRUCT    | the structure (layout) reference           |
//! | 2     | STYLE1    | first appearance reference                 |
//! | 3     | STYLE2    | second appearance reference                |
//!
//! The ordering is a run-wide invariant: a batch whose leading dimension is
//! not exactly [`NUM_LANES`] is a contract violation and fails loudly.
//!
//! Candle tensors are immutable, so "overwrite the OUTPUT lane" is realized
//! by rebuilding the batch from per-lane slices ([`overwrite_lane`]). The
//! session merges the updated OUTPUT lane back after each callback; the
//! other three lanes are never rebuilt from anything but their own slice.

use candle::{Result, Tensor};

/// Number of lanes in every batched tensor.
pub const NUM_LANES: usize = 4;

/// Lane index of the generated output image.
pub const OUT_INDEX: usize = 0;
/// Lane index of the structure reference image.
pub const STRUCT_INDEX: usize = 1;
/// Lane index of the first appearance reference image.
pub const STYLE1_INDEX: usize = 2;
/// Lane index of the second appearance reference image.
pub const STYLE2_INDEX: usize = 3;

/// Period of the hard structural key/value lock during injection.
pub const MOD_STEP: usize = 5;
/// First denoising step at which the structural lock stops applying.
pub const STRUCT_LOCK_MAX_STEP: usize = 40;

/// Verify that a batched tensor carries exactly [`NUM_LANES`] lanes.
///
/// A wrong lane count reaching the attention path is a fatal precondition
/// failure, never something to reshape around.
pub fn check_lane_batch(t: &Tensor) -> Result<()> {
    let lanes = t.dim(0)?;
    if lanes != NUM_LANES {
        candle::bail!(
            "lane batches must have exactly {} lanes, got leading dimension {} (shape {:?})",
            NUM_LANES,
            lanes,
            t.dims()
        );
    }
    Ok(())
}

/// Extract one lane as a tensor without the lane dimension.
pub fn lane(batch: &Tensor, index: usize) -> Result<Tensor> {
    check_lane_batch(batch)?;
    batch.narrow(0, index, 1)?.squeeze(0)
}

/// Rebuild a lane batch with one lane replaced.
///
/// `replacement` must match the shape of the lane it replaces (without the
/// lane dimension). All other lanes are carried over untouched.
pub fn overwrite_lane(batch: &Tensor, index: usize, replacement: &Tensor) -> Result<Tensor> {
    check_lane_batch(batch)?;
    let expected = batch.narrow(0, index, 1)?.squeeze(0)?;
    if replacement.dims() != expected.dims() {
        candle::bail!(
            "lane {} replacement shape {:?} does not match lane shape {:?}",
            index,
            replacement.dims(),
            expected.dims()
        );
    }
    let mut lanes = Vec::with_capacity(NUM_LANES);
    for i in 0..NUM_LANES {
        if i == index {
            lanes.push(replacement.unsqueeze(0)?);
        } else {
            lanes.push(batch.narrow(0, i, 1)?);
        }
    }
    let refs: Vec<&Tensor> = lanes.iter().collect();
    Tensor::cat(&refs, 0)
}

/// Stack four per-lane tensors into a lane batch, validating that every
/// lane has the same shape.
pub fn stack_lanes(
    out: &Tensor,
    structure: &Tensor,
    style1: &Tensor,
    style2: &Tensor,
) -> Result<Tensor> {
    for (name, t) in [
        ("structure", structure),
        ("style1", style1),
        ("style2", style2),
    ] {
        if t.dims() != out.dims() {
            candle::bail!(
                "{} lane shape {:?} does not match output lane shape {:?}",
                name,
                t.dims(),
                out.dims()
            );
        }
    }
    Tensor::stack(&[out, structure, style1, style2], 0)
}
