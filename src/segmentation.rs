//! Region masks and their two acquisition paths.
//!
//! Injection and statistics alignment both consume binary foreground masks
//! at the two latent resolutions the UNet attends at (32x32 and 64x64).
//! Masks come from one of two sources:
//!
//! - an external segmentation service, reached through the
//!   [`ObjectSegmenter`] trait and queried eagerly the first time masks are
//!   needed for a run; or
//! - the model's own cross-attention maps, accumulated per layer call in an
//!   [`AttentionStore`] and thresholded once at a fixed step
//!   (prompt-mixing self-segmentation).
//!
//! Either way, masks are computed once per run and immutable afterwards;
//! the [`MaskStore`] caches them and recomputes synchronously if a consumer
//! asks before they exist.

use std::collections::HashMap;
use std::path::Path;

use candle::{DType, Result, Tensor, D};
use tracing::{debug, trace};

use crate::config::RunConfig;
use crate::lanes::{self, OUT_INDEX, STRUCT_INDEX, STYLE1_INDEX, STYLE2_INDEX};

/// Number of objects expected in the structure image.
pub const STRUCT_OBJECT_COUNT: usize = 2;

/// The two spatial resolutions at which masks exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MaskResolution {
    /// 32x32 latent grid (1024 attention locations).
    R32,
    /// 64x64 latent grid (4096 attention locations).
    R64,
}

impl MaskResolution {
    /// Side length of the square grid.
    pub const fn side(self) -> usize {
        match self {
            Self::R32 => 32,
            Self::R64 => 64,
        }
    }

    /// Flattened sequence length of the grid.
    pub const fn seq_len(self) -> usize {
        self.side() * self.side()
    }

    /// Map an attention sequence length back to a mask resolution.
    /// Returns `None` for resolutions masks do not exist at.
    pub fn from_seq_len(seq_len: usize) -> Option<Self> {
        match seq_len {
            1024 => Some(Self::R32),
            4096 => Some(Self::R64),
            _ => None,
        }
    }
}

/// A binary foreground mask over one square latent grid.
///
/// Values are {0, 1} as f32; the shape is validated at construction and
/// the mask is immutable afterwards.
#[derive(Debug, Clone)]
pub struct RegionMask {
    resolution: MaskResolution,
    mask: Tensor,
}

impl RegionMask {
    /// Wrap a `[side, side]` tensor as a region mask.
    ///
    /// Fails if the tensor shape does not match the stated resolution; a
    /// mask at the wrong resolution is a contract violation, not something
    /// to resize.
    pub fn new(mask: Tensor, resolution: MaskResolution) -> Result<Self> {
        let side = resolution.side();
        if mask.dims() != [side, side] {
            candle::bail!(
                "region mask shape {:?} does not match resolution {}x{}",
                mask.dims(),
                side,
                side
            );
        }
        let mask = mask.to_dtype(DType::F32)?;
        Ok(Self { resolution, mask })
    }

    /// The grid resolution of this mask.
    pub fn resolution(&self) -> MaskResolution {
        self.resolution
    }

    /// The `[side, side]` mask tensor.
    pub fn tensor(&self) -> &Tensor {
        &self.mask
    }

    /// The mask flattened to a `[seq_len, 1]` column, the layout the
    /// key/value blend broadcasts against.
    pub fn flattened(&self) -> Result<Tensor> {
        self.mask.flatten_all()?.unsqueeze(D::Minus1)
    }

    /// The complement mask, `1 - m`.
    pub fn inverse(&self) -> Result<Self> {
        let ones = Tensor::ones_like(&self.mask)?;
        Ok(Self {
            resolution: self.resolution,
            mask: (ones - &self.mask)?,
        })
    }

    /// Elementwise union with another mask at the same resolution.
    pub fn union(&self, other: &Self) -> Result<Self> {
        if self.resolution != other.resolution {
            candle::bail!(
                "cannot union masks at different resolutions ({:?} vs {:?})",
                self.resolution,
                other.resolution
            );
        }
        Ok(Self {
            resolution: self.resolution,
            mask: self.mask.maximum(&other.mask)?,
        })
    }

    /// Fraction of the grid covered by the mask.
    pub fn coverage(&self) -> Result<f32> {
        self.mask.mean_all()?.to_scalar::<f32>()
    }
}

/// The pair of per-resolution masks describing one object in one image.
#[derive(Debug, Clone)]
pub struct ObjectMasks {
    /// Mask on the 32x32 grid.
    pub mask_32: RegionMask,
    /// Mask on the 64x64 grid.
    pub mask_64: RegionMask,
}

impl ObjectMasks {
    /// Build from per-resolution masks, validating their resolutions.
    pub fn new(mask_32: RegionMask, mask_64: RegionMask) -> Result<Self> {
        if mask_32.resolution() != MaskResolution::R32 {
            candle::bail!("mask_32 has resolution {:?}", mask_32.resolution());
        }
        if mask_64.resolution() != MaskResolution::R64 {
            candle::bail!("mask_64 has resolution {:?}", mask_64.resolution());
        }
        Ok(Self { mask_32, mask_64 })
    }

    /// The mask at the requested resolution.
    pub fn at(&self, resolution: MaskResolution) -> &RegionMask {
        match resolution {
            MaskResolution::R32 => &self.mask_32,
            MaskResolution::R64 => &self.mask_64,
        }
    }
}

/// Boundary to the external segmentation service.
///
/// Given an image path and an expected object count, the service returns
/// one [`ObjectMasks`] per detected object. Only the 32x32 and 64x64
/// resolutions are consumed; how the service produces them is its own
/// business.
pub trait ObjectSegmenter {
    /// Segment `n_objects` foreground objects out of the image at `path`.
    fn segment(&self, path: &Path, n_objects: usize) -> Result<Vec<ObjectMasks>>;
}

/// Per-run masks for every role that consumes one.
#[derive(Debug, Clone)]
pub struct RoleMasks {
    /// Individual object masks in the structure image.
    pub struct_objects: Vec<ObjectMasks>,
    /// Union foreground of the structure image.
    pub structure: ObjectMasks,
    /// Foreground of the first appearance image.
    pub app1: ObjectMasks,
    /// Foreground of the second appearance image.
    pub app2: ObjectMasks,
}

/// Running cross-attention statistics used for attention-derived masks.
///
/// Every attention-processor call feeds its raw weights in here; only
/// cross-attention calls at mask-bearing resolutions actually accumulate.
/// The store averages, per lane and per resolution, the attention each
/// spatial location pays to the prompt's object-noun token.
#[derive(Debug)]
pub struct AttentionStore {
    object_token_index: usize,
    sums: HashMap<(usize, MaskResolution), Tensor>,
    counts: HashMap<(usize, MaskResolution), usize>,
}

impl AttentionStore {
    /// Create an empty store tracking the given prompt token.
    pub fn new(object_token_index: usize) -> Self {
        Self {
            object_token_index,
            sums: HashMap::new(),
            counts: HashMap::new(),
        }
    }

    /// Accumulate one layer's raw attention weights.
    ///
    /// `attn_weights` is `[4, heads, seq_q, seq_kv]`. Self-attention calls
    /// and unsupported resolutions are absorbed silently; a token index
    /// outside the conditioning sequence is logged and skipped.
    pub fn update(&mut self, attn_weights: &Tensor, is_cross: bool) -> Result<()> {
        if !is_cross {
            return Ok(());
        }
        lanes::check_lane_batch(attn_weights)?;
        let seq_q = attn_weights.dim(2)?;
        let Some(resolution) = MaskResolution::from_seq_len(seq_q) else {
            return Ok(());
        };
        let seq_kv = attn_weights.dim(3)?;
        if self.object_token_index >= seq_kv {
            trace!(
                token = self.object_token_index,
                seq_kv,
                "object token outside conditioning sequence, skipping accumulation"
            );
            return Ok(());
        }

        for lane_idx in [OUT_INDEX, STRUCT_INDEX, STYLE1_INDEX, STYLE2_INDEX] {
            // [heads, seq_q] attention to the noun token, averaged over heads.
            let map = lanes::lane(attn_weights, lane_idx)?
                .narrow(D::Minus1, self.object_token_index, 1)?
                .squeeze(D::Minus1)?
                .mean(0)?;
            let key = (lane_idx, resolution);
            let sum = match self.sums.get(&key) {
                Some(prev) => (prev + &map)?,
                None => map,
            };
            self.sums.insert(key, sum);
            *self.counts.entry(key).or_insert(0) += 1;
        }
        Ok(())
    }

    /// Number of accumulated updates for one lane and resolution.
    pub fn count(&self, lane_idx: usize, resolution: MaskResolution) -> usize {
        self.counts.get(&(lane_idx, resolution)).copied().unwrap_or(0)
    }

    /// The averaged `[seq_len]` attention map for one lane and resolution.
    pub fn average(&self, lane_idx: usize, resolution: MaskResolution) -> Result<Tensor> {
        let key = (lane_idx, resolution);
        match (self.sums.get(&key), self.counts.get(&key)) {
            (Some(sum), Some(&count)) if count > 0 => Ok((sum / count as f64)?),
            _ => candle::bail!(
                "no cross-attention accumulated for lane {} at {:?}",
                lane_idx,
                resolution
            ),
        }
    }

    /// Threshold one lane's averaged map into a region mask.
    ///
    /// The map is min-max normalized to [0, 1] first so the threshold is
    /// scale-free.
    pub fn derive_mask(
        &self,
        lane_idx: usize,
        resolution: MaskResolution,
        threshold: f64,
    ) -> Result<RegionMask> {
        let avg = self.average(lane_idx, resolution)?;
        let min = avg.min(0)?.to_scalar::<f32>()? as f64;
        let max = avg.max(0)?.to_scalar::<f32>()? as f64;
        let normalized = ((avg - min)? / (max - min + 1e-8))?;
        let side = resolution.side();
        let mask = normalized
            .ge(threshold)?
            .to_dtype(DType::F32)?
            .reshape((side, side))?;
        RegionMask::new(mask, resolution)
    }

    /// Derive per-role masks for the structure and both appearance lanes.
    ///
    /// This is the prompt-mixing self-segmentation path, invoked once at a
    /// fixed step; it needs both resolutions accumulated for every lane.
    pub fn derive_role_masks(&self, threshold: f64) -> Result<RoleMasks> {
        let object = |lane_idx: usize| -> Result<ObjectMasks> {
            ObjectMasks::new(
                self.derive_mask(lane_idx, MaskResolution::R32, threshold)?,
                self.derive_mask(lane_idx, MaskResolution::R64, threshold)?,
            )
        };
        let structure = object(STRUCT_INDEX)?;
        Ok(RoleMasks {
            struct_objects: vec![structure.clone()],
            structure,
            app1: object(STYLE1_INDEX)?,
            app2: object(STYLE2_INDEX)?,
        })
    }

    /// Drop all accumulated statistics. Called once per run, never per step.
    pub fn reset(&mut self) {
        self.sums.clear();
        self.counts.clear();
    }
}

/// Per-run mask cache.
///
/// Masks are computed at most once; every later request returns the cached,
/// bit-identical tensors. Consumers that need masks before they exist
/// trigger a synchronous computation through the segmenter rather than an
/// error.
pub struct MaskStore {
    segmenter: Box<dyn ObjectSegmenter + Send>,
    masks: Option<RoleMasks>,
}

impl MaskStore {
    /// Create an empty store backed by the given segmentation service.
    pub fn new(segmenter: Box<dyn ObjectSegmenter + Send>) -> Self {
        Self {
            segmenter,
            masks: None,
        }
    }

    /// Whether masks have been computed for this run.
    pub fn is_ready(&self) -> bool {
        self.masks.is_some()
    }

    /// The cached masks, if any.
    pub fn get(&self) -> Option<&RoleMasks> {
        self.masks.as_ref()
    }

    /// Install masks produced by the attention-derived path.
    ///
    /// No-op if segmenter masks were already computed; masks are immutable
    /// for the remainder of the run.
    pub fn install(&mut self, masks: RoleMasks) {
        if self.masks.is_none() {
            self.masks = Some(masks);
        }
    }

    /// Return the run's masks, computing them through the segmenter on
    /// first use.
    ///
    /// The structure image is segmented into [`STRUCT_OBJECT_COUNT`]
    /// objects, each appearance image into one. A count mismatch from the
    /// service is a contract violation.
    pub fn ensure(&mut self, config: &RunConfig) -> Result<&RoleMasks> {
        if self.masks.is_none() {
            debug!(
                struct_image = %config.struct_image_path.display(),
                "computing segmentation masks"
            );
            let struct_objects = self
                .segmenter
                .segment(&config.struct_image_path, STRUCT_OBJECT_COUNT)?;
            if struct_objects.len() != STRUCT_OBJECT_COUNT {
                candle::bail!(
                    "segmenter returned {} structure objects, expected {}",
                    struct_objects.len(),
                    STRUCT_OBJECT_COUNT
                );
            }
            let app1 = Self::single_object(
                self.segmenter.segment(&config.app1_image_path, 1)?,
                "app1",
            )?;
            let app2 = Self::single_object(
                self.segmenter.segment(&config.app2_image_path, 1)?,
                "app2",
            )?;

            let structure = ObjectMasks::new(
                struct_objects[0].mask_32.union(&struct_objects[1].mask_32)?,
                struct_objects[0].mask_64.union(&struct_objects[1].mask_64)?,
            )?;
            self.masks = Some(RoleMasks {
                struct_objects,
                structure,
                app1,
                app2,
            });
        }
        match &self.masks {
            Some(masks) => Ok(masks),
            None => candle::bail!("mask computation left the store empty"),
        }
    }

    fn single_object(mut objects: Vec<ObjectMasks>, role: &str) -> Result<ObjectMasks> {
        if objects.len() != 1 {
            candle::bail!(
                "segmenter returned {} objects for the {} image, expected 1",
                objects.len(),
                role
            );
        }
        Ok(objects.remove(0))
    }
}

/// Write a mask as an 8-bit grayscale PNG, `{name}_step_{step}.png`.
///
/// Debug artifact only; values are scaled from {0, 1} to {0, 255}.
pub fn save_mask_image(mask: &RegionMask, dir: &Path, name: &str, step: usize) -> Result<()> {
    let side = mask.resolution().side();
    let values = mask.tensor().flatten_all()?.to_vec1::<f32>()?;
    let pixels: Vec<u8> = values
        .iter()
        .map(|v| (v.clamp(0.0, 1.0) * 255.0) as u8)
        .collect();
    let img = match image::GrayImage::from_raw(side as u32, side as u32, pixels) {
        Some(img) => img,
        None => candle::bail!("mask buffer does not fill a {side}x{side} image"),
    };
    std::fs::create_dir_all(dir).map_err(candle::Error::wrap)?;
    let path = dir.join(format!("{name}_step_{step}.png"));
    img.save(&path).map_err(candle::Error::wrap)?;
    debug!(path = %path.display(), "saved mask image");
    Ok(())
}
