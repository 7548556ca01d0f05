//! Run configuration for appearance transfer.
//!
//! A [`RunConfig`] describes one transfer run: the three source images, the
//! step ranges in which cross-image attention and statistics alignment are
//! active, and the debug-artifact switches. Configurations deserialize from
//! JSON with per-field defaults so a minimal config only names the images
//! and the prompt.

use std::path::PathBuf;

use serde::Deserialize;

/// A half-open range of denoising steps `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct StepRange {
    /// First step at which the mechanism is active.
    pub start: usize,
    /// First step at which the mechanism is no longer active.
    pub end: usize,
}

impl StepRange {
    /// Create a new half-open step range.
    pub const fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Whether `step` falls inside the range.
    pub fn contains(&self, step: usize) -> bool {
        self.start <= step && step < self.end
    }
}

/// Configuration for a single appearance-transfer run.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    /// Text prompt describing the generated scene.
    pub prompt: String,

    /// Noun in the prompt naming the transferred object. Used to pick the
    /// cross-attention map that drives attention-derived segmentation.
    pub object_noun: String,

    /// Token position of `object_noun` in the encoded prompt (the external
    /// text encoder owns tokenization; position 1 is the first word after
    /// the BOS token for CLIP-style tokenizers).
    #[serde(default = "default_object_token_index")]
    pub object_token_index: usize,

    /// Path to the structure (layout) image.
    pub struct_image_path: PathBuf,

    /// Path to the first appearance image.
    pub app1_image_path: PathBuf,

    /// Path to the second appearance image.
    pub app2_image_path: PathBuf,

    /// Restrict statistics alignment to masked foreground regions.
    #[serde(default = "default_use_masked_adain")]
    pub use_masked_adain: bool,

    /// Derive region masks from the accumulated cross-attention maps
    /// (prompt-mixing self-segmentation) instead of querying the external
    /// segmenter. Resolved once, at the first step of `adain_range`.
    #[serde(default)]
    pub use_attention_masks: bool,

    /// Step range in which statistics alignment runs.
    #[serde(default = "default_adain_range")]
    pub adain_range: StepRange,

    /// Step range in which 32x32 self-attention layers may mix lanes.
    #[serde(default = "default_cross_attn_32_range")]
    pub cross_attn_32_range: StepRange,

    /// Step range in which 64x64 self-attention layers may mix lanes.
    #[serde(default = "default_cross_attn_64_range")]
    pub cross_attn_64_range: StepRange,

    /// Contrast factor applied to the output lane's attention weights when
    /// cross-lane injection is active. Counteracts the over-smoothing that
    /// injected keys/values introduce.
    #[serde(default = "default_contrast_strength")]
    pub contrast_strength: f64,

    /// Guidance scale for the sampling loop's swap-guidance pass. Carried
    /// here so one config drives the whole run; the core never reads it.
    #[serde(default = "default_swap_guidance_scale")]
    pub swap_guidance_scale: f64,

    /// Binarization threshold for attention-derived masks, applied after
    /// min-max normalization of the averaged attention map.
    #[serde(default = "default_mask_threshold")]
    pub mask_threshold: f64,

    /// Write every computed mask as a grayscale PNG for inspection.
    #[serde(default)]
    pub save_masks: bool,

    /// Directory for saved mask images.
    #[serde(default = "default_masks_dir")]
    pub masks_dir: PathBuf,
}

fn default_object_token_index() -> usize {
    1
}
fn default_use_masked_adain() -> bool {
    true
}
fn default_adain_range() -> StepRange {
    StepRange::new(20, 100)
}
fn default_cross_attn_32_range() -> StepRange {
    StepRange::new(10, 70)
}
fn default_cross_attn_64_range() -> StepRange {
    StepRange::new(10, 90)
}
fn default_contrast_strength() -> f64 {
    1.67
}
fn default_swap_guidance_scale() -> f64 {
    3.5
}
fn default_mask_threshold() -> f64 {
    0.5
}
fn default_masks_dir() -> PathBuf {
    PathBuf::from("./saved_masks")
}
