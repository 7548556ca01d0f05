//! Zero-shot appearance transfer inside a diffusion denoising loop.
//!
//! Four latents denoise together as one batch: the generated output, a
//! structure reference, and two appearance references. The host pipeline
//! keeps its scheduler and UNet; this crate supplies the pieces that make
//! the lanes interact:
//!
//! - [`processor`] replaces the UNet's attention layers. In the decoder's
//!   self-attention, the output lane's keys and values are periodically
//!   locked to the structure lane and otherwise blended with the
//!   appearance lanes under region masks, so the output borrows layout
//!   from one image and texture from two others.
//! - [`attention`] holds the shared attention math, including the
//!   contrast sharpening applied to the output lane on edited calls.
//! - [`segmentation`] produces the region masks, either from an external
//!   segmentation service or thresholded out of the model's own
//!   cross-attention maps, and caches them for the run.
//! - [`adain`] aligns the output lane's channel statistics with the
//!   appearance lanes between steps, globally or per masked region.
//! - [`session`] ties it together: one [`AppearanceTransfer`] per run,
//!   stepped by the host between denoising iterations.
//!
//! The host integrates through three touch points: register the
//! [`ProcessorRegistry`] over its attention layers, call
//! [`AppearanceTransfer::step_callback`] between steps, and read the
//! output lane back with [`AppearanceTransfer::finish`].

pub mod adain;
pub mod attention;
pub mod config;
pub mod lanes;
pub mod processor;
pub mod segmentation;
pub mod session;

#[cfg(test)]
pub(crate) mod test_utils;

pub use config::{RunConfig, StepRange};
pub use processor::{AttnLayer, CrossImageAttnProcessor, LayerLocation, ProcessorRegistry};
pub use segmentation::{MaskStore, ObjectMasks, ObjectSegmenter, RegionMask, RoleMasks};
pub use session::{AppearanceTransfer, RunState};
