//! Run orchestration around the host denoising loop.
//!
//! The host pipeline owns the scheduler and the UNet; this module owns the
//! cross-image state that rides along with a run. An [`AppearanceTransfer`]
//! is created once per transfer, fed the four lanes' initial latents and
//! per-lane noise, and then consulted from two host hooks:
//!
//! - the attention processors read and update the shared [`RunState`]
//!   on every layer call;
//! - [`AppearanceTransfer::step_callback`] runs between denoising steps
//!   and applies the AdaIN statistics alignment to the output lane.
//!
//! The session is a linear state machine: latents must be set before any
//! step runs, and [`AppearanceTransfer::finish`] closes the run and hands
//! back the output lane.

use candle::{Result, Tensor};
use tracing::{debug, info, trace};

use crate::adain;
use crate::config::RunConfig;
use crate::lanes::{self, OUT_INDEX, STYLE1_INDEX, STYLE2_INDEX};
use crate::segmentation::{
    save_mask_image, AttentionStore, MaskResolution, MaskStore, ObjectSegmenter,
};

/// Mutable per-run state shared with the attention processors.
pub struct RunState {
    /// Current denoising step, updated by the step callback before the
    /// UNet runs.
    pub step: usize,
    /// Whether cross-image injection is active. The host toggles this off
    /// for its guidance passes.
    pub enable_edit: bool,
    /// Per-run mask cache.
    pub masks: MaskStore,
    /// Cross-attention accumulator for attention-derived masks.
    pub attn_store: AttentionStore,
}

impl RunState {
    /// Create the initial state for a run.
    pub fn new(masks: MaskStore, attn_store: AttentionStore) -> Self {
        Self {
            step: 0,
            enable_edit: false,
            masks,
            attn_store,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Uninitialized,
    LatentsSet,
    Done,
}

/// One appearance-transfer run.
pub struct AppearanceTransfer {
    config: RunConfig,
    state: RunState,
    latents: Option<Tensor>,
    noise: Option<Tensor>,
    phase: Phase,
}

impl AppearanceTransfer {
    /// Create a run from its configuration and a segmentation service.
    pub fn new(config: RunConfig, segmenter: Box<dyn ObjectSegmenter + Send>) -> Self {
        let attn_store = AttentionStore::new(config.object_token_index);
        Self {
            config,
            state: RunState::new(MaskStore::new(segmenter), attn_store),
            latents: None,
            noise: None,
            phase: Phase::Uninitialized,
        }
    }

    /// The run configuration.
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// The shared state handed to the attention processors.
    pub fn state(&mut self) -> &mut RunState {
        &mut self.state
    }

    /// Toggle cross-image injection for subsequent UNet calls.
    pub fn set_enable_edit(&mut self, enable: bool) {
        self.state.enable_edit = enable;
    }

    /// Install the four lanes' starting latents.
    ///
    /// Each latent is `[C, H, W]`; the lanes are stacked into the
    /// `[4, C, H, W]` batch the whole pipeline operates on. The output
    /// lane typically starts as a copy of the structure latent.
    pub fn set_latents(
        &mut self,
        output: &Tensor,
        structure: &Tensor,
        style1: &Tensor,
        style2: &Tensor,
    ) -> Result<()> {
        if self.phase == Phase::Done {
            candle::bail!("cannot set latents on a finished run");
        }
        let latents = lanes::stack_lanes(output, structure, style1, style2)?;
        let (_, _c, h, w) = latents.dims4()?;
        debug!(h, w, "lane latents installed");
        self.latents = Some(latents);
        self.phase = Phase::LatentsSet;
        Ok(())
    }

    /// Install the per-lane noise tensors the host scheduler uses to
    /// re-noise the reference lanes each step.
    pub fn set_noise(
        &mut self,
        output: &Tensor,
        structure: &Tensor,
        style1: &Tensor,
        style2: &Tensor,
    ) -> Result<()> {
        if self.phase == Phase::Done {
            candle::bail!("cannot set noise on a finished run");
        }
        self.noise = Some(lanes::stack_lanes(output, structure, style1, style2)?);
        Ok(())
    }

    /// The stacked `[4, C, H, W]` lane latents.
    pub fn latents(&self) -> Result<&Tensor> {
        match &self.latents {
            Some(latents) => Ok(latents),
            None => candle::bail!("latents requested before set_latents"),
        }
    }

    /// The stacked per-lane noise, if the host installed any.
    pub fn noise(&self) -> Option<&Tensor> {
        self.noise.as_ref()
    }

    /// Install masks thresholded out of the accumulated cross-attention
    /// maps instead of querying the segmenter.
    ///
    /// Invoked by the step callback at the start of `adain_range` when
    /// `use_attention_masks` is set, and fails loudly if nothing has been
    /// accumulated yet. No-op if masks already exist; masks are immutable
    /// once computed.
    pub fn derive_masks_from_attention(&mut self) -> Result<()> {
        let masks = self
            .state
            .attn_store
            .derive_role_masks(self.config.mask_threshold)?;
        self.state.masks.install(masks);
        Ok(())
    }

    /// Per-step hook, called with the scheduler's current latents before
    /// the next UNet invocation. Returns the latents the host should
    /// continue with.
    ///
    /// `timestep` is the scheduler timestep for this step; the alignment
    /// is driven by the step counter alone, so the timestep is only
    /// logged. Inside `adain_range` the output lane's channel statistics
    /// are aligned to the appearance lanes, under the region masks when
    /// masked AdaIN is enabled. Outside the range the latents pass
    /// through unchanged. The masks themselves are resolved once, at the
    /// first step of the range: from the accumulated cross-attention maps
    /// when `use_attention_masks` is set, through the segmenter otherwise.
    pub fn step_callback(
        &mut self,
        step: usize,
        timestep: usize,
        latents: &Tensor,
    ) -> Result<Tensor> {
        if self.phase != Phase::LatentsSet {
            candle::bail!("step callback invoked before latents were set");
        }
        lanes::check_lane_batch(latents)?;
        self.state.step = step;
        trace!(step, timestep, "step callback");

        if self.config.use_masked_adain && step == self.config.adain_range.start {
            if self.config.use_attention_masks {
                self.derive_masks_from_attention()?;
            } else {
                self.state.masks.ensure(&self.config)?;
            }
            if self.config.save_masks {
                self.save_masks(step)?;
            }
        }

        let latents = if self.config.adain_range.contains(step) {
            let output = lanes::lane(latents, OUT_INDEX)?;
            let style1 = lanes::lane(latents, STYLE1_INDEX)?;
            let style2 = lanes::lane(latents, STYLE2_INDEX)?;
            let aligned = if self.config.use_masked_adain {
                let masks = self.state.masks.ensure(&self.config)?;
                adain::masked_adain(
                    &output,
                    &style1,
                    &style2,
                    &masks.structure.mask_64,
                    &masks.app1.mask_64,
                    &masks.app2.mask_64,
                )?
            } else {
                adain::adain(&output, &style1, &style2)?
            };
            lanes::overwrite_lane(latents, OUT_INDEX, &aligned)?
        } else {
            latents.clone()
        };

        self.latents = Some(latents.clone());
        Ok(latents)
    }

    /// Close the run and return the output lane's final `[C, H, W]`
    /// latent.
    pub fn finish(&mut self) -> Result<Tensor> {
        if self.phase != Phase::LatentsSet {
            candle::bail!("finish invoked before latents were set");
        }
        let latents = self.latents()?;
        let output = lanes::lane(latents, OUT_INDEX)?;
        self.phase = Phase::Done;
        info!("appearance transfer run finished");
        Ok(output)
    }

    fn save_masks(&mut self, step: usize) -> Result<()> {
        let dir = self.config.masks_dir.clone();
        let masks = self.state.masks.ensure(&self.config)?;
        for (name, mask) in [
            ("structure", &masks.structure),
            ("app1", &masks.app1),
            ("app2", &masks.app2),
        ] {
            save_mask_image(mask.at(MaskResolution::R64), &dir, name, step)?;
        }
        Ok(())
    }
}
