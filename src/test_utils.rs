//! Shared fixtures for the crate's unit tests.

use std::path::Path;

use candle::{DType, Device, Result, Tensor};

use crate::config::RunConfig;
use crate::segmentation::{MaskResolution, ObjectMasks, ObjectSegmenter, RegionMask, RoleMasks};

pub(crate) fn test_config() -> RunConfig {
    let json = r#"{
        "prompt": "a photo of a giraffe",
        "object_noun": "giraffe",
        "struct_image_path": "s.png",
        "app1_image_path": "a.png",
        "app2_image_path": "b.png"
    }"#;
    serde_json::from_str(json).unwrap()
}

pub(crate) fn full_mask(resolution: MaskResolution) -> RegionMask {
    let side = resolution.side();
    let t = Tensor::ones((side, side), DType::F32, &Device::Cpu).unwrap();
    RegionMask::new(t, resolution).unwrap()
}

/// A mask covering the top or bottom half of the grid.
pub(crate) fn half_mask(resolution: MaskResolution, top: bool) -> RegionMask {
    let side = resolution.side();
    let mut data = vec![0f32; side * side];
    let rows = if top { 0..side / 2 } else { side / 2..side };
    for y in rows {
        for x in 0..side {
            data[y * side + x] = 1.0;
        }
    }
    let t = Tensor::from_vec(data, (side, side), &Device::Cpu).unwrap();
    RegionMask::new(t, resolution).unwrap()
}

/// Segmenter that splits every image into horizontal bands: object 0 is the
/// top half, object 1 the bottom half. Single-object requests are keyed off
/// the image path so the two appearance images get complementary bands:
/// `b.png` (app2) yields the bottom half, every other image the top half.
pub(crate) struct BandSegmenter;

impl ObjectSegmenter for BandSegmenter {
    fn segment(&self, path: &Path, n_objects: usize) -> Result<Vec<ObjectMasks>> {
        (0..n_objects)
            .map(|i| {
                let top = if n_objects == 1 {
                    path != Path::new("b.png")
                } else {
                    i == 0
                };
                ObjectMasks::new(
                    half_mask(MaskResolution::R32, top),
                    half_mask(MaskResolution::R64, top),
                )
            })
            .collect()
    }
}

/// Role masks matching [`BandSegmenter`]'s output: app1 covers the top half,
/// app2 the bottom half, the structure foreground the whole grid.
pub(crate) fn band_object_masks() -> RoleMasks {
    let half = |top| {
        ObjectMasks::new(
            half_mask(MaskResolution::R32, top),
            half_mask(MaskResolution::R64, top),
        )
        .unwrap()
    };
    let full = ObjectMasks::new(
        full_mask(MaskResolution::R32),
        full_mask(MaskResolution::R64),
    )
    .unwrap();
    RoleMasks {
        struct_objects: vec![half(true), half(false)],
        structure: full,
        app1: half(true),
        app2: half(false),
    }
}
