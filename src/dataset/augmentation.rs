//! Clip Augmentation Module
//!
//! Spatial pipeline applied to every frame of a clip with the same random
//! parameters: shorter-side scaling, cropping, horizontal flip and per-channel
//! normalisation into a `[C, T, H, W]` buffer.

use image::imageops::FilterType;
use image::DynamicImage;
use rand::Rng;
use rand_chacha::ChaCha8Rng;

use crate::config::{DataConfig, Modality};

const RGB_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
const RGB_STD: [f32; 3] = [0.229, 0.224, 0.225];
const FLOW_MEAN: f32 = 0.5;
const FLOW_STD: f32 = 0.226;

/// Crop position inside the scaled frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CropPosition {
    /// Top-left corner in pixels
    At(u32, u32),
    Center,
    TopLeft,
    TopRight,
    BottomLeft,
    BottomRight,
    /// Start of the longer side
    Start,
    /// End of the longer side
    End,
}

/// One deterministic spatial view
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpatialView {
    pub position: CropPosition,
    pub flip: bool,
}

/// Fixed evaluation crops for `--num_crops`
pub fn eval_views(num_crops: usize) -> Vec<SpatialView> {
    let plain = |position| SpatialView {
        position,
        flip: false,
    };
    let five = [
        CropPosition::Center,
        CropPosition::TopLeft,
        CropPosition::TopRight,
        CropPosition::BottomLeft,
        CropPosition::BottomRight,
    ];
    match num_crops {
        3 => vec![
            plain(CropPosition::Start),
            plain(CropPosition::Center),
            plain(CropPosition::End),
        ],
        5 => five.iter().map(|&p| plain(p)).collect(),
        10 => five
            .iter()
            .map(|&p| plain(p))
            .chain(five.iter().map(|&p| SpatialView {
                position: p,
                flip: true,
            }))
            .collect(),
        _ => vec![plain(CropPosition::Center)],
    }
}

/// Clip transform shared by all frames of one sample
#[derive(Debug, Clone)]
pub struct ClipTransform {
    input_size: u32,
    scale_range: (u32, u32),
    eval_scale: u32,
    flip: bool,
    modality: Modality,
}

impl ClipTransform {
    pub fn new(data: &DataConfig) -> Self {
        let input_size = data.input_size as u32;
        let (lo, hi) = match data.scale_range.as_slice() {
            [lo, hi] => (*lo as u32, *hi as u32),
            _ => (input_size, input_size),
        };
        let (scale_range, eval_scale) = if data.disable_scaleup {
            ((input_size, input_size), input_size)
        } else {
            ((lo.max(input_size), hi.max(input_size)), input_size * 256 / 224)
        };
        Self {
            input_size,
            scale_range,
            eval_scale,
            flip: !data.no_flip,
            modality: data.modality,
        }
    }

    pub fn input_size(&self) -> usize {
        self.input_size as usize
    }

    /// Random training view: scale in range, random crop, random flip
    pub fn train(&self, frames: &[Vec<DynamicImage>], rng: &mut ChaCha8Rng) -> Vec<f32> {
        let scale = rng.gen_range(self.scale_range.0..=self.scale_range.1);
        let (w, h) = scaled_dims(frames, scale);
        let x = rng.gen_range(0..=w.saturating_sub(self.input_size));
        let y = rng.gen_range(0..=h.saturating_sub(self.input_size));
        let flip = self.flip && rng.gen_bool(0.5);
        self.render(
            frames,
            scale,
            SpatialView {
                position: CropPosition::At(x, y),
                flip,
            },
        )
    }

    /// Deterministic evaluation view
    pub fn eval(&self, frames: &[Vec<DynamicImage>], view: SpatialView) -> Vec<f32> {
        self.render(frames, self.eval_scale, view)
    }

    /// `frames[t]` holds the channel images of time step `t`
    fn render(&self, frames: &[Vec<DynamicImage>], scale: u32, view: SpatialView) -> Vec<f32> {
        let size = self.input_size;
        let (w, h) = scaled_dims(frames, scale);
        let (x, y) = crop_origin(view.position, w, h, size);

        let channels = self.modality.input_channels();
        let t_len = frames.len();
        let plane = (size * size) as usize;
        let mut out = vec![0.0f32; channels * t_len * plane];

        for (t, stack) in frames.iter().enumerate() {
            let mut c = 0;
            for image in stack {
                let mut img = image
                    .resize_exact(w, h, FilterType::Triangle)
                    .crop_imm(x, y, size.min(w), size.min(h));
                if view.flip {
                    img = img.fliph();
                }
                if img.width() != size || img.height() != size {
                    img = img.resize_exact(size, size, FilterType::Triangle);
                }

                match self.modality {
                    Modality::Rgb => {
                        let rgb = img.to_rgb8();
                        for (i, pixel) in rgb.pixels().enumerate() {
                            for k in 0..3 {
                                let v = pixel.0[k] as f32 / 255.0;
                                out[((c + k) * t_len + t) * plane + i] = (v - RGB_MEAN[k]) / RGB_STD[k];
                            }
                        }
                        c += 3;
                    }
                    Modality::Flow => {
                        let luma = img.to_luma8();
                        for (i, pixel) in luma.pixels().enumerate() {
                            let v = pixel.0[0] as f32 / 255.0;
                            out[(c * t_len + t) * plane + i] = (v - FLOW_MEAN) / FLOW_STD;
                        }
                        c += 1;
                    }
                }
                if c >= channels {
                    break;
                }
            }
        }
        out
    }
}

/// Frame size after resizing the shorter side to `scale`
fn scaled_dims(frames: &[Vec<DynamicImage>], scale: u32) -> (u32, u32) {
    let (w, h) = frames
        .first()
        .and_then(|stack| stack.first())
        .map(|img| (img.width().max(1), img.height().max(1)))
        .unwrap_or((scale, scale));
    if w <= h {
        (scale, (h as u64 * scale as u64 / w as u64) as u32)
    } else {
        ((w as u64 * scale as u64 / h as u64) as u32, scale)
    }
}

fn crop_origin(position: CropPosition, w: u32, h: u32, size: u32) -> (u32, u32) {
    let max_x = w.saturating_sub(size);
    let max_y = h.saturating_sub(size);
    match position {
        CropPosition::At(x, y) => (x.min(max_x), y.min(max_y)),
        CropPosition::Center => (max_x / 2, max_y / 2),
        CropPosition::TopLeft => (0, 0),
        CropPosition::TopRight => (max_x, 0),
        CropPosition::BottomLeft => (0, max_y),
        CropPosition::BottomRight => (max_x, max_y),
        CropPosition::Start => {
            if w >= h {
                (0, max_y / 2)
            } else {
                (max_x / 2, 0)
            }
        }
        CropPosition::End => {
            if w >= h {
                (max_x, max_y / 2)
            } else {
                (max_x / 2, max_y)
            }
        }
    }
}
