use eframe::egui::{Color32, ColorImage};

use crate::dicom::{DecodedImage, ImagePixels};
use crate::engine::WindowLevel;

/// Sample ranges up to this size are mapped through a lookup table.
const MAX_LUT_SPAN: i64 = 1 << 16;

/// Maps one decoded image to display colors, using `window` when set and the
/// image's own window otherwise. Color images ignore the window.
pub fn render_image(image: &DecodedImage, window: Option<WindowLevel>) -> ColorImage {
    match &image.pixels {
        ImagePixels::Monochrome(samples) => render_monochrome(
            image.width,
            image.height,
            samples,
            (image.min_value, image.max_value),
            image.invert,
            window.unwrap_or(image.default_window),
        ),
        ImagePixels::Rgb {
            samples_per_pixel,
            data,
        } => render_rgb(image.width, image.height, data, *samples_per_pixel),
    }
}

fn render_monochrome(
    width_px: usize,
    height_px: usize,
    samples: &[i32],
    (min_value, max_value): (i32, i32),
    invert: bool,
    window: WindowLevel,
) -> ColorImage {
    let mapper = GrayMapper::new(window, invert);
    let span = i64::from(max_value) - i64::from(min_value);
    let pixel_count = width_px.saturating_mul(height_px);

    let mut pixels = if (0..MAX_LUT_SPAN).contains(&span) {
        let lut = (min_value..=max_value)
            .map(|value| mapper.color(value))
            .collect::<Vec<_>>();
        samples
            .iter()
            .take(pixel_count)
            .map(|&value| {
                let offset = (i64::from(value) - i64::from(min_value)).clamp(0, span);
                lut[offset as usize]
            })
            .collect::<Vec<_>>()
    } else {
        samples
            .iter()
            .take(pixel_count)
            .map(|&value| mapper.color(value))
            .collect::<Vec<_>>()
    };
    pixels.resize(pixel_count, Color32::BLACK);

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}

struct GrayMapper {
    low: f32,
    range: f32,
    invert: bool,
}

impl GrayMapper {
    fn new(window: WindowLevel, invert: bool) -> Self {
        let width = window.width.max(1.0);
        Self {
            low: window.center - width / 2.0,
            range: width.max(1e-6),
            invert,
        }
    }

    fn color(&self, value: i32) -> Color32 {
        let normalized = ((value as f32 - self.low) / self.range).clamp(0.0, 1.0);
        let gray = (normalized * 255.0).round() as u8;
        Color32::from_gray(if self.invert { 255 - gray } else { gray })
    }
}

fn render_rgb(
    width_px: usize,
    height_px: usize,
    data: &[u8],
    samples_per_pixel: u16,
) -> ColorImage {
    let spp = usize::from(samples_per_pixel.max(1));
    let pixel_count = width_px.saturating_mul(height_px);

    let mut pixels = data
        .chunks_exact(spp)
        .take(pixel_count)
        .map(|chunk| match chunk {
            [r, g, b, ..] => Color32::from_rgb(*r, *g, *b),
            [gray, ..] => Color32::from_gray(*gray),
            [] => Color32::BLACK,
        })
        .collect::<Vec<_>>();
    pixels.resize(pixel_count, Color32::BLACK);

    ColorImage {
        size: [width_px, height_px],
        pixels,
    }
}
