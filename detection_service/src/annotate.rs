use crate::detector::Detection;
use image::{codecs::jpeg::JpegEncoder, Rgb, RgbImage};
use thiserror::Error;

const BOX_THICKNESS: u32 = 2;

const PALETTE: [[u8; 3]; 6] = [
    [0, 255, 0],
    [255, 0, 0],
    [0, 128, 255],
    [255, 200, 0],
    [255, 0, 255],
    [0, 255, 255],
];

#[derive(Error, Debug)]
pub enum AnnotateError {
    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),
    #[error("Failed to encode annotated image: {0}")]
    Encode(image::ImageError),
}

/// Draws one outlined box per detection and re-encodes the frame as JPEG.
pub fn annotate_image(
    image_data: &[u8],
    detections: &[Detection],
    jpeg_quality: u8,
) -> Result<Vec<u8>, AnnotateError> {
    let mut canvas = image::load_from_memory(image_data)
        .map_err(AnnotateError::Decode)?
        .to_rgb8();

    for detection in detections {
        let color = detection
            .color
            .unwrap_or_else(|| palette_color(&detection.label));
        draw_box(&mut canvas, detection, Rgb(color));
    }

    let mut encoded = Vec::new();
    JpegEncoder::new_with_quality(&mut encoded, jpeg_quality)
        .encode_image(&canvas)
        .map_err(AnnotateError::Encode)?;

    Ok(encoded)
}

fn palette_color(label: &str) -> [u8; 3] {
    let hash = label
        .bytes()
        .fold(0usize, |acc, b| acc.wrapping_mul(31).wrapping_add(b as usize));
    PALETTE[hash % PALETTE.len()]
}

fn draw_box(canvas: &mut RgbImage, detection: &Detection, color: Rgb<u8>) {
    let (width, height) = canvas.dimensions();
    if width == 0 || height == 0 {
        return;
    }

    let clamp = |value: f32, max: u32| value.round().clamp(0.0, (max - 1) as f32) as u32;
    let x1 = clamp(detection.x, width);
    let y1 = clamp(detection.y, height);
    let x2 = clamp(detection.x + detection.width, width);
    let y2 = clamp(detection.y + detection.height, height);

    for t in 0..BOX_THICKNESS {
        for x in x1..=x2 {
            canvas.put_pixel(x, (y1 + t).min(y2), color);
            canvas.put_pixel(x, y2.saturating_sub(t).max(y1), color);
        }
        for y in y1..=y2 {
            canvas.put_pixel((x1 + t).min(x2), y, color);
            canvas.put_pixel(x2.saturating_sub(t).max(x1), y, color);
        }
    }
}
