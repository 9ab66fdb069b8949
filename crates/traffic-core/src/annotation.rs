//! CPU frame annotation and JPEG encoding.
//!
//! Labels use a built-in 5x7 bitmap font so no font files are needed at
//! runtime. Unknown characters advance the cursor without drawing.

use anyhow::{Result, anyhow, bail};
use image::{ImageBuffer, Rgb, RgbImage, codecs::jpeg::JpegEncoder};
use video_ingest::{Frame, FrameFormat};

use crate::{detector::TrackedObject, stats::VehicleClass};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const LINE_COLOR: Rgb<u8> = Rgb([255, 0, 0]);
const LABEL_BG: Rgb<u8> = Rgb([0, 0, 0]);
const INFO_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const GLYPH_ADVANCE: i32 = 6;

/// What to draw on top of a frame.
pub struct Overlay<'a> {
    pub objects: &'a [TrackedObject],
    pub line_y: i32,
    pub frame_number: u64,
    pub fps: f64,
}

/// Draw `overlay` onto `frame` and encode the result as JPEG.
pub fn annotate(frame: &Frame, overlay: &Overlay<'_>, jpeg_quality: u8) -> Result<Vec<u8>> {
    let image = render(frame, overlay)?;
    encode_rgb(&image, jpeg_quality)
}

/// Encode a raw frame without drawing anything.
pub fn encode_jpeg(frame: &Frame, jpeg_quality: u8) -> Result<Vec<u8>> {
    encode_rgb(&to_rgb_image(frame)?, jpeg_quality)
}

/// Draw `overlay` onto an RGB copy of `frame`.
pub fn render(frame: &Frame, overlay: &Overlay<'_>) -> Result<RgbImage> {
    let mut image = to_rgb_image(frame)?;
    let width = image.width() as i32;
    let height = image.height() as i32;

    if (0..height).contains(&overlay.line_y) {
        fill_rect(&mut image, 0, overlay.line_y, width - 1, overlay.line_y, LINE_COLOR);
        if overlay.line_y + 1 < height {
            fill_rect(
                &mut image,
                0,
                overlay.line_y + 1,
                width - 1,
                overlay.line_y + 1,
                LINE_COLOR,
            );
        }
    }

    for object in overlay.objects {
        let [left, top, right, bottom] = object.corners();
        draw_rectangle(
            &mut image,
            left.round() as i32,
            top.round() as i32,
            right.round() as i32,
            bottom.round() as i32,
            BOX_COLOR,
        );
    }

    for object in overlay.objects {
        let [left, top, _, _] = object.corners();
        let label = object_label(object);
        let label_x = (left.round() as i32).max(0);
        let label_y = (top.round() as i32 - 10).max(0);
        let text_width = label.chars().count() as i32 * GLYPH_ADVANCE;
        fill_rect(
            &mut image,
            label_x,
            label_y,
            label_x + text_width,
            label_y + 8,
            LABEL_BG,
        );
        draw_label(&mut image, label_x + 1, label_y + 1, &label, BOX_COLOR);
    }

    let info = format!("FRAME {:06}  FPS {:4.1}", overlay.frame_number, overlay.fps);
    let info_width = (info.chars().count() as i32 * GLYPH_ADVANCE).min(width);
    let info_x = (width - info_width - 4).max(0);
    let info_y = (height - 12).max(0);
    fill_rect(
        &mut image,
        info_x,
        info_y,
        info_x + info_width + 4,
        info_y + 8,
        LABEL_BG,
    );
    draw_label(&mut image, info_x + 2, info_y + 1, &info, INFO_COLOR);

    Ok(image)
}

fn object_label(object: &TrackedObject) -> String {
    let class = match VehicleClass::from_class_id(object.class_id) {
        Some(class) => class.label().to_uppercase(),
        None => format!("CLS{}", object.class_id),
    };
    match object.track_id {
        Some(id) => format!("ID:{id} {class}"),
        None => class,
    }
}

fn to_rgb_image(frame: &Frame) -> Result<RgbImage> {
    if frame.width <= 0 || frame.height <= 0 {
        bail!("invalid frame geometry {}x{}", frame.width, frame.height);
    }
    let expected = Frame::expected_len(frame.width, frame.height, frame.format);
    if frame.data.len() != expected {
        bail!(
            "unexpected frame buffer size: got {} bytes, expected {}",
            frame.data.len(),
            expected
        );
    }
    let rgb = match frame.format {
        FrameFormat::Bgr8 => bgr_to_rgb(&frame.data),
    };
    ImageBuffer::from_vec(frame.width as u32, frame.height as u32, rgb)
        .ok_or_else(|| anyhow!("failed to convert frame into image buffer"))
}

fn encode_rgb(image: &RgbImage, jpeg_quality: u8) -> Result<Vec<u8>> {
    let mut buffer = Vec::new();
    JpegEncoder::new_with_quality(&mut buffer, jpeg_quality.clamp(1, 100))
        .encode_image(image)
        .map_err(|err| anyhow!("JPEG encode failed: {err}"))?;
    Ok(buffer)
}

fn bgr_to_rgb(input: &[u8]) -> Vec<u8> {
    let mut output = Vec::with_capacity(input.len());
    for chunk in input.chunks_exact(3) {
        output.extend_from_slice(&[chunk[2], chunk[1], chunk[0]]);
    }
    output
}

fn draw_rectangle(
    image: &mut RgbImage,
    left: i32,
    top: i32,
    right: i32,
    bottom: i32,
    color: Rgb<u8>,
) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for x in left..=right {
        image.put_pixel(x as u32, top as u32, color);
        image.put_pixel(x as u32, bottom as u32, color);
    }
    for y in top..=bottom {
        image.put_pixel(left as u32, y as u32, color);
        image.put_pixel(right as u32, y as u32, color);
    }
}

fn fill_rect(image: &mut RgbImage, left: i32, top: i32, right: i32, bottom: i32, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    let left = left.clamp(0, width - 1);
    let right = right.clamp(0, width - 1);
    let top = top.clamp(0, height - 1);
    let bottom = bottom.clamp(0, height - 1);

    for y in top..=bottom {
        for x in left..=right {
            image.put_pixel(x as u32, y as u32, color);
        }
    }
}

fn draw_label(image: &mut RgbImage, mut x: i32, y: i32, text: &str, color: Rgb<u8>) {
    let width = image.width() as i32;
    let height = image.height() as i32;
    for ch in text.chars().flat_map(|c| c.to_uppercase()) {
        if let Some(glyph) = glyph_bits(ch) {
            for (row, pattern) in glyph.iter().enumerate() {
                let py = y + row as i32;
                if py < 0 || py >= height {
                    continue;
                }
                for col in 0..5 {
                    if (pattern >> (4 - col)) & 1 == 1 {
                        let px = x + col;
                        if px >= 0 && px < width {
                            image.put_pixel(px as u32, py as u32, color);
                        }
                    }
                }
            }
        }
        x += GLYPH_ADVANCE;
    }
}

fn glyph_bits(ch: char) -> Option<[u8; 7]> {
    let rows = match ch {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11100, 0b10010, 0b10001, 0b10001, 0b10001, 0b10010, 0b11100],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b10101, 0b01010],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11110, 0b00001, 0b00001, 0b01110, 0b00001, 0b00001, 0b11110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        ':' => [0, 0b01100, 0b01100, 0, 0b01100, 0b01100, 0],
        '/' => [0b00001, 0b00010, 0b00010, 0b00100, 0b01000, 0b01000, 0b10000],
        '-' => [0, 0, 0, 0b11111, 0, 0, 0],
        '%' => [0b10001, 0b10010, 0b00100, 0b01000, 0b10010, 0b10001, 0],
        '.' => [0, 0, 0, 0, 0, 0b00110, 0b00110],
        ' ' => [0; 7],
        _ => return None,
    };
    Some(rows)
}
