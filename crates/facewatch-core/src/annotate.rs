//! Drawing detections onto images and naming the `_visualize` outputs.

use crate::types::BoundingBox;
use font8x8::{UnicodeFonts, BASIC_FONTS, LATIN_FONTS};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_circle_mut, draw_filled_rect_mut, draw_hollow_rect_mut};
use imageproc::rect::Rect;
use std::path::{Path, PathBuf};

/// File-name marker of annotated copies written next to database images.
/// Files carrying it are never loaded as enrollment images.
pub const VISUALIZE_MARKER: &str = "_visualize";

pub const KNOWN_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
pub const UNKNOWN_COLOR: Rgb<u8> = Rgb([255, 0, 0]);

const LABEL_TEXT_COLOR: Rgb<u8> = Rgb([255, 255, 255]);
const LABEL_BACKGROUND: Rgb<u8> = Rgb([0, 0, 0]);
/// Each 8×8 glyph pixel becomes a LABEL_SCALE×LABEL_SCALE block.
const LABEL_SCALE: i32 = 2;
const GLYPH_SIZE: i32 = 8;
const LABEL_PADDING: i32 = 2;
/// Gap between the label and the top of the box.
const LABEL_GAP: i32 = 5;

/// Landmark colours: left eye, right eye, nose, left mouth, right mouth.
const LANDMARK_COLORS: [Rgb<u8>; 5] = [
    Rgb([0, 0, 255]),
    Rgb([255, 0, 0]),
    Rgb([0, 255, 0]),
    Rgb([255, 0, 255]),
    Rgb([255, 255, 0]),
];

const LANDMARK_RADIUS: i32 = 2;

/// Whether `path` is an annotated copy rather than an enrollment image.
pub fn is_visualization_output(path: &Path) -> bool {
    path.file_name()
        .map(|name| name.to_string_lossy().contains(VISUALIZE_MARKER))
        .unwrap_or(false)
}

/// `dir/photo.jpg` → `dir/photo_visualize.jpg`.
pub fn visualize_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}{VISUALIZE_MARKER}.{}", ext.to_string_lossy()),
        None => format!("{stem}{VISUALIZE_MARKER}"),
    };
    path.with_file_name(name)
}

/// Outline a box `thickness` pixels wide, clipped to the image.
pub fn draw_box(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>, thickness: u32) {
    let x0 = bbox.x.round() as i32;
    let y0 = bbox.y.round() as i32;
    let x1 = (bbox.x + bbox.width).round() as i32;
    let y1 = (bbox.y + bbox.height).round() as i32;

    for d in 0..thickness.max(1) as i32 {
        let (w, h) = (x1 - x0 + 1 - 2 * d, y1 - y0 + 1 - 2 * d);
        if w <= 0 || h <= 0 {
            break;
        }
        draw_hollow_rect_mut(image, Rect::at(x0 + d, y0 + d).of_size(w as u32, h as u32), color);
    }
}

/// Box plus the five landmark dots.
pub fn draw_face(image: &mut RgbImage, bbox: &BoundingBox, color: Rgb<u8>) {
    draw_box(image, bbox, color, 2);

    let Some(landmarks) = bbox.landmarks else {
        return;
    };
    for (&(lx, ly), &dot) in landmarks.iter().zip(LANDMARK_COLORS.iter()) {
        draw_filled_circle_mut(image, (lx.round() as i32, ly.round() as i32), LANDMARK_RADIUS, dot);
    }
}

fn glyph(c: char) -> [u8; 8] {
    BASIC_FONTS
        .get(c)
        .or_else(|| LATIN_FONTS.get(c))
        .or_else(|| BASIC_FONTS.get('?'))
        .unwrap_or([0; 8])
}

/// Write `name` in white on a black band centred above the box, or at the
/// top edge when there is no room above it.
pub fn draw_label(image: &mut RgbImage, bbox: &BoundingBox, name: &str) {
    let chars = name.chars().count() as i32;
    if chars == 0 {
        return;
    }
    let cell = GLYPH_SIZE * LABEL_SCALE;
    let (text_w, text_h) = (chars * cell, cell);
    let text_x = bbox.x.round() as i32 + (bbox.width.round() as i32 - text_w) / 2;
    let text_y = (bbox.y.round() as i32 - text_h - LABEL_GAP).max(0);

    let band = Rect::at(text_x - LABEL_PADDING, text_y - LABEL_PADDING)
        .of_size((text_w + 2 * LABEL_PADDING) as u32, (text_h + 2 * LABEL_PADDING) as u32);
    draw_filled_rect_mut(image, band, LABEL_BACKGROUND);

    for (i, c) in name.chars().enumerate() {
        let origin_x = text_x + i as i32 * cell;
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_SIZE {
                if bits & (1 << col) == 0 {
                    continue;
                }
                let px = Rect::at(origin_x + col * LABEL_SCALE, text_y + row as i32 * LABEL_SCALE)
                    .of_size(LABEL_SCALE as u32, LABEL_SCALE as u32);
                draw_filled_rect_mut(image, px, LABEL_TEXT_COLOR);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GRAY: Rgb<u8> = Rgb([50, 50, 50]);

    fn bbox(x: f32, y: f32, width: f32, height: f32) -> BoundingBox {
        BoundingBox { x, y, width, height, confidence: 1.0, landmarks: None }
    }

    #[test]
    fn test_visualize_path() {
        let p = visualize_path(Path::new("/db/alice/photo.jpg"));
        assert_eq!(p, PathBuf::from("/db/alice/photo_visualize.jpg"));
        assert!(is_visualization_output(&p));
    }

    #[test]
    fn test_visualize_path_without_extension() {
        let p = visualize_path(Path::new("db/bob/scan"));
        assert_eq!(p, PathBuf::from("db/bob/scan_visualize"));
    }

    #[test]
    fn test_plain_image_is_not_visualization() {
        assert!(!is_visualization_output(Path::new("/db/alice/photo.jpg")));
    }

    #[test]
    fn test_draw_box_outline_only() {
        let mut image = RgbImage::new(20, 20);
        draw_box(&mut image, &bbox(2.0, 2.0, 10.0, 10.0), KNOWN_COLOR, 1);
        assert_eq!(*image.get_pixel(2, 2), KNOWN_COLOR);
        assert_eq!(*image.get_pixel(12, 7), KNOWN_COLOR);
        assert_eq!(*image.get_pixel(7, 7), Rgb([0, 0, 0]));
    }

    #[test]
    fn test_draw_face_clips_at_border() {
        let mut image = RgbImage::new(10, 10);
        let mut face = bbox(-5.0, -5.0, 30.0, 30.0);
        face.landmarks = Some([(0.0, 0.0), (9.0, 9.0), (5.0, 5.0), (-3.0, 4.0), (4.0, 40.0)]);
        draw_face(&mut image, &face, UNKNOWN_COLOR);
        assert_eq!(*image.get_pixel(5, 5), LANDMARK_COLORS[2]);
    }

    #[test]
    fn test_draw_label_above_box() {
        let mut image = RgbImage::from_pixel(64, 64, GRAY);
        draw_label(&mut image, &bbox(10.0, 30.0, 40.0, 30.0), "ab");

        // Two 16px glyphs centred over x 10..50, 5px above y=30, padded by 2.
        assert_eq!(*image.get_pixel(12, 7), LABEL_BACKGROUND);
        assert_eq!(*image.get_pixel(47, 26), LABEL_BACKGROUND);
        assert_eq!(*image.get_pixel(11, 7), GRAY);
        assert_eq!(*image.get_pixel(12, 27), GRAY);

        let painted = (14..46).flat_map(|x| (9..25).map(move |y| (x, y)));
        assert!(painted.into_iter().any(|(x, y)| *image.get_pixel(x, y) == LABEL_TEXT_COLOR));
    }

    #[test]
    fn test_draw_label_clamps_to_top() {
        let mut image = RgbImage::from_pixel(64, 64, GRAY);
        draw_label(&mut image, &bbox(0.0, 2.0, 64.0, 40.0), "Unknown");
        assert_eq!(*image.get_pixel(0, 0), LABEL_BACKGROUND);
        assert!(image.pixels().any(|p| *p == LABEL_TEXT_COLOR));
    }

    #[test]
    fn test_draw_label_empty_name() {
        let mut image = RgbImage::from_pixel(16, 16, GRAY);
        draw_label(&mut image, &bbox(0.0, 8.0, 16.0, 8.0), "");
        assert!(image.pixels().all(|p| *p == GRAY));
    }
}
