//! Timestamp watermark raster.
//!
//! The string is re-read at most once per second and only re-rasterized when it changed, so the
//! GPU upload happens at ~1 Hz no matter the frame rate. Glyphs are a built-in 5x7 bitmap font
//! scaled x2; characters outside it render as blanks.

use std::time::{Duration, Instant};

use image::{Rgba, RgbaImage};
use time::macros::format_description;

pub const WATERMARK_WIDTH: u32 = 320;
pub const WATERMARK_HEIGHT: u32 = 36;

const SCALE: u32 = 2;
const GLYPH_W: u32 = 5;
const GLYPH_H: u32 = 7;
const ADVANCE: u32 = (GLYPH_W + 1) * SCALE;
const ORIGIN_X: u32 = 2;
const ORIGIN_Y: u32 = (WATERMARK_HEIGHT - GLYPH_H * SCALE) / 2 - 2;
const SHADOW_OFFSET: u32 = 2;
const REFRESH: Duration = Duration::from_secs(1);

const SHADOW: Rgba<u8> = Rgba([0, 0, 0, 255]);
const TEXT: Rgba<u8> = Rgba([255, 255, 255, 255]);
const CLEAR: Rgba<u8> = Rgba([0, 0, 0, 0]);

// Rows top to bottom, bit 4 = leftmost column.
fn glyph(c: char) -> [u8; 7] {
    match c {
        '0' => [0x0E, 0x11, 0x13, 0x15, 0x19, 0x11, 0x0E],
        '1' => [0x04, 0x0C, 0x04, 0x04, 0x04, 0x04, 0x0E],
        '2' => [0x0E, 0x11, 0x01, 0x02, 0x04, 0x08, 0x1F],
        '3' => [0x1F, 0x02, 0x04, 0x02, 0x01, 0x11, 0x0E],
        '4' => [0x02, 0x06, 0x0A, 0x12, 0x1F, 0x02, 0x02],
        '5' => [0x1F, 0x10, 0x1E, 0x01, 0x01, 0x11, 0x0E],
        '6' => [0x06, 0x08, 0x10, 0x1E, 0x11, 0x11, 0x0E],
        '7' => [0x1F, 0x01, 0x02, 0x04, 0x08, 0x08, 0x08],
        '8' => [0x0E, 0x11, 0x11, 0x0E, 0x11, 0x11, 0x0E],
        '9' => [0x0E, 0x11, 0x11, 0x0F, 0x01, 0x02, 0x0C],
        '-' => [0x00, 0x00, 0x00, 0x1F, 0x00, 0x00, 0x00],
        ':' => [0x00, 0x0C, 0x0C, 0x00, 0x0C, 0x0C, 0x00],
        '.' => [0x00, 0x00, 0x00, 0x00, 0x00, 0x0C, 0x0C],
        '/' => [0x00, 0x01, 0x02, 0x04, 0x08, 0x10, 0x00],
        _ => [0; 7],
    }
}

/// `yyyy-MM-dd HH:mm:ss` in local time.
pub fn local_timestamp() -> String {
    crate::logging::local_now()
        .format(format_description!("[year]-[month]-[day] [hour]:[minute]:[second]"))
        .unwrap_or_default()
}

pub struct Watermark {
    raster: RgbaImage,
    text: String,
    last_check: Option<Instant>,
    clock: Box<dyn FnMut() -> String + Send>,
    rasterized: u64,
}

impl Default for Watermark {
    fn default() -> Self {
        Self::new()
    }
}

impl Watermark {
    pub fn new() -> Self {
        Self::with_clock(local_timestamp)
    }

    /// Use a custom text source (tests, or a different stamp format).
    pub fn with_clock(clock: impl FnMut() -> String + Send + 'static) -> Self {
        Self {
            raster: RgbaImage::from_pixel(WATERMARK_WIDTH, WATERMARK_HEIGHT, CLEAR),
            text: String::new(),
            last_check: None,
            clock: Box::new(clock),
            rasterized: 0,
        }
    }

    /// Returns the new raster when the text changed and is due for upload, `None` otherwise.
    pub fn refresh(&mut self, now: Instant) -> Option<&RgbaImage> {
        if let Some(last) = self.last_check {
            if now.saturating_duration_since(last) < REFRESH {
                return None;
            }
        }
        self.last_check = Some(now);

        let text = (self.clock)();
        if text == self.text {
            return None;
        }
        self.text = text;
        self.rasterize();
        Some(&self.raster)
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    /// How many times the raster was redrawn.
    pub fn rasterized(&self) -> u64 {
        self.rasterized
    }

    fn rasterize(&mut self) {
        for p in self.raster.pixels_mut() {
            *p = CLEAR;
        }
        let text = std::mem::take(&mut self.text);
        draw_text(&mut self.raster, ORIGIN_X + SHADOW_OFFSET, ORIGIN_Y + SHADOW_OFFSET, &text, SHADOW);
        draw_text(&mut self.raster, ORIGIN_X, ORIGIN_Y, &text, TEXT);
        self.text = text;
        self.rasterized += 1;
    }
}

fn draw_text(img: &mut RgbaImage, x0: u32, y0: u32, text: &str, color: Rgba<u8>) {
    for (i, c) in text.chars().enumerate() {
        let gx = x0 + i as u32 * ADVANCE;
        if gx >= img.width() {
            break;
        }
        for (row, bits) in glyph(c).iter().enumerate() {
            for col in 0..GLYPH_W {
                if bits & (0x10 >> col) == 0 {
                    continue;
                }
                for dy in 0..SCALE {
                    for dx in 0..SCALE {
                        let x = gx + col * SCALE + dx;
                        let y = y0 + row as u32 * SCALE + dy;
                        if x < img.width() && y < img.height() {
                            img.put_pixel(x, y, color);
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    fn scripted(texts: &[&str]) -> (Watermark, Arc<Mutex<usize>>) {
        let texts: Vec<String> = texts.iter().map(|s| s.to_string()).collect();
        let calls = Arc::new(Mutex::new(0usize));
        let c = calls.clone();
        let wm = Watermark::with_clock(move || {
            let mut n = c.lock().unwrap();
            let t = texts[(*n).min(texts.len() - 1)].clone();
            *n += 1;
            t
        });
        (wm, calls)
    }

    #[test]
    fn first_refresh_rasterizes() {
        let (mut wm, _) = scripted(&["2024-01-01 00:00:00"]);
        let img = wm.refresh(Instant::now()).unwrap();
        assert_eq!(img.dimensions(), (WATERMARK_WIDTH, WATERMARK_HEIGHT));
        assert_eq!(wm.rasterized(), 1);
    }

    #[test]
    fn clock_is_read_at_most_once_per_second() {
        let (mut wm, calls) = scripted(&["a", "b", "c"]);
        let t0 = Instant::now();
        assert!(wm.refresh(t0).is_some());
        for ms in [1, 100, 500, 999] {
            assert!(wm.refresh(t0 + Duration::from_millis(ms)).is_none());
        }
        assert_eq!(*calls.lock().unwrap(), 1);
        assert!(wm.refresh(t0 + Duration::from_millis(1000)).is_some());
        assert_eq!(*calls.lock().unwrap(), 2);
    }

    #[test]
    fn unchanged_text_is_not_redrawn() {
        let (mut wm, calls) = scripted(&["12:00:00", "12:00:00", "12:00:01"]);
        let t0 = Instant::now();
        assert!(wm.refresh(t0).is_some());
        assert!(wm.refresh(t0 + Duration::from_secs(1)).is_none());
        assert_eq!(wm.rasterized(), 1);
        assert!(wm.refresh(t0 + Duration::from_secs(2)).is_some());
        assert_eq!(wm.rasterized(), 2);
        assert_eq!(*calls.lock().unwrap(), 3);
    }

    #[test]
    fn shadow_is_offset_below_right_of_text() {
        let (mut wm, _) = scripted(&["1"]);
        let img = wm.refresh(Instant::now()).unwrap().clone();
        let white: Vec<(u32, u32)> = img
            .enumerate_pixels()
            .filter(|(_, _, p)| **p == TEXT)
            .map(|(x, y, _)| (x, y))
            .collect();
        assert!(!white.is_empty());
        let black = img.enumerate_pixels().filter(|(_, _, p)| **p == SHADOW).count();
        assert!(black > 0);
        // Bottom-right pixel of the glyph's stroke only has shadow beside it.
        let (mx, my) = *white.iter().max_by_key(|&&(x, y)| (y, x)).unwrap();
        assert_eq!(*img.get_pixel(mx + SHADOW_OFFSET, my + SHADOW_OFFSET), SHADOW);
    }

    #[test]
    fn full_timestamp_fits() {
        let stamp = "2030-12-31 23:59:59";
        assert!(ORIGIN_X + SHADOW_OFFSET + stamp.len() as u32 * ADVANCE <= WATERMARK_WIDTH);
    }

    #[test]
    fn local_timestamp_shape() {
        let s = local_timestamp();
        assert_eq!(s.len(), 19, "{s}");
        assert_eq!(&s[4..5], "-");
        assert_eq!(&s[13..14], ":");
    }
}
