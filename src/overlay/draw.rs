// src/overlay/draw.rs
//
// Normalized detection box -> pixel rect, and box/label drawing.

use opencv::{
    core::{self, Mat, Rect, Scalar},
    imgproc,
    prelude::*,
};

use crate::error::{Result, SnippetError};
use crate::types::{NormalizedBox, OverlayConfig};

/// Maps producer boxes onto frame pixels.
///
/// Producers disagree on axis order. With `flip_xy` the box is read as
/// `top/bottom` along the frame width and `left/right` along the height:
///
///   x = [top * w, bottom * w]    y = [left * h, right * h]
///
/// Without it the names mean what they say:
///
///   x = [left * w, right * w]    y = [top * h, bottom * h]
#[derive(Debug, Clone, Copy)]
pub struct BoxMapper {
    pub flip_xy: bool,
}

impl BoxMapper {
    pub fn new(flip_xy: bool) -> Self {
        Self { flip_xy }
    }

    /// Pixel rect clamped to the frame, at least 1x1.
    pub fn to_pixel_rect(&self, bbox: &NormalizedBox, width: i32, height: i32) -> Rect {
        let (w, h) = (width as f32, height as f32);
        let (x1, y1, x2, y2) = if self.flip_xy {
            (bbox.top * w, bbox.left * h, bbox.bottom * w, bbox.right * h)
        } else {
            (bbox.left * w, bbox.top * h, bbox.right * w, bbox.bottom * h)
        };

        let max_x = (width - 1).max(0);
        let max_y = (height - 1).max(0);
        let x_min = (x1.min(x2).round() as i32).clamp(0, max_x);
        let y_min = (y1.min(y2).round() as i32).clamp(0, max_y);
        let x_max = (x1.max(x2).round() as i32).clamp(0, width.max(1));
        let y_max = (y1.max(y2).round() as i32).clamp(0, height.max(1));

        Rect::new(
            x_min,
            y_min,
            (x_max - x_min).max(1),
            (y_max - y_min).max(1),
        )
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BoxStyle {
    pub color: Scalar,
    pub thickness: i32,
    pub labels: bool,
}

impl BoxStyle {
    pub fn from_config(cfg: &OverlayConfig) -> Self {
        let [b, g, r] = cfg.box_color_bgr;
        Self {
            color: Scalar::new(b as f64, g as f64, r as f64, 0.0),
            thickness: cfg.box_thickness,
            labels: cfg.draw_labels,
        }
    }
}

pub fn draw_box(frame: &mut Mat, rect: Rect, object_id: i64, style: &BoxStyle) -> Result<()> {
    imgproc::rectangle(
        frame,
        rect,
        style.color,
        style.thickness,
        imgproc::LINE_8,
        0,
    )
    .map_err(|e| SnippetError::media("overlay frame", e))?;

    if style.labels {
        // Above the box, or just inside it when the box touches the top edge
        let baseline_y = if rect.y > 14 { rect.y - 4 } else { rect.y + 14 };
        imgproc::put_text(
            frame,
            &format!("#{}", object_id),
            core::Point::new(rect.x, baseline_y),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.5,
            style.color,
            1,
            imgproc::LINE_8,
            false,
        )
        .map_err(|e| SnippetError::media("overlay frame", e))?;
    }
    Ok(())
}
