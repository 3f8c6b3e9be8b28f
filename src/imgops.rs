//! Pixel-level helpers used by the stages
//!
//! Nearest-neighbour resizes for the fixed segmentation input and the
//! long-edge tracking input, ROI cropping, and the mask cleanup that keeps
//! only the largest connected white region.

use std::collections::VecDeque;

use crate::frame::{ImageBuffer, LabelGrid, Rect};

/// Nearest-neighbour resize to an exact target size.
pub fn resize_nearest(src: &ImageBuffer, dst_width: usize, dst_height: usize) -> ImageBuffer {
    let mut dst = ImageBuffer::new(dst_width, dst_height, src.channels);
    if src.width == 0 || src.height == 0 {
        return dst;
    }
    let channels = src.channels;
    for dy in 0..dst_height {
        let sy = (dy * src.height) / dst_height;
        for dx in 0..dst_width {
            let sx = (dx * src.width) / dst_width;
            let src_off = (sy * src.width + sx) * channels;
            let dst_off = (dy * dst_width + dx) * channels;
            dst.data[dst_off..dst_off + channels]
                .copy_from_slice(&src.data[src_off..src_off + channels]);
        }
    }
    dst
}

/// Resize so the longer edge equals `long_edge`, preserving aspect ratio.
pub fn resize_long_edge(src: &ImageBuffer, long_edge: usize) -> ImageBuffer {
    let max_dim = src.width.max(src.height);
    if max_dim == 0 {
        return ImageBuffer::new(0, 0, src.channels);
    }
    let width = ((src.width * long_edge) / max_dim).max(1);
    let height = ((src.height * long_edge) / max_dim).max(1);
    resize_nearest(src, width, height)
}

/// Crops `rect` out of `src`, clamped to the image bounds.
pub fn crop(src: &ImageBuffer, rect: Rect) -> ImageBuffer {
    let x0 = rect.x.max(0) as usize;
    let y0 = rect.y.max(0) as usize;
    let x1 = ((rect.x + rect.width).max(0) as usize).min(src.width);
    let y1 = ((rect.y + rect.height).max(0) as usize).min(src.height);
    if x0 >= x1 || y0 >= y1 {
        return ImageBuffer::new(0, 0, src.channels);
    }
    let width = x1 - x0;
    let height = y1 - y0;
    let channels = src.channels;
    let mut dst = ImageBuffer::new(width, height, channels);
    for row in 0..height {
        let src_off = ((y0 + row) * src.width + x0) * channels;
        let dst_off = row * width * channels;
        dst.data[dst_off..dst_off + width * channels]
            .copy_from_slice(&src.data[src_off..src_off + width * channels]);
    }
    dst
}

/// Keeps only the largest 4-connected non-zero region of the mask and
/// binarizes it to {0, 255}. Returns the retained area in pixels.
pub fn keep_largest_region(mask: &mut LabelGrid) -> usize {
    let width = mask.width;
    let height = mask.height;
    if width == 0 || height == 0 {
        return 0;
    }

    // 0 = unvisited background/foreground, labels start at 1.
    let mut labels: Vec<u32> = vec![0; width * height];
    let mut next_label: u32 = 1;
    let mut best_label: u32 = 0;
    let mut best_area: usize = 0;
    let mut queue: VecDeque<(usize, usize)> = VecDeque::new();

    for start_y in 0..height {
        for start_x in 0..width {
            let idx = start_y * width + start_x;
            if mask.data[idx] == 0 || labels[idx] != 0 {
                continue;
            }
            let label = next_label;
            next_label += 1;
            let mut area = 0usize;
            labels[idx] = label;
            queue.push_back((start_x, start_y));
            while let Some((x, y)) = queue.pop_front() {
                area += 1;
                let neighbours = [
                    (x.wrapping_sub(1), y),
                    (x + 1, y),
                    (x, y.wrapping_sub(1)),
                    (x, y + 1),
                ];
                for (nx, ny) in neighbours {
                    if nx >= width || ny >= height {
                        continue;
                    }
                    let n_idx = ny * width + nx;
                    if mask.data[n_idx] != 0 && labels[n_idx] == 0 {
                        labels[n_idx] = label;
                        queue.push_back((nx, ny));
                    }
                }
            }
            if area > best_area {
                best_area = area;
                best_label = label;
            }
        }
    }

    for (value, label) in mask.data.iter_mut().zip(labels.iter()) {
        *value = if *label == best_label && best_label != 0 {
            255
        } else {
            0
        };
    }
    best_area
}

/// Bounding rectangle of the white pixels, widened by one pixel and clamped
/// to the grid. `None` when the mask is entirely black.
pub fn bounding_roi(mask: &LabelGrid) -> Option<Rect> {
    let mut min_x = usize::MAX;
    let mut min_y = usize::MAX;
    let mut max_x = 0usize;
    let mut max_y = 0usize;
    let mut any = false;
    for y in 0..mask.height {
        for x in 0..mask.width {
            if mask.at(x, y) != 0 {
                any = true;
                min_x = min_x.min(x);
                min_y = min_y.min(y);
                max_x = max_x.max(x);
                max_y = max_y.max(y);
            }
        }
    }
    if !any {
        return None;
    }
    let x1 = min_x.saturating_sub(1);
    let y1 = min_y.saturating_sub(1);
    let x2 = (max_x + 2).min(mask.width);
    let y2 = (max_y + 2).min(mask.height);
    Some(Rect::new(
        x1 as i32,
        y1 as i32,
        (x2 - x1) as i32,
        (y2 - y1) as i32,
    ))
}

/// Rescales a rectangle from mask coordinates into source coordinates.
pub fn scale_rect(
    rect: Rect,
    from_width: usize,
    from_height: usize,
    to_width: usize,
    to_height: usize,
) -> Rect {
    if from_width == 0 || from_height == 0 {
        return Rect::full(to_width, to_height);
    }
    let sx = to_width as f64 / from_width as f64;
    let sy = to_height as f64 / from_height as f64;
    let x = (rect.x as f64 * sx) as i32;
    let y = (rect.y as f64 * sy) as i32;
    let w = ((rect.width as f64) * sx).ceil() as i32;
    let h = ((rect.height as f64) * sy).ceil() as i32;
    Rect::new(
        x.clamp(0, to_width as i32),
        y.clamp(0, to_height as i32),
        w.min(to_width as i32 - x.max(0)),
        h.min(to_height as i32 - y.max(0)),
    )
}
