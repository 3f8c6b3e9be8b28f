//! Emergency-lane geometry
//!
//! Derives the left/right emergency-lane polygons from a cleaned road mask.
//! Per mask row the white span is measured; the lane boundary sits at a
//! fixed fraction of the span, computed from the reference car width at the
//! reference row (`p_interval = car_width * times_car_width / level_width`).

use crate::frame::{DetectionBox, LabelGrid};

pub type Point = (i32, i32);

/// Lane regions in mask coordinates until rescaled by the caller.
#[derive(Debug, Clone)]
pub struct EmergencyLane {
    pub left_region: Vec<Point>,
    pub right_region: Vec<Point>,
    pub left_boundary: Vec<Point>,
    pub right_boundary: Vec<Point>,
}

/// White span (first and last white column) of one mask row.
fn row_span(mask: &LabelGrid, y: usize) -> Option<(usize, usize)> {
    let row = &mask.data[y * mask.width..(y + 1) * mask.width];
    let first = row.iter().position(|&v| v == 255)?;
    let last = row.iter().rposition(|&v| v == 255)?;
    Some((first, last))
}

/// Derives the emergency-lane regions. `car_width` and `car_low_y` are in
/// mask coordinates and come from the reference vehicle picked by the event
/// stage. Returns `None` when the mask gives no usable road span.
pub fn derive_emergency_lane(
    mask: &LabelGrid,
    car_width: f64,
    car_low_y: f64,
    times_car_width: f32,
) -> Option<EmergencyLane> {
    if car_width <= 0.0 || mask.width == 0 || mask.height == 0 {
        return None;
    }

    let reference_row = (car_low_y.max(0.0) as usize).min(mask.height - 1);
    let (first, last) = row_span(mask, reference_row)?;
    let level_width = (last - first) as f64;
    if level_width <= 0.0 {
        return None;
    }

    // The road must reach the bottom edge, otherwise the perspective
    // extrapolation below has no anchor.
    row_span(mask, mask.height - 1)?;

    let p_interval = (car_width * times_car_width as f64) / level_width;

    let mut left_border = Vec::new();
    let mut right_border = Vec::new();
    let mut left_quarter = Vec::new();
    let mut right_quarter = Vec::new();

    for y in 0..mask.height {
        if let Some((start, end)) = row_span(mask, y) {
            let span = (end - start) as f64;
            let offset = (span * p_interval) as i32;
            left_border.push((start as i32, y as i32));
            right_border.push((end as i32, y as i32));
            left_quarter.push((start as i32 + offset, y as i32));
            right_quarter.push((end as i32 - offset, y as i32));
        }
    }

    if left_border.len() < 2 {
        return None;
    }

    // Each lane region is the polygon between the road border and the lane
    // boundary: border points downward, boundary points back upward.
    let mut left_region = left_border;
    left_region.extend(left_quarter.iter().rev().copied());
    let mut right_region = right_border;
    right_region.extend(right_quarter.iter().rev().copied());

    Some(EmergencyLane {
        left_region,
        right_region,
        left_boundary: left_quarter,
        right_boundary: right_quarter,
    })
}

/// Even-odd ray casting; boundary points count as inside.
pub fn point_in_polygon(polygon: &[Point], point: Point) -> bool {
    if polygon.len() < 3 {
        return false;
    }
    let (px, py) = (point.0 as f64, point.1 as f64);
    let mut inside = false;
    let mut j = polygon.len() - 1;
    for i in 0..polygon.len() {
        let (xi, yi) = (polygon[i].0 as f64, polygon[i].1 as f64);
        let (xj, yj) = (polygon[j].0 as f64, polygon[j].1 as f64);

        // On-segment check so border pixels are not excluded.
        let cross = (xj - xi) * (py - yi) - (px - xi) * (yj - yi);
        if cross.abs() < f64::EPSILON
            && px >= xi.min(xj)
            && px <= xi.max(xj)
            && py >= yi.min(yj)
            && py <= yi.max(yj)
        {
            return true;
        }

        if (yi > py) != (yj > py) {
            let x_cross = (xj - xi) * (py - yi) / (yj - yi) + xi;
            if px < x_cross {
                inside = !inside;
            }
        }
        j = i;
    }
    inside
}

/// Index of the narrowest detection whose center row lies within
/// `[band_top, band_bottom]`.
pub fn min_width_box_in_band(
    boxes: &[DetectionBox],
    band_top: i32,
    band_bottom: i32,
) -> Option<usize> {
    let mut best: Option<(usize, i32)> = None;
    for (index, candidate) in boxes.iter().enumerate() {
        let center_y = (candidate.top + candidate.bottom) / 2;
        if center_y < band_top || center_y > band_bottom {
            continue;
        }
        let width = candidate.width();
        match best {
            Some((_, best_width)) if width >= best_width => {}
            _ => best = Some((index, width)),
        }
    }
    best.map(|(index, _)| index)
}
