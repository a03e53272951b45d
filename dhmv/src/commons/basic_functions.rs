use geo::{Coord, LineString, MultiPolygon, Point, Polygon};

use crate::geo_core::BoundingBox;

/// Axis-aligned square of side `2 * half_size` centred on `point`
pub fn square_buffer(point: Point<f64>, half_size: f64) -> Polygon<f64> {
    BoundingBox::new(
        point.x() - half_size,
        point.y() - half_size,
        point.x() + half_size,
        point.y() + half_size,
    )
    .to_polygon()
}

/// Build a polygon from a GeoJSON-style ring (`[[x, y], ...]`).
/// Returns `None` when the ring has fewer than three distinct positions.
pub fn ring_to_polygon(ring: &[Vec<f64>]) -> Option<Polygon<f64>> {
    let coords: Vec<Coord<f64>> = ring
        .iter()
        .filter(|position| position.len() >= 2)
        .map(|position| Coord {
            x: position[0],
            y: position[1],
        })
        .collect();

    // LineString closes itself in Polygon::new, so count the open ring
    let open_len = match (coords.first(), coords.last()) {
        (Some(first), Some(last)) if first == last => coords.len() - 1,
        _ => coords.len(),
    };
    if open_len < 3 {
        return None;
    }
    Some(Polygon::new(LineString::from(coords), vec![]))
}

/// Number of polygons in a footprint that have a non-degenerate exterior
pub fn polygon_count(footprint: &MultiPolygon<f64>) -> usize {
    footprint
        .0
        .iter()
        .filter(|p| p.exterior().0.len() >= 4)
        .count()
}
