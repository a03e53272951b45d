//! Projected coordinates and bounding boxes.

use geo::{BoundingRect, Coord, Polygon, Rect};

/// EPSG code of Belgian Lambert 72, the CRS of every Flemish dataset used here.
pub const LAMBERT72_EPSG: i32 = 31370;

/// Bounding box structure (projected coordinates, metres)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BoundingBox {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl BoundingBox {
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        BoundingBox {
            min_x,
            min_y,
            max_x,
            max_y,
        }
    }

    /// Bounding box of any geometry, `None` when the geometry is empty
    pub fn of<G>(geometry: &G) -> Option<Self>
    where
        G: BoundingRect<f64>,
        G::Output: Into<Option<Rect<f64>>>,
    {
        let rect: Option<Rect<f64>> = geometry.bounding_rect().into();
        rect.map(Self::from)
    }

    /// Grow the box by `margin` on every side
    pub fn expand(&self, margin: f64) -> Self {
        BoundingBox::new(
            self.min_x - margin,
            self.min_y - margin,
            self.max_x + margin,
            self.max_y + margin,
        )
    }

    pub fn width(&self) -> f64 {
        self.max_x - self.min_x
    }

    pub fn height(&self) -> f64 {
        self.max_y - self.min_y
    }

    pub fn center(&self) -> (f64, f64) {
        (
            (self.min_x + self.max_x) / 2.0,
            (self.min_y + self.max_y) / 2.0,
        )
    }

    /// Inclusive containment test
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.min_x && x <= self.max_x && y >= self.min_y && y <= self.max_y
    }

    /// Whether `other` lies entirely inside this box, within `tolerance`
    pub fn contains_box(&self, other: &BoundingBox, tolerance: f64) -> bool {
        other.min_x >= self.min_x - tolerance
            && other.max_x <= self.max_x + tolerance
            && other.min_y >= self.min_y - tolerance
            && other.max_y <= self.max_y + tolerance
    }

    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }

    pub fn to_polygon(&self) -> Polygon<f64> {
        Rect::from(*self).to_polygon()
    }
}

impl From<Rect<f64>> for BoundingBox {
    fn from(rect: Rect<f64>) -> Self {
        BoundingBox::new(rect.min().x, rect.min().y, rect.max().x, rect.max().y)
    }
}

impl From<BoundingBox> for Rect<f64> {
    fn from(bbox: BoundingBox) -> Self {
        Rect::new(
            Coord {
                x: bbox.min_x,
                y: bbox.min_y,
            },
            Coord {
                x: bbox.max_x,
                y: bbox.max_y,
            },
        )
    }
}
