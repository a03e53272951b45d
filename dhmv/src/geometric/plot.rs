//! Rendering of height models: a flat colour-coded raster or a 3D surface.
//!
//! Plain software rasterisation into an RGBA image: an orthographic camera,
//! back-to-front quads and Lambert shading.

use glam::{Mat4, Vec2, Vec3};
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, Rgba, RgbaImage};
use std::path::Path;
use tracing::{debug, info};

use crate::error::{DhmvError, Result};
use crate::geometric::height_model::HeightModel;

/// Largest image side, in pixels
const MAX_CANVAS_SIDE: u32 = 32_768;

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);
const EDGE: Rgba<u8> = Rgba([40, 40, 40, 255]);

/// Viridis control points
const RAMP: [(f32, [u8; 3]); 5] = [
    (0.0, [68, 1, 84]),
    (0.25, [59, 82, 139]),
    (0.5, [33, 145, 140]),
    (0.75, [94, 201, 98]),
    (1.0, [253, 231, 37]),
];

/// Colour of a normalised height in `[0, 1]`
pub fn ramp_color(t: f32) -> Rgba<u8> {
    let t = if t.is_finite() { t.clamp(0.0, 1.0) } else { 0.0 };
    for pair in RAMP.windows(2) {
        let (t0, c0) = pair[0];
        let (t1, c1) = pair[1];
        if t <= t1 {
            let f = (t - t0) / (t1 - t0);
            let mix = |a: u8, b: u8| (a as f32 + (b as f32 - a as f32) * f).round() as u8;
            return Rgba([mix(c0[0], c1[0]), mix(c0[1], c1[1]), mix(c0[2], c1[2]), 255]);
        }
    }
    let [r, g, b] = RAMP[RAMP.len() - 1].1;
    Rgba([r, g, b, 255])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlotKind {
    /// 3D elevation surface
    Surface3d,
    /// Flat raster with a colour scale
    Flat,
}

#[derive(Debug, Clone)]
pub struct PlotOptions {
    /// Pixels per raster cell in the flat plot
    pub cell_size: u32,
    /// Canvas size of the 3D plot
    pub width: u32,
    pub height: u32,
    /// Camera azimuth in degrees, counter-clockwise from east
    pub azimuth: f32,
    /// Camera elevation in degrees above the horizon
    pub elevation: f32,
    /// Vertical exaggeration of the 3D surface
    pub z_exaggeration: f32,
    /// Draw the cell edges over the 3D surface
    pub wireframe: bool,
    /// Add a height colour bar on the right
    pub colorbar: bool,
    /// Canvas colour; no-data cells of the flat plot stay transparent
    pub background: Rgba<u8>,
}

impl Default for PlotOptions {
    fn default() -> Self {
        PlotOptions {
            cell_size: 16,
            width: 800,
            height: 600,
            azimuth: 225.0,
            elevation: 35.0,
            z_exaggeration: 1.0,
            wireframe: true,
            colorbar: true,
            background: Rgba([255, 255, 255, 255]),
        }
    }
}

/// A rendered plot
#[derive(Debug, Clone)]
pub struct Figure {
    image: RgbaImage,
    kind: PlotKind,
}

impl Figure {
    pub fn image(&self) -> &RgbaImage {
        &self.image
    }

    pub fn kind(&self) -> PlotKind {
        self.kind
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Save as PNG
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        self.image.save_with_format(path, ImageFormat::Png)?;
        info!(path = %path.display(), "Figure saved");
        Ok(())
    }

    /// Encode as PNG in memory
    pub fn to_png_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        PngEncoder::new(&mut bytes).write_image(
            self.image.as_raw(),
            self.image.width(),
            self.image.height(),
            ExtendedColorType::Rgba8,
        )?;
        Ok(bytes)
    }
}

/// Renders [`HeightModel`]s
#[derive(Debug, Clone, Default)]
pub struct Plotter {
    options: PlotOptions,
}

impl Plotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: PlotOptions) -> Self {
        Plotter { options }
    }

    pub fn options(&self) -> &PlotOptions {
        &self.options
    }

    /// Render `model` as the requested kind of plot
    pub fn plot(&self, model: &HeightModel, kind: PlotKind) -> Result<Figure> {
        match kind {
            PlotKind::Surface3d => self.plot_3d(model),
            PlotKind::Flat => self.plot_flat(model),
        }
    }

    /// Flat raster, north up, with a colour bar on the right
    pub fn plot_flat(&self, model: &HeightModel) -> Result<Figure> {
        let cell = self.options.cell_size;
        if cell == 0 {
            return Err(DhmvError::InvalidInput("cell_size must be positive".to_string()));
        }
        let bar = self.colorbar_width();
        let plot_w = canvas_side(model.width(), cell, bar)? - bar;
        let plot_h = canvas_side(model.height(), cell, 0)?.max(1);
        let mut image = RgbaImage::from_pixel(plot_w + bar, plot_h, self.options.background);
        let scale = HeightScale::of(model);

        for row in 0..model.height() {
            for col in 0..model.width() {
                let color = match model.get(col, row) {
                    Some(v) if v.is_finite() => ramp_color(scale.normalise(v)),
                    _ => TRANSPARENT,
                };
                let (x0, y0) = (col as u32 * cell, row as u32 * cell);
                for y in y0..y0 + cell {
                    for x in x0..x0 + cell {
                        image.put_pixel(x, y, color);
                    }
                }
            }
        }
        if bar > 0 {
            draw_colorbar(&mut image, plot_w, plot_h);
        }
        debug!(width = image.width(), height = image.height(), "Flat plot rendered");
        Ok(Figure {
            image,
            kind: PlotKind::Flat,
        })
    }

    /// Orthographic 3D surface through the pixel centres
    pub fn plot_3d(&self, model: &HeightModel) -> Result<Figure> {
        let opts = &self.options;
        if opts.width == 0 || opts.height == 0 {
            return Err(DhmvError::InvalidInput("canvas size must be positive".to_string()));
        }
        if opts.width > MAX_CANVAS_SIDE || opts.height > MAX_CANVAS_SIDE {
            return Err(DhmvError::InvalidInput(format!(
                "canvas {}x{} exceeds {} pixels per side",
                opts.width, opts.height, MAX_CANVAS_SIDE
            )));
        }
        let bar = self.colorbar_width();
        let plot_w = opts.width.saturating_sub(bar).max(1);
        let mut image = RgbaImage::from_pixel(plot_w + bar, opts.height, opts.background);
        let scale = HeightScale::of(model);
        let transform = model.transform();

        // local coordinates, x east, y north, z up
        let vertex = |col: usize, row: usize| -> Option<Vec3> {
            let z = model.get(col, row).filter(|v| v.is_finite())?;
            Some(Vec3::new(
                col as f32 * transform.pixel_width as f32,
                -(row as f32) * transform.pixel_height as f32,
                (z - scale.min) * opts.z_exaggeration,
            ))
        };

        let mut quads: Vec<([Vec3; 4], f32)> = Vec::new();
        for row in 0..model.height().saturating_sub(1) {
            for col in 0..model.width().saturating_sub(1) {
                let corners = [
                    vertex(col, row),
                    vertex(col + 1, row),
                    vertex(col + 1, row + 1),
                    vertex(col, row + 1),
                ];
                if let [Some(a), Some(b), Some(c), Some(d)] = corners {
                    let mean = [(col, row), (col + 1, row), (col + 1, row + 1), (col, row + 1)]
                        .iter()
                        .filter_map(|&(c, r)| model.get(c, r))
                        .sum::<f32>()
                        / 4.0;
                    quads.push(([a, b, c, d], mean));
                }
            }
        }

        if !quads.is_empty() {
            let points: Vec<Vec3> = quads.iter().flat_map(|(q, _)| q.iter().copied()).collect();
            let camera = Camera::fit(&points, opts, plot_w, opts.height);
            let light = Vec3::new(0.3, 0.5, 1.0).normalize();

            let mut projected: Vec<([Vec2; 4], f32, Rgba<u8>)> = quads
                .iter()
                .map(|(q, mean)| {
                    let normal = (q[1] - q[0]).cross(q[3] - q[0]).normalize_or_zero();
                    let normal = if normal.z < 0.0 { -normal } else { normal };
                    let shade = 0.35 + 0.65 * normal.dot(light).max(0.0);
                    let base = ramp_color(scale.normalise(*mean));
                    let color = Rgba([
                        (base[0] as f32 * shade) as u8,
                        (base[1] as f32 * shade) as u8,
                        (base[2] as f32 * shade) as u8,
                        255,
                    ]);
                    let depth = q.iter().map(|p| camera.depth(*p)).sum::<f32>() / 4.0;
                    ((*q).map(|p| camera.project(p)), depth, color)
                })
                .collect();

            // painter's algorithm: farthest first
            projected.sort_by(|a, b| a.1.total_cmp(&b.1));

            for (screen, _, color) in &projected {
                fill_triangle(&mut image, [screen[0], screen[1], screen[2]], *color);
                fill_triangle(&mut image, [screen[0], screen[2], screen[3]], *color);
                if opts.wireframe {
                    for i in 0..4 {
                        draw_line(&mut image, screen[i], screen[(i + 1) % 4], EDGE);
                    }
                }
            }
        }

        if bar > 0 {
            draw_colorbar(&mut image, plot_w, opts.height);
        }
        debug!(quads = quads.len(), "3D plot rendered");
        Ok(Figure {
            image,
            kind: PlotKind::Surface3d,
        })
    }

    fn colorbar_width(&self) -> u32 {
        if self.options.colorbar {
            COLORBAR_GAP + COLORBAR_WIDTH + COLORBAR_GAP
        } else {
            0
        }
    }
}

/// `cells * cell_size + extra` pixels, rejected when it exceeds the canvas limit
fn canvas_side(cells: usize, cell_size: u32, extra: u32) -> Result<u32> {
    u32::try_from(cells)
        .ok()
        .and_then(|n| n.checked_mul(cell_size))
        .and_then(|n| n.checked_add(extra))
        .filter(|&n| n <= MAX_CANVAS_SIDE)
        .ok_or_else(|| {
            DhmvError::InvalidInput(format!(
                "{} cells of {} pixels exceed {} pixels per side",
                cells, cell_size, MAX_CANVAS_SIDE
            ))
        })
}

/// Maps heights onto `[0, 1]`; a constant model maps to the middle of the ramp
#[derive(Debug, Clone, Copy)]
struct HeightScale {
    min: f32,
    range: f32,
}

impl HeightScale {
    fn of(model: &HeightModel) -> Self {
        match (model.min(), model.max()) {
            (Some(min), Some(max)) => HeightScale {
                min,
                range: max - min,
            },
            _ => HeightScale {
                min: 0.0,
                range: 0.0,
            },
        }
    }

    fn normalise(&self, v: f32) -> f32 {
        if self.range <= f32::EPSILON {
            0.5
        } else {
            (v - self.min) / self.range
        }
    }
}

/// Orthographic view fitted to the canvas
struct Camera {
    view: Mat4,
    min: Vec2,
    scale: f32,
    offset: Vec2,
    canvas_height: f32,
}

const PADDING: f32 = 20.0;
const COLORBAR_WIDTH: u32 = 20;
const COLORBAR_GAP: u32 = 12;

impl Camera {
    fn fit(points: &[Vec3], opts: &PlotOptions, width: u32, height: u32) -> Self {
        let (lo, hi) = points.iter().fold(
            (Vec3::splat(f32::MAX), Vec3::splat(f32::MIN)),
            |(lo, hi), p| (lo.min(*p), hi.max(*p)),
        );
        let center = (lo + hi) / 2.0;
        let radius = (hi - lo).length().max(1.0);

        let az = opts.azimuth.to_radians();
        let el = opts.elevation.clamp(1.0, 89.0).to_radians();
        let direction = Vec3::new(el.cos() * az.cos(), el.cos() * az.sin(), el.sin());
        let view = Mat4::look_at_rh(center + direction * radius * 2.0, center, Vec3::Z);

        let (min, max) = points.iter().fold(
            (Vec2::splat(f32::MAX), Vec2::splat(f32::MIN)),
            |(min, max), p| {
                let v = view.transform_point3(*p);
                (min.min(v.truncate()), max.max(v.truncate()))
            },
        );
        let extent = (max - min).max(Vec2::splat(1e-3));
        let available = Vec2::new(
            (width as f32 - 2.0 * PADDING).max(1.0),
            (height as f32 - 2.0 * PADDING).max(1.0),
        );
        let scale = (available.x / extent.x).min(available.y / extent.y);
        let offset = Vec2::splat(PADDING) + (available - extent * scale) / 2.0;

        Camera {
            view,
            min,
            scale,
            offset,
            canvas_height: height as f32,
        }
    }

    fn project(&self, p: Vec3) -> Vec2 {
        let v = self.view.transform_point3(p).truncate();
        let s = self.offset + (v - self.min) * self.scale;
        Vec2::new(s.x, self.canvas_height - s.y)
    }

    /// Larger is closer to the camera
    fn depth(&self, p: Vec3) -> f32 {
        self.view.transform_point3(p).z
    }
}

fn fill_triangle(image: &mut RgbaImage, tri: [Vec2; 3], color: Rgba<u8>) {
    let edge = |a: Vec2, b: Vec2, p: Vec2| (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x);
    let area = edge(tri[0], tri[1], tri[2]);
    if area.abs() < f32::EPSILON {
        return;
    }

    let min = tri[0].min(tri[1]).min(tri[2]).floor().max(Vec2::ZERO);
    let max = tri[0]
        .max(tri[1])
        .max(tri[2])
        .ceil()
        .min(Vec2::new(image.width() as f32 - 1.0, image.height() as f32 - 1.0));
    if max.x < min.x || max.y < min.y {
        return;
    }

    for y in min.y as u32..=max.y as u32 {
        for x in min.x as u32..=max.x as u32 {
            let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
            let w0 = edge(tri[1], tri[2], p) / area;
            let w1 = edge(tri[2], tri[0], p) / area;
            let w2 = edge(tri[0], tri[1], p) / area;
            if w0 >= -1e-4 && w1 >= -1e-4 && w2 >= -1e-4 {
                image.put_pixel(x, y, color);
            }
        }
    }
}

/// Bresenham line, clipped to the image
fn draw_line(image: &mut RgbaImage, from: Vec2, to: Vec2, color: Rgba<u8>) {
    let (mut x0, mut y0) = (from.x.round() as i64, from.y.round() as i64);
    let (x1, y1) = (to.x.round() as i64, to.y.round() as i64);
    let dx = (x1 - x0).abs();
    let dy = -(y1 - y0).abs();
    let sx = if x0 < x1 { 1 } else { -1 };
    let sy = if y0 < y1 { 1 } else { -1 };
    let mut err = dx + dy;
    let (w, h) = (image.width() as i64, image.height() as i64);

    loop {
        if (0..w).contains(&x0) && (0..h).contains(&y0) {
            image.put_pixel(x0 as u32, y0 as u32, color);
        }
        if x0 == x1 && y0 == y1 {
            break;
        }
        let e2 = 2 * err;
        if e2 >= dy {
            err += dy;
            x0 += sx;
        }
        if e2 <= dx {
            err += dx;
            y0 += sy;
        }
    }
}

/// Vertical ramp right of `plot_width`, highest values on top
fn draw_colorbar(image: &mut RgbaImage, plot_width: u32, plot_height: u32) {
    let x0 = plot_width + COLORBAR_GAP;
    let x1 = (x0 + COLORBAR_WIDTH).min(image.width());
    let bottom = plot_height.saturating_sub(1).max(1) as f32;
    for y in 0..plot_height.min(image.height()) {
        let color = ramp_color(1.0 - y as f32 / bottom);
        for x in x0..x1 {
            let border = x == x0 || x + 1 == x1 || y == 0 || y + 1 == plot_height;
            image.put_pixel(x, y, if border { EDGE } else { color });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometric::height_model::HeightModelBuilder;
    use crate::geometric::raster::{GeoTransform, RasterGrid};

    fn model(values: Vec<f32>, width: usize, height: usize) -> HeightModel {
        let transform = GeoTransform::new(152_000.0, 212_000.0, 1.0, 1.0);
        let surface = RasterGrid::new(width, height, transform, values).unwrap();
        let terrain = RasterGrid::new(width, height, transform, vec![0.0; width * height]).unwrap();
        HeightModelBuilder::new()
            .from_grids(&surface, &terrain, None)
            .unwrap()
    }

    fn increasing() -> HeightModel {
        model((1..=9).map(|v| v as f32).collect(), 3, 3)
    }

    fn drawn_pixels(figure: &Figure, background: Rgba<u8>) -> usize {
        figure
            .image()
            .pixels()
            .filter(|p| **p != background && p[3] > 0)
            .count()
    }

    #[test]
    fn test_ramp_endpoints() {
        assert_eq!(ramp_color(0.0), Rgba([68, 1, 84, 255]));
        assert_eq!(ramp_color(1.0), Rgba([253, 231, 37, 255]));
        assert_eq!(ramp_color(f32::NAN), ramp_color(0.0));
        assert_eq!(ramp_color(7.0), ramp_color(1.0));
    }

    #[test]
    fn test_flat_plot() {
        let plotter = Plotter::new();
        let figure = plotter.plot(&increasing(), PlotKind::Flat).unwrap();
        assert_eq!(figure.kind(), PlotKind::Flat);
        assert_eq!(figure.height(), 3 * 16);
        // lowest value top-left, highest bottom-right
        assert_eq!(*figure.image().get_pixel(0, 0), ramp_color(0.0));
        assert_eq!(*figure.image().get_pixel(47, 47), ramp_color(1.0));
        assert!(!figure.to_png_bytes().unwrap().is_empty());
    }

    #[test]
    fn test_surface_plot() {
        let plotter = Plotter::new();
        let figure = plotter.plot(&increasing(), PlotKind::Surface3d).unwrap();
        assert_eq!((figure.width(), figure.height()), (800, 600));
        let background = plotter.options().background;
        assert!(drawn_pixels(&figure, background) > 1000);

        let bytes = figure.to_png_bytes().unwrap();
        assert_eq!(&bytes[1..4], b"PNG");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("surface.png");
        figure.save(&path).unwrap();
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }

    #[test]
    fn test_oversized_canvas_is_rejected() {
        let model = increasing();
        let huge_cells = Plotter::with_options(PlotOptions {
            cell_size: u32::MAX / 2,
            ..PlotOptions::default()
        });
        assert!(matches!(
            huge_cells.plot_flat(&model),
            Err(DhmvError::InvalidInput(_))
        ));

        let huge_canvas = Plotter::with_options(PlotOptions {
            width: 100_000,
            ..PlotOptions::default()
        });
        assert!(matches!(
            huge_canvas.plot_3d(&model),
            Err(DhmvError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_degenerate_models_still_render() {
        let options = PlotOptions {
            colorbar: false,
            ..PlotOptions::default()
        };
        let plotter = Plotter::with_options(options);

        let empty = model(vec![f32::NAN; 9], 3, 3);
        let figure = plotter.plot_3d(&empty).unwrap();
        assert_eq!(drawn_pixels(&figure, plotter.options().background), 0);
        let flat = plotter.plot_flat(&empty).unwrap();
        assert!(flat.image().pixels().all(|p| p[3] == 0));

        let constant = model(vec![4.0; 9], 3, 3);
        let figure = plotter.plot_3d(&constant).unwrap();
        assert!(drawn_pixels(&figure, plotter.options().background) > 0);
        let flat = plotter.plot_flat(&constant).unwrap();
        assert_eq!(*flat.image().get_pixel(0, 0), ramp_color(0.5));
    }
}
