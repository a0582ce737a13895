use serde::{Deserialize, Serialize};

use crate::constants::{EPSILON, MAX_NATIVE_POINTS};
use crate::error::{Error, Result};

/// A position in the sample plane, in the instrument's physical units.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn distance(self, other: Self) -> f64 {
        (other.x - self.x).hypot(other.y - self.y)
    }

    /// Linear interpolation; `t = 0` is `self`, `t = 1` is `other`.
    pub fn lerp(self, other: Self, t: f64) -> Self {
        Self {
            x: self.x + t * (other.x - self.x),
            y: self.y + t * (other.y - self.y),
        }
    }

    /// Equal within `EPSILON` on both axes.
    pub fn approx_eq(self, other: Self) -> bool {
        (self.x - other.x).abs() <= EPSILON && (self.y - other.y).abs() <= EPSILON
    }

    pub fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

impl From<[f64; 2]> for Point {
    fn from([x, y]: [f64; 2]) -> Self {
        Self { x, y }
    }
}

impl From<Point> for [f64; 2] {
    fn from(p: Point) -> Self {
        [p.x, p.y]
    }
}

/// Axis-aligned physical extent of the scannable area (inclusive bounds).
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

impl Extent {
    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn contains_x(&self, x: f64) -> bool {
        x >= self.x_min - EPSILON && x <= self.x_max + EPSILON
    }

    pub fn contains_y(&self, y: f64) -> bool {
        y >= self.y_min - EPSILON && y <= self.y_max + EPSILON
    }

    pub fn contains(&self, p: Point) -> bool {
        self.contains_x(p.x) && self.contains_y(p.y)
    }
}

/// Sampling properties reported by the peer at initialize time.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    /// Native sampling pitch.
    pub pitch: f64,
    pub extent: Extent,
}

impl Geometry {
    /// Validated constructor: pitch must be positive and finite, the extent
    /// finite with `min <= max` on both axes, and the native grid no larger
    /// than [`MAX_NATIVE_POINTS`]. A zero-width axis has a single position.
    pub fn new(pitch: f64, extent: Extent) -> Result<Self> {
        if !(pitch.is_finite() && pitch > 0.0) {
            return Err(Error::InvalidParameter(format!(
                "pitch must be positive and finite, got {pitch}"
            )));
        }
        let finite = [extent.x_min, extent.x_max, extent.y_min, extent.y_max]
            .iter()
            .all(|v| v.is_finite());
        if !finite || extent.width() < 0.0 || extent.height() < 0.0 {
            return Err(Error::InvalidParameter(format!(
                "extent is empty or not finite: {extent:?}"
            )));
        }
        let limit = MAX_NATIVE_POINTS as f64;
        let (cols, rows) = (
            extent.width() / pitch + EPSILON,
            extent.height() / pitch + EPSILON,
        );
        let too_large = || {
            Error::InvalidParameter(format!(
                "pitch {pitch} over {extent:?} exceeds {MAX_NATIVE_POINTS} native positions"
            ))
        };
        if !(cols.is_finite() && rows.is_finite() && cols < limit && rows < limit) {
            return Err(too_large());
        }
        let (cols, rows) = (cols.floor() as usize + 1, rows.floor() as usize + 1);
        match cols.checked_mul(rows) {
            Some(n) if n <= MAX_NATIVE_POINTS => Ok(Self { pitch, extent }),
            _ => Err(too_large()),
        }
    }

    /// Number of native positions along x.
    pub fn columns(&self) -> usize {
        axis_count(self.extent.width(), self.pitch)
    }

    /// Number of native positions along y.
    pub fn rows(&self) -> usize {
        axis_count(self.extent.height(), self.pitch)
    }

    /// The i-th native x coordinate.
    pub fn x_at(&self, i: usize) -> f64 {
        self.extent.x_min + i as f64 * self.pitch
    }

    /// The j-th native y coordinate.
    pub fn y_at(&self, j: usize) -> f64 {
        self.extent.y_min + j as f64 * self.pitch
    }

    /// Snap a coordinate onto the nearest native x position.
    pub fn snap_x(&self, x: f64) -> f64 {
        let i = ((x - self.extent.x_min) / self.pitch).round().max(0.0) as usize;
        self.x_at(i.min(self.columns() - 1))
    }

    /// Snap a coordinate onto the nearest native y position.
    pub fn snap_y(&self, y: f64) -> f64 {
        let j = ((y - self.extent.y_min) / self.pitch).round().max(0.0) as usize;
        self.y_at(j.min(self.rows() - 1))
    }
}

fn axis_count(span: f64, pitch: f64) -> usize {
    (span / pitch + EPSILON).floor() as usize + 1
}

/// Fast-axis direction for frame and line scans.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScanDirection {
    #[default]
    Horizontal,
    Vertical,
}

impl ScanDirection {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "horizontal" | "h" | "x" => Ok(ScanDirection::Horizontal),
            "vertical" | "v" | "y" => Ok(ScanDirection::Vertical),
            other => Err(Error::InvalidParameter(format!(
                "direction must be 'horizontal' or 'vertical', got '{other}'"
            ))),
        }
    }
}

/// Sweep sense along the fast axis.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Trace {
    #[default]
    Trace,
    Retrace,
}

impl Trace {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(Trace::Trace),
            "retrace" => Ok(Trace::Retrace),
            other => Err(Error::InvalidParameter(format!(
                "trace must be 'trace' or 'retrace', got '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(half: f64) -> Extent {
        Extent {
            x_min: -half,
            x_max: half,
            y_min: -half,
            y_max: half,
        }
    }

    #[test]
    fn test_native_counts_include_both_ends() {
        let g = Geometry::new(0.1, extent(5.0)).unwrap();
        assert_eq!(g.columns(), 101);
        assert_eq!(g.rows(), 101);
        assert!((g.x_at(100) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_oversized_native_grid_rejected() {
        for pitch in [1e-300, 1e-3, f64::MIN_POSITIVE] {
            let err = Geometry::new(pitch, extent(5.0)).unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParameter);
        }
        // One very long axis is enough to exceed the cap.
        let strip = Extent {
            x_min: 0.0,
            x_max: 1e9,
            y_min: 0.0,
            y_max: 0.0,
        };
        assert!(Geometry::new(1.0, strip).is_err());

        let g = Geometry::new(0.01, extent(5.0)).unwrap();
        assert!(g.columns() * g.rows() <= MAX_NATIVE_POINTS);
    }

    #[test]
    fn test_degenerate_extent_has_single_position() {
        let g = Geometry::new(
            0.5,
            Extent {
                x_min: 1.0,
                x_max: 1.0,
                y_min: 0.0,
                y_max: 2.0,
            },
        )
        .unwrap();
        assert_eq!(g.columns(), 1);
        assert_eq!(g.rows(), 5);
    }

    #[test]
    fn test_rejects_bad_pitch_and_inverted_extent() {
        assert!(Geometry::new(0.0, extent(1.0)).is_err());
        assert!(Geometry::new(f64::NAN, extent(1.0)).is_err());
        let inverted = Extent {
            x_min: 1.0,
            x_max: -1.0,
            y_min: 0.0,
            y_max: 1.0,
        };
        assert!(Geometry::new(0.1, inverted).is_err());
    }

    #[test]
    fn test_snap() {
        let g = Geometry::new(0.25, extent(1.0)).unwrap();
        assert!((g.snap_x(0.3) - 0.25).abs() < 1e-12);
        assert!((g.snap_y(-0.9) - -1.0).abs() < 1e-12);
        assert!((g.snap_x(7.0) - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_contains_with_tolerance() {
        let e = extent(1.0);
        assert!(e.contains(Point::new(1.0 + 1e-12, -1.0)));
        assert!(!e.contains(Point::new(1.1, 0.0)));
    }

    #[test]
    fn test_parse_direction_and_trace() {
        assert_eq!(ScanDirection::parse("Vertical").unwrap(), ScanDirection::Vertical);
        assert_eq!(ScanDirection::parse("h").unwrap(), ScanDirection::Horizontal);
        assert!(ScanDirection::parse("diagonal").is_err());
        assert_eq!(Trace::parse("RETRACE").unwrap(), Trace::Retrace);
        assert!(Trace::parse("forward").is_err());
    }
}
