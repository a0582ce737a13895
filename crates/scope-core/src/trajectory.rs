//! Scan trajectory planning.
//!
//! Turns a scan request (full frame, single line, grid, arbitrary waypoint
//! path) into the ordered positions the instrument actually visits, at the
//! native sampling pitch reported by the peer. Imperfection modifiers are
//! peer-side physics and never alter a plan.

use serde::Serialize;

use crate::constants::EPSILON;
use crate::error::{Error, Result};
use crate::geometry::{Geometry, Point, ScanDirection, Trace};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    Point,
    Grid,
    Line,
    Frame,
    Path,
}

/// A resolved scan: the caller's sparse waypoints and the dense path.
#[derive(Clone, Debug, PartialEq)]
pub struct TrajectoryPlan {
    pub kind: PlanKind,
    pub waypoints: Vec<Point>,
    pub resolved_path: Vec<Point>,
    /// `[columns, rows]` for raster plans (frame, grid).
    pub shape: Option<[usize; 2]>,
    pub pitch: f64,
}

impl TrajectoryPlan {
    pub fn len(&self) -> usize {
        self.resolved_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.resolved_path.is_empty()
    }

    /// Cumulative arclength along the resolved path.
    pub fn total_length(&self) -> f64 {
        path_length(&self.resolved_path)
    }

    pub fn summary(&self) -> PlanSummary {
        PlanSummary {
            kind: self.kind,
            waypoint_count: self.waypoints.len(),
            resolved_point_count: self.resolved_path.len(),
            total_length: self.total_length(),
            pitch: self.pitch,
            shape: self.shape,
            start: self.resolved_path.first().copied(),
            end: self.resolved_path.last().copied(),
        }
    }
}

/// Path-planning metadata kept by the session for reporting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PlanSummary {
    pub kind: PlanKind,
    pub waypoint_count: usize,
    pub resolved_point_count: usize,
    pub total_length: f64,
    pub pitch: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shape: Option<[usize; 2]>,
    pub start: Option<Point>,
    pub end: Option<Point>,
}

/// Sum of straight-line distances between consecutive points.
pub fn path_length(points: &[Point]) -> f64 {
    points.windows(2).map(|w| w[0].distance(w[1])).sum()
}

pub struct TrajectoryPlanner;

impl TrajectoryPlanner {
    /// A single in-extent position.
    pub fn point(geometry: &Geometry, position: Point) -> Result<TrajectoryPlan> {
        check_in_extent(geometry, position)?;
        Ok(TrajectoryPlan {
            kind: PlanKind::Point,
            waypoints: vec![position],
            resolved_path: vec![position],
            shape: None,
            pitch: geometry.pitch,
        })
    }

    /// The full native grid, row-major with `direction` as the fast axis.
    /// `Retrace` sweeps the fast axis backwards within every row.
    pub fn frame(geometry: &Geometry, direction: ScanDirection, trace: Trace) -> TrajectoryPlan {
        let (columns, rows) = (geometry.columns(), geometry.rows());
        let (fast_count, slow_count) = match direction {
            ScanDirection::Horizontal => (columns, rows),
            ScanDirection::Vertical => (rows, columns),
        };

        let mut resolved = Vec::with_capacity(columns * rows);
        for slow in 0..slow_count {
            for step in 0..fast_count {
                let fast = match trace {
                    Trace::Trace => step,
                    Trace::Retrace => fast_count - 1 - step,
                };
                let p = match direction {
                    ScanDirection::Horizontal => Point::new(geometry.x_at(fast), geometry.y_at(slow)),
                    ScanDirection::Vertical => Point::new(geometry.x_at(slow), geometry.y_at(fast)),
                };
                resolved.push(p);
            }
        }

        TrajectoryPlan {
            kind: PlanKind::Frame,
            waypoints: Vec::new(),
            resolved_path: resolved,
            shape: Some([columns, rows]),
            pitch: geometry.pitch,
        }
    }

    /// Every native position along the free axis. `coord` fixes the other
    /// axis: y for horizontal lines, x for vertical ones.
    pub fn line(geometry: &Geometry, direction: ScanDirection, coord: f64) -> Result<TrajectoryPlan> {
        let extent = &geometry.extent;
        let resolved: Vec<Point> = match direction {
            ScanDirection::Horizontal => {
                if !coord.is_finite() || !extent.contains_y(coord) {
                    return Err(Error::InvalidCoordinate(format!(
                        "horizontal line at y={coord} is outside [{}, {}]",
                        extent.y_min, extent.y_max
                    )));
                }
                (0..geometry.columns())
                    .map(|i| Point::new(geometry.x_at(i), coord))
                    .collect()
            }
            ScanDirection::Vertical => {
                if !coord.is_finite() || !extent.contains_x(coord) {
                    return Err(Error::InvalidCoordinate(format!(
                        "vertical line at x={coord} is outside [{}, {}]",
                        extent.x_min, extent.x_max
                    )));
                }
                (0..geometry.rows())
                    .map(|j| Point::new(coord, geometry.y_at(j)))
                    .collect()
            }
        };

        let waypoints = vec![resolved[0], resolved[resolved.len() - 1]];
        Ok(TrajectoryPlan {
            kind: PlanKind::Line,
            waypoints,
            resolved_path: resolved,
            shape: None,
            pitch: geometry.pitch,
        })
    }

    /// `nx × ny` positions spread evenly over the extent and snapped onto the
    /// native grid, x-outer / y-inner.
    pub fn grid(geometry: &Geometry, nx: usize, ny: usize) -> Result<TrajectoryPlan> {
        let xs = spread(nx, geometry.columns(), "grid_size_x", |i, n| {
            let extent = &geometry.extent;
            let x = if n == 1 {
                extent.x_min + extent.width() / 2.0
            } else {
                extent.x_min + extent.width() * i as f64 / (n - 1) as f64
            };
            geometry.snap_x(x)
        })?;
        let ys = spread(ny, geometry.rows(), "grid_size_y", |j, n| {
            let extent = &geometry.extent;
            let y = if n == 1 {
                extent.y_min + extent.height() / 2.0
            } else {
                extent.y_min + extent.height() * j as f64 / (n - 1) as f64
            };
            geometry.snap_y(y)
        })?;

        let mut resolved = Vec::with_capacity(nx * ny);
        for &x in &xs {
            for &y in &ys {
                resolved.push(Point::new(x, y));
            }
        }

        Ok(TrajectoryPlan {
            kind: PlanKind::Grid,
            waypoints: Vec::new(),
            resolved_path: resolved,
            shape: Some([nx, ny]),
            pitch: geometry.pitch,
        })
    }

    /// Piecewise-linear path through `waypoints`, resampled so consecutive
    /// points are never more than one pitch apart.
    ///
    /// Consecutive duplicate waypoints collapse to one. Each segment of
    /// length `L` gets `ceil(L / pitch)` equal steps; a point on a segment
    /// boundary is emitted once, as the start of the later segment, and only
    /// the final segment emits its end point.
    pub fn path(geometry: &Geometry, waypoints: &[Point]) -> Result<TrajectoryPlan> {
        if let Some(bad) = waypoints.iter().find(|p| !p.is_finite()) {
            return Err(Error::InvalidCoordinate(format!(
                "waypoint ({}, {}) is not finite",
                bad.x, bad.y
            )));
        }

        let mut distinct: Vec<Point> = Vec::with_capacity(waypoints.len());
        for &w in waypoints {
            if distinct.last().is_some_and(|last| last.approx_eq(w)) {
                continue;
            }
            distinct.push(w);
        }
        if distinct.len() < 2 {
            return Err(Error::DegenerateWaypoints(format!(
                "need at least 2 distinct waypoints, got {}",
                distinct.len()
            )));
        }
        for &w in &distinct {
            check_in_extent(geometry, w)?;
        }

        let pitch = geometry.pitch;
        let mut resolved = Vec::new();
        for seg in distinct.windows(2) {
            let (a, b) = (seg[0], seg[1]);
            let length = a.distance(b);
            if length <= EPSILON {
                continue;
            }
            let steps = ((length / pitch) - EPSILON).ceil().max(1.0) as usize;
            for k in 0..steps {
                resolved.push(a.lerp(b, k as f64 / steps as f64));
            }
        }
        resolved.push(distinct[distinct.len() - 1]);

        Ok(TrajectoryPlan {
            kind: PlanKind::Path,
            waypoints: distinct,
            resolved_path: resolved,
            shape: None,
            pitch,
        })
    }
}

fn check_in_extent(geometry: &Geometry, p: Point) -> Result<()> {
    if p.is_finite() && geometry.extent.contains(p) {
        return Ok(());
    }
    let e = &geometry.extent;
    Err(Error::InvalidCoordinate(format!(
        "({}, {}) is outside x∈[{}, {}], y∈[{}, {}]",
        p.x, p.y, e.x_min, e.x_max, e.y_min, e.y_max
    )))
}

fn spread(
    n: usize,
    native: usize,
    name: &str,
    place: impl Fn(usize, usize) -> f64,
) -> Result<Vec<f64>> {
    if n == 0 || n > native {
        return Err(Error::InvalidParameter(format!(
            "{name} must be between 1 and {native}, got {n}"
        )));
    }
    Ok((0..n).map(|i| place(i, n)).collect())
}
