//! # Navigation
//!
//! The navigator knows the route the vehicle is following. Every sample it is given the fused
//! pose and returns the [`GeoState`], i.e. the lateral and heading error of the vehicle relative
//! to the segment of the current path it is on. It also sequences the paths of the route, raising
//! a one-shot "path changed" flag each time it moves onto the next path, and provides lookahead
//! points for the trajectory controller.
//!
//! ## Error frame
//!
//! Errors and lookahead points are expressed in the frame attached to the vehicle's projection
//! onto the current segment: x points to the right of the path and y along it. Headings in this
//! frame are measured clockwise from +y, so a positive lateral error means the vehicle is right of
//! the path and a positive heading error means it points to the right of it.
//!
//! ## Routes
//!
//! A [`Route`] is an ordered list of [`RoutePath`]s, each an ordered list of [`Waypoint`]s in the
//! local planar frame. Paths marked `is_back`, or whose name contains `Back`, are driven in
//! reverse. Routes are loaded from JSON files.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::{
    fs::File,
    io::BufReader,
    path::Path,
    sync::{Arc, Mutex},
};

use log::{debug, info, trace};
use nalgebra::Vector2;
use serde::{Deserialize, Serialize};
use util::maths::wrap_pi;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Segments shorter than this are rejected when validating a route.
const MIN_SEGMENT_LENGTH_M: f64 = 1e-6;

// ------------------------------------------------------------------------------------------------
// TYPES
// ------------------------------------------------------------------------------------------------

/// A navigator shared between the information stream and the path follower.
pub type SharedNavigator = Arc<Mutex<Box<dyn Navigator>>>;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Error of the vehicle relative to the current path.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct GeoState {
    /// Lateral error in meters, positive when the vehicle is right of the path.
    pub lat_error_m: f64,

    /// Heading error in radians, positive when the vehicle points right of the path.
    pub head_error_rad: f64,
}

/// A point on the reference trajectory, in the error frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct TrajectoryPoint {
    pub x_m: f64,
    pub y_m: f64,
    pub heading_rad: f64,
    pub curvature_m: f64,
    pub velocity_ms: f64,
}

/// A point on a path.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Waypoint {
    /// Identifier of the point. Identifiers may carry the curvature of the path at the point,
    /// either as the whole identifier or as the last `_` separated token.
    pub id: String,

    /// Position in the local planar frame
    pub position_m: Vector2<f64>,
}

/// One path of a route.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RoutePath {
    pub name: String,

    #[serde(default)]
    pub is_back: bool,

    pub points: Vec<Waypoint>,
}

/// An ordered list of paths.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Route {
    pub paths: Vec<RoutePath>,
}

/// A navigator following a [`Route`].
#[derive(Debug, Default)]
pub struct RouteNavigator {
    route: Option<Route>,

    /// Index of the current path in the route
    path_index: usize,

    /// Index of the point the vehicle is heading towards on the current path. The current segment
    /// joins `target_index - 1` and `target_index`.
    target_index: usize,

    path_changed: bool,
    finished: bool,

    last_projection: Option<Projection>,
}

/// Where the vehicle projects onto the current segment.
#[derive(Debug, Clone, Copy)]
struct Projection {
    foot_m: Vector2<f64>,
    heading_rad: f64,
    path_index: usize,
    target_index: usize,
}

/// A segment of a path.
#[derive(Debug, Clone, Copy)]
struct Segment {
    start_m: Vector2<f64>,
    target_m: Vector2<f64>,
    length_m: f64,
    direction: Vector2<f64>,

    /// Heading of the segment, clockwise from north
    heading_rad: f64,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum NavError {
    #[error("Could not open the route file: {0}")]
    RouteFileError(std::io::Error),

    #[error("Could not parse the route file: {0}")]
    RouteParseError(serde_json::Error),

    #[error("The route contains no paths")]
    EmptyRoute,

    #[error("Path {0} has fewer than two points")]
    PathTooShort(String),

    #[error("Path {0} has a zero length segment ending at point {1}")]
    ZeroLengthSegment(String, usize),
}

// ------------------------------------------------------------------------------------------------
// TRAITS
// ------------------------------------------------------------------------------------------------

/// Map and path sequencing.
pub trait Navigator: Send {
    /// Replace the route being followed, restarting at its first path.
    fn set_map(&mut self, route: Route) -> Result<(), NavError>;

    /// Whether a route has been set.
    fn has_map(&self) -> bool;

    /// Update the navigator with the vehicle's pose.
    ///
    /// Returns `None` if no error can be computed from this pose, either because the pose is
    /// invalid or because there is no route.
    fn update(&mut self, position_m: Vector2<f64>, heading_rad: f64) -> Option<GeoState>;

    fn current_path(&self) -> Option<&RoutePath>;

    fn next_path(&self) -> Option<&RoutePath>;

    /// The waypoint the vehicle is currently heading towards.
    fn current_point(&self) -> Option<&Waypoint>;

    fn current_path_index(&self) -> Option<usize>;

    /// Returns `true` once for each path transition (including finishing the route).
    fn take_path_changed(&mut self) -> bool;

    /// Get the point `distance_m` ahead of the vehicle's projection on the route, in the error
    /// frame.
    ///
    /// If `forward` is set the walk continues onto the next path when the current one runs out,
    /// otherwise the last segment of the current path is extended.
    fn look_ahead_point(&self, distance_m: f64, forward: bool) -> Option<TrajectoryPoint>;

    /// `true` once the last point of the route has been passed.
    fn is_finished(&self) -> bool;
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl RoutePath {
    /// Whether this path is to be driven in reverse.
    pub fn is_back(&self) -> bool {
        self.is_back || self.name.contains("Back")
    }

    /// Get the segment ending at the given point, if it exists.
    fn segment(&self, target_index: usize) -> Option<Segment> {
        if target_index == 0 || target_index >= self.points.len() {
            return None;
        }

        Segment::new(
            self.points[target_index - 1].position_m,
            self.points[target_index].position_m,
        )
    }
}

impl Route {
    /// Load a route from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, NavError> {
        let file = File::open(path).map_err(NavError::RouteFileError)?;
        let route: Route =
            serde_json::from_reader(BufReader::new(file)).map_err(NavError::RouteParseError)?;

        route.validate()?;

        Ok(route)
    }

    /// Check the route can be followed.
    pub fn validate(&self) -> Result<(), NavError> {
        if self.paths.is_empty() {
            return Err(NavError::EmptyRoute);
        }

        for path in &self.paths {
            if path.points.len() < 2 {
                return Err(NavError::PathTooShort(path.name.clone()));
            }

            for (i, pair) in path.points.windows(2).enumerate() {
                if (pair[1].position_m - pair[0].position_m).norm() < MIN_SEGMENT_LENGTH_M {
                    return Err(NavError::ZeroLengthSegment(path.name.clone(), i + 1));
                }
            }
        }

        Ok(())
    }
}

impl Segment {
    fn new(start_m: Vector2<f64>, target_m: Vector2<f64>) -> Option<Self> {
        let diff = target_m - start_m;
        let length_m = diff.norm();

        if length_m < MIN_SEGMENT_LENGTH_M {
            return None;
        }

        Some(Self {
            start_m,
            target_m,
            length_m,
            direction: diff / length_m,
            heading_rad: diff[0].atan2(diff[1]),
        })
    }

    /// Distance along the segment of the projection of the point, from the start.
    fn along(&self, point_m: &Vector2<f64>) -> f64 {
        (point_m - self.start_m).dot(&self.direction)
    }
}

impl RouteNavigator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a navigator already following the given route.
    pub fn with_route(route: Route) -> Result<Self, NavError> {
        let mut nav = Self::new();
        nav.set_map(route)?;
        Ok(nav)
    }

    fn path(&self, index: usize) -> Option<&RoutePath> {
        self.route.as_ref().and_then(|r| r.paths.get(index))
    }

    /// Advance the target (and path) until the vehicle has not yet passed the target point.
    fn advance(&mut self, position_m: &Vector2<f64>) {
        loop {
            let path = match self.path(self.path_index) {
                Some(p) => p,
                None => return,
            };

            let seg = match path.segment(self.target_index) {
                Some(s) => s,
                None => return,
            };

            if seg.along(position_m) < seg.length_m {
                return;
            }

            trace!(
                "Passed point {} of path {}",
                path.points[self.target_index].id,
                path.name
            );

            if self.target_index + 1 < path.points.len() {
                self.target_index += 1;
                continue;
            }

            // End of the path
            let num_paths = self.route.as_ref().map(|r| r.paths.len()).unwrap_or(0);
            self.path_changed = true;

            if self.path_index + 1 < num_paths {
                self.path_index += 1;
                self.target_index = 1;
                info!(
                    "Moved onto path {} ({})",
                    self.path_index,
                    self.path(self.path_index).map(|p| p.name.as_str()).unwrap_or("")
                );
            }
            else {
                self.finished = true;
                info!("Reached the end of the route");
                return;
            }
        }
    }

    /// Walk `distance_m` along the route from the last projection.
    ///
    /// Returns the world position, the heading of the segment at that point and the id of the
    /// point ending that segment.
    fn walk(&self, distance_m: f64, forward: bool) -> Option<(Vector2<f64>, f64, Option<&str>)> {
        let proj = self.last_projection?;
        let route = self.route.as_ref()?;

        let mut remaining_m = distance_m.max(0.0);
        let mut from_m = proj.foot_m;
        let mut path_index = proj.path_index;
        let mut target_index = proj.target_index;
        let mut last_seg: Option<Segment> = None;
        let mut last_id: Option<&str> = None;

        loop {
            let path = route.paths.get(path_index)?;

            if target_index < path.points.len() {
                let target = &path.points[target_index];

                // The first leg starts at the foot point, later legs at the previous point
                if let Some(seg) = Segment::new(from_m, target.position_m) {
                    if remaining_m <= seg.length_m {
                        return Some((
                            seg.start_m + seg.direction * remaining_m,
                            seg.heading_rad,
                            Some(target.id.as_str()),
                        ));
                    }

                    remaining_m -= seg.length_m;
                    last_seg = Some(seg);
                }

                last_id = Some(target.id.as_str());
                from_m = target.position_m;
                target_index += 1;
                continue;
            }

            // Out of points on this path
            let continues = forward && path_index + 1 < route.paths.len();
            if continues {
                path_index += 1;
                target_index = 0;
                continue;
            }

            // Extend the last segment travelled, or the current one if none was completed
            let seg = match last_seg {
                Some(s) => s,
                None => route.paths[proj.path_index].segment(proj.target_index)?,
            };
            return Some((
                from_m + seg.direction * remaining_m,
                seg.heading_rad,
                last_id,
            ));
        }
    }
}

impl Navigator for RouteNavigator {
    fn set_map(&mut self, route: Route) -> Result<(), NavError> {
        route.validate()?;

        info!("New route with {} paths", route.paths.len());
        for (i, p) in route.paths.iter().enumerate() {
            debug!(
                "    {}: {} ({} points{})",
                i,
                p.name,
                p.points.len(),
                if p.is_back() { ", reverse" } else { "" }
            );
        }

        self.route = Some(route);
        self.path_index = 0;
        self.target_index = 1;
        self.path_changed = false;
        self.finished = false;
        self.last_projection = None;

        Ok(())
    }

    fn has_map(&self) -> bool {
        self.route.is_some()
    }

    fn update(&mut self, position_m: Vector2<f64>, heading_rad: f64) -> Option<GeoState> {
        if !position_m[0].is_finite() || !position_m[1].is_finite() || !heading_rad.is_finite() {
            return None;
        }

        if !self.finished {
            self.advance(&position_m);
        }

        let seg = self.path(self.path_index)?.segment(self.target_index)?;

        let rel = position_m - seg.start_m;
        let foot_m = seg.start_m + seg.direction * seg.along(&position_m);

        // Right of the path is the direction rotated 90° clockwise
        let right = Vector2::new(seg.direction[1], -seg.direction[0]);

        self.last_projection = Some(Projection {
            foot_m,
            heading_rad: seg.heading_rad,
            path_index: self.path_index,
            target_index: self.target_index,
        });

        Some(GeoState {
            lat_error_m: rel.dot(&right),
            head_error_rad: wrap_pi(heading_rad - seg.heading_rad),
        })
    }

    fn current_path(&self) -> Option<&RoutePath> {
        self.path(self.path_index)
    }

    fn next_path(&self) -> Option<&RoutePath> {
        self.path(self.path_index + 1)
    }

    fn current_point(&self) -> Option<&Waypoint> {
        self.current_path()?.points.get(self.target_index)
    }

    fn current_path_index(&self) -> Option<usize> {
        self.current_path().map(|_| self.path_index)
    }

    fn take_path_changed(&mut self) -> bool {
        std::mem::replace(&mut self.path_changed, false)
    }

    fn look_ahead_point(&self, distance_m: f64, forward: bool) -> Option<TrajectoryPoint> {
        let proj = self.last_projection?;
        let (point_m, heading_rad, id) = self.walk(distance_m, forward)?;

        let rel = point_m - proj.foot_m;
        let fwd = Vector2::new(proj.heading_rad.sin(), proj.heading_rad.cos());
        let right = Vector2::new(fwd[1], -fwd[0]);

        Some(TrajectoryPoint {
            x_m: rel.dot(&right),
            y_m: rel.dot(&fwd),
            heading_rad: wrap_pi(heading_rad - proj.heading_rad),
            curvature_m: id.and_then(parse_curvature).unwrap_or(0.0),
            velocity_ms: 0.0,
        })
    }

    fn is_finished(&self) -> bool {
        self.finished
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Parse the path curvature carried by a waypoint id.
///
/// The whole id is tried first, then its last `_` separated token.
pub fn parse_curvature(id: &str) -> Option<f64> {
    let parse = |s: &str| s.trim().parse::<f64>().ok().filter(|c| c.is_finite());

    parse(id).or_else(|| id.rsplit('_').next().and_then(parse))
}

/// Wrap a navigator so it can be shared between threads.
pub fn shared<N: Navigator + 'static>(nav: N) -> SharedNavigator {
    Arc::new(Mutex::new(Box::new(nav)))
}
