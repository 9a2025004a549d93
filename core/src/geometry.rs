//! Planar geometry kernel: wall segments, ray casting and collision tests.
//!
//! The world is an unordered set of straight wall segments. Two queries run against it every tick:
//!
//! - **Ray casting**: for a pose and a fan of beam angles, the distance along each beam to the
//!   nearest wall and the point where it is hit.
//! - **Collision**: whether any edge of the robot's hull, placed at a pose, crosses any wall.
//!
//! A beam is parameterized as $o + t\,d$ with $d = (\cos a, \sin a)$ and a wall as
//! $s + u\,(e - s)$. With $v_1 = o - s$, $v_2 = e - s$ and $v_3 = (-d_y, d_x)$ the intersection is
//!
//! $$
//! t = \frac{v_2 \times v_1}{v_2 \cdot v_3}, \qquad u = \frac{v_1 \cdot v_3}{v_2 \cdot v_3}
//! $$
//!
//! and is valid when $t \ge 0$ and $u \in [0, 1]$. Parallel walls ($v_2 \cdot v_3 = 0$) never
//! produce a hit.
use nalgebra::{Point2, Rotation2, Vector2};
use serde::{Deserialize, Serialize};

use crate::Pose;
use crate::error::{LocalizationError, Result};

/// A straight segment between two points.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: Point2<f64>,
    pub end: Point2<f64>,
}

impl Segment {
    pub fn new(x1: f64, y1: f64, x2: f64, y2: f64) -> Segment {
        Segment {
            start: Point2::new(x1, y1),
            end: Point2::new(x2, y2),
        }
    }
    /// Direction vector from `start` to `end` (not normalized).
    pub fn delta(&self) -> Vector2<f64> {
        self.end - self.start
    }
    pub fn length(&self) -> f64 {
        self.delta().norm()
    }
    pub fn to_array(&self) -> [f64; 4] {
        [self.start.x, self.start.y, self.end.x, self.end.y]
    }
    /// Whether `point` lies on this segment.
    ///
    /// The point must be within `tolerance` of the supporting line (measured as the cross product
    /// of the segment direction and the offset to the point) and strictly between the endpoints.
    pub fn contains_point(&self, point: &Point2<f64>, tolerance: f64) -> bool {
        let ab = self.delta();
        let ap = *point - self.start;
        let cross = ab.perp(&ap);
        if cross.abs() > tolerance {
            return false;
        }
        let dot = ab.dot(&ap);
        dot > 0.0 && dot < ab.norm_squared()
    }
}

impl From<[f64; 4]> for Segment {
    fn from(a: [f64; 4]) -> Self {
        Segment::new(a[0], a[1], a[2], a[3])
    }
}

impl From<Segment> for [f64; 4] {
    fn from(s: Segment) -> Self {
        s.to_array()
    }
}

/// The static wall set the robot moves in.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct World {
    segments: Vec<Segment>,
}

impl World {
    pub fn new(segments: Vec<Segment>) -> World {
        World { segments }
    }
    pub fn from_arrays(walls: &[[f64; 4]]) -> World {
        World {
            segments: walls.iter().copied().map(Segment::from).collect(),
        }
    }
    /// Axis aligned rectangle of walls with its lower-left corner at `origin`.
    pub fn rectangle(origin: Point2<f64>, width: f64, height: f64) -> World {
        let (x0, y0) = (origin.x, origin.y);
        let (x1, y1) = (x0 + width, y0 + height);
        World::from_arrays(&[
            [x0, y0, x1, y0],
            [x1, y0, x1, y1],
            [x1, y1, x0, y1],
            [x0, y1, x0, y0],
        ])
    }
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }
    pub fn len(&self) -> usize {
        self.segments.len()
    }
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }
    pub fn add_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }
    pub fn extend<I: IntoIterator<Item = Segment>>(&mut self, segments: I) {
        self.segments.extend(segments);
    }
    /// Remove the segment at `index`, returning it if it existed.
    pub fn remove_segment(&mut self, index: usize) -> Option<Segment> {
        (index < self.segments.len()).then(|| self.segments.remove(index))
    }
    /// Remove the first wall `point` lies on, see [`Segment::contains_point`].
    pub fn remove_at(&mut self, point: &Point2<f64>, tolerance: f64) -> Option<Segment> {
        let index = self
            .segments
            .iter()
            .position(|s| s.contains_point(point, tolerance))?;
        Some(self.segments.remove(index))
    }
    /// Lower-left and upper-right corners of the box enclosing every wall endpoint.
    pub fn bounds(&self) -> Option<(Point2<f64>, Point2<f64>)> {
        let mut points = self.segments.iter().flat_map(|s| [s.start, s.end]);
        let first = points.next()?;
        let (min, max) = points.fold((first, first), |(min, max), p| {
            (
                Point2::new(min.x.min(p.x), min.y.min(p.y)),
                Point2::new(max.x.max(p.x), max.y.max(p.y)),
            )
        });
        Some((min, max))
    }
}

/// Result of casting a fan of beams from one origin.
#[derive(Clone, Debug, PartialEq)]
pub struct RayCast {
    pub origin: Point2<f64>,
    /// Absolute beam angles in the world frame.
    pub angles: Vec<f64>,
    /// Distance to the nearest wall along each beam, or the no-hit sentinel.
    pub distances: Vec<f64>,
    /// Hit point for each beam, `None` where the beam hit nothing.
    pub hitpoints: Vec<Option<Point2<f64>>>,
}

impl RayCast {
    pub fn len(&self) -> usize {
        self.distances.len()
    }
    pub fn is_empty(&self) -> bool {
        self.distances.is_empty()
    }
    pub fn hit_count(&self) -> usize {
        self.hitpoints.iter().filter(|h| h.is_some()).count()
    }
}

/// Rotate a vector by `angle` radians.
pub fn rotate(angle: f64, v: &Vector2<f64>) -> Vector2<f64> {
    Rotation2::new(angle) * *v
}

/// Map a robot-local segment into the world frame at `pose`.
pub fn transform_segment(pose: &Pose, segment: &Segment) -> Segment {
    let iso = pose.isometry();
    Segment {
        start: iso * segment.start,
        end: iso * segment.end,
    }
}

/// Distance along a unit `direction` from `origin` to `segment`, if the ray hits it.
pub fn intersect_ray(
    origin: &Point2<f64>,
    direction: &Vector2<f64>,
    segment: &Segment,
) -> Option<f64> {
    let v1 = *origin - segment.start;
    let v2 = segment.delta();
    let v3 = Vector2::new(-direction.y, direction.x);
    let det = v2.dot(&v3);
    if det == 0.0 {
        return None;
    }
    let t = v2.perp(&v1) / det;
    let u = v1.dot(&v3) / det;
    (t >= 0.0 && (0.0..=1.0).contains(&u)).then_some(t)
}

/// Cast a single beam at absolute `angle`.
///
/// Returns the distance to the nearest wall and the hit point, or `(no_hit, None)`.
pub fn cast_ray(
    origin: &Point2<f64>,
    angle: f64,
    world: &World,
    no_hit: f64,
) -> (f64, Option<Point2<f64>>) {
    let direction = Vector2::new(angle.cos(), angle.sin());
    let nearest = world
        .segments()
        .iter()
        .filter_map(|s| intersect_ray(origin, &direction, s))
        .min_by(f64::total_cmp);
    match nearest {
        Some(t) => (t, Some(*origin + direction * t)),
        None => (no_hit, None),
    }
}

/// Cast one beam per entry of `beam_angles`, each relative to `heading`.
///
/// # Example
/// ```rust
/// use nalgebra::Point2;
/// use robosim::geometry::{World, ray_cast};
/// let world = World::from_arrays(&[[5.0, 0.0, 5.0, 4.0]]);
/// let beams = [0.0, std::f64::consts::PI];
/// let scan = ray_cast(&Point2::new(2.0, 2.0), 0.0, &beams, &world, f64::INFINITY);
/// assert!((scan.distances[0] - 3.0).abs() < 1e-12);
/// assert!(scan.distances[1].is_infinite());
/// ```
pub fn ray_cast(
    origin: &Point2<f64>,
    heading: f64,
    beam_angles: &[f64],
    world: &World,
    no_hit: f64,
) -> RayCast {
    let angles: Vec<f64> = beam_angles.iter().map(|b| heading + b).collect();
    let (distances, hitpoints) = angles
        .iter()
        .map(|a| cast_ray(origin, *a, world, no_hit))
        .unzip();
    RayCast {
        origin: *origin,
        angles,
        distances,
        hitpoints,
    }
}

/// [`ray_cast`] for callers holding the origin as a plain slice.
///
/// The origin must have exactly two components.
pub fn ray_cast_slice(
    origin: &[f64],
    heading: f64,
    beam_angles: &[f64],
    world: &World,
    no_hit: f64,
) -> Result<RayCast> {
    match origin {
        [x, y] => Ok(ray_cast(
            &Point2::new(*x, *y),
            heading,
            beam_angles,
            world,
            no_hit,
        )),
        _ => Err(LocalizationError::InvalidDimension {
            expected: 2,
            actual: origin.len(),
        }),
    }
}

/// Cast the same beam fan from every pose in `poses`.
pub fn ray_cast_batch(
    poses: &[Pose],
    beam_angles: &[f64],
    world: &World,
    no_hit: f64,
) -> Vec<RayCast> {
    poses
        .iter()
        .map(|p| ray_cast(&p.position(), p.theta, beam_angles, world, no_hit))
        .collect()
}

/// Whether two segments cross.
///
/// Parallel and collinear pairs never intersect here, overlapping collinear segments included.
pub fn segments_intersect(a: &Segment, b: &Segment) -> bool {
    let s1 = a.delta();
    let s2 = b.delta();
    let den = -s2.x * s1.y + s1.x * s2.y;
    if den == 0.0 {
        return false;
    }
    let s = (-s1.y * (a.start.x - b.start.x) + s1.x * (a.start.y - b.start.y)) / den;
    let t = (s2.x * (a.start.y - b.start.y) - s2.y * (a.start.x - b.start.x)) / den;
    (0.0..=1.0).contains(&s) && (0.0..=1.0).contains(&t)
}

/// Whether the hull, given as robot-local edges and placed at `pose`, touches any wall.
pub fn collides(world: &World, hull: &[Segment], pose: &Pose) -> bool {
    let placed: Vec<Segment> = hull.iter().map(|e| transform_segment(pose, e)).collect();
    world
        .segments()
        .iter()
        .any(|wall| placed.iter().any(|edge| segments_intersect(wall, edge)))
}
