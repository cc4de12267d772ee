//! Small linear-algebra helpers used by brushes, patches and entity origins.

use std::fmt;
use std::ops::{Add, Mul, Neg, Sub};

use serde::{Deserialize, Serialize};

/// Tolerance used when comparing plane distances and vertex positions.
pub const EPSILON: f64 = 1e-5;

/// 3D vector in world units.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub const ZERO: Self = Self::new(0.0, 0.0, 0.0);

    pub const fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, other: Self) -> f64 {
        self.x * other.x + self.y * other.y + self.z * other.z
    }

    pub fn cross(self, other: Self) -> Self {
        Self::new(
            self.y * other.z - self.z * other.y,
            self.z * other.x - self.x * other.z,
            self.x * other.y - self.y * other.x,
        )
    }

    pub fn length(self) -> f64 {
        self.dot(self).sqrt()
    }

    /// Returns the unit vector, or zero for a degenerate input.
    pub fn normalised(self) -> Self {
        let len = self.length();
        if len < f64::EPSILON {
            Self::ZERO
        } else {
            self * (1.0 / len)
        }
    }

    pub fn is_near(self, other: Self, epsilon: f64) -> bool {
        (self.x - other.x).abs() <= epsilon
            && (self.y - other.y).abs() <= epsilon
            && (self.z - other.z).abs() <= epsilon
    }

    /// Parses the `"x y z"` form used by entity spawnargs.
    pub fn parse(text: &str) -> Option<Self> {
        let mut parts = text.split_whitespace().map(str::parse::<f64>);
        let x = parts.next()?.ok()?;
        let y = parts.next()?.ok()?;
        let z = parts.next()?.ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self::new(x, y, z))
    }
}

impl fmt::Display for Vector3 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {}", self.x, self.y, self.z)
    }
}

impl Add for Vector3 {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Self::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Sub for Vector3 {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Self::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl Mul<f64> for Vector3 {
    type Output = Self;
    fn mul(self, rhs: f64) -> Self {
        Self::new(self.x * rhs, self.y * rhs, self.z * rhs)
    }
}

impl Neg for Vector3 {
    type Output = Self;
    fn neg(self) -> Self {
        Self::new(-self.x, -self.y, -self.z)
    }
}

/// Plane in `normal . p = dist` form.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane3 {
    pub normal: Vector3,
    pub dist: f64,
}

impl Plane3 {
    pub const fn new(normal: Vector3, dist: f64) -> Self {
        Self { normal, dist }
    }

    /// Builds a plane through three points, with the winding used by `brushDef` faces.
    pub fn from_points(p0: Vector3, p1: Vector3, p2: Vector3) -> Self {
        let normal = (p0 - p1).cross(p2 - p1).normalised();
        Self::new(normal, normal.dot(p0))
    }

    pub fn distance_to(&self, point: Vector3) -> f64 {
        self.normal.dot(point) - self.dist
    }

    pub fn translated(&self, offset: Vector3) -> Self {
        Self::new(self.normal, self.dist + self.normal.dot(offset))
    }

    /// Intersection point of three planes, if they meet in a single point.
    pub fn intersect(a: &Self, b: &Self, c: &Self) -> Option<Vector3> {
        let n1xn2 = a.normal.cross(b.normal);
        let denom = c.normal.dot(n1xn2);
        if denom.abs() < 1e-9 {
            return None;
        }
        let point = (b.normal.cross(c.normal) * a.dist
            + c.normal.cross(a.normal) * b.dist
            + n1xn2 * c.dist)
            * (1.0 / denom);
        Some(point)
    }
}

/// Axis-aligned bounding box.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vector3,
    pub max: Vector3,
}

impl Aabb {
    pub fn from_point(point: Vector3) -> Self {
        Self { min: point, max: point }
    }

    pub fn include_point(&mut self, point: Vector3) {
        self.min = Vector3::new(self.min.x.min(point.x), self.min.y.min(point.y), self.min.z.min(point.z));
        self.max = Vector3::new(self.max.x.max(point.x), self.max.y.max(point.y), self.max.z.max(point.z));
    }

    pub fn include(&mut self, other: &Self) {
        self.include_point(other.min);
        self.include_point(other.max);
    }

    pub fn origin(&self) -> Vector3 {
        (self.min + self.max) * 0.5
    }

    /// Bounds of a point cloud, `None` when empty.
    pub fn from_points(points: impl IntoIterator<Item = Vector3>) -> Option<Self> {
        let mut iter = points.into_iter();
        let mut bounds = Self::from_point(iter.next()?);
        for point in iter {
            bounds.include_point(point);
        }
        Some(bounds)
    }
}
