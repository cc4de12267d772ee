//! Brush and patch primitives.

use crate::math::{Aabb, Plane3, Vector3};

/// Distance within which a vertex still counts as on or behind a plane.
const PLANE_EPSILON: f64 = 0.01;

/// Texture projection matrix of a face (`( ( xx yx tx ) ( xy yy ty ) )`).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextureMatrix {
    pub rows: [[f64; 3]; 2],
}

impl Default for TextureMatrix {
    fn default() -> Self {
        Self {
            rows: [[0.0078125, 0.0, 0.0], [0.0, 0.0078125, 0.0]],
        }
    }
}

impl TextureMatrix {
    /// Shifts the translation so the texture stays put while the face moves by `offset`.
    fn compensate(&mut self, normal: Vector3, offset: Vector3) {
        let (s_axis, t_axis) = compute_axis_base(normal);
        let ds = offset.dot(s_axis);
        let dt = offset.dot(t_axis);
        for row in &mut self.rows {
            row[2] -= row[0] * ds + row[1] * dt;
        }
    }

    /// Texture coordinates of `point` on a face with the given normal.
    pub fn project(&self, normal: Vector3, point: Vector3) -> (f64, f64) {
        let (s_axis, t_axis) = compute_axis_base(normal);
        let ps = point.dot(s_axis);
        let pt = point.dot(t_axis);
        let [s, t] = self.rows;
        (s[0] * ps + s[1] * pt + s[2], t[0] * ps + t[1] * pt + t[2])
    }
}

/// Texture axes derived from a face normal (brush primitive convention).
pub fn compute_axis_base(normal: Vector3) -> (Vector3, Vector3) {
    let rot_y = -normal.z.atan2((normal.y * normal.y + normal.x * normal.x).sqrt());
    let rot_z = normal.y.atan2(normal.x);
    let s_axis = Vector3::new(-rot_z.sin(), rot_z.cos(), 0.0);
    let t_axis = Vector3::new(
        -rot_y.sin() * rot_z.cos(),
        -rot_y.sin() * rot_z.sin(),
        -rot_y.cos(),
    );
    (s_axis, t_axis)
}

#[derive(Debug, Clone, PartialEq)]
pub struct Face {
    /// Outward-facing plane.
    pub plane: Plane3,
    pub texture: TextureMatrix,
    pub shader: String,
    /// Content flags and the two unused integers written after the shader.
    pub flags: [i32; 3],
}

impl Face {
    pub fn new(plane: Plane3, shader: &str) -> Self {
        Self {
            plane,
            texture: TextureMatrix::default(),
            shader: shader.to_string(),
            flags: [0; 3],
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Brush {
    pub faces: Vec<Face>,
    pub detail: bool,
}

impl Brush {
    pub fn new(faces: Vec<Face>) -> Self {
        Self { faces, detail: false }
    }

    /// Axis-aligned box brush with every face using `shader`.
    pub fn cuboid(min: Vector3, max: Vector3, shader: &str) -> Self {
        let axes = [
            Vector3::new(1.0, 0.0, 0.0),
            Vector3::new(0.0, 1.0, 0.0),
            Vector3::new(0.0, 0.0, 1.0),
        ];
        let mut faces = Vec::with_capacity(6);
        for axis in axes {
            faces.push(Face::new(Plane3::new(axis, axis.dot(max)), shader));
            faces.push(Face::new(Plane3::new(-axis, -axis.dot(min)), shader));
        }
        Self::new(faces)
    }

    /// Corner points, found by intersecting every plane triple.
    pub fn vertices(&self) -> Vec<Vector3> {
        let planes: Vec<Plane3> = self.faces.iter().map(|f| f.plane).collect();
        let mut points: Vec<Vector3> = Vec::new();

        for i in 0..planes.len() {
            for j in i + 1..planes.len() {
                for k in j + 1..planes.len() {
                    let Some(point) = Plane3::intersect(&planes[i], &planes[j], &planes[k]) else {
                        continue;
                    };
                    let inside = planes.iter().all(|p| p.distance_to(point) <= PLANE_EPSILON);
                    if inside && !points.iter().any(|q| q.is_near(point, PLANE_EPSILON)) {
                        points.push(point);
                    }
                }
            }
        }
        points
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.vertices())
    }

    /// A brush needs at least four faces enclosing a volume.
    pub fn is_valid(&self) -> bool {
        self.faces.len() >= 4 && self.vertices().len() >= 4
    }

    pub fn translate(&mut self, offset: Vector3, texture_lock: bool) {
        for face in &mut self.faces {
            face.plane = face.plane.translated(offset);
            if texture_lock {
                face.texture.compensate(face.plane.normal, offset);
            }
        }
    }

    pub fn set_shader(&mut self, shader: &str) {
        for face in &mut self.faces {
            face.shader = shader.to_string();
        }
    }
}

/// One patch control vertex: position and texture coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PatchControl {
    pub vertex: Vector3,
    pub u: f64,
    pub v: f64,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Patch {
    pub shader: String,
    /// Control points, `width` columns of `height` rows each.
    pub width: usize,
    pub height: usize,
    pub controls: Vec<PatchControl>,
    /// Fixed tessellation (`patchDef3`); `None` for automatic subdivision.
    pub fixed_subdivisions: Option<(u32, u32)>,
    /// Trailing integers of the patch header.
    pub flags: [i32; 3],
}

impl Patch {
    pub fn new(shader: &str, width: usize, height: usize) -> Self {
        Self {
            shader: shader.to_string(),
            width,
            height,
            controls: vec![PatchControl::default(); width * height],
            fixed_subdivisions: None,
            flags: [0; 3],
        }
    }

    pub fn control(&self, column: usize, row: usize) -> Option<&PatchControl> {
        (column < self.width && row < self.height)
            .then(|| self.controls.get(column * self.height + row))
            .flatten()
    }

    pub fn control_mut(&mut self, column: usize, row: usize) -> Option<&mut PatchControl> {
        if column < self.width && row < self.height {
            self.controls.get_mut(column * self.height + row)
        } else {
            None
        }
    }

    pub fn bounds(&self) -> Option<Aabb> {
        Aabb::from_points(self.controls.iter().map(|c| c.vertex))
    }

    /// Moves every control point. Texture coordinates are stored per vertex and stay as they are.
    pub fn translate(&mut self, offset: Vector3) {
        for control in &mut self.controls {
            control.vertex = control.vertex + offset;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::EPSILON;

    #[test]
    fn test_cuboid_vertices_and_bounds() {
        let brush = Brush::cuboid(Vector3::new(-8.0, -8.0, -8.0), Vector3::new(8.0, 8.0, 8.0), "textures/a");
        assert_eq!(brush.vertices().len(), 8);
        assert!(brush.is_valid());
        let bounds = brush.bounds().unwrap();
        assert!(bounds.origin().is_near(Vector3::ZERO, EPSILON));
        assert!(bounds.max.is_near(Vector3::new(8.0, 8.0, 8.0), EPSILON));
    }

    #[test]
    fn test_translate_moves_planes() {
        let mut brush = Brush::cuboid(Vector3::new(-8.0, -8.0, -8.0), Vector3::new(8.0, 8.0, 8.0), "textures/a");
        brush.translate(Vector3::new(10.0, 20.0, 30.0), false);
        let origin = brush.bounds().unwrap().origin();
        assert!(origin.is_near(Vector3::new(10.0, 20.0, 30.0), EPSILON));
    }

    #[test]
    fn test_texture_lock_keeps_texture_in_place() {
        let mut brush = Brush::cuboid(Vector3::new(0.0, 0.0, 0.0), Vector3::new(64.0, 64.0, 64.0), "textures/a");
        let offset = Vector3::new(16.0, 8.0, 4.0);
        let point = Vector3::new(32.0, 32.0, 64.0);
        let before: Vec<(f64, f64)> = brush.faces.iter().map(|f| f.texture.project(f.plane.normal, point)).collect();

        brush.translate(offset, true);
        let after: Vec<(f64, f64)> = brush
            .faces
            .iter()
            .map(|f| f.texture.project(f.plane.normal, point + offset))
            .collect();

        for ((s0, t0), (s1, t1)) in before.into_iter().zip(after) {
            assert!((s0 - s1).abs() < 1e-9 && (t0 - t1).abs() < 1e-9);
        }
    }

    #[test]
    fn test_patch_controls() {
        let mut patch = Patch::new("textures/p", 3, 3);
        patch.control_mut(2, 1).unwrap().vertex = Vector3::new(4.0, 0.0, 0.0);
        patch.translate(Vector3::new(1.0, 1.0, 1.0));
        assert_eq!(patch.control(2, 1).unwrap().vertex, Vector3::new(5.0, 1.0, 1.0));
        assert!(patch.control(3, 0).is_none());
        assert_eq!(patch.bounds().unwrap().max, Vector3::new(5.0, 1.0, 1.0));
    }
}
