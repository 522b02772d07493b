//! The small 3-D scene drawn by render units: a cube, a sphere and a cone.

use rand::seq::SliceRandom;
use rand::Rng;
use std::f32::consts::PI;

pub type Vec3 = [f32; 3];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapeKind {
    Cube,
    Sphere,
    Cone,
}

impl ShapeKind {
    pub const ALL: [ShapeKind; 3] = [ShapeKind::Cube, ShapeKind::Sphere, ShapeKind::Cone];

    /// ARGB colour used when no texture is bound.
    pub fn color(self) -> u32 {
        match self {
            ShapeKind::Cube => 0xFF_FF_FF_FF,
            ShapeKind::Sphere => 0xFF_00_00_FF,
            ShapeKind::Cone => 0xFF_FF_00_00,
        }
    }
}

/// Model-space vertices with texture coordinates.
#[derive(Debug, Clone)]
pub struct Mesh {
    pub kind: ShapeKind,
    pub vertices: Vec<(Vec3, [f32; 2])>,
}

impl Mesh {
    pub fn cube() -> Self {
        let corners: [Vec3; 8] = [
            [-1.0, -1.0, -1.0],
            [1.0, -1.0, -1.0],
            [1.0, 1.0, -1.0],
            [-1.0, 1.0, -1.0],
            [-1.0, -1.0, 1.0],
            [1.0, -1.0, 1.0],
            [1.0, 1.0, 1.0],
            [-1.0, 1.0, 1.0],
        ];
        let faces = [
            [0, 1, 2, 3],
            [4, 5, 6, 7],
            [0, 4, 7, 3],
            [1, 5, 6, 2],
            [3, 2, 6, 7],
            [0, 1, 5, 4],
        ];
        let uv = [[0.0, 0.0], [1.0, 0.0], [1.0, 1.0], [0.0, 1.0]];
        // Sample each face on a grid so the rasterizer has something to fill.
        const STEPS: usize = 12;
        let mut vertices = Vec::with_capacity(faces.len() * (STEPS + 1) * (STEPS + 1));
        for face in faces {
            let [a, b, _, d] = face.map(|i| corners[i]);
            for i in 0..=STEPS {
                for j in 0..=STEPS {
                    let s = i as f32 / STEPS as f32;
                    let t = j as f32 / STEPS as f32;
                    let p = [
                        a[0] + (b[0] - a[0]) * s + (d[0] - a[0]) * t,
                        a[1] + (b[1] - a[1]) * s + (d[1] - a[1]) * t,
                        a[2] + (b[2] - a[2]) * s + (d[2] - a[2]) * t,
                    ];
                    let u = uv[0][0] + (uv[1][0] - uv[0][0]) * s;
                    let v = uv[0][1] + (uv[3][1] - uv[0][1]) * t;
                    vertices.push((p, [u, v]));
                }
            }
        }
        Mesh {
            kind: ShapeKind::Cube,
            vertices,
        }
    }

    pub fn sphere(radius: f32, slices: usize, stacks: usize) -> Self {
        let mut vertices = Vec::with_capacity((slices + 1) * (stacks + 1));
        for i in 0..=stacks {
            let phi = PI * i as f32 / stacks as f32;
            for j in 0..=slices {
                let theta = 2.0 * PI * j as f32 / slices as f32;
                let p = [
                    radius * phi.sin() * theta.cos(),
                    radius * phi.sin() * theta.sin(),
                    radius * phi.cos(),
                ];
                vertices.push((p, [j as f32 / slices as f32, i as f32 / stacks as f32]));
            }
        }
        Mesh {
            kind: ShapeKind::Sphere,
            vertices,
        }
    }

    pub fn cone(base: f32, height: f32, slices: usize, stacks: usize) -> Self {
        let mut vertices = Vec::with_capacity((slices + 1) * (stacks + 1));
        for i in 0..=stacks {
            let t = i as f32 / stacks as f32;
            let r = base * (1.0 - t);
            for j in 0..=slices {
                let theta = 2.0 * PI * j as f32 / slices as f32;
                vertices.push((
                    [r * theta.cos(), r * theta.sin(), height * t],
                    [j as f32 / slices as f32, t],
                ));
            }
        }
        Mesh {
            kind: ShapeKind::Cone,
            vertices,
        }
    }
}

/// One shape instance in a frame.
#[derive(Debug, Clone, Copy)]
pub struct Placement {
    pub kind: ShapeKind,
    pub offset: Vec3,
    /// Degrees around the (1, 1, 1) axis
    pub rotation: f32,
}

/// Meshes plus per-frame placement.
#[derive(Debug, Clone)]
pub struct Scene {
    meshes: Vec<Mesh>,
}

impl Default for Scene {
    fn default() -> Self {
        Self {
            meshes: vec![
                Mesh::cube(),
                Mesh::sphere(0.5, 20, 20),
                Mesh::cone(0.5, 1.0, 20, 20),
            ],
        }
    }
}

impl Scene {
    pub fn mesh(&self, kind: ShapeKind) -> &Mesh {
        // Meshes are built in `ShapeKind::ALL` order.
        &self.meshes[ShapeKind::ALL.iter().position(|k| *k == kind).unwrap_or(0)]
    }

    /// Shuffled draw order with every shape jittered within ±3 units.
    pub fn frame<R: Rng>(&self, rotation: f32, rng: &mut R) -> Vec<Placement> {
        let mut kinds = ShapeKind::ALL;
        kinds.shuffle(rng);
        kinds
            .into_iter()
            .map(|kind| Placement {
                kind,
                offset: [
                    rng.random_range(-3.0..3.0),
                    rng.random_range(-3.0..3.0),
                    rng.random_range(-3.0..3.0),
                ],
                rotation,
            })
            .collect()
    }
}

/// Rotate `p` by `degrees` around the normalized (1, 1, 1) axis (Rodrigues).
pub fn rotate(p: Vec3, degrees: f32) -> Vec3 {
    let k = 1.0 / 3.0f32.sqrt();
    let (s, c) = degrees.to_radians().sin_cos();
    let dot = k * (p[0] + p[1] + p[2]);
    let cross = [k * (p[2] - p[1]), k * (p[0] - p[2]), k * (p[1] - p[0])];
    [
        p[0] * c + cross[0] * s + k * dot * (1.0 - c),
        p[1] * c + cross[1] * s + k * dot * (1.0 - c),
        p[2] * c + cross[2] * s + k * dot * (1.0 - c),
    ]
}

/// Perspective camera at (0, 0, `eye_z`) looking at the origin.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Projection {
    pub fov_y_degrees: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub eye_z: f32,
}

impl Projection {
    pub fn perspective(width: u32, height: u32) -> Self {
        Self {
            fov_y_degrees: 45.0,
            aspect: width as f32 / height.max(1) as f32,
            near: 0.1,
            far: 50.0,
            eye_z: 15.0,
        }
    }

    /// Normalized device coordinates in `-1..=1`, or `None` when clipped.
    pub fn project(&self, p: Vec3) -> Option<(f32, f32)> {
        let depth = self.eye_z - p[2];
        if depth < self.near || depth > self.far {
            return None;
        }
        let f = 1.0 / (self.fov_y_degrees.to_radians() / 2.0).tan();
        let x = f / self.aspect * p[0] / depth;
        let y = f * p[1] / depth;
        ((-1.0..=1.0).contains(&x) && (-1.0..=1.0).contains(&y)).then_some((x, y))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_contains_each_shape_once() {
        let scene = Scene::default();
        let mut rng = rand::rng();
        let frame = scene.frame(12.0, &mut rng);
        assert_eq!(frame.len(), 3);
        for kind in ShapeKind::ALL {
            assert_eq!(frame.iter().filter(|p| p.kind == kind).count(), 1);
        }
        assert!(frame
            .iter()
            .all(|p| p.offset.iter().all(|c| (-3.0..3.0).contains(c)) && p.rotation == 12.0));
    }

    #[test]
    fn rotation_preserves_length_and_axis() {
        let p = [1.0, 2.0, -0.5];
        let r = rotate(p, 73.0);
        let len = |v: Vec3| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();
        assert!((len(p) - len(r)).abs() < 1e-5);
        let axis = rotate([1.0, 1.0, 1.0], 120.0);
        assert!(axis.iter().all(|c| (c - 1.0).abs() < 1e-5));
    }

    #[test]
    fn origin_projects_to_centre() {
        let proj = Projection::perspective(800, 600);
        assert_eq!(proj.project([0.0, 0.0, 0.0]), Some((0.0, 0.0)));
        assert_eq!(proj.project([0.0, 0.0, 20.0]), None);
    }

    #[test]
    fn meshes_have_expected_vertex_counts() {
        assert_eq!(Mesh::sphere(0.5, 20, 20).vertices.len(), 21 * 21);
        assert_eq!(Mesh::cone(0.5, 1.0, 20, 20).vertices.len(), 21 * 21);
        assert_eq!(Mesh::cube().vertices.len(), 6 * 13 * 13);
    }
}
