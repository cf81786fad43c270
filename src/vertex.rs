use glam::{Vec2, Vec3};
use lazy_static::lazy_static;

lazy_static! {
    /// A quad made of two triangles, with a color per corner.
    pub static ref VERTICES: Vec<Vertex> = vec![
        Vertex::new(Vec2::new(-0.5, 0.5), Vec3::new(1.0, 0.0, 0.0)),
        Vertex::new(Vec2::new(-0.5, -0.5), Vec3::new(0.0, 1.0, 0.0)),
        Vertex::new(Vec2::new(0.5, -0.5), Vec3::new(0.0, 0.0, 1.0)),
        Vertex::new(Vec2::new(0.5, 0.5), Vec3::new(1.0, 1.0, 1.0)),
    ];
}

pub const INDICES: &[u32] = &[0, 1, 2, 2, 3, 0];

#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Vertex {
    pos: Vec2,
    color: Vec3,
}

impl Vertex {
    pub fn new(pos: Vec2, color: Vec3) -> Self {
        Self { pos, color }
    }
}
