//! Geometry types consumed from the external geometry store.
//!
//! The geometry store owns the shared vertex and index buffers for all
//! meshes; this crate only sees their device addresses plus per-mesh
//! primitive ranges.

use ash::vk;

/// A triangle sub-range of the shared index buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Primitive {
    /// Index of the first index in the shared index buffer.
    pub first: u32,
    /// Number of indices used by this primitive.
    pub count: u32,
    /// Highest index into the vertex buffer referenced by this primitive.
    pub highest_referenced_index: u32,
    /// Index into the material buffer. Negative selects the fallback material.
    pub material_index: i32,
}

impl Primitive {
    /// Number of triangles (each consumes three indices).
    pub fn triangle_count(&self) -> u32 {
        self.count / 3
    }

    /// Byte offset of this primitive's first index in the index buffer.
    pub fn index_byte_offset(&self) -> u32 {
        self.first * std::mem::size_of::<u32>() as u32
    }
}

/// An ordered list of primitives sharing one bottom-level structure.
#[derive(Debug, Clone)]
pub struct Mesh {
    /// Debug name, used for buffer naming.
    pub name: String,
    /// Primitives in draw order. One BLAS geometry is built per primitive so
    /// each keeps its own material addressability.
    pub primitives: Vec<Primitive>,
}

impl Mesh {
    pub fn new(name: impl Into<String>, primitives: Vec<Primitive>) -> Self {
        Self {
            name: name.into(),
            primitives,
        }
    }
}

/// Device addresses of the geometry store's shared buffers.
///
/// These can change between frames when the store reallocates; builds and
/// updates always consume the current value.
#[derive(Debug, Clone, Copy)]
pub struct GeometrySource {
    /// Device address of the shared vertex buffer.
    pub vertex_address: vk::DeviceAddress,
    /// Device address of the shared index buffer (u32 indices).
    pub index_address: vk::DeviceAddress,
    /// Byte stride between vertices.
    pub vertex_stride: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn triangle_count_from_index_count() {
        let primitive = Primitive {
            first: 12,
            count: 9,
            highest_referenced_index: 7,
            material_index: 0,
        };
        assert_eq!(primitive.triangle_count(), 3);
        assert_eq!(primitive.index_byte_offset(), 48);
    }
}
