//! Per-geometry shader metadata.
//!
//! Hit shaders receive only `gl_InstanceCustomIndexEXT` and
//! `gl_GeometryIndexEXT`; this buffer lets them map that pair to a material
//! and an index-buffer offset. Entries are packed per distinct acceleration
//! structure, one entry per primitive, and each instance carries the offset
//! of its structure's first entry as its custom index.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use gpu_allocator::MemoryLocation;
use radiant_gpu::context::GpuContext;
use radiant_gpu::error::{GpuError, Result};
use radiant_gpu::resource::GpuResource;
use tracing::debug;

use crate::blas::Blas;
use crate::geometry::Primitive;

/// One entry per geometry, in the layout hit shaders index.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct GeometryMeta {
    pub material_index: i32,
    pub index_buffer_offset: u32,
}

impl GeometryMeta {
    fn from_primitive(primitive: &Primitive) -> Self {
        Self {
            material_index: primitive.material_index,
            index_buffer_offset: primitive.first,
        }
    }
}

/// Pack metadata entries for the given structures, keyed by device address.
///
/// Returns the entry array plus each structure's offset into it. Iteration
/// over the address-ordered map makes the packing deterministic for a given
/// set of structures.
fn pack_entries(
    used: &BTreeMap<vk::DeviceAddress, Arc<Blas>>,
) -> (Vec<GeometryMeta>, BTreeMap<vk::DeviceAddress, u32>) {
    let mut entries = Vec::new();
    let mut offsets = BTreeMap::new();
    for (&address, blas) in used {
        offsets.insert(address, entries.len() as u32);
        for primitive in &blas.mesh().primitives {
            entries.push(GeometryMeta::from_primitive(primitive));
        }
    }
    (entries, offsets)
}

/// Device-local array of [`GeometryMeta`], rebuilt whenever acceleration
/// structure membership changes.
pub struct GeometryMetaBuffer {
    buffer: Option<radiant_gpu::memory::GpuBuffer>,
    capacity: u64,
    offsets: BTreeMap<vk::DeviceAddress, u32>,
    name: String,
}

impl Default for GeometryMetaBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl GeometryMetaBuffer {
    pub fn new() -> Self {
        Self {
            buffer: None,
            capacity: 0,
            offsets: BTreeMap::new(),
            name: "geometry meta".to_owned(),
        }
    }

    /// Repack entries for `used` and upload them, growing the buffer only
    /// when the packed array no longer fits. Returns each structure's entry
    /// offset for writing into instance custom indices.
    pub fn create_or_update(
        &mut self,
        context: &GpuContext,
        used: &BTreeMap<vk::DeviceAddress, Arc<Blas>>,
    ) -> Result<BTreeMap<vk::DeviceAddress, u32>> {
        let (entries, offsets) = pack_entries(used);
        self.offsets = offsets;

        if entries.is_empty() {
            return Ok(self.offsets.clone());
        }

        let required = std::mem::size_of_val(entries.as_slice()) as u64;
        if required > self.capacity {
            if let Some(mut old) = self.buffer.take() {
                context.allocator().lock().free_buffer(&mut old)?;
            }
            self.buffer = Some(context.allocator().lock().create_buffer(
                required,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::TRANSFER_DST,
                MemoryLocation::GpuOnly,
                &self.name,
            )?);
            self.capacity = required;
            debug!(capacity = required, "grew geometry meta buffer");
        }

        // One-shot staged upload; membership changes are rare enough that a
        // blocking submit is acceptable here.
        let bytes: &[u8] = bytemuck::cast_slice(&entries);
        let mut staging = context.allocator().lock().create_buffer(
            required,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
            "geometry meta staging",
        )?;
        staging.write_bytes(0, bytes)?;

        let dest = self
            .buffer
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("geometry meta buffer missing".into()))?
            .buffer;
        let copied = context.run_one_shot(|cmd| {
            let region = vk::BufferCopy {
                src_offset: 0,
                dst_offset: 0,
                size: required,
            };
            unsafe {
                context
                    .device()
                    .cmd_copy_buffer(cmd, staging.buffer, dest, &[region]);
            }
        });
        // Free the staging buffer whether or not the submit went through.
        context.allocator().lock().free_buffer(&mut staging)?;
        copied?;

        debug!(
            structures = used.len(),
            entries = entries.len(),
            "uploaded geometry meta"
        );
        Ok(self.offsets.clone())
    }

    /// Entry offset for a structure from the last packing, if present.
    pub fn offset_of(&self, address: vk::DeviceAddress) -> Option<u32> {
        self.offsets.get(&address).copied()
    }

    /// The device-local buffer, once at least one upload has happened.
    pub fn buffer(&self) -> Option<&radiant_gpu::memory::GpuBuffer> {
        self.buffer.as_ref()
    }
}

impl GpuResource for GeometryMetaBuffer {
    fn exists(&self) -> bool {
        self.buffer.is_some()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn destroy(&mut self, context: &GpuContext) -> Result<()> {
        if let Some(mut buffer) = self.buffer.take() {
            context.allocator().lock().free_buffer(&mut buffer)?;
        }
        self.capacity = 0;
        self.offsets.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Mesh;

    fn mesh(primitives: &[(u32, u32, i32)]) -> Arc<Mesh> {
        Arc::new(Mesh::new(
            "test mesh",
            primitives
                .iter()
                .map(|&(first, count, material_index)| Primitive {
                    first,
                    count,
                    highest_referenced_index: 0,
                    material_index,
                })
                .collect(),
        ))
    }

    #[test]
    fn offsets_accumulate_per_structure() {
        let mut used = BTreeMap::new();
        used.insert(0x1000, Arc::new(Blas::stub(0x1000, mesh(&[(0, 3, 0), (3, 6, 1)]))));
        used.insert(0x2000, Arc::new(Blas::stub(0x2000, mesh(&[(0, 9, 2)]))));

        let (entries, offsets) = pack_entries(&used);
        assert_eq!(entries.len(), 3);
        assert_eq!(offsets[&0x1000], 0);
        assert_eq!(offsets[&0x2000], 2);
        assert_eq!(entries[1].material_index, 1);
        assert_eq!(entries[1].index_buffer_offset, 3);
        assert_eq!(entries[2].material_index, 2);
    }

    #[test]
    fn packing_is_deterministic_for_a_given_set() {
        let a = Arc::new(Blas::stub(0x4000, mesh(&[(0, 3, 5)])));
        let b = Arc::new(Blas::stub(0x3000, mesh(&[(0, 6, 7)])));

        // Insertion order must not affect the packed layout.
        let mut first = BTreeMap::new();
        first.insert(0x4000, a.clone());
        first.insert(0x3000, b.clone());
        let mut second = BTreeMap::new();
        second.insert(0x3000, b);
        second.insert(0x4000, a);

        assert_eq!(pack_entries(&first), pack_entries(&second));
    }

    #[test]
    fn empty_set_packs_nothing() {
        let used = BTreeMap::new();
        let (entries, offsets) = pack_entries(&used);
        assert!(entries.is_empty());
        assert!(offsets.is_empty());
    }
}
