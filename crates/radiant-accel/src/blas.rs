//! Bottom-level acceleration structures.
//!
//! One `Blas` wraps one mesh: each primitive becomes one triangle geometry
//! in the structure. Builds run on a one-shot command buffer and block until
//! the device finishes, since they happen at load time or on rare geometry
//! edits rather than per frame. Refits for animated vertex data record into
//! the caller's per-frame command buffer instead.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::MemoryLocation;
use radiant_gpu::context::GpuContext;
use radiant_gpu::error::{GpuError, Result};
use radiant_gpu::memory::GpuBuffer;
use radiant_gpu::resource::GpuResource;
use tracing::debug;

use crate::geometry::{GeometrySource, Mesh, Primitive};

/// Build-time knobs, applied to every build and refit of the structure.
#[derive(Debug, Clone, Copy)]
pub struct BlasBuildOptions {
    pub flags: vk::BuildAccelerationStructureFlagsKHR,
    /// Marks every geometry opaque, skipping any-hit shader invocations.
    pub opaque: bool,
}

impl Default for BlasBuildOptions {
    fn default() -> Self {
        Self {
            flags: vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            opaque: false,
        }
    }
}

/// One build range per primitive: `primitive_count` in triangles,
/// `primitive_offset` in bytes into the index buffer.
pub(crate) fn assemble_build_ranges(
    primitives: &[Primitive],
) -> (Vec<vk::AccelerationStructureBuildRangeInfoKHR>, Vec<u32>) {
    let mut ranges = Vec::with_capacity(primitives.len());
    let mut counts = Vec::with_capacity(primitives.len());
    for primitive in primitives {
        let triangles = primitive.triangle_count();
        ranges.push(vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: triangles,
            primitive_offset: primitive.index_byte_offset(),
            first_vertex: 0,
            transform_offset: 0,
        });
        counts.push(triangles);
    }
    (ranges, counts)
}

/// Bottom-level acceleration structure over one mesh.
pub struct Blas {
    accel: vk::AccelerationStructureKHR,
    backing: Option<GpuBuffer>,
    scratch: Option<GpuBuffer>,
    address: vk::DeviceAddress,
    mesh: Arc<Mesh>,
    options: BlasBuildOptions,
    ranges: Vec<vk::AccelerationStructureBuildRangeInfoKHR>,
    primitive_counts: Vec<u32>,
    name: String,
}

impl Blas {
    /// Build a structure for `mesh` from vertex and index data at `source`.
    pub fn build(
        context: &GpuContext,
        mesh: Arc<Mesh>,
        source: &GeometrySource,
        options: BlasBuildOptions,
    ) -> Result<Self> {
        let name = format!("blas for \"{}\"", mesh.name);
        let (ranges, primitive_counts) = assemble_build_ranges(&mesh.primitives);
        if ranges.is_empty() {
            return Err(GpuError::InvalidState(format!(
                "mesh \"{}\" has no primitives to build from",
                mesh.name,
            )));
        }

        let mut blas = Self {
            accel: vk::AccelerationStructureKHR::null(),
            backing: None,
            scratch: None,
            address: 0,
            mesh,
            options,
            ranges,
            primitive_counts,
            name,
        };
        blas.rebuild(context, source)?;
        Ok(blas)
    }

    /// Rebuild from scratch against current geometry data. Grows the backing
    /// buffer only when the required size exceeds the existing capacity, so a
    /// rebuild of similar-sized geometry reuses the allocation.
    pub fn rebuild(&mut self, context: &GpuContext, source: &GeometrySource) -> Result<()> {
        let device = context.device();
        let loader = context.accel_loader();

        let geometries = self.assemble_geometries(source);
        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.options.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &self.primitive_counts,
                &mut size_info,
            );
        }

        let backing_fits = self
            .backing
            .as_ref()
            .is_some_and(|b| b.size >= size_info.acceleration_structure_size);
        if !backing_fits {
            if let Some(mut old) = self.backing.take() {
                context.allocator().lock().free_buffer(&mut old)?;
            }
            self.backing = Some(context.allocator().lock().create_buffer(
                size_info.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
                &self.name,
            )?);
        }

        // Keep the scratch sized for refits too, so cmd_refit never allocates.
        let scratch_size = size_info.build_scratch_size.max(size_info.update_scratch_size);
        let scratch_fits = self.scratch.as_ref().is_some_and(|b| b.size >= scratch_size);
        if !scratch_fits {
            if let Some(mut old) = self.scratch.take() {
                context.allocator().lock().free_buffer(&mut old)?;
            }
            self.scratch = Some(context.allocator().lock().create_buffer_aligned(
                scratch_size,
                vk::BufferUsageFlags::STORAGE_BUFFER | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
                u64::from(context.capabilities().ray_tracing.min_scratch_alignment),
                &format!("scratch for \"{}\"", self.name),
            )?);
        }

        if self.accel != vk::AccelerationStructureKHR::null() {
            unsafe { loader.destroy_acceleration_structure(self.accel, None) };
            self.accel = vk::AccelerationStructureKHR::null();
        }

        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("blas backing buffer missing".into()))?;
        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("blas scratch buffer missing".into()))?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(backing.buffer)
            .offset(0)
            .size(size_info.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL);
        self.accel = unsafe { loader.create_acceleration_structure(&create_info, None)? };

        build_info = build_info
            .dst_acceleration_structure(self.accel)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(device),
            });

        context.run_one_shot(|cmd| unsafe {
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&self.ranges]);
        })?;

        self.address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(self.accel),
            )
        };
        debug!(
            name = %self.name,
            geometries = self.ranges.len(),
            size = size_info.acceleration_structure_size,
            "built bottom-level acceleration structure"
        );
        Ok(())
    }

    /// Record a refit against updated vertex data into `cmd`.
    ///
    /// Valid only after a successful build, with geometry counts unchanged.
    /// The cached device address survives a refit; only [`Self::rebuild`]
    /// may move it.
    /// The caller must barrier the vertex writes before this and the build
    /// output before any trace that consumes it.
    ///
    /// # Safety
    /// `cmd` must be a command buffer in the recording state.
    pub unsafe fn cmd_refit(
        &self,
        context: &GpuContext,
        cmd: vk::CommandBuffer,
        source: &GeometrySource,
    ) -> Result<()> {
        if self.accel == vk::AccelerationStructureKHR::null() {
            return Err(GpuError::InvalidState(format!(
                "refit of \"{}\" before first build",
                self.name,
            )));
        }
        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("blas scratch buffer missing".into()))?;

        let geometries = self.assemble_geometries(source);
        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::BOTTOM_LEVEL)
            .flags(self.options.flags)
            .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
            .src_acceleration_structure(self.accel)
            .dst_acceleration_structure(self.accel)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(context.device()),
            });

        unsafe {
            context
                .accel_loader()
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&self.ranges]);
        }
        Ok(())
    }

    /// Geometry descriptions referencing current device addresses. Rebuilt
    /// per call because the structs borrow nothing and addresses may move
    /// when the caller reallocates vertex storage.
    fn assemble_geometries(
        &self,
        source: &GeometrySource,
    ) -> Vec<vk::AccelerationStructureGeometryKHR<'static>> {
        let flags = if self.options.opaque {
            vk::GeometryFlagsKHR::OPAQUE
        } else {
            vk::GeometryFlagsKHR::empty()
        };

        // One descriptor per primitive; max_vertex bounds that primitive's
        // own index range, not the mesh-wide maximum.
        self.mesh
            .primitives
            .iter()
            .map(|primitive| {
                let triangles = vk::AccelerationStructureGeometryTrianglesDataKHR::default()
                    .vertex_format(vk::Format::R32G32B32_SFLOAT)
                    .vertex_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: source.vertex_address,
                    })
                    .vertex_stride(source.vertex_stride)
                    .max_vertex(primitive.highest_referenced_index)
                    .index_type(vk::IndexType::UINT32)
                    .index_data(vk::DeviceOrHostAddressConstKHR {
                        device_address: source.index_address,
                    });

                vk::AccelerationStructureGeometryKHR::default()
                    .geometry_type(vk::GeometryTypeKHR::TRIANGLES)
                    .geometry(vk::AccelerationStructureGeometryDataKHR { triangles })
                    .flags(flags)
            })
            .collect()
    }

    /// Device address of the built structure, the identity used for instance
    /// references and metadata packing.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn mesh(&self) -> &Arc<Mesh> {
        &self.mesh
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.accel
    }

    /// A shell with a fixed address and no device objects, for exercising
    /// host-side packing logic.
    #[cfg(test)]
    pub(crate) fn stub(address: vk::DeviceAddress, mesh: Arc<Mesh>) -> Self {
        let (ranges, primitive_counts) = assemble_build_ranges(&mesh.primitives);
        let name = format!("blas for \"{}\"", mesh.name);
        Self {
            accel: vk::AccelerationStructureKHR::null(),
            backing: None,
            scratch: None,
            address,
            mesh,
            options: BlasBuildOptions::default(),
            ranges,
            primitive_counts,
            name,
        }
    }
}

impl GpuResource for Blas {
    fn exists(&self) -> bool {
        self.accel != vk::AccelerationStructureKHR::null()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn destroy(&mut self, context: &GpuContext) -> Result<()> {
        if self.accel != vk::AccelerationStructureKHR::null() {
            unsafe {
                context
                    .accel_loader()
                    .destroy_acceleration_structure(self.accel, None);
            }
            self.accel = vk::AccelerationStructureKHR::null();
        }
        let mut allocator = context.allocator().lock();
        if let Some(mut backing) = self.backing.take() {
            allocator.free_buffer(&mut backing)?;
        }
        if let Some(mut scratch) = self.scratch.take() {
            allocator.free_buffer(&mut scratch)?;
        }
        self.address = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_ranges_cover_each_primitive() {
        let primitives = [
            Primitive {
                first: 0,
                count: 9,
                highest_referenced_index: 5,
                material_index: 0,
            },
            Primitive {
                first: 9,
                count: 3,
                highest_referenced_index: 7,
                material_index: 1,
            },
        ];
        let (ranges, counts) = assemble_build_ranges(&primitives);

        assert_eq!(ranges.len(), 2);
        assert_eq!(counts, vec![3, 1]);
        assert_eq!(ranges[0].primitive_count, 3);
        assert_eq!(ranges[0].primitive_offset, 0);
        assert_eq!(ranges[1].primitive_count, 1);
        assert_eq!(ranges[1].primitive_offset, 9 * 4);
        assert_eq!(ranges[1].first_vertex, 0);
    }

    #[test]
    fn empty_mesh_yields_no_ranges() {
        let (ranges, counts) = assemble_build_ranges(&[]);
        assert!(ranges.is_empty());
        assert!(counts.is_empty());
    }

    fn two_primitive_blas(address: u64) -> Blas {
        let mesh = Mesh::new(
            "two primitives",
            vec![
                Primitive {
                    first: 0,
                    count: 9,
                    highest_referenced_index: 2,
                    material_index: 0,
                },
                Primitive {
                    first: 9,
                    count: 3,
                    highest_referenced_index: 999,
                    material_index: 1,
                },
            ],
        );
        Blas::stub(address, std::sync::Arc::new(mesh))
    }

    #[test]
    fn each_geometry_bounds_its_own_vertex_range() {
        let blas = two_primitive_blas(0x1000);
        let source = GeometrySource {
            vertex_address: 0x10,
            index_address: 0x20,
            vertex_stride: 12,
        };

        let geometries = blas.assemble_geometries(&source);
        let max_vertices: Vec<u32> = geometries
            .iter()
            .map(|g| unsafe { g.geometry.triangles.max_vertex })
            .collect();
        assert_eq!(max_vertices, vec![2, 999]);
    }

    #[test]
    fn geometry_assembly_leaves_cached_address_untouched() {
        // The refit path reassembles geometry descriptors against current
        // addresses; the structure's cached address must not move with them.
        let blas = two_primitive_blas(0xBEEF00);
        let before = blas.device_address();

        for address in [0x10u64, 0x9000] {
            let source = GeometrySource {
                vertex_address: address,
                index_address: address + 0x100,
                vertex_stride: 12,
            };
            let _ = blas.assemble_geometries(&source);
        }

        assert_eq!(blas.device_address(), before);
        assert_eq!(before, 0xBEEF00);
    }
}
