//! Top-level acceleration structure and its instance table.
//!
//! Membership and static transforms change through [`InstanceTable`], which
//! marks the structure dirty; [`Tlas::create_or_update`] performs the full
//! blocking rebuild. Animated motion goes through the per-frame
//! [`Tlas::cmd_update_animated`] path, which restages only the animated tail
//! of the instance buffer and refits the structure in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use ash::vk;
use glam::Mat4;
use gpu_allocator::MemoryLocation;
use radiant_gpu::context::GpuContext;
use radiant_gpu::deferred::DeferredDeletionQueue;
use radiant_gpu::error::{GpuError, Result};
use radiant_gpu::memory::GpuBuffer;
use radiant_gpu::resource::GpuResource;
use tracing::debug;

use crate::blas::Blas;
use crate::dual_buffer::DualBuffer;
use crate::instance::{BlasInstance, FrameContext, TransformSource};
use crate::meta::GeometryMetaBuffer;

const INSTANCE_STRIDE: u64 = std::mem::size_of::<vk::AccelerationStructureInstanceKHR>() as u64;

/// Instances keyed by a monotonically assigned id, split by animation so the
/// static block can sit in front of the animated block in the device buffer.
#[derive(Default)]
pub struct InstanceTable {
    statics: BTreeMap<u64, BlasInstance>,
    animated: BTreeMap<u64, BlasInstance>,
    next_id: u64,
    dirty: bool,
}

impl InstanceTable {
    /// Add an instance fixed at `transform`. Returns its id.
    pub fn add_static(&mut self, blas: Arc<Blas>, transform: Mat4) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.statics
            .insert(id, BlasInstance::new_static(id, blas, transform));
        self.dirty = true;
        id
    }

    /// Add an instance whose transform is pulled from `source` each frame.
    pub fn add_animated(&mut self, blas: Arc<Blas>, source: Arc<dyn TransformSource>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.animated
            .insert(id, BlasInstance::new_animated(id, blas, source));
        self.dirty = true;
        id
    }

    /// Add from a source, classifying by [`TransformSource::is_static`].
    /// Static sources are sampled once here and never again.
    pub fn add(&mut self, blas: Arc<Blas>, source: Arc<dyn TransformSource>) -> u64 {
        if source.is_static() {
            let transform = source.sample(&FrameContext::default());
            self.add_static(blas, transform)
        } else {
            self.add_animated(blas, source)
        }
    }

    /// Remove an instance by id. Unknown ids are a no-op, but the table is
    /// marked dirty either way.
    pub fn remove(&mut self, id: u64) {
        self.statics.remove(&id);
        self.animated.remove(&id);
        self.dirty = true;
    }

    pub fn find(&self, id: u64) -> Option<&BlasInstance> {
        self.statics.get(&id).or_else(|| self.animated.get(&id))
    }

    pub fn find_mut(&mut self, id: u64) -> Option<&mut BlasInstance> {
        self.dirty = true;
        self.statics.get_mut(&id).or_else(|| self.animated.get_mut(&id))
    }

    pub fn clear(&mut self) {
        self.statics.clear();
        self.animated.clear();
        self.dirty = true;
    }

    pub fn static_count(&self) -> usize {
        self.statics.len()
    }

    pub fn animated_count(&self) -> usize {
        self.animated.len()
    }

    pub fn len(&self) -> usize {
        self.statics.len() + self.animated.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statics.is_empty() && self.animated.is_empty()
    }

    /// Whether membership or static transforms changed since the last full
    /// rebuild.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Every distinct bottom-level structure referenced, keyed by device
    /// address for deterministic packing.
    fn used_blas(&self) -> BTreeMap<vk::DeviceAddress, Arc<Blas>> {
        let mut used = BTreeMap::new();
        for instance in self.statics.values().chain(self.animated.values()) {
            used.entry(instance.blas().device_address())
                .or_insert_with(|| instance.blas().clone());
        }
        used
    }

    fn apply_meta_offsets(&mut self, offsets: &BTreeMap<vk::DeviceAddress, u32>) {
        for instance in self.statics.values_mut().chain(self.animated.values_mut()) {
            if let Some(&offset) = offsets.get(&instance.blas().device_address()) {
                instance.set_geometry_meta_offset(offset);
            }
        }
    }

    /// Descriptors in device-buffer order: static block first, animated
    /// block after it, each in ascending id order.
    fn serialize(&self) -> Vec<vk::AccelerationStructureInstanceKHR> {
        self.statics
            .values()
            .chain(self.animated.values())
            .map(|instance| *instance.descriptor())
            .collect()
    }

    fn serialize_animated(&self) -> Vec<vk::AccelerationStructureInstanceKHR> {
        self.animated
            .values()
            .map(|instance| *instance.descriptor())
            .collect()
    }

    fn refresh_animated(&mut self, frame: &FrameContext) {
        for instance in self.animated.values_mut() {
            instance.refresh(frame);
        }
    }
}

/// Top-level acceleration structure over an [`InstanceTable`].
pub struct Tlas {
    accel: vk::AccelerationStructureKHR,
    backing: Option<GpuBuffer>,
    scratch: Option<GpuBuffer>,
    instance_buffer: Option<DualBuffer>,
    address: vk::DeviceAddress,
    instances: InstanceTable,
    meta: GeometryMetaBuffer,
    retired: DeferredDeletionQueue,
    built_instance_count: u32,
    name: String,
}

impl Tlas {
    pub fn new(context: &GpuContext, name: impl Into<String>) -> Self {
        Self {
            accel: vk::AccelerationStructureKHR::null(),
            backing: None,
            scratch: None,
            instance_buffer: None,
            address: 0,
            instances: InstanceTable::default(),
            meta: GeometryMetaBuffer::new(),
            retired: DeferredDeletionQueue::new(context.frames_in_flight()),
            built_instance_count: 0,
            name: name.into(),
        }
    }

    pub fn instances(&self) -> &InstanceTable {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut InstanceTable {
        &mut self.instances
    }

    pub fn meta_buffer(&self) -> &GeometryMetaBuffer {
        &self.meta
    }

    /// Device address of the built structure.
    pub fn device_address(&self) -> vk::DeviceAddress {
        self.address
    }

    pub fn handle(&self) -> vk::AccelerationStructureKHR {
        self.accel
    }

    /// Rebuild the structure to match the current instance table. Blocks on
    /// a one-shot submit; call at load time or on membership edits, never in
    /// the per-frame path.
    ///
    /// No-op when the table is clean and the structure is built. Superseded
    /// device objects are retired through the deferred queue since in-flight
    /// frames may still reference them.
    pub fn create_or_update(&mut self, context: &GpuContext, frame_number: u64) -> Result<()> {
        if !self.instances.is_dirty() && self.accel != vk::AccelerationStructureKHR::null() {
            return Ok(());
        }

        let used = self.instances.used_blas();
        let offsets = self.meta.create_or_update(context, &used)?;
        self.instances.apply_meta_offsets(&offsets);

        let descriptors = self.instances.serialize();
        let instance_count = descriptors.len() as u32;

        // At least one instance slot so an emptied scene still has a valid
        // buffer to rebuild into later.
        let required = INSTANCE_STRIDE * u64::from(instance_count.max(1));
        let buffer_fits = self
            .instance_buffer
            .as_ref()
            .is_some_and(|b| b.capacity() >= required);
        if !buffer_fits {
            if let Some(old) = self.instance_buffer.take() {
                for buffer in old.into_buffers() {
                    self.retired.queue_buffer(buffer, frame_number);
                }
            }
            // Overallocate so steady instance growth reuses the buffer.
            let capacity = required + required / 4;
            self.instance_buffer = Some(DualBuffer::new(
                context,
                capacity,
                vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
                    | vk::BufferUsageFlags::ACCELERATION_STRUCTURE_BUILD_INPUT_READ_ONLY_KHR,
                context.frames_in_flight(),
                format!("instances for \"{}\"", self.name),
            )?);
        }

        let instance_buffer = self
            .instance_buffer
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("tlas instance buffer missing".into()))?;
        if !descriptors.is_empty() {
            instance_buffer.stage_section(0, &descriptors, 0)?;
        }

        let device = context.device();
        let loader = context.accel_loader();
        let instance_address = instance_buffer.device_address(device);

        let geometry_instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_address,
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: geometry_instances,
            });
        let geometries = [geometry];

        let mut build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                    | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            )
            .mode(vk::BuildAccelerationStructureModeKHR::BUILD)
            .geometries(&geometries);

        let mut size_info = vk::AccelerationStructureBuildSizesInfoKHR::default();
        unsafe {
            loader.get_acceleration_structure_build_sizes(
                vk::AccelerationStructureBuildTypeKHR::DEVICE,
                &build_info,
                &[instance_count],
                &mut size_info,
            );
        }

        let backing_fits = self
            .backing
            .as_ref()
            .is_some_and(|b| b.size >= size_info.acceleration_structure_size);
        if !backing_fits {
            if let Some(old) = self.backing.take() {
                self.retired.queue_buffer(old, frame_number);
            }
            self.backing = Some(context.allocator().lock().create_buffer(
                size_info.acceleration_structure_size,
                vk::BufferUsageFlags::ACCELERATION_STRUCTURE_STORAGE_KHR
                    | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                MemoryLocation::GpuOnly,
                &self.name,
            )?);
        }

        let scratch_size = size_info.build_scratch_size.max(size_info.update_scratch_size);
        let scratch_fits = self.scratch.as_ref().is_some_and(|b| b.size >= scratch_size);
        if !scratch_fits {
            if let Some(old) = self.scratch.take() {
                self.retired.queue_buffer(old, frame_number);
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
            self.retired.queue_accel_struct(self.accel, frame_number);
            self.accel = vk::AccelerationStructureKHR::null();
        }

        let backing = self
            .backing
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("tlas backing buffer missing".into()))?;
        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("tlas scratch buffer missing".into()))?;

        let create_info = vk::AccelerationStructureCreateInfoKHR::default()
            .buffer(backing.buffer)
            .offset(0)
            .size(size_info.acceleration_structure_size)
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL);
        self.accel = unsafe { loader.create_acceleration_structure(&create_info, None)? };

        build_info = build_info
            .dst_acceleration_structure(self.accel)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(device),
            });

        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: instance_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };

        // Full rebuilds block on their own submit, so slot 0 serves as the
        // staging slot regardless of the caller's frame.
        context.run_one_shot(|cmd| unsafe {
            if let Some(buffer) = &mut self.instance_buffer {
                buffer.cmd_copy_to_device(device, cmd, 0);
                buffer.cmd_prepare_for_read(
                    device,
                    cmd,
                    vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                    vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
                );
            }
            loader.cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        })?;

        self.address = unsafe {
            loader.get_acceleration_structure_device_address(
                &vk::AccelerationStructureDeviceAddressInfoKHR::default()
                    .acceleration_structure(self.accel),
            )
        };
        self.built_instance_count = instance_count;
        self.instances.mark_clean();
        self.retired.process(context, frame_number)?;

        debug!(
            name = %self.name,
            statics = self.instances.static_count(),
            animated = self.instances.animated_count(),
            "rebuilt top-level acceleration structure"
        );
        Ok(())
    }

    /// Record the per-frame animated refresh: restage the animated block of
    /// the instance buffer and refit the structure in place.
    ///
    /// Requires a clean, built structure; membership edits must go through
    /// [`Self::create_or_update`] first. No-op when nothing is animated.
    ///
    /// # Safety
    /// `cmd` must be a command buffer in the recording state, submitted with
    /// the frame pacing the staging slots were sized for.
    pub unsafe fn cmd_update_animated(
        &mut self,
        context: &GpuContext,
        cmd: vk::CommandBuffer,
        frame: &FrameContext,
    ) -> Result<()> {
        self.retired.process(context, frame.frame_index)?;

        if self.instances.animated_count() == 0 {
            return Ok(());
        }
        if self.instances.is_dirty() || self.accel == vk::AccelerationStructureKHR::null() {
            return Err(GpuError::InvalidState(format!(
                "animated update of \"{}\" with pending membership changes",
                self.name,
            )));
        }

        self.instances.refresh_animated(frame);
        let descriptors = self.instances.serialize_animated();
        let animated_offset = INSTANCE_STRIDE * self.instances.static_count() as u64;

        let instance_buffer = self
            .instance_buffer
            .as_mut()
            .ok_or_else(|| GpuError::InvalidState("tlas instance buffer missing".into()))?;
        instance_buffer.stage_section(frame.frame_index, &descriptors, animated_offset)?;

        let device = context.device();
        unsafe {
            instance_buffer.cmd_copy_to_device(device, cmd, frame.frame_index);
            instance_buffer.cmd_prepare_for_read(
                device,
                cmd,
                vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR,
                vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR,
            );
        }

        let scratch = self
            .scratch
            .as_ref()
            .ok_or_else(|| GpuError::InvalidState("tlas scratch buffer missing".into()))?;

        let geometry_instances = vk::AccelerationStructureGeometryInstancesDataKHR::default()
            .array_of_pointers(false)
            .data(vk::DeviceOrHostAddressConstKHR {
                device_address: instance_buffer.device_address(device),
            });
        let geometry = vk::AccelerationStructureGeometryKHR::default()
            .geometry_type(vk::GeometryTypeKHR::INSTANCES)
            .geometry(vk::AccelerationStructureGeometryDataKHR {
                instances: geometry_instances,
            });
        let geometries = [geometry];

        let build_info = vk::AccelerationStructureBuildGeometryInfoKHR::default()
            .ty(vk::AccelerationStructureTypeKHR::TOP_LEVEL)
            .flags(
                vk::BuildAccelerationStructureFlagsKHR::PREFER_FAST_TRACE
                    | vk::BuildAccelerationStructureFlagsKHR::ALLOW_UPDATE,
            )
            .mode(vk::BuildAccelerationStructureModeKHR::UPDATE)
            .src_acceleration_structure(self.accel)
            .dst_acceleration_structure(self.accel)
            .geometries(&geometries)
            .scratch_data(vk::DeviceOrHostAddressKHR {
                device_address: scratch.device_address(device),
            });

        // A refit still covers every instance, not just the animated block.
        let range = vk::AccelerationStructureBuildRangeInfoKHR {
            primitive_count: self.built_instance_count,
            primitive_offset: 0,
            first_vertex: 0,
            transform_offset: 0,
        };
        unsafe {
            context
                .accel_loader()
                .cmd_build_acceleration_structures(cmd, &[build_info], &[&[range]]);
        }
        Ok(())
    }

    /// Barrier making the refit output visible to ray traversal. Record
    /// after [`Self::cmd_update_animated`], before the trace.
    ///
    /// # Safety
    /// `cmd` must be a command buffer in the recording state.
    pub unsafe fn cmd_barrier_for_trace(&self, context: &GpuContext, cmd: vk::CommandBuffer) {
        let barrier = vk::MemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ACCELERATION_STRUCTURE_BUILD_KHR)
            .src_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_WRITE_KHR)
            .dst_stage_mask(vk::PipelineStageFlags2::RAY_TRACING_SHADER_KHR)
            .dst_access_mask(vk::AccessFlags2::ACCELERATION_STRUCTURE_READ_KHR);
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::default().memory_barriers(&barriers);
        unsafe { context.device().cmd_pipeline_barrier2(cmd, &dependency) };
    }
}

impl GpuResource for Tlas {
    fn exists(&self) -> bool {
        self.accel != vk::AccelerationStructureKHR::null()
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn destroy(&mut self, context: &GpuContext) -> Result<()> {
        self.retired.flush(context)?;
        if self.accel != vk::AccelerationStructureKHR::null() {
            unsafe {
                context
                    .accel_loader()
                    .destroy_acceleration_structure(self.accel, None);
            }
            self.accel = vk::AccelerationStructureKHR::null();
        }
        if let Some(mut buffer) = self.instance_buffer.take() {
            buffer.destroy(context)?;
        }
        let mut allocator = context.allocator().lock();
        if let Some(mut backing) = self.backing.take() {
            allocator.free_buffer(&mut backing)?;
        }
        if let Some(mut scratch) = self.scratch.take() {
            allocator.free_buffer(&mut scratch)?;
        }
        drop(allocator);
        self.meta.destroy(context)?;
        self.address = 0;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Mesh, Primitive};
    use crate::instance::StaticTransform;

    fn stub_blas(address: u64, primitive_count: usize) -> Arc<Blas> {
        let primitives = (0..primitive_count)
            .map(|i| Primitive {
                first: (i * 3) as u32,
                count: 3,
                highest_referenced_index: 2,
                material_index: i as i32,
            })
            .collect();
        Arc::new(Blas::stub(address, Arc::new(Mesh::new("stub", primitives))))
    }

    #[test]
    fn adds_and_removes_mark_dirty() {
        let mut table = InstanceTable::default();
        assert!(!table.is_dirty());

        let id = table.add_static(stub_blas(0x1000, 1), Mat4::IDENTITY);
        assert!(table.is_dirty());

        table.mark_clean();
        table.remove(id);
        assert!(table.is_dirty());
        assert!(table.is_empty());

        // Removing an unknown id still dirties.
        table.mark_clean();
        table.remove(999);
        assert!(table.is_dirty());
    }

    #[test]
    fn ids_are_monotonic_and_unique() {
        let mut table = InstanceTable::default();
        let blas = stub_blas(0x1000, 1);
        let a = table.add_static(blas.clone(), Mat4::IDENTITY);
        let b = table.add_static(blas.clone(), Mat4::IDENTITY);
        table.remove(a);
        let c = table.add_static(blas, Mat4::IDENTITY);

        assert!(b > a);
        assert!(c > b);
    }

    #[test]
    fn add_classifies_by_source_staticness() {
        let mut table = InstanceTable::default();
        let blas = stub_blas(0x1000, 1);

        struct Orbit;
        impl TransformSource for Orbit {
            fn sample(&self, _frame: &FrameContext) -> Mat4 {
                Mat4::IDENTITY
            }
        }

        table.add(blas.clone(), Arc::new(StaticTransform(Mat4::IDENTITY)));
        table.add(blas, Arc::new(Orbit));

        assert_eq!(table.static_count(), 1);
        assert_eq!(table.animated_count(), 1);
    }

    #[test]
    fn serialization_packs_statics_before_animated() {
        let mut table = InstanceTable::default();
        let static_blas = stub_blas(0x1000, 1);
        let animated_blas = stub_blas(0x2000, 1);

        struct Orbit;
        impl TransformSource for Orbit {
            fn sample(&self, _frame: &FrameContext) -> Mat4 {
                Mat4::IDENTITY
            }
        }

        // Interleave insertion order; the layout must still be split.
        table.add_animated(animated_blas.clone(), Arc::new(Orbit));
        table.add_static(static_blas.clone(), Mat4::IDENTITY);
        table.add_animated(animated_blas, Arc::new(Orbit));
        table.add_static(static_blas, Mat4::IDENTITY);

        let descriptors = table.serialize();
        assert_eq!(descriptors.len(), 4);
        unsafe {
            assert_eq!(descriptors[0].acceleration_structure_reference.device_handle, 0x1000);
            assert_eq!(descriptors[1].acceleration_structure_reference.device_handle, 0x1000);
            assert_eq!(descriptors[2].acceleration_structure_reference.device_handle, 0x2000);
            assert_eq!(descriptors[3].acceleration_structure_reference.device_handle, 0x2000);
        }
    }

    #[test]
    fn used_blas_deduplicates_by_address() {
        let mut table = InstanceTable::default();
        let shared = stub_blas(0x1000, 2);
        table.add_static(shared.clone(), Mat4::IDENTITY);
        table.add_static(shared, Mat4::IDENTITY);
        table.add_static(stub_blas(0x2000, 1), Mat4::IDENTITY);

        let used = table.used_blas();
        assert_eq!(used.len(), 2);
        assert!(used.contains_key(&0x1000));
        assert!(used.contains_key(&0x2000));
    }

    #[test]
    fn meta_offsets_reach_every_instance() {
        let mut table = InstanceTable::default();
        table.add_static(stub_blas(0x1000, 2), Mat4::IDENTITY);
        table.add_static(stub_blas(0x2000, 1), Mat4::IDENTITY);

        let mut offsets = BTreeMap::new();
        offsets.insert(0x1000u64, 0u32);
        offsets.insert(0x2000u64, 2u32);
        table.apply_meta_offsets(&offsets);

        let descriptors = table.serialize();
        assert_eq!(descriptors[0].instance_custom_index_and_mask.low_24(), 0);
        assert_eq!(descriptors[1].instance_custom_index_and_mask.low_24(), 2);
        // Mask survives the offset write.
        assert_eq!(descriptors[0].instance_custom_index_and_mask.high_8(), 0xFF);
    }

    #[test]
    fn refresh_only_touches_animated_block() {
        use glam::Vec3;

        struct Slide;
        impl TransformSource for Slide {
            fn sample(&self, frame: &FrameContext) -> Mat4 {
                Mat4::from_translation(Vec3::new(frame.time_seconds as f32, 0.0, 0.0))
            }
        }

        let mut table = InstanceTable::default();
        table.add_static(stub_blas(0x1000, 1), Mat4::IDENTITY);
        table.add_animated(stub_blas(0x2000, 1), Arc::new(Slide));

        table.refresh_animated(&FrameContext {
            frame_index: 3,
            time_seconds: 2.5,
        });

        let descriptors = table.serialize();
        assert_eq!(descriptors[0].transform.matrix[3], 0.0);
        assert_eq!(descriptors[1].transform.matrix[3], 2.5);
    }
}
