//! N-buffered host-to-device synchronization.
//!
//! A `DualBuffer` owns one device-local buffer plus one persistently mapped
//! staging buffer per frame in flight. Host writes land in the staging slot
//! for `frame_index mod N`; the pending regions are copied to the device
//! buffer when the frame's command buffer is recorded. Slot reuse safety is
//! the caller's frame-pacing responsibility (see `radiant_gpu::sync`).

use ash::vk;
use gpu_allocator::MemoryLocation;
use radiant_gpu::context::GpuContext;
use radiant_gpu::error::{GpuError, Result};
use radiant_gpu::memory::{GpuAllocator, GpuBuffer};
use radiant_gpu::resource::GpuResource;

/// Per-slot ledger of staged-but-not-yet-copied regions.
///
/// Pure host bookkeeping: records which byte ranges of a slot's staging
/// buffer differ from the device buffer, cleared when the copy is recorded.
#[derive(Debug, Default)]
pub(crate) struct CopyRing {
    slots: Vec<Vec<vk::BufferCopy>>,
}

impl CopyRing {
    pub(crate) fn new(slot_count: usize) -> Self {
        assert!(slot_count > 0, "staging ring needs at least one slot");
        Self {
            slots: vec![Vec::new(); slot_count],
        }
    }

    pub(crate) fn slot_index(&self, frame_index: u64) -> usize {
        (frame_index % self.slots.len() as u64) as usize
    }

    /// Record a pending copy. Staging writes mirror the destination layout,
    /// so source and destination offsets are identical.
    pub(crate) fn record(&mut self, frame_index: u64, offset: u64, size: u64) {
        let slot = self.slot_index(frame_index);
        self.slots[slot].push(vk::BufferCopy {
            src_offset: offset,
            dst_offset: offset,
            size,
        });
    }

    pub(crate) fn is_empty(&self, frame_index: u64) -> bool {
        self.slots[self.slot_index(frame_index)].is_empty()
    }

    /// Take the slot's pending copies, leaving it empty.
    pub(crate) fn take(&mut self, frame_index: u64) -> Vec<vk::BufferCopy> {
        let slot = self.slot_index(frame_index);
        std::mem::take(&mut self.slots[slot])
    }
}

/// One device-local buffer shadowed by N persistently mapped staging buffers.
pub struct DualBuffer {
    device_buffer: GpuBuffer,
    staging_buffers: Vec<GpuBuffer>,
    copies: CopyRing,
    capacity: u64,
    name: String,
}

impl DualBuffer {
    /// Create the device buffer and `staging_count` mapped staging buffers of
    /// identical capacity.
    ///
    /// `usage` applies to the device buffer; `TRANSFER_DST` is added
    /// implicitly, as `TRANSFER_SRC` is for the staging buffers.
    pub fn new(
        context: &GpuContext,
        size: u64,
        usage: vk::BufferUsageFlags,
        staging_count: usize,
        name: impl Into<String>,
    ) -> Result<Self> {
        if staging_count == 0 {
            return Err(GpuError::InvalidState(
                "dual buffer needs at least one staging slot".into(),
            ));
        }

        let name = name.into();
        let mut allocator = context.allocator().lock();

        let device_buffer = allocator.create_buffer(
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
            &name,
        )?;

        let mut staging_buffers = Vec::with_capacity(staging_count);
        for i in 0..staging_count {
            let staging_name = format!("staging for \"{name}\" #{i}");
            staging_buffers.push(allocator.create_buffer(
                size,
                vk::BufferUsageFlags::TRANSFER_SRC,
                MemoryLocation::CpuToGpu,
                &staging_name,
            )?);
        }

        Ok(Self {
            device_buffer,
            staging_buffers,
            copies: CopyRing::new(staging_count),
            capacity: size,
            name,
        })
    }

    /// Capacity of the device buffer in bytes.
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// The device-local buffer the GPU reads from.
    pub fn device_buffer(&self) -> &GpuBuffer {
        &self.device_buffer
    }

    /// Device address of the device-local buffer.
    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.device_buffer.device_address(device)
    }

    /// Whether the slot for `frame_index` has staged regions not yet copied.
    pub fn has_pending(&self, frame_index: u64) -> bool {
        !self.copies.is_empty(frame_index)
    }

    /// Copy `data` into the staging buffer for slot `frame_index mod N` at
    /// `dest_offset` bytes, and record the region for the next device copy.
    ///
    /// The region must lie within capacity; out-of-range writes are rejected.
    pub fn stage_section<T: Copy>(
        &mut self,
        frame_index: u64,
        data: &[T],
        dest_offset: u64,
    ) -> Result<()> {
        let size = std::mem::size_of_val(data) as u64;
        debug_assert!(
            dest_offset + size <= self.capacity,
            "staged region [{dest_offset}, {}) exceeds capacity {} of \"{}\"",
            dest_offset + size,
            self.capacity,
            self.name,
        );
        if size == 0 {
            return Ok(());
        }

        let slot = self.copies.slot_index(frame_index);
        self.staging_buffers[slot].write_range(dest_offset, data)?;
        self.copies.record(frame_index, dest_offset, size);
        Ok(())
    }

    /// Stage a region covering the entire device buffer.
    pub fn stage_full_buffer<T: Copy>(&mut self, frame_index: u64, data: &[T]) -> Result<()> {
        let size = std::mem::size_of_val(data) as u64;
        if size != self.capacity {
            return Err(GpuError::InvalidState(format!(
                "full-buffer stage of {size} bytes does not cover \"{}\" (capacity {})",
                self.name, self.capacity,
            )));
        }
        self.stage_section(frame_index, data, 0)
    }

    /// Record the barriers and copy commands that mirror the slot's staged
    /// regions into the device buffer. Emits nothing when the slot has no
    /// pending regions.
    ///
    /// # Safety
    /// `cmd` must be a command buffer in the recording state, and the copy
    /// must be ordered before any read of the device buffer in this frame.
    pub unsafe fn cmd_copy_to_device(
        &mut self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        frame_index: u64,
    ) {
        if self.copies.is_empty(frame_index) {
            // No staged changes this frame; skip the barrier and copy
            return;
        }

        let slot = self.copies.slot_index(frame_index);
        let source = self.staging_buffers[slot].buffer;
        let dest = self.device_buffer.buffer;
        let regions = self.copies.take(frame_index);

        // TRANSFER in the source mask also orders against a previous copy
        // that read this staging buffer.
        let staging_barrier = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::HOST | vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::HOST_WRITE)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_READ)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(source)
            .size(vk::WHOLE_SIZE);

        let device_barrier = vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::ALL_COMMANDS)
            .src_access_mask(vk::AccessFlags2::MEMORY_READ)
            .dst_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .dst_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(dest)
            .size(vk::WHOLE_SIZE);

        let barriers = [device_barrier, staging_barrier];
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
        unsafe {
            device.cmd_pipeline_barrier2(cmd, &dependency);
            device.cmd_copy_buffer(cmd, source, dest, &regions);
        }
    }

    /// Barrier transitioning the device buffer from transfer-write to the
    /// given read stage. Record it after [`Self::cmd_copy_to_device`] and
    /// before the consuming read in the same command stream.
    pub fn barrier_prepare_for_read(
        &self,
        dst_stage_mask: vk::PipelineStageFlags2,
        dst_access_mask: vk::AccessFlags2,
    ) -> vk::BufferMemoryBarrier2<'static> {
        vk::BufferMemoryBarrier2::default()
            .src_stage_mask(vk::PipelineStageFlags2::TRANSFER)
            .src_access_mask(vk::AccessFlags2::TRANSFER_WRITE)
            .dst_stage_mask(dst_stage_mask)
            .dst_access_mask(dst_access_mask)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.device_buffer.buffer)
            .size(vk::WHOLE_SIZE)
    }

    /// Record the read-transition barrier directly.
    ///
    /// # Safety
    /// `cmd` must be a command buffer in the recording state.
    pub unsafe fn cmd_prepare_for_read(
        &self,
        device: &ash::Device,
        cmd: vk::CommandBuffer,
        dst_stage_mask: vk::PipelineStageFlags2,
        dst_access_mask: vk::AccessFlags2,
    ) {
        let barrier = self.barrier_prepare_for_read(dst_stage_mask, dst_access_mask);
        let barriers = [barrier];
        let dependency = vk::DependencyInfo::default().buffer_memory_barriers(&barriers);
        unsafe { device.cmd_pipeline_barrier2(cmd, &dependency) };
    }

    /// Free all buffers, returning them to the allocator.
    pub fn destroy_with(&mut self, allocator: &mut GpuAllocator) -> Result<()> {
        if self.capacity == 0 {
            return Ok(());
        }
        allocator.free_buffer(&mut self.device_buffer)?;
        for staging in &mut self.staging_buffers {
            allocator.free_buffer(staging)?;
        }
        self.staging_buffers.clear();
        self.capacity = 0;
        Ok(())
    }

    /// Decompose into the owned buffers for deferred retirement.
    pub(crate) fn into_buffers(self) -> Vec<GpuBuffer> {
        let mut buffers = self.staging_buffers;
        buffers.push(self.device_buffer);
        buffers
    }
}

impl GpuResource for DualBuffer {
    fn exists(&self) -> bool {
        self.capacity != 0
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn destroy(&mut self, context: &GpuContext) -> Result<()> {
        self.destroy_with(&mut context.allocator().lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[should_panic(expected = "at least one slot")]
    fn zero_slots_are_rejected() {
        let _ = CopyRing::new(0);
    }

    #[test]
    fn slot_index_wraps_by_staging_count() {
        let ring = CopyRing::new(2);
        assert_eq!(ring.slot_index(0), 0);
        assert_eq!(ring.slot_index(1), 1);
        assert_eq!(ring.slot_index(2), 0);
        assert_eq!(ring.slot_index(7), 1);
    }

    #[test]
    fn record_tracks_region_at_matching_offsets() {
        let mut ring = CopyRing::new(2);
        ring.record(0, 8, 4);

        let copies = ring.take(0);
        assert_eq!(copies.len(), 1);
        assert_eq!(copies[0].src_offset, 8);
        assert_eq!(copies[0].dst_offset, 8);
        assert_eq!(copies[0].size, 4);
    }

    #[test]
    fn take_clears_slot() {
        let mut ring = CopyRing::new(2);
        ring.record(3, 0, 16);
        assert!(!ring.is_empty(3));

        let _ = ring.take(3);
        assert!(ring.is_empty(3));
        assert!(ring.take(3).is_empty());
    }

    #[test]
    fn slots_are_independent() {
        let mut ring = CopyRing::new(3);
        ring.record(0, 0, 4);
        ring.record(1, 4, 4);

        assert!(!ring.is_empty(0));
        assert!(!ring.is_empty(1));
        assert!(ring.is_empty(2));

        let _ = ring.take(0);
        assert!(ring.is_empty(0));
        assert!(!ring.is_empty(1));
    }

    #[test]
    fn regions_accumulate_within_a_slot() {
        let mut ring = CopyRing::new(2);
        ring.record(4, 0, 8);
        ring.record(4, 32, 16);
        ring.record(6, 64, 8); // same slot as frame 4

        let copies = ring.take(4);
        assert_eq!(copies.len(), 3);
        assert_eq!(copies[1].dst_offset, 32);
        assert_eq!(copies[2].dst_offset, 64);
    }
}
