//! Deferred resource deletion for multi-frame-in-flight rendering.
//!
//! When a top-level structure is rebuilt, its previous instance buffer,
//! backing buffer, or acceleration structure handle may still be read by an
//! in-flight frame. This module provides a queue to defer those deletions
//! until the resource is guaranteed to no longer be in use.

use crate::context::GpuContext;
use crate::error::Result;
use crate::memory::GpuBuffer;
use std::collections::VecDeque;

/// A retired GPU resource awaiting deletion.
pub enum RetiredResource {
    /// A buffer to return to the allocator.
    Buffer(GpuBuffer),
    /// An acceleration structure handle to destroy.
    AccelerationStructure(ash::vk::AccelerationStructureKHR),
}

struct PendingDeletion {
    resource: RetiredResource,
    frame_queued: u64,
}

/// Queue for deferred resource deletions.
///
/// Resources are queued with a frame number and only freed once enough frames
/// have passed to guarantee they are no longer in use by any in-flight frame.
pub struct DeferredDeletionQueue {
    pending: VecDeque<PendingDeletion>,
    frames_in_flight: usize,
}

impl DeferredDeletionQueue {
    /// Create a new deferred deletion queue.
    ///
    /// # Arguments
    /// * `frames_in_flight` - Number of frames that can be in flight
    ///   simultaneously. Resources are kept for this many frames before being
    ///   freed.
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight,
        }
    }

    /// Queue a buffer for deferred deletion.
    pub fn queue_buffer(&mut self, buffer: GpuBuffer, frame_number: u64) {
        self.pending.push_back(PendingDeletion {
            resource: RetiredResource::Buffer(buffer),
            frame_queued: frame_number,
        });
    }

    /// Queue an acceleration structure handle for deferred deletion.
    pub fn queue_accel_struct(
        &mut self,
        accel: ash::vk::AccelerationStructureKHR,
        frame_number: u64,
    ) {
        self.pending.push_back(PendingDeletion {
            resource: RetiredResource::AccelerationStructure(accel),
            frame_queued: frame_number,
        });
    }

    /// Remove and return the resources whose retirement window has elapsed.
    fn drain_mature(&mut self, current_frame_number: u64) -> Vec<RetiredResource> {
        let cutoff = current_frame_number.saturating_sub(self.frames_in_flight as u64);

        let mut mature = Vec::new();
        // Queue order is FIFO and frame numbers are non-decreasing, so only
        // the front can mature.
        while matches!(self.pending.front(), Some(p) if p.frame_queued < cutoff) {
            let pending = self.pending.pop_front().expect("front just matched");
            mature.push(pending.resource);
        }
        mature
    }

    /// Process the queue and free resources that are safe to delete.
    ///
    /// Call this once per frame, before recording new work.
    pub fn process(&mut self, context: &GpuContext, current_frame_number: u64) -> Result<()> {
        for resource in self.drain_mature(current_frame_number) {
            free_resource(context, resource)?;
        }
        Ok(())
    }

    /// Flush all pending deletions immediately.
    ///
    /// Call this during shutdown after `device_wait_idle()` to ensure
    /// all resources are freed.
    pub fn flush(&mut self, context: &GpuContext) -> Result<()> {
        while let Some(pending) = self.pending.pop_front() {
            free_resource(context, pending.resource)?;
        }
        Ok(())
    }

    /// Get the number of pending deletions.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn free_resource(context: &GpuContext, resource: RetiredResource) -> Result<()> {
    match resource {
        RetiredResource::Buffer(mut buffer) => {
            context.allocator().lock().free_buffer(&mut buffer)?;
        }
        RetiredResource::AccelerationStructure(accel) => unsafe {
            context.accel_loader().destroy_acceleration_structure(accel, None);
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk;

    fn stamp(queue: &mut DeferredDeletionQueue, frame: u64) {
        queue.queue_accel_struct(vk::AccelerationStructureKHR::null(), frame);
    }

    #[test]
    fn nothing_matures_within_flight_window() {
        let mut queue = DeferredDeletionQueue::new(2);
        stamp(&mut queue, 10);
        stamp(&mut queue, 11);

        assert!(queue.drain_mature(11).is_empty());
        assert!(queue.drain_mature(12).is_empty());
        assert_eq!(queue.pending_count(), 2);
    }

    #[test]
    fn matures_in_fifo_order_after_window() {
        let mut queue = DeferredDeletionQueue::new(2);
        stamp(&mut queue, 10);
        stamp(&mut queue, 11);
        stamp(&mut queue, 12);

        // Frame 13: cutoff is 11, only the frame-10 entry matures
        assert_eq!(queue.drain_mature(13).len(), 1);
        assert_eq!(queue.pending_count(), 2);

        // Frame 15: cutoff is 13, the rest mature
        assert_eq!(queue.drain_mature(15).len(), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn saturates_at_frame_zero() {
        let mut queue = DeferredDeletionQueue::new(3);
        stamp(&mut queue, 0);
        assert!(queue.drain_mature(0).is_empty());
        assert!(queue.drain_mature(2).is_empty());
    }
}
