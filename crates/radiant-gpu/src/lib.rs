//! Vulkan device layer for the Radiant raytracing engine.
//!
//! This crate provides:
//! - Vulkan instance and device management for raytracing-capable GPUs
//! - GPU capability detection (including acceleration structure properties)
//! - Memory allocation via gpu-allocator
//! - Command buffer management and one-shot submit helpers
//! - Frame synchronization and deferred resource deletion

pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod error;
pub mod instance;
pub mod memory;
pub mod resource;
pub mod sync;

pub use capabilities::{GpuCapabilities, GpuVendor, RayTracingCapabilities};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{DeferredDeletionQueue, RetiredResource};
pub use error::{GpuError, Result};
pub use memory::{GpuAllocator, GpuBuffer};
pub use resource::GpuResource;
pub use sync::{create_fence, create_semaphore, FrameSync, FrameSyncManager};
