//! Uniform lifecycle contract for GPU-resident objects.

use crate::context::GpuContext;
use crate::error::Result;

/// Lifecycle contract shared by device-resident objects (acceleration
/// structures, staged buffers, metadata tables).
///
/// Resources are created through their own constructors and released
/// explicitly through [`GpuResource::destroy`] before the owning
/// [`GpuContext`] is torn down. `destroy` must be idempotent: calling it
/// on an already-released resource is a no-op.
pub trait GpuResource {
    /// Whether the underlying device object currently exists.
    fn exists(&self) -> bool;

    /// Debug name of this resource.
    fn name(&self) -> &str;

    /// Release all device objects owned by this resource.
    fn destroy(&mut self, context: &GpuContext) -> Result<()>;
}
