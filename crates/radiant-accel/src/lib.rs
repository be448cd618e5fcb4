//! Acceleration structure management for the Radiant raytracing engine.
//!
//! This crate provides:
//! - `DualBuffer`: N-buffered host-to-device staging keyed by frame-in-flight slot
//! - `Blas`: bottom-level acceleration structures built per mesh
//! - `Tlas`: the top-level structure over a table of BLAS instances, with a
//!   host-blocking full rebuild path and a GPU-only per-frame refit
//! - `GeometryMetaBuffer`: per-geometry metadata addressed from raytracing
//!   shaders via the instance custom index

pub mod blas;
pub mod dual_buffer;
pub mod geometry;
pub mod instance;
pub mod meta;
pub mod tlas;

pub use blas::{Blas, BlasBuildOptions};
pub use dual_buffer::DualBuffer;
pub use geometry::{GeometrySource, Mesh, Primitive};
pub use instance::{BlasInstance, FrameContext, StaticTransform, TransformSource};
pub use meta::{GeometryMeta, GeometryMetaBuffer};
pub use tlas::{InstanceTable, Tlas};
