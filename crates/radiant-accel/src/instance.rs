//! Top-level instances and their transform sources.

use std::sync::Arc;

use ash::vk;
use glam::Mat4;

use crate::blas::Blas;

/// Per-frame inputs handed to transform sources when animated instances are
/// refreshed.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameContext {
    pub frame_index: u64,
    pub time_seconds: f64,
}

/// Supplies an instance's world transform.
///
/// Sources reporting `is_static` are sampled once when the instance is
/// created; all others are pulled every frame during the lean update.
pub trait TransformSource: Send + Sync {
    fn sample(&self, frame: &FrameContext) -> Mat4;

    fn is_static(&self) -> bool {
        false
    }
}

/// Fixed transform, for instances that never move.
pub struct StaticTransform(pub Mat4);

impl TransformSource for StaticTransform {
    fn sample(&self, _frame: &FrameContext) -> Mat4 {
        self.0
    }

    fn is_static(&self) -> bool {
        true
    }
}

/// Convert a column-major matrix to the row-major 3x4 layout instance
/// descriptors use. The projective row is dropped.
pub fn translate_transform_matrix(matrix: &Mat4) -> vk::TransformMatrixKHR {
    let cols = matrix.to_cols_array_2d();
    let mut out = [0.0f32; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = cols[col][row];
        }
    }
    vk::TransformMatrixKHR { matrix: out }
}

/// One entry in the top-level structure: a reference to a bottom-level
/// structure plus the state needed to refresh its descriptor.
pub struct BlasInstance {
    id: u64,
    blas: Arc<Blas>,
    source: Option<Arc<dyn TransformSource>>,
    instance: vk::AccelerationStructureInstanceKHR,
}

impl BlasInstance {
    pub(crate) fn new_static(id: u64, blas: Arc<Blas>, transform: Mat4) -> Self {
        let instance = Self::assemble_descriptor(&blas, &transform);
        Self {
            id,
            blas,
            source: None,
            instance,
        }
    }

    pub(crate) fn new_animated(
        id: u64,
        blas: Arc<Blas>,
        source: Arc<dyn TransformSource>,
    ) -> Self {
        let transform = source.sample(&FrameContext::default());
        let instance = Self::assemble_descriptor(&blas, &transform);
        Self {
            id,
            blas,
            source: Some(source),
            instance,
        }
    }

    fn assemble_descriptor(
        blas: &Blas,
        transform: &Mat4,
    ) -> vk::AccelerationStructureInstanceKHR {
        vk::AccelerationStructureInstanceKHR {
            transform: translate_transform_matrix(transform),
            instance_custom_index_and_mask: vk::Packed24_8::new(0, 0xFF),
            instance_shader_binding_table_record_offset_and_flags: vk::Packed24_8::new(0, 0),
            acceleration_structure_reference: vk::AccelerationStructureReferenceKHR {
                device_handle: blas.device_address(),
            },
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn blas(&self) -> &Arc<Blas> {
        &self.blas
    }

    pub fn is_animated(&self) -> bool {
        self.source.is_some()
    }

    /// The raw descriptor as last assembled.
    pub fn descriptor(&self) -> &vk::AccelerationStructureInstanceKHR {
        &self.instance
    }

    /// Point hit shaders at this instance's slice of the geometry metadata.
    pub(crate) fn set_geometry_meta_offset(&mut self, offset: u32) {
        let mask = self.instance.instance_custom_index_and_mask.high_8();
        self.instance.instance_custom_index_and_mask = vk::Packed24_8::new(offset, mask);
    }

    /// Visibility mask matched against the ray mask at traversal.
    pub fn set_mask(&mut self, mask: u8) {
        let custom_index = self.instance.instance_custom_index_and_mask.low_24();
        self.instance.instance_custom_index_and_mask = vk::Packed24_8::new(custom_index, mask);
    }

    /// Offset applied when selecting the hit group for this instance.
    pub fn set_sbt_record_offset(&mut self, offset: u32) {
        let flags = self
            .instance
            .instance_shader_binding_table_record_offset_and_flags
            .high_8();
        self.instance.instance_shader_binding_table_record_offset_and_flags =
            vk::Packed24_8::new(offset, flags);
    }

    pub fn set_flags(&mut self, flags: vk::GeometryInstanceFlagsKHR) {
        let offset = self
            .instance
            .instance_shader_binding_table_record_offset_and_flags
            .low_24();
        self.instance.instance_shader_binding_table_record_offset_and_flags =
            vk::Packed24_8::new(offset, flags.as_raw() as u8);
    }

    /// Pull the current transform for an animated instance. Static instances
    /// keep the transform captured at creation.
    pub(crate) fn refresh(&mut self, frame: &FrameContext) {
        if let Some(source) = &self.source {
            self.instance.transform = translate_transform_matrix(&source.sample(frame));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::{Mesh, Primitive};
    use approx::assert_relative_eq;
    use glam::Vec3;

    fn stub_blas(address: u64) -> Arc<Blas> {
        Arc::new(Blas::stub(
            address,
            Arc::new(Mesh::new(
                "cube",
                vec![Primitive {
                    first: 0,
                    count: 36,
                    highest_referenced_index: 23,
                    material_index: 0,
                }],
            )),
        ))
    }

    #[test]
    fn translation_lands_in_fourth_column_of_each_row() {
        let matrix = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let out = translate_transform_matrix(&matrix).matrix;

        assert_relative_eq!(out[3], 1.0);
        assert_relative_eq!(out[7], 2.0);
        assert_relative_eq!(out[11], 3.0);
        // Rotational part stays identity.
        assert_relative_eq!(out[0], 1.0);
        assert_relative_eq!(out[5], 1.0);
        assert_relative_eq!(out[10], 1.0);
        assert_relative_eq!(out[1], 0.0);
    }

    #[test]
    fn transpose_maps_columns_to_rows() {
        let matrix = Mat4::from_cols_array_2d(&[
            [1.0, 5.0, 9.0, 0.0],
            [2.0, 6.0, 10.0, 0.0],
            [3.0, 7.0, 11.0, 0.0],
            [4.0, 8.0, 12.0, 1.0],
        ]);
        let out = translate_transform_matrix(&matrix).matrix;
        assert_eq!(out, [1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]);
    }

    #[test]
    fn new_instance_carries_full_mask_and_blas_address() {
        let instance = BlasInstance::new_static(1, stub_blas(0xABCD00), Mat4::IDENTITY);
        let descriptor = instance.descriptor();

        assert_eq!(descriptor.instance_custom_index_and_mask.high_8(), 0xFF);
        assert_eq!(descriptor.instance_custom_index_and_mask.low_24(), 0);
        unsafe {
            assert_eq!(descriptor.acceleration_structure_reference.device_handle, 0xABCD00);
        }
    }

    #[test]
    fn meta_offset_preserves_mask() {
        let mut instance = BlasInstance::new_static(1, stub_blas(0x1000), Mat4::IDENTITY);
        instance.set_mask(0x0F);
        instance.set_geometry_meta_offset(42);

        assert_eq!(instance.descriptor().instance_custom_index_and_mask.low_24(), 42);
        assert_eq!(instance.descriptor().instance_custom_index_and_mask.high_8(), 0x0F);
    }

    #[test]
    fn sbt_offset_and_flags_pack_independently() {
        let mut instance = BlasInstance::new_static(1, stub_blas(0x1000), Mat4::IDENTITY);
        instance.set_sbt_record_offset(7);
        instance.set_flags(vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE);

        let packed = instance
            .descriptor()
            .instance_shader_binding_table_record_offset_and_flags;
        assert_eq!(packed.low_24(), 7);
        assert_eq!(
            packed.high_8(),
            vk::GeometryInstanceFlagsKHR::TRIANGLE_FACING_CULL_DISABLE.as_raw() as u8
        );
    }

    #[test]
    fn animated_instance_samples_source_on_refresh() {
        struct Spin;
        impl TransformSource for Spin {
            fn sample(&self, frame: &FrameContext) -> Mat4 {
                Mat4::from_translation(Vec3::new(frame.time_seconds as f32, 0.0, 0.0))
            }
        }

        let mut instance = BlasInstance::new_animated(2, stub_blas(0x1000), Arc::new(Spin));
        assert!(instance.is_animated());
        assert_relative_eq!(instance.descriptor().transform.matrix[3], 0.0);

        instance.refresh(&FrameContext {
            frame_index: 10,
            time_seconds: 4.0,
        });
        assert_relative_eq!(instance.descriptor().transform.matrix[3], 4.0);
    }
}
