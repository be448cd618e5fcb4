//! GPU capability detection.

use ash::vk;
use std::collections::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Raytracing capabilities and acceleration structure limits.
#[derive(Debug, Clone, Default)]
pub struct RayTracingCapabilities {
    /// `VK_KHR_acceleration_structure` feature available
    pub supports_acceleration_structure: bool,
    /// `VK_KHR_ray_tracing_pipeline` feature available
    pub supports_ray_tracing_pipeline: bool,
    /// Minimum alignment for acceleration structure scratch buffer addresses
    pub min_scratch_alignment: u32,
    /// Maximum number of instances in a top-level structure
    pub max_instance_count: u64,
    /// Maximum number of geometries in a bottom-level structure
    pub max_geometry_count: u64,
    /// Maximum number of triangles across all geometries of one structure
    pub max_primitive_count: u64,
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,
    /// Driver version
    pub driver_version: u32,

    /// Buffer device address support (required for build inputs)
    pub supports_buffer_device_address: bool,
    /// Synchronization2 support (VK 1.3 core)
    pub supports_synchronization2: bool,

    /// Raytracing feature set and limits
    pub ray_tracing: RayTracingCapabilities,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,

    /// Available device extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        // Get available extensions
        let extensions = unsafe { instance.enumerate_device_extension_properties(physical_device) }
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) }
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        // Acceleration structure limits come in through the properties2 chain
        let mut accel_properties =
            vk::PhysicalDeviceAccelerationStructurePropertiesKHR::default();
        let mut properties2 =
            vk::PhysicalDeviceProperties2::default().push_next(&mut accel_properties);
        unsafe { instance.get_physical_device_properties2(physical_device, &mut properties2) };
        let properties = properties2.properties;

        // Feature bits likewise
        let mut accel_features = vk::PhysicalDeviceAccelerationStructureFeaturesKHR::default();
        let mut rt_pipeline_features =
            vk::PhysicalDeviceRayTracingPipelineFeaturesKHR::default();
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default();
        let mut features2 = vk::PhysicalDeviceFeatures2::default()
            .push_next(&mut accel_features)
            .push_next(&mut rt_pipeline_features)
            .push_next(&mut vulkan_1_2_features)
            .push_next(&mut vulkan_1_3_features);
        unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };

        // Parse device info
        let vendor = GpuVendor::from_vendor_id(properties.vendor_id);
        let device_name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        // Calculate device-local memory
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let ray_tracing = RayTracingCapabilities {
            supports_acceleration_structure: accel_features.acceleration_structure == vk::TRUE
                && available_extensions
                    .contains(ash::khr::acceleration_structure::NAME.to_str().unwrap()),
            supports_ray_tracing_pipeline: rt_pipeline_features.ray_tracing_pipeline == vk::TRUE
                && available_extensions
                    .contains(ash::khr::ray_tracing_pipeline::NAME.to_str().unwrap()),
            min_scratch_alignment: accel_properties
                .min_acceleration_structure_scratch_offset_alignment,
            max_instance_count: accel_properties.max_instance_count,
            max_geometry_count: accel_properties.max_geometry_count,
            max_primitive_count: accel_properties.max_primitive_count,
        };

        Self {
            vendor,
            device_name,
            api_version: properties.api_version,
            driver_version: properties.driver_version,
            supports_buffer_device_address: vulkan_1_2_features.buffer_device_address
                == vk::TRUE,
            supports_synchronization2: vulkan_1_3_features.synchronization2 == vk::TRUE,
            ray_tracing,
            device_local_memory_mb,
            available_extensions,
        }
    }

    /// Check that the device satisfies the engine's hard requirements.
    pub fn meets_requirements(&self) -> bool {
        let has_vulkan_1_3 = vk::api_version_major(self.api_version) >= 1
            && vk::api_version_minor(self.api_version) >= 3;

        has_vulkan_1_3
            && self.supports_buffer_device_address
            && self.supports_synchronization2
            && self.ray_tracing.supports_acceleration_structure
    }

    /// One-line human readable summary for logging.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}), {} MB local, AS={}, RT pipeline={}, scratch align {}",
            self.device_name,
            self.vendor,
            self.device_local_memory_mb,
            self.ray_tracing.supports_acceleration_structure,
            self.ray_tracing.supports_ray_tracing_pipeline,
            self.ray_tracing.min_scratch_alignment,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vendor_from_pci_id() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
        assert_eq!(GpuVendor::from_vendor_id(0x1234), GpuVendor::Other(0x1234));
    }

    #[test]
    fn requirements_reject_missing_acceleration_structure() {
        let caps = GpuCapabilities {
            vendor: GpuVendor::Nvidia,
            device_name: "test".into(),
            api_version: vk::make_api_version(0, 1, 3, 0),
            driver_version: 0,
            supports_buffer_device_address: true,
            supports_synchronization2: true,
            ray_tracing: RayTracingCapabilities::default(),
            device_local_memory_mb: 8192,
            available_extensions: Default::default(),
        };
        assert!(!caps.meets_requirements());

        let mut caps = caps;
        caps.ray_tracing.supports_acceleration_structure = true;
        assert!(caps.meets_requirements());
    }
}
