//! Init-time sizing for frames in flight, view heaps and staging memory.

use crate::error::GpuError;

/// Per-category capacities of the persistent view heaps.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ViewHeapCapacities {
    pub shader_resource: u32,
    pub constant_buffer: u32,
    pub unordered_access: u32,
    pub sampler: u32,
    pub render_target: u32,
    pub depth_stencil: u32,
}

impl Default for ViewHeapCapacities {
    fn default() -> Self {
        Self {
            shader_resource: 4096,
            constant_buffer: 2048,
            unordered_access: 512,
            sampler: 256,
            render_target: 256,
            depth_stencil: 64,
        }
    }
}

/// Sizing knobs fixed at device init.
///
/// All capacities are hard limits: exhausting a heap or the barrier queue at
/// runtime indicates a mis-sized configuration, not a recoverable condition.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuConfig {
    /// Number of frames that may be in flight on the GPU at once.
    pub frames_in_flight: usize,
    pub persistent_views: ViewHeapCapacities,
    /// Capacity of each per-frame shader-visible transient heap, in slots.
    pub transient_views: u32,
    /// Byte size of the persistent staging buffer for generic data.
    pub generic_staging_bytes: u64,
    /// Byte size of the persistent staging buffer for texture data.
    pub texture_staging_bytes: u64,
    /// Alignment applied to texture payload offsets in the staging buffer.
    pub texture_placement_alignment: u64,
    /// Pending state-transition barriers per recording context before a
    /// flush is forced.
    pub max_pending_barriers: usize,
}

impl Default for GpuConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: 2,
            persistent_views: ViewHeapCapacities::default(),
            transient_views: 4096,
            generic_staging_bytes: 10 * 1024 * 1024,
            texture_staging_bytes: 40 * 1024 * 1024,
            texture_placement_alignment: 512,
            max_pending_barriers: 16,
        }
    }
}

impl GpuConfig {
    pub fn validate(&self) -> Result<(), GpuError> {
        if self.frames_in_flight == 0 {
            return Err(GpuError::InvalidConfig("frames_in_flight must be > 0"));
        }
        if self.transient_views == 0 {
            return Err(GpuError::InvalidConfig("transient_views must be > 0"));
        }
        if self.generic_staging_bytes == 0 || self.texture_staging_bytes == 0 {
            return Err(GpuError::InvalidConfig("staging buffers must be non-empty"));
        }
        if !self.texture_placement_alignment.is_power_of_two() {
            return Err(GpuError::InvalidConfig(
                "texture_placement_alignment must be a power of two",
            ));
        }
        if self.max_pending_barriers == 0 {
            return Err(GpuError::InvalidConfig("max_pending_barriers must be > 0"));
        }
        Ok(())
    }
}
