//! The upstream driver binding layer this core sits on.
//!
//! Everything the submission core needs from an explicit GPU API is expressed
//! as the object-safe traits in this module: queue creation and submission,
//! fence signal/poll/wait, view-heap creation and view copies, and command
//! recording. A production binding implements these over the native driver;
//! [`software`] implements them entirely on the CPU for tests and headless
//! builds.

pub mod software;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use crate::error::GpuError;
use crate::fence::QueueClass;
use crate::resource::Barrier;

/// CPU-side address of a view slot in a view heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CpuViewAddress(pub u64);

/// GPU-side address of a view slot; only shader-visible heaps have one.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GpuViewAddress(pub u64);

/// Driver identity of a view heap.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HeapId(pub u32);

/// Driver identity of a GPU memory allocation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AllocationId(pub u32);

/// Driver identity of a compiled pipeline-state object.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct PipelineId(pub u32);

/// View categories a heap can hold.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ViewCategory {
    ShaderResource,
    ConstantBuffer,
    UnorderedAccess,
    Sampler,
    RenderTarget,
    DepthStencil,
}

#[derive(Clone, Copy, Debug)]
pub struct ViewHeapDesc {
    pub label: Option<&'static str>,
    pub category: ViewCategory,
    pub capacity: u32,
    pub shader_visible: bool,
}

/// Addresses and layout of a created view heap.
#[derive(Clone, Copy, Debug)]
pub struct DriverViewHeap {
    pub id: HeapId,
    pub cpu_base: CpuViewAddress,
    pub gpu_base: Option<GpuViewAddress>,
    /// Byte stride between consecutive view slots.
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryKind {
    /// CPU-mapped, GPU-readable staging memory.
    Upload,
    /// GPU-optimal memory; written only through copy commands.
    DeviceLocal,
}

#[derive(Clone, Copy, Debug)]
pub struct BufferDesc {
    pub label: Option<&'static str>,
    pub byte_size: u64,
    pub kind: MemoryKind,
}

/// Placement of one texture subresource inside a staging buffer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SubresourceFootprint {
    /// Byte offset relative to the start of the staged payload.
    pub offset: u64,
    pub row_pitch: u32,
    pub row_count: u32,
    pub depth: u32,
}

impl SubresourceFootprint {
    pub fn byte_size(&self) -> u64 {
        self.row_pitch as u64 * self.row_count as u64 * self.depth.max(1) as u64
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub min_depth: f32,
    pub max_depth: f32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScissorRect {
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IndexFormat {
    Uint16,
    Uint32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VertexBufferView {
    pub buffer: AllocationId,
    pub byte_size: u32,
    pub stride: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexBufferView {
    pub buffer: AllocationId,
    pub byte_size: u32,
    pub format: IndexFormat,
}

/// Factory surface of the driver binding.
///
/// Creation failures are fatal at device init by convention; this layer
/// reports them and the caller decides whether the device is usable.
pub trait DriverDevice: fmt::Debug + Send + Sync {
    fn create_queue(&self, class: QueueClass) -> Result<Box<dyn DriverQueue>, GpuError>;
    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn DriverFence>, GpuError>;
    fn create_view_heap(&self, desc: &ViewHeapDesc) -> Result<DriverViewHeap, GpuError>;
    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn DriverAllocation>, GpuError>;
    /// Creates a command list in the closed state with one command allocator
    /// per frame in flight.
    fn create_command_list(
        &self,
        class: QueueClass,
        frames_in_flight: usize,
    ) -> Result<Box<dyn DriverCommandList>, GpuError>;
    /// Points the view slot at `dst` to `resource`.
    fn write_view(&self, category: ViewCategory, dst: CpuViewAddress, resource: AllocationId);
    /// Copies the view at `src` into the slot at `dst`.
    fn copy_view(&self, category: ViewCategory, dst: CpuViewAddress, src: CpuViewAddress);
    /// Writes a null/placeholder view into the slot at `dst`.
    fn write_null_view(&self, category: ViewCategory, dst: CpuViewAddress);
}

/// A fence primitive with a monotonically increasing completed value.
pub trait DriverFence: fmt::Debug + Send + Sync {
    /// Latest value the driver reports as completed.
    fn completed_value(&self) -> u64;
    /// CPU-side signal, raising the completed value to at least `value`.
    fn signal(&self, value: u64);
    /// Blocks the calling thread on the fence's OS wait primitive until the
    /// completed value reaches `value`.
    fn wait_until(&self, value: u64);
}

/// One hardware command queue.
pub trait DriverQueue: fmt::Debug + Send + Sync {
    /// Enqueues a GPU-side signal of `fence` to `value` after previously
    /// submitted work.
    fn signal(&self, fence: &Arc<dyn DriverFence>, value: u64) -> Result<(), GpuError>;
    /// Enqueues a GPU-side wait; the queue stalls until `fence` reaches
    /// `value`. Never blocks the CPU.
    fn wait_gpu(&self, fence: &Arc<dyn DriverFence>, value: u64) -> Result<(), GpuError>;
    /// Submits a closed command list for execution.
    fn execute(&self, list: &mut dyn DriverCommandList) -> Result<(), GpuError>;
}

/// A GPU memory allocation handle.
pub trait DriverAllocation: fmt::Debug + Send + Sync {
    fn id(&self) -> AllocationId;
    fn byte_size(&self) -> u64;
    fn gpu_address(&self) -> u64;
    /// Writes into a CPU-mapped (upload) allocation.
    fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), GpuError>;
}

/// A recordable command buffer with per-frame-slot backing storage.
pub trait DriverCommandList: fmt::Debug {
    fn class(&self) -> QueueClass;
    /// Recycles the given frame slot's allocator and opens the list for
    /// recording.
    fn reset(&mut self, frame_slot: usize) -> Result<(), GpuError>;
    /// Closes the list for submission. Fails when the list is not recording;
    /// this failure is recoverable (log and skip the submission).
    fn close(&mut self) -> Result<(), GpuError>;

    fn record_barriers(&mut self, barriers: &[Barrier]);
    fn bind_view_heap(&mut self, heap: HeapId);

    fn copy_resource(&mut self, src: AllocationId, dst: AllocationId);
    fn copy_buffer_region(
        &mut self,
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        dst_offset: u64,
        byte_count: u64,
    );
    fn copy_texture_region(
        &mut self,
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        subresources: &[SubresourceFootprint],
    );

    fn set_pipeline(&mut self, pipeline: PipelineId);
    fn set_root_table(&mut self, root_parameter: u32, table: GpuViewAddress);
    fn set_render_targets(&mut self, colors: &[CpuViewAddress], depth: Option<CpuViewAddress>);
    fn clear_render_target(&mut self, target: CpuViewAddress, color: [f32; 4]);
    fn clear_depth_stencil(&mut self, target: CpuViewAddress, depth: f32, stencil: u8);
    fn set_viewport(&mut self, viewport: Viewport);
    fn set_scissor(&mut self, rect: Option<ScissorRect>);
    fn set_primitive_topology(&mut self, topology: PrimitiveTopology);
    fn set_vertex_buffer(&mut self, slot: u32, view: VertexBufferView);
    fn set_index_buffer(&mut self, view: IndexBufferView);
    fn set_blend_factor(&mut self, factor: [f32; 4]);
    fn set_stencil_reference(&mut self, reference: u32);

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    );
    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    );
    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32);

    /// Backend downcast hook; lets a driver implementation recover its
    /// concrete list type from the trait object at submission time.
    fn as_any_mut(&mut self) -> &mut dyn Any;
}
