//! The base recording context: per-frame command buffers and barrier
//! batching.

use std::rc::Rc;
use std::sync::Arc;

use crate::config::GpuConfig;
use crate::driver::{DriverCommandList, DriverDevice, SubresourceFootprint};
use crate::error::GpuError;
use crate::fence::QueueClass;
use crate::resource::{GpuResource, ResourceState};
use crate::views::{TransientViewHeap, ViewHeapManager};

/// States a resource may hold while recorded against a compute-class context.
const COMPUTE_STATES: [ResourceState; 4] = [
    ResourceState::UnorderedAccess,
    ResourceState::ShaderResource,
    ResourceState::CopyDest,
    ResourceState::CopySource,
];

/// Split borrow of a recording context's driver-facing pieces, so callers can
/// copy views and record commands in the same pass.
pub(crate) struct RecordSplit<'a> {
    pub device: &'a Arc<dyn DriverDevice>,
    pub frame_heap: &'a Rc<TransientViewHeap>,
    pub list: &'a mut dyn DriverCommandList,
}

/// Records a command sequence into a per-frame-slot buffer and batches
/// pending state-transition barriers into single driver calls.
///
/// One context is recorded by one CPU thread; there is no internal locking.
pub struct RecordingContext {
    device: Arc<dyn DriverDevice>,
    class: QueueClass,
    list: Box<dyn DriverCommandList>,
    pending_barriers: Vec<crate::resource::Barrier>,
    max_pending_barriers: usize,
    frame_heap: Option<Rc<TransientViewHeap>>,
    barrier_batches: u64,
}

impl RecordingContext {
    pub fn new(
        device: &Arc<dyn DriverDevice>,
        config: &GpuConfig,
        class: QueueClass,
    ) -> Result<Self, GpuError> {
        let list = device.create_command_list(class, config.frames_in_flight)?;
        Ok(Self {
            device: Arc::clone(device),
            class,
            list,
            pending_barriers: Vec::with_capacity(config.max_pending_barriers),
            max_pending_barriers: config.max_pending_barriers,
            frame_heap: None,
            barrier_batches: 0,
        })
    }

    pub fn class(&self) -> QueueClass {
        self.class
    }

    /// Recycles the slot's command buffer for new recording and rebinds the
    /// frame's transient view heap as the active shader-visible heap.
    ///
    /// The transient cursor itself is reset by the frame orchestrator, once
    /// per slot.
    pub fn reset(&mut self, frame_slot: usize, heaps: &ViewHeapManager) -> Result<(), GpuError> {
        self.pending_barriers.clear();
        self.list.reset(frame_slot)?;
        let heap = Rc::clone(heaps.frame_heap(frame_slot));
        if self.class != QueueClass::Copy {
            self.list.bind_view_heap(heap.id());
        }
        self.frame_heap = Some(heap);
        Ok(())
    }

    /// The transient heap bound by the last [`reset`](Self::reset).
    pub fn frame_heap(&self) -> Option<&Rc<TransientViewHeap>> {
        self.frame_heap.as_ref()
    }

    /// Queues the minimal barrier moving `resource` to `new_state`, flushing
    /// first when the pending queue is full.
    pub fn add_barrier(&mut self, resource: &GpuResource, new_state: ResourceState) {
        if self.pending_barriers.len() >= self.max_pending_barriers {
            self.flush_barriers();
        }

        if self.class == QueueClass::Compute {
            debug_assert!(
                COMPUTE_STATES.contains(&resource.usage_state()),
                "resource state {:?} is not valid on a compute context",
                resource.usage_state()
            );
            debug_assert!(
                COMPUTE_STATES.contains(&new_state),
                "target state {new_state:?} is not valid on a compute context"
            );
        }

        if let Some(barrier) = resource.request_transition(new_state) {
            self.pending_barriers.push(barrier);
        }
    }

    /// Emits all pending barriers as one batched command and clears the
    /// queue.
    pub fn flush_barriers(&mut self) {
        if self.pending_barriers.is_empty() {
            return;
        }
        self.list.record_barriers(&self.pending_barriers);
        self.pending_barriers.clear();
        self.barrier_batches += 1;
    }

    pub fn pending_barrier_count(&self) -> usize {
        self.pending_barriers.len()
    }

    pub fn barrier_batches(&self) -> u64 {
        self.barrier_batches
    }

    /// Whole-resource copy. Callers transition both resources to the copy
    /// states first.
    pub fn copy_resource(&mut self, src: &GpuResource, dst: &GpuResource) {
        self.list.copy_resource(src.id(), dst.id());
    }

    pub fn copy_buffer_region(
        &mut self,
        src: &GpuResource,
        src_offset: u64,
        dst: &GpuResource,
        dst_offset: u64,
        byte_count: u64,
    ) {
        self.list
            .copy_buffer_region(src.id(), src_offset, dst.id(), dst_offset, byte_count);
    }

    pub fn copy_texture_region(
        &mut self,
        src: &GpuResource,
        src_offset: u64,
        subresources: &[SubresourceFootprint],
        dst: &GpuResource,
    ) {
        self.list
            .copy_texture_region(src.id(), src_offset, dst.id(), subresources);
    }

    /// The underlying driver command list, for submission through a
    /// [`CommandQueue`](crate::queue::CommandQueue).
    pub fn driver_list_mut(&mut self) -> &mut dyn DriverCommandList {
        self.list.as_mut()
    }

    pub(crate) fn split_mut(&mut self) -> RecordSplit<'_> {
        let frame_heap = self
            .frame_heap
            .as_ref()
            .expect("recording context has not been reset for a frame");
        RecordSplit {
            device: &self.device,
            frame_heap,
            list: self.list.as_mut(),
        }
    }
}
