//! Frame pacing and submission ordering.

use std::rc::Rc;
use std::sync::Arc;

use crate::device::DeviceContext;
use crate::error::GpuError;
use crate::fence::FenceValue;
use crate::graphics::GraphicsContext;
use crate::queue::QueueManager;
use crate::resource::{GpuResource, ResourceState};
use crate::upload::UploadContext;
use crate::views::ViewHeapManager;

/// A surface this core hands to presentation at the end of a frame.
pub trait Presentable {
    fn backing_resource(&self) -> &Arc<GpuResource>;
    /// Presentation failure signals device loss.
    fn present(&mut self) -> Result<(), GpuError>;
}

#[derive(Clone, Copy, Debug, Default)]
struct FrameEndFences {
    graphics: FenceValue,
    compute: FenceValue,
    copy: FenceValue,
}

/// Paces N frames in flight and submits each frame's recorded work in
/// dependency order.
///
/// A frame slot's buffers are only reused once the fence values recorded for
/// that slot N frames ago are confirmed complete; the once-per-frame wait in
/// [`mark_frame_start`](Self::mark_frame_start) is the only implicit CPU
/// block in the crate.
pub struct FrameOrchestrator {
    queues: Arc<QueueManager>,
    heaps: Rc<ViewHeapManager>,
    upload: UploadContext,
    graphics: GraphicsContext,
    frame_end_fences: Vec<FrameEndFences>,
    frames_in_flight: usize,
    frame_index: u64,
    frame_slot: usize,
}

impl FrameOrchestrator {
    pub fn new(context: &DeviceContext) -> Result<Self, GpuError> {
        let config = context.config();
        Ok(Self {
            queues: Arc::clone(context.queues()),
            heaps: Rc::clone(context.heaps()),
            upload: UploadContext::new(context.driver(), config)?,
            graphics: GraphicsContext::new(context.driver(), config)?,
            frame_end_fences: vec![FrameEndFences::default(); config.frames_in_flight],
            frames_in_flight: config.frames_in_flight,
            frame_index: u64::MAX,
            frame_slot: 0,
        })
    }

    /// Monotonic frame counter; wraps from the "no frame yet" sentinel to 0
    /// on the first [`mark_frame_start`](Self::mark_frame_start).
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    pub fn frame_slot(&self) -> usize {
        self.frame_slot
    }

    pub fn upload(&self) -> &UploadContext {
        &self.upload
    }

    pub fn upload_mut(&mut self) -> &mut UploadContext {
        &mut self.upload
    }

    pub fn graphics(&self) -> &GraphicsContext {
        &self.graphics
    }

    pub fn graphics_mut(&mut self) -> &mut GraphicsContext {
        &mut self.graphics
    }

    /// Advances to the next frame slot, blocks until the slot's previous
    /// work has left the GPU, then recycles its buffers and transient heap.
    pub fn mark_frame_start(&mut self) -> Result<(), GpuError> {
        self.frame_index = self.frame_index.wrapping_add(1);
        self.frame_slot = (self.frame_index % self.frames_in_flight as u64) as usize;

        let fences = self.frame_end_fences[self.frame_slot];
        self.queues.compute().block_until(fences.compute);
        self.queues.copy().block_until(fences.copy);
        self.queues.graphics().block_until(fences.graphics);

        // The only cursor reset for this slot this frame.
        self.heaps.frame_heap(self.frame_slot).reset();

        self.upload.resolve_uploads();
        self.upload.reset(self.frame_slot, &self.heaps)?;
        self.graphics.reset(self.frame_slot, &self.heaps)?;
        Ok(())
    }

    /// Submits the frame's recorded work in dependency order (copy before
    /// graphics) and hands drawn surfaces to presentation.
    pub fn mark_frame_end(
        &mut self,
        presentables: &mut [&mut dyn Presentable],
    ) -> Result<(), GpuError> {
        self.upload.process_uploads();
        let copy_fence = Self::submit(self.queues.copy(), self.upload.recording_mut())?;
        self.frame_end_fences[self.frame_slot].copy = copy_fence;

        // The graphics queue may only read upload destinations once the copy
        // work has finished.
        if !copy_fence.is_null() {
            self.queues.graphics().wait_gpu(self.queues.copy(), copy_fence)?;
        }

        let mut presented = Vec::new();
        for (index, presentable) in presentables.iter().enumerate() {
            let resource = presentable.backing_resource();
            if resource.usage_state() == ResourceState::Present {
                // Not drawn to this frame.
                continue;
            }
            self.graphics.add_barrier(resource, ResourceState::Present);
            presented.push(index);
        }
        self.graphics.flush_barriers();

        let graphics_fence =
            Self::submit(self.queues.graphics(), self.graphics.recording_mut())?;
        self.frame_end_fences[self.frame_slot].graphics = graphics_fence;

        for index in presented {
            if let Err(err) = presentables[index].present() {
                log::error!("presentation failed, treating the device as lost: {err}");
                return Err(GpuError::DeviceLost);
            }
        }
        Ok(())
    }

    fn submit(
        queue: &crate::queue::CommandQueue,
        recording: &mut crate::record::RecordingContext,
    ) -> Result<FenceValue, GpuError> {
        match queue.execute_command_list(recording.driver_list_mut()) {
            Ok(fence) => Ok(fence),
            // A failed close is recoverable: the slot keeps a null fence so
            // its next reuse does not wait on work that never ran.
            Err(GpuError::CommandListClose(err)) => {
                log::error!(
                    "skipping {} submission after close failure: {err}",
                    queue.class().name()
                );
                Ok(FenceValue::NULL)
            }
            Err(err) => Err(err),
        }
    }

    /// Lets async-compute submitters participate in the slot fencing
    /// discipline.
    pub fn record_compute_fence(&mut self, value: FenceValue) {
        self.frame_end_fences[self.frame_slot].compute = value;
    }

    /// Blocks until every queue is idle. Forfeits all overlap; only for
    /// destructive operations such as a surface resize.
    pub fn wait_for_all_idle(&self) {
        self.queues.wait_for_all_idle();
    }
}
