//! CPU-only implementation of the driver binding layer.
//!
//! Submitted command lists are retained as inspectable command logs and copy
//! commands are applied to plain byte buffers, so the submission core can be
//! exercised end to end without a GPU. Fence completion either tracks
//! submission immediately ([`CompletionMode::Immediate`]) or waits for the
//! test to drive it ([`CompletionMode::Manual`]).

use std::any::Any;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};

use crate::error::GpuError;
use crate::fence::QueueClass;
use crate::resource::Barrier;

use super::{
    AllocationId, BufferDesc, CpuViewAddress, DriverAllocation, DriverCommandList, DriverDevice,
    DriverFence, DriverQueue, DriverViewHeap, GpuViewAddress, HeapId, IndexBufferView, MemoryKind,
    PipelineId, PrimitiveTopology, ScissorRect, SubresourceFootprint, VertexBufferView, ViewCategory,
    ViewHeapDesc, Viewport,
};

/// How the software device completes fence signals.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Queue signals complete the fence as soon as they are issued.
    Immediate,
    /// Queue signals stay pending until released through
    /// [`SoftwareDevice::complete_next_signal`] /
    /// [`SoftwareDevice::complete_all_signals`].
    Manual,
}

/// Contents of a view slot, as observed by tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SoftwareView {
    Null,
    Resource(AllocationId),
    Copied(CpuViewAddress),
}

/// Everything a single `execute` call recorded.
#[derive(Clone, Debug, PartialEq)]
pub struct SoftwareSubmission {
    pub commands: Vec<SoftwareCommand>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SoftwareCommand {
    Barriers(Vec<Barrier>),
    BindViewHeap(HeapId),
    CopyResource {
        src: AllocationId,
        dst: AllocationId,
    },
    CopyBufferRegion {
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        dst_offset: u64,
        byte_count: u64,
    },
    CopyTextureRegion {
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        subresources: Vec<SubresourceFootprint>,
    },
    SetPipeline(PipelineId),
    SetRootTable {
        root_parameter: u32,
        table: GpuViewAddress,
    },
    SetRenderTargets {
        colors: Vec<CpuViewAddress>,
        depth: Option<CpuViewAddress>,
    },
    ClearRenderTarget {
        target: CpuViewAddress,
        color: [f32; 4],
    },
    ClearDepthStencil {
        target: CpuViewAddress,
        depth: f32,
        stencil: u8,
    },
    SetViewport(Viewport),
    SetScissor(Option<ScissorRect>),
    SetPrimitiveTopology(PrimitiveTopology),
    SetVertexBuffer {
        slot: u32,
        view: VertexBufferView,
    },
    SetIndexBuffer(IndexBufferView),
    SetBlendFactor([f32; 4]),
    SetStencilReference(u32),
    DrawInstanced {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexedInstanced {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    Dispatch {
        groups_x: u32,
        groups_y: u32,
        groups_z: u32,
    },
}

#[derive(Debug, Default)]
struct QueueState {
    executed: Vec<SoftwareSubmission>,
    pending_signals: VecDeque<(Arc<dyn DriverFence>, u64)>,
    gpu_waits: Vec<u64>,
}

#[derive(Debug, Default)]
struct DeviceState {
    next_allocation: u32,
    next_heap: u32,
    allocations: HashMap<u32, Arc<SoftwareAllocation>>,
    views: HashMap<u64, SoftwareView>,
    queues: HashMap<u8, QueueState>,
}

impl DeviceState {
    fn queue_mut(&mut self, class: QueueClass) -> &mut QueueState {
        self.queues.entry(class.tag()).or_default()
    }
}

/// The software device. Clones of the same device share all state.
#[derive(Debug)]
pub struct SoftwareDevice {
    mode: CompletionMode,
    state: Arc<Mutex<DeviceState>>,
}

const VIEW_STRIDE: u32 = 32;

impl SoftwareDevice {
    pub fn new(mode: CompletionMode) -> Arc<SoftwareDevice> {
        Arc::new(SoftwareDevice {
            mode,
            state: Arc::new(Mutex::new(DeviceState::default())),
        })
    }

    pub fn completion_mode(&self) -> CompletionMode {
        self.mode
    }

    /// Submissions executed so far on the queue of `class`.
    pub fn executed(&self, class: QueueClass) -> Vec<SoftwareSubmission> {
        let mut state = self.state.lock().unwrap();
        state.queue_mut(class).executed.clone()
    }

    pub fn executed_count(&self, class: QueueClass) -> usize {
        let mut state = self.state.lock().unwrap();
        state.queue_mut(class).executed.len()
    }

    /// GPU-side waits recorded on the queue of `class` (fence values only).
    pub fn gpu_waits(&self, class: QueueClass) -> Vec<u64> {
        let mut state = self.state.lock().unwrap();
        state.queue_mut(class).gpu_waits.clone()
    }

    pub fn pending_signal_count(&self, class: QueueClass) -> usize {
        let mut state = self.state.lock().unwrap();
        state.queue_mut(class).pending_signals.len()
    }

    /// Completes the oldest pending signal on the queue of `class`. Returns
    /// false when nothing was pending.
    pub fn complete_next_signal(&self, class: QueueClass) -> bool {
        let pending = {
            let mut state = self.state.lock().unwrap();
            state.queue_mut(class).pending_signals.pop_front()
        };
        match pending {
            Some((fence, value)) => {
                fence.signal(value);
                true
            }
            None => false,
        }
    }

    pub fn complete_all_signals(&self, class: QueueClass) {
        while self.complete_next_signal(class) {}
    }

    /// Contents of the view slot at `addr`, if any view was ever written
    /// there.
    pub fn view(&self, addr: CpuViewAddress) -> Option<SoftwareView> {
        self.state.lock().unwrap().views.get(&addr.0).copied()
    }

    /// Snapshot of an allocation's bytes.
    pub fn allocation_bytes(&self, id: AllocationId) -> Option<Vec<u8>> {
        let state = self.state.lock().unwrap();
        state
            .allocations
            .get(&id.0)
            .map(|allocation| allocation.data.lock().unwrap().clone())
    }

    fn apply_copies(state: &DeviceState, commands: &[SoftwareCommand]) {
        for command in commands {
            match command {
                SoftwareCommand::CopyResource { src, dst } => {
                    let Some((src, dst)) = Self::copy_pair(state, *src, *dst) else {
                        continue;
                    };
                    let bytes = src.data.lock().unwrap().clone();
                    let mut dst_data = dst.data.lock().unwrap();
                    let count = bytes.len().min(dst_data.len());
                    dst_data[..count].copy_from_slice(&bytes[..count]);
                }
                SoftwareCommand::CopyBufferRegion {
                    src,
                    src_offset,
                    dst,
                    dst_offset,
                    byte_count,
                } => {
                    let Some((src, dst)) = Self::copy_pair(state, *src, *dst) else {
                        continue;
                    };
                    let bytes = {
                        let src_data = src.data.lock().unwrap();
                        let start = *src_offset as usize;
                        let end = start + *byte_count as usize;
                        src_data[start..end].to_vec()
                    };
                    let mut dst_data = dst.data.lock().unwrap();
                    let start = *dst_offset as usize;
                    dst_data[start..start + bytes.len()].copy_from_slice(&bytes);
                }
                SoftwareCommand::CopyTextureRegion {
                    src,
                    src_offset,
                    dst,
                    subresources,
                } => {
                    let Some((src, dst)) = Self::copy_pair(state, *src, *dst) else {
                        continue;
                    };
                    let mut dst_cursor = 0usize;
                    for footprint in subresources {
                        let start = (*src_offset + footprint.offset) as usize;
                        let count = footprint.byte_size() as usize;
                        let bytes = {
                            let src_data = src.data.lock().unwrap();
                            src_data[start..start + count].to_vec()
                        };
                        let mut dst_data = dst.data.lock().unwrap();
                        let end = (dst_cursor + count).min(dst_data.len());
                        let count = end.saturating_sub(dst_cursor);
                        dst_data[dst_cursor..end].copy_from_slice(&bytes[..count]);
                        dst_cursor = end;
                    }
                }
                _ => {}
            }
        }
    }

    fn copy_pair(
        state: &DeviceState,
        src: AllocationId,
        dst: AllocationId,
    ) -> Option<(Arc<SoftwareAllocation>, Arc<SoftwareAllocation>)> {
        let src = state.allocations.get(&src.0)?.clone();
        let dst = state.allocations.get(&dst.0)?.clone();
        Some((src, dst))
    }
}

impl DriverDevice for SoftwareDevice {
    fn create_queue(&self, class: QueueClass) -> Result<Box<dyn DriverQueue>, GpuError> {
        self.state.lock().unwrap().queue_mut(class);
        Ok(Box::new(SoftwareQueue {
            class,
            mode: self.mode,
            state: Arc::clone(&self.state),
        }))
    }

    fn create_fence(&self, initial_value: u64) -> Result<Arc<dyn DriverFence>, GpuError> {
        Ok(Arc::new(SoftwareFence {
            value: Mutex::new(initial_value),
            signaled: Condvar::new(),
        }))
    }

    fn create_view_heap(&self, desc: &ViewHeapDesc) -> Result<DriverViewHeap, GpuError> {
        let mut state = self.state.lock().unwrap();
        state.next_heap += 1;
        let id = state.next_heap;
        // Each heap gets a disjoint 32-bit address window.
        let base = (id as u64) << 32;
        Ok(DriverViewHeap {
            id: HeapId(id),
            cpu_base: CpuViewAddress(base),
            gpu_base: desc.shader_visible.then_some(GpuViewAddress(base)),
            stride: VIEW_STRIDE,
        })
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<dyn DriverAllocation>, GpuError> {
        let mut state = self.state.lock().unwrap();
        state.next_allocation += 1;
        let id = state.next_allocation;
        let allocation = Arc::new(SoftwareAllocation {
            id: AllocationId(id),
            byte_size: desc.byte_size,
            kind: desc.kind,
            gpu_address: (id as u64) << 20,
            data: Mutex::new(vec![0; desc.byte_size as usize]),
        });
        state.allocations.insert(id, Arc::clone(&allocation));
        Ok(allocation)
    }

    fn create_command_list(
        &self,
        class: QueueClass,
        frames_in_flight: usize,
    ) -> Result<Box<dyn DriverCommandList>, GpuError> {
        Ok(Box::new(SoftwareCommandList {
            class,
            frames_in_flight,
            commands: Vec::new(),
            recording: false,
        }))
    }

    fn write_view(&self, _category: ViewCategory, dst: CpuViewAddress, resource: AllocationId) {
        let mut state = self.state.lock().unwrap();
        state.views.insert(dst.0, SoftwareView::Resource(resource));
    }

    fn copy_view(&self, _category: ViewCategory, dst: CpuViewAddress, src: CpuViewAddress) {
        let mut state = self.state.lock().unwrap();
        let contents = state
            .views
            .get(&src.0)
            .copied()
            .unwrap_or(SoftwareView::Copied(src));
        state.views.insert(dst.0, contents);
    }

    fn write_null_view(&self, _category: ViewCategory, dst: CpuViewAddress) {
        let mut state = self.state.lock().unwrap();
        state.views.insert(dst.0, SoftwareView::Null);
    }
}

#[derive(Debug)]
struct SoftwareAllocation {
    id: AllocationId,
    byte_size: u64,
    kind: MemoryKind,
    gpu_address: u64,
    data: Mutex<Vec<u8>>,
}

impl DriverAllocation for SoftwareAllocation {
    fn id(&self) -> AllocationId {
        self.id
    }

    fn byte_size(&self) -> u64 {
        self.byte_size
    }

    fn gpu_address(&self) -> u64 {
        self.gpu_address
    }

    fn write(&self, offset: u64, bytes: &[u8]) -> Result<(), GpuError> {
        if self.kind != MemoryKind::Upload {
            return Err(GpuError::NotCpuMapped(self.id));
        }
        let end = offset + bytes.len() as u64;
        if end > self.byte_size {
            return Err(GpuError::Driver(format!(
                "write of {} bytes at offset {offset} exceeds allocation size {}",
                bytes.len(),
                self.byte_size
            )));
        }
        let mut data = self.data.lock().unwrap();
        data[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug)]
struct SoftwareFence {
    value: Mutex<u64>,
    signaled: Condvar,
}

impl DriverFence for SoftwareFence {
    fn completed_value(&self) -> u64 {
        *self.value.lock().unwrap()
    }

    fn signal(&self, value: u64) {
        let mut current = self.value.lock().unwrap();
        if value > *current {
            *current = value;
        }
        self.signaled.notify_all();
    }

    fn wait_until(&self, value: u64) {
        let mut current = self.value.lock().unwrap();
        while *current < value {
            current = self.signaled.wait(current).unwrap();
        }
    }
}

#[derive(Debug)]
struct SoftwareQueue {
    class: QueueClass,
    mode: CompletionMode,
    state: Arc<Mutex<DeviceState>>,
}

impl DriverQueue for SoftwareQueue {
    fn signal(&self, fence: &Arc<dyn DriverFence>, value: u64) -> Result<(), GpuError> {
        match self.mode {
            CompletionMode::Immediate => fence.signal(value),
            CompletionMode::Manual => {
                let mut state = self.state.lock().unwrap();
                state
                    .queue_mut(self.class)
                    .pending_signals
                    .push_back((Arc::clone(fence), value));
            }
        }
        Ok(())
    }

    fn wait_gpu(&self, _fence: &Arc<dyn DriverFence>, value: u64) -> Result<(), GpuError> {
        let mut state = self.state.lock().unwrap();
        state.queue_mut(self.class).gpu_waits.push(value);
        Ok(())
    }

    fn execute(&self, list: &mut dyn DriverCommandList) -> Result<(), GpuError> {
        let list = list
            .as_any_mut()
            .downcast_mut::<SoftwareCommandList>()
            .ok_or_else(|| GpuError::Driver("foreign command list submitted".into()))?;
        if list.recording {
            return Err(GpuError::Driver("command list was not closed".into()));
        }
        let commands = std::mem::take(&mut list.commands);
        let mut state = self.state.lock().unwrap();
        SoftwareDevice::apply_copies(&state, &commands);
        state
            .queue_mut(self.class)
            .executed
            .push(SoftwareSubmission { commands });
        Ok(())
    }
}

/// A command list that records into an inspectable command vector.
#[derive(Debug)]
pub struct SoftwareCommandList {
    class: QueueClass,
    frames_in_flight: usize,
    commands: Vec<SoftwareCommand>,
    recording: bool,
}

impl SoftwareCommandList {
    /// Commands recorded since the last reset. Emptied when the list is
    /// executed.
    pub fn commands(&self) -> &[SoftwareCommand] {
        &self.commands
    }

    fn record(&mut self, command: SoftwareCommand) {
        debug_assert!(self.recording, "recorded into a closed command list");
        self.commands.push(command);
    }
}

impl DriverCommandList for SoftwareCommandList {
    fn class(&self) -> QueueClass {
        self.class
    }

    fn reset(&mut self, frame_slot: usize) -> Result<(), GpuError> {
        if frame_slot >= self.frames_in_flight {
            return Err(GpuError::Driver(format!(
                "frame slot {frame_slot} out of range for {} frames in flight",
                self.frames_in_flight
            )));
        }
        self.commands.clear();
        self.recording = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), GpuError> {
        if !self.recording {
            return Err(GpuError::CommandListClose(
                "command list is not recording".into(),
            ));
        }
        self.recording = false;
        Ok(())
    }

    fn record_barriers(&mut self, barriers: &[Barrier]) {
        self.record(SoftwareCommand::Barriers(barriers.to_vec()));
    }

    fn bind_view_heap(&mut self, heap: HeapId) {
        self.record(SoftwareCommand::BindViewHeap(heap));
    }

    fn copy_resource(&mut self, src: AllocationId, dst: AllocationId) {
        self.record(SoftwareCommand::CopyResource { src, dst });
    }

    fn copy_buffer_region(
        &mut self,
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        dst_offset: u64,
        byte_count: u64,
    ) {
        self.record(SoftwareCommand::CopyBufferRegion {
            src,
            src_offset,
            dst,
            dst_offset,
            byte_count,
        });
    }

    fn copy_texture_region(
        &mut self,
        src: AllocationId,
        src_offset: u64,
        dst: AllocationId,
        subresources: &[SubresourceFootprint],
    ) {
        self.record(SoftwareCommand::CopyTextureRegion {
            src,
            src_offset,
            dst,
            subresources: subresources.to_vec(),
        });
    }

    fn set_pipeline(&mut self, pipeline: PipelineId) {
        self.record(SoftwareCommand::SetPipeline(pipeline));
    }

    fn set_root_table(&mut self, root_parameter: u32, table: GpuViewAddress) {
        self.record(SoftwareCommand::SetRootTable {
            root_parameter,
            table,
        });
    }

    fn set_render_targets(&mut self, colors: &[CpuViewAddress], depth: Option<CpuViewAddress>) {
        self.record(SoftwareCommand::SetRenderTargets {
            colors: colors.to_vec(),
            depth,
        });
    }

    fn clear_render_target(&mut self, target: CpuViewAddress, color: [f32; 4]) {
        self.record(SoftwareCommand::ClearRenderTarget { target, color });
    }

    fn clear_depth_stencil(&mut self, target: CpuViewAddress, depth: f32, stencil: u8) {
        self.record(SoftwareCommand::ClearDepthStencil {
            target,
            depth,
            stencil,
        });
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.record(SoftwareCommand::SetViewport(viewport));
    }

    fn set_scissor(&mut self, rect: Option<ScissorRect>) {
        self.record(SoftwareCommand::SetScissor(rect));
    }

    fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.record(SoftwareCommand::SetPrimitiveTopology(topology));
    }

    fn set_vertex_buffer(&mut self, slot: u32, view: VertexBufferView) {
        self.record(SoftwareCommand::SetVertexBuffer { slot, view });
    }

    fn set_index_buffer(&mut self, view: IndexBufferView) {
        self.record(SoftwareCommand::SetIndexBuffer(view));
    }

    fn set_blend_factor(&mut self, factor: [f32; 4]) {
        self.record(SoftwareCommand::SetBlendFactor(factor));
    }

    fn set_stencil_reference(&mut self, reference: u32) {
        self.record(SoftwareCommand::SetStencilReference(reference));
    }

    fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.record(SoftwareCommand::DrawInstanced {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.record(SoftwareCommand::DrawIndexedInstanced {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
    }

    fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.record(SoftwareCommand::Dispatch {
            groups_x,
            groups_y,
            groups_z,
        });
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn immediate_mode_completes_signals_at_once() {
        let device = SoftwareDevice::new(CompletionMode::Immediate);
        let queue = device.create_queue(QueueClass::Graphics).unwrap();
        let fence = device.create_fence(0).unwrap();

        queue.signal(&fence, 5).unwrap();
        assert_eq!(fence.completed_value(), 5);
    }

    #[test]
    fn manual_mode_holds_signals_until_released() {
        let device = SoftwareDevice::new(CompletionMode::Manual);
        let queue = device.create_queue(QueueClass::Copy).unwrap();
        let fence = device.create_fence(0).unwrap();

        queue.signal(&fence, 1).unwrap();
        queue.signal(&fence, 2).unwrap();
        assert_eq!(fence.completed_value(), 0);
        assert_eq!(device.pending_signal_count(QueueClass::Copy), 2);

        assert!(device.complete_next_signal(QueueClass::Copy));
        assert_eq!(fence.completed_value(), 1);
        device.complete_all_signals(QueueClass::Copy);
        assert_eq!(fence.completed_value(), 2);
    }

    #[test]
    fn execute_applies_buffer_copies() {
        let device = SoftwareDevice::new(CompletionMode::Immediate);
        let queue = device.create_queue(QueueClass::Copy).unwrap();
        let src = device
            .create_buffer(&BufferDesc {
                label: None,
                byte_size: 8,
                kind: MemoryKind::Upload,
            })
            .unwrap();
        let dst = device
            .create_buffer(&BufferDesc {
                label: None,
                byte_size: 8,
                kind: MemoryKind::DeviceLocal,
            })
            .unwrap();
        src.write(0, &[1, 2, 3, 4]).unwrap();

        let mut list = device.create_command_list(QueueClass::Copy, 1).unwrap();
        list.reset(0).unwrap();
        list.copy_buffer_region(src.id(), 0, dst.id(), 4, 4);
        list.close().unwrap();
        queue.execute(list.as_mut()).unwrap();

        assert_eq!(
            device.allocation_bytes(dst.id()).unwrap(),
            vec![0, 0, 0, 0, 1, 2, 3, 4]
        );
        assert_eq!(device.executed_count(QueueClass::Copy), 1);
    }

    #[test]
    fn close_fails_when_not_recording() {
        let device = SoftwareDevice::new(CompletionMode::Immediate);
        let mut list = device.create_command_list(QueueClass::Graphics, 2).unwrap();
        assert!(list.close().is_err());
        list.reset(1).unwrap();
        assert!(list.close().is_ok());
    }

    #[test]
    fn write_to_device_local_allocation_is_rejected() {
        let device = SoftwareDevice::new(CompletionMode::Immediate);
        let buffer = device
            .create_buffer(&BufferDesc {
                label: None,
                byte_size: 4,
                kind: MemoryKind::DeviceLocal,
            })
            .unwrap();
        assert!(matches!(
            buffer.write(0, &[0xFF]),
            Err(GpuError::NotCpuMapped(_))
        ));
    }
}
