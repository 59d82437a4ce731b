//! Resource-view heaps: persistent freelist-backed heaps, per-frame transient
//! heaps, and the RAII handles that recycle their slots.
//!
//! Persistent allocation and release are confined to a single owning thread
//! (handles are `Rc`-based and deliberately not `Send`); the per-frame
//! transient heaps are only touched from the recording thread.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use crate::config::GpuConfig;
use crate::driver::{
    CpuViewAddress, DriverDevice, DriverViewHeap, GpuViewAddress, HeapId, ViewCategory,
    ViewHeapDesc,
};
use crate::error::GpuError;
use crate::resource::GpuResource;

/// A shared handle to one view slot in a persistent heap.
///
/// Handles are shared by every component that still addresses the view; when
/// the last clone drops, the owning heap is notified and recycles the slot.
/// The back-reference to the heap is weak, never an ownership edge.
#[derive(Clone, Debug)]
pub struct ViewHandle {
    data: Rc<HandleData>,
}

#[derive(Debug)]
struct HandleData {
    heap: Weak<RefCell<PersistentState>>,
    cpu: CpuViewAddress,
    gpu: Option<GpuViewAddress>,
    index: u32,
}

impl Drop for HandleData {
    fn drop(&mut self) {
        if let Some(heap) = self.heap.upgrade() {
            heap.borrow_mut().release(self.index);
        }
    }
}

impl ViewHandle {
    pub fn cpu(&self) -> CpuViewAddress {
        self.data.cpu
    }

    /// Set only for handles from shader-visible heaps.
    pub fn gpu(&self) -> Option<GpuViewAddress> {
        self.data.gpu
    }

    pub fn slot_index(&self) -> u32 {
        self.data.index
    }
}

#[derive(Debug)]
struct PersistentState {
    label: &'static str,
    capacity: u32,
    free: Vec<u32>,
    high_water: u32,
    active: u32,
}

impl PersistentState {
    fn release(&mut self, index: u32) {
        assert!(
            self.active != 0,
            "view heap '{}': released more handles than were allocated",
            self.label
        );
        self.free.push(index);
        self.active -= 1;
    }
}

/// Fixed-capacity heap with freelist recycling, for views that live beyond a
/// frame.
#[derive(Debug)]
pub struct PersistentViewHeap {
    heap: DriverViewHeap,
    category: ViewCategory,
    label: &'static str,
    state: Rc<RefCell<PersistentState>>,
}

impl PersistentViewHeap {
    pub fn new(
        device: &dyn DriverDevice,
        category: ViewCategory,
        capacity: u32,
        label: &'static str,
    ) -> Result<Self, GpuError> {
        let heap = device.create_view_heap(&ViewHeapDesc {
            label: Some(label),
            category,
            capacity,
            shader_visible: false,
        })?;
        Ok(Self {
            heap,
            category,
            label,
            state: Rc::new(RefCell::new(PersistentState {
                label,
                capacity,
                free: Vec::new(),
                high_water: 0,
                active: 0,
            })),
        })
    }

    pub fn category(&self) -> ViewCategory {
        self.category
    }

    pub fn capacity(&self) -> u32 {
        self.state.borrow().capacity
    }

    pub fn active_handles(&self) -> u32 {
        self.state.borrow().active
    }

    /// Allocates one view slot: from the freelist when possible, otherwise by
    /// advancing the high-water cursor. Exhaustion is a sizing bug and fatal.
    pub fn allocate(&self) -> ViewHandle {
        let index = {
            let mut state = self.state.borrow_mut();
            let index = if let Some(index) = state.free.pop() {
                index
            } else if state.high_water < state.capacity {
                let index = state.high_water;
                state.high_water += 1;
                index
            } else {
                log::error!(
                    "view heap '{}' exhausted ({} slots)",
                    self.label,
                    state.capacity
                );
                panic!("view heap '{}' exhausted", self.label);
            };
            state.active += 1;
            index
        };
        ViewHandle {
            data: Rc::new(HandleData {
                heap: Rc::downgrade(&self.state),
                cpu: self.slot_cpu(index),
                gpu: None,
                index,
            }),
        }
    }

    /// Allocates a slot and points it at `resource`.
    pub fn create_view(&self, device: &dyn DriverDevice, resource: &GpuResource) -> ViewHandle {
        let handle = self.allocate();
        device.write_view(self.category, handle.cpu(), resource.id());
        handle
    }

    fn slot_cpu(&self, index: u32) -> CpuViewAddress {
        CpuViewAddress(self.heap.cpu_base.0 + index as u64 * self.heap.stride as u64)
    }
}

/// A contiguous block of slots handed out by a transient heap.
///
/// Blocks are never recycled individually; addresses stay stable until the
/// heap's end-of-frame reset.
#[derive(Clone, Copy, Debug)]
pub struct TransientBlock {
    cpu: CpuViewAddress,
    gpu: GpuViewAddress,
    first_slot: u32,
    count: u32,
    stride: u32,
}

impl TransientBlock {
    pub fn cpu(&self) -> CpuViewAddress {
        self.cpu
    }

    pub fn gpu(&self) -> GpuViewAddress {
        self.gpu
    }

    pub fn first_slot(&self) -> u32 {
        self.first_slot
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn cpu_at(&self, offset: u32) -> CpuViewAddress {
        debug_assert!(offset < self.count);
        CpuViewAddress(self.cpu.0 + offset as u64 * self.stride as u64)
    }
}

/// Shader-visible per-frame heap with a ring cursor that resets every frame.
#[derive(Debug)]
pub struct TransientViewHeap {
    heap: DriverViewHeap,
    gpu_base: GpuViewAddress,
    capacity: u32,
    label: &'static str,
    cursor: Cell<u32>,
}

impl TransientViewHeap {
    pub fn new(
        device: &dyn DriverDevice,
        capacity: u32,
        label: &'static str,
    ) -> Result<Self, GpuError> {
        let heap = device.create_view_heap(&ViewHeapDesc {
            label: Some(label),
            category: ViewCategory::ShaderResource,
            capacity,
            shader_visible: true,
        })?;
        let gpu_base = heap.gpu_base.ok_or_else(|| {
            GpuError::Driver(format!("shader-visible heap '{label}' has no GPU address"))
        })?;
        Ok(Self {
            heap,
            gpu_base,
            capacity,
            label,
            cursor: Cell::new(0),
        })
    }

    pub fn id(&self) -> HeapId {
        self.heap.id
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    pub fn cursor(&self) -> u32 {
        self.cursor.get()
    }

    pub fn remaining(&self) -> u32 {
        self.capacity - self.cursor.get()
    }

    pub fn slot_cpu(&self, index: u32) -> CpuViewAddress {
        CpuViewAddress(self.heap.cpu_base.0 + index as u64 * self.heap.stride as u64)
    }

    pub fn slot_gpu(&self, index: u32) -> GpuViewAddress {
        GpuViewAddress(self.gpu_base.0 + index as u64 * self.heap.stride as u64)
    }

    /// Takes `count` contiguous slots. Overflow means the heap was sized too
    /// small for the frame's worth of bindings and is fatal.
    pub fn allocate_block(&self, count: u32) -> TransientBlock {
        let start = self.cursor.get();
        let end = start.checked_add(count).unwrap_or_else(|| {
            log::error!("transient view heap '{}' block count overflow", self.label);
            panic!("transient view heap '{}' exhausted", self.label);
        });
        if end > self.capacity {
            log::error!(
                "transient view heap '{}' exhausted: {count} slots requested, {} of {} left",
                self.label,
                self.remaining(),
                self.capacity
            );
            panic!("transient view heap '{}' exhausted", self.label);
        }
        self.cursor.set(end);
        TransientBlock {
            cpu: self.slot_cpu(start),
            gpu: self.slot_gpu(start),
            first_slot: start,
            count,
            stride: self.heap.stride,
        }
    }

    /// Zeroes the cursor. Called once per frame slot, after the slot's prior
    /// GPU work completed.
    pub fn reset(&self) {
        self.cursor.set(0);
    }
}

/// One persistent heap per view category plus one transient heap per frame in
/// flight.
#[derive(Debug)]
pub struct ViewHeapManager {
    shader_resource: Rc<PersistentViewHeap>,
    constant_buffer: Rc<PersistentViewHeap>,
    unordered_access: Rc<PersistentViewHeap>,
    sampler: Rc<PersistentViewHeap>,
    render_target: Rc<PersistentViewHeap>,
    depth_stencil: Rc<PersistentViewHeap>,
    frame_heaps: Vec<Rc<TransientViewHeap>>,
}

impl ViewHeapManager {
    pub fn new(device: &dyn DriverDevice, config: &GpuConfig) -> Result<Self, GpuError> {
        let capacities = &config.persistent_views;
        let mut frame_heaps = Vec::with_capacity(config.frames_in_flight);
        for _ in 0..config.frames_in_flight {
            frame_heaps.push(Rc::new(TransientViewHeap::new(
                device,
                config.transient_views,
                "frame view heap",
            )?));
        }
        Ok(Self {
            shader_resource: Rc::new(PersistentViewHeap::new(
                device,
                ViewCategory::ShaderResource,
                capacities.shader_resource,
                "shader resource views",
            )?),
            constant_buffer: Rc::new(PersistentViewHeap::new(
                device,
                ViewCategory::ConstantBuffer,
                capacities.constant_buffer,
                "constant buffer views",
            )?),
            unordered_access: Rc::new(PersistentViewHeap::new(
                device,
                ViewCategory::UnorderedAccess,
                capacities.unordered_access,
                "unordered access views",
            )?),
            sampler: Rc::new(PersistentViewHeap::new(
                device,
                ViewCategory::Sampler,
                capacities.sampler,
                "sampler views",
            )?),
            render_target: Rc::new(PersistentViewHeap::new(
                device,
                ViewCategory::RenderTarget,
                capacities.render_target,
                "render target views",
            )?),
            depth_stencil: Rc::new(PersistentViewHeap::new(
                device,
                ViewCategory::DepthStencil,
                capacities.depth_stencil,
                "depth stencil views",
            )?),
            frame_heaps,
        })
    }

    pub fn shader_resource(&self) -> &PersistentViewHeap {
        &self.shader_resource
    }

    pub fn constant_buffer(&self) -> &PersistentViewHeap {
        &self.constant_buffer
    }

    pub fn unordered_access(&self) -> &PersistentViewHeap {
        &self.unordered_access
    }

    pub fn sampler(&self) -> &PersistentViewHeap {
        &self.sampler
    }

    pub fn render_target(&self) -> &PersistentViewHeap {
        &self.render_target
    }

    pub fn depth_stencil(&self) -> &PersistentViewHeap {
        &self.depth_stencil
    }

    pub fn persistent(&self, category: ViewCategory) -> &PersistentViewHeap {
        match category {
            ViewCategory::ShaderResource => &self.shader_resource,
            ViewCategory::ConstantBuffer => &self.constant_buffer,
            ViewCategory::UnorderedAccess => &self.unordered_access,
            ViewCategory::Sampler => &self.sampler,
            ViewCategory::RenderTarget => &self.render_target,
            ViewCategory::DepthStencil => &self.depth_stencil,
        }
    }

    pub fn frame_heap(&self, frame_slot: usize) -> &Rc<TransientViewHeap> {
        &self.frame_heaps[frame_slot]
    }

    /// An allocator over the persistent shader-resource heap for external
    /// overlay integrations.
    pub fn overlay_pool(&self) -> OverlayViewPool {
        OverlayViewPool {
            heap: Rc::clone(&self.shader_resource),
            blocks: HashMap::new(),
            next_key: 1,
        }
    }
}

/// Key identifying a block handed out by an [`OverlayViewAllocator`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct OverlayViewKey(pub u64);

/// A block of allocated view slots, addressed for the caller to fill.
#[derive(Clone, Debug)]
pub struct OverlayViewBlock {
    pub key: OverlayViewKey,
    pub views: Vec<CpuViewAddress>,
}

/// Allocation hooks injected into external overlay integrations.
pub trait OverlayViewAllocator {
    fn allocate_block(&mut self, count: u32) -> OverlayViewBlock;
    fn free_block(&mut self, key: OverlayViewKey);
}

/// [`OverlayViewAllocator`] over a persistent heap; handles stay owned here
/// until the block is freed by key.
#[derive(Debug)]
pub struct OverlayViewPool {
    heap: Rc<PersistentViewHeap>,
    blocks: HashMap<OverlayViewKey, Vec<ViewHandle>>,
    next_key: u64,
}

impl OverlayViewAllocator for OverlayViewPool {
    fn allocate_block(&mut self, count: u32) -> OverlayViewBlock {
        let handles: Vec<ViewHandle> = (0..count).map(|_| self.heap.allocate()).collect();
        let views = handles.iter().map(ViewHandle::cpu).collect();
        let key = OverlayViewKey(self.next_key);
        self.next_key += 1;
        self.blocks.insert(key, handles);
        OverlayViewBlock { key, views }
    }

    fn free_block(&mut self, key: OverlayViewKey) {
        if self.blocks.remove(&key).is_none() {
            log::warn!("overlay view block {key:?} freed twice or never allocated");
        }
    }
}
