//! Draw/dispatch recording and the per-frame resource-table cache.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::config::GpuConfig;
use crate::driver::{
    CpuViewAddress, DriverCommandList, DriverDevice, GpuViewAddress, IndexBufferView,
    PrimitiveTopology, ScissorRect, VertexBufferView, ViewCategory, Viewport,
};
use crate::error::GpuError;
use crate::fence::QueueClass;
use crate::pipeline::{ParameterInfo, PipelineState, RegisterKind, UpdateFrequency};
use crate::record::RecordingContext;
use crate::resource::{GpuResource, ResourceState};
use crate::views::{TransientViewHeap, ViewHandle, ViewHeapManager};

/// A render-target or depth-stencil attachment: the backing resource plus its
/// fixed-function view.
#[derive(Clone, Debug)]
pub struct TargetView {
    pub resource: Arc<GpuResource>,
    pub view: ViewHandle,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableCacheStats {
    /// Pending tables rebound from a previously uploaded block.
    pub hits: u64,
    /// Transient-heap blocks allocated and filled.
    pub allocations: u64,
}

type PendingTables = BTreeMap<u32, Vec<Option<ViewHandle>>>;

struct CachedTable {
    views: Vec<Option<CpuViewAddress>>,
    table: GpuViewAddress,
}

/// Recording context specialized for draw and dispatch work on the graphics
/// queue.
///
/// Bound resource sets are staged per root parameter and only uploaded to the
/// frame's transient heap when they differ from a set already uploaded this
/// frame, so identical resource sets cost one table rebind instead of a heap
/// block per call.
pub struct GraphicsContext {
    ctx: RecordingContext,
    pipeline: Option<Arc<PipelineState>>,
    pending_buffers: PendingTables,
    pending_textures: PendingTables,
    cached_buffers: Vec<CachedTable>,
    cached_textures: Vec<CachedTable>,
    stats: TableCacheStats,
}

impl GraphicsContext {
    pub fn new(device: &Arc<dyn DriverDevice>, config: &GpuConfig) -> Result<Self, GpuError> {
        Ok(Self {
            ctx: RecordingContext::new(device, config, QueueClass::Graphics)?,
            pipeline: None,
            pending_buffers: BTreeMap::new(),
            pending_textures: BTreeMap::new(),
            cached_buffers: Vec::new(),
            cached_textures: Vec::new(),
            stats: TableCacheStats::default(),
        })
    }

    pub fn recording(&self) -> &RecordingContext {
        &self.ctx
    }

    pub fn recording_mut(&mut self) -> &mut RecordingContext {
        &mut self.ctx
    }

    pub fn stats(&self) -> TableCacheStats {
        self.stats
    }

    pub fn reset(&mut self, frame_slot: usize, heaps: &ViewHeapManager) -> Result<(), GpuError> {
        self.ctx.reset(frame_slot, heaps)?;
        self.pipeline = None;
        self.pending_buffers.clear();
        self.pending_textures.clear();
        self.cached_buffers.clear();
        self.cached_textures.clear();
        Ok(())
    }

    pub fn add_barrier(&mut self, resource: &GpuResource, new_state: ResourceState) {
        self.ctx.add_barrier(resource, new_state);
    }

    pub fn flush_barriers(&mut self) {
        self.ctx.flush_barriers();
    }

    pub fn set_pipeline(&mut self, pipeline: &Arc<PipelineState>) {
        self.ctx.driver_list_mut().set_pipeline(pipeline.id());
        self.pipeline = Some(Arc::clone(pipeline));
    }

    /// Stages a constant-buffer view for the next draw or dispatch.
    pub fn bind_constant_buffer(
        &mut self,
        frequency: UpdateFrequency,
        register: u32,
        view: &ViewHandle,
    ) {
        let info = self.resolve_parameter(frequency, RegisterKind::ConstantBuffer, register);
        stage_binding(&mut self.pending_buffers, info, Some(view.clone()));
    }

    /// Stages a texture view for the next draw or dispatch. `None` leaves the
    /// slot to be filled with a null view.
    pub fn bind_texture(
        &mut self,
        frequency: UpdateFrequency,
        register: u32,
        view: Option<&ViewHandle>,
    ) {
        let info = self.resolve_parameter(frequency, RegisterKind::Texture, register);
        stage_binding(&mut self.pending_textures, info, view.cloned());
    }

    fn resolve_parameter(
        &self,
        frequency: UpdateFrequency,
        kind: RegisterKind,
        register: u32,
    ) -> ParameterInfo {
        let Some(pipeline) = &self.pipeline else {
            log::error!("resource bound with no active pipeline");
            panic!("resource bound with no active pipeline");
        };
        match pipeline.layout().parameter_info(frequency, kind, register) {
            Some(info) => info,
            None => {
                log::error!(
                    "active pipeline layout has no root parameter for {kind:?} register {register} at {frequency:?}"
                );
                panic!("root parameter missing for bound resource");
            }
        }
    }

    /// Uploads pending resource tables to the frame heap (or rebinds cached
    /// blocks) and sets the root tables. Runs before every draw and dispatch.
    pub fn flush_pipeline_resources(&mut self) {
        let split = self.ctx.split_mut();
        flush_tables(
            split.device,
            split.frame_heap,
            split.list,
            &self.pending_buffers,
            &mut self.cached_buffers,
            &mut self.stats,
            ViewCategory::ConstantBuffer,
            false,
        );
        flush_tables(
            split.device,
            split.frame_heap,
            split.list,
            &self.pending_textures,
            &mut self.cached_textures,
            &mut self.stats,
            ViewCategory::ShaderResource,
            true,
        );
    }

    /// Transitions the attachments and binds them for output. Color targets
    /// move to the render-target state, the depth target to depth-write.
    pub fn set_render_targets(&mut self, colors: &[&TargetView], depth: Option<&TargetView>) {
        let mut color_views = Vec::with_capacity(colors.len());
        for target in colors {
            self.ctx
                .add_barrier(&target.resource, ResourceState::RenderTarget);
            color_views.push(target.view.cpu());
        }
        let depth_view = depth.map(|target| {
            self.ctx
                .add_barrier(&target.resource, ResourceState::DepthWrite);
            target.view.cpu()
        });
        self.ctx.flush_barriers();
        self.ctx
            .driver_list_mut()
            .set_render_targets(&color_views, depth_view);
    }

    pub fn clear_color(&mut self, target: &TargetView, color: [f32; 4]) {
        self.ctx
            .add_barrier(&target.resource, ResourceState::RenderTarget);
        self.ctx.flush_barriers();
        self.ctx
            .driver_list_mut()
            .clear_render_target(target.view.cpu(), color);
    }

    pub fn clear_depth(&mut self, target: &TargetView, depth: f32, stencil: u8) {
        self.ctx
            .add_barrier(&target.resource, ResourceState::DepthWrite);
        self.ctx.flush_barriers();
        self.ctx
            .driver_list_mut()
            .clear_depth_stencil(target.view.cpu(), depth, stencil);
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.ctx.driver_list_mut().set_viewport(viewport);
    }

    /// Covers the whole surface with both viewport and scissor.
    pub fn set_viewport_and_scissor(&mut self, width: u32, height: u32) {
        self.ctx.driver_list_mut().set_viewport(Viewport {
            x: 0.0,
            y: 0.0,
            width: width as f32,
            height: height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        });
        self.ctx.driver_list_mut().set_scissor(Some(ScissorRect {
            left: 0,
            top: 0,
            right: width as i32,
            bottom: height as i32,
        }));
    }

    pub fn set_scissor(&mut self, rect: ScissorRect) {
        self.ctx.driver_list_mut().set_scissor(Some(rect));
    }

    pub fn disable_scissor(&mut self) {
        self.ctx.driver_list_mut().set_scissor(None);
    }

    pub fn set_primitive_topology(&mut self, topology: PrimitiveTopology) {
        self.ctx.driver_list_mut().set_primitive_topology(topology);
    }

    pub fn set_vertex_buffer(&mut self, slot: u32, view: VertexBufferView) {
        self.ctx.driver_list_mut().set_vertex_buffer(slot, view);
    }

    pub fn set_index_buffer(&mut self, view: IndexBufferView) {
        self.ctx.driver_list_mut().set_index_buffer(view);
    }

    pub fn set_blend_factor(&mut self, factor: [f32; 4]) {
        self.ctx.driver_list_mut().set_blend_factor(factor);
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.ctx.driver_list_mut().set_stencil_reference(reference);
    }

    pub fn draw(&mut self, vertex_count: u32, first_vertex: u32) {
        self.draw_instanced(vertex_count, 1, first_vertex, 0);
    }

    pub fn draw_indexed(&mut self, index_count: u32, first_index: u32, base_vertex: i32) {
        self.draw_indexed_instanced(index_count, 1, first_index, base_vertex, 0);
    }

    pub fn draw_instanced(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        self.flush_pipeline_resources();
        self.ctx.driver_list_mut().draw_instanced(
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        );
    }

    pub fn draw_indexed_instanced(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        self.flush_pipeline_resources();
        self.ctx.driver_list_mut().draw_indexed_instanced(
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        );
    }

    pub fn dispatch(&mut self, groups_x: u32, groups_y: u32, groups_z: u32) {
        self.flush_pipeline_resources();
        self.ctx
            .driver_list_mut()
            .dispatch(groups_x, groups_y, groups_z);
    }

    pub fn dispatch_1d(&mut self, threads_x: u32, group_size_x: u32) {
        self.dispatch(group_count(threads_x, group_size_x), 1, 1);
    }

    pub fn dispatch_2d(
        &mut self,
        threads_x: u32,
        threads_y: u32,
        group_size_x: u32,
        group_size_y: u32,
    ) {
        self.dispatch(
            group_count(threads_x, group_size_x),
            group_count(threads_y, group_size_y),
            1,
        );
    }

    pub fn dispatch_3d(
        &mut self,
        threads_x: u32,
        threads_y: u32,
        threads_z: u32,
        group_size_x: u32,
        group_size_y: u32,
        group_size_z: u32,
    ) {
        self.dispatch(
            group_count(threads_x, group_size_x),
            group_count(threads_y, group_size_y),
            group_count(threads_z, group_size_z),
        );
    }
}

fn group_count(thread_count: u32, group_size: u32) -> u32 {
    (thread_count + group_size - 1) / group_size
}

fn stage_binding(pending: &mut PendingTables, info: ParameterInfo, view: Option<ViewHandle>) {
    let table = pending
        .entry(info.root_parameter_index)
        .or_insert_with(|| vec![None; info.count as usize]);
    table[info.register_offset as usize] = view;
}

/// An unset pending entry matches any cached entry, so partially re-staged
/// sets still reuse the block they were last uploaded to.
fn table_matches(cached: &[Option<CpuViewAddress>], pending: &[Option<CpuViewAddress>]) -> bool {
    cached.len() == pending.len()
        && pending
            .iter()
            .zip(cached)
            .all(|(pending, cached)| match pending {
                None => true,
                Some(addr) => cached.as_ref() == Some(addr),
            })
}

#[allow(clippy::too_many_arguments)]
fn flush_tables(
    device: &Arc<dyn DriverDevice>,
    frame_heap: &TransientViewHeap,
    list: &mut dyn DriverCommandList,
    pending: &PendingTables,
    cache: &mut Vec<CachedTable>,
    stats: &mut TableCacheStats,
    category: ViewCategory,
    fill_null: bool,
) {
    for (root_parameter, views) in pending.iter() {
        let addresses: Vec<Option<CpuViewAddress>> = views
            .iter()
            .map(|view| view.as_ref().map(ViewHandle::cpu))
            .collect();

        if let Some(cached) = cache
            .iter()
            .find(|cached| table_matches(&cached.views, &addresses))
        {
            list.set_root_table(*root_parameter, cached.table);
            stats.hits += 1;
            continue;
        }

        let block = frame_heap.allocate_block(addresses.len() as u32);
        for (i, address) in addresses.iter().enumerate() {
            match address {
                Some(address) => device.copy_view(category, block.cpu_at(i as u32), *address),
                None if fill_null => device.write_null_view(category, block.cpu_at(i as u32)),
                None => {
                    log::error!("constant-buffer table slot {i} left unbound");
                    panic!("constant-buffer table slot left unbound");
                }
            }
        }
        list.set_root_table(*root_parameter, block.gpu());
        cache.push(CachedTable {
            views: addresses,
            table: block.gpu(),
        });
        stats.allocations += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::software::{CompletionMode, SoftwareDevice, SoftwareView};
    use crate::driver::{BufferDesc, MemoryKind, PipelineId};
    use crate::pipeline::RootParameterMap;

    struct Fixture {
        device: Arc<SoftwareDevice>,
        heaps: ViewHeapManager,
        graphics: GraphicsContext,
    }

    fn fixture() -> Fixture {
        let device = SoftwareDevice::new(CompletionMode::Immediate);
        let config = GpuConfig::default();
        let driver: Arc<dyn DriverDevice> = device.clone();
        let heaps = ViewHeapManager::new(device.as_ref(), &config).unwrap();
        let mut graphics = GraphicsContext::new(&driver, &config).unwrap();
        graphics.reset(0, &heaps).unwrap();
        Fixture {
            device,
            heaps,
            graphics,
        }
    }

    fn test_pipeline() -> Arc<PipelineState> {
        let mut layout = RootParameterMap::new();
        layout
            .add_table()
            .add_range(UpdateFrequency::PerMaterial, RegisterKind::Texture, 0, 4);
        layout.add_table().add_range(
            UpdateFrequency::PerObject,
            RegisterKind::ConstantBuffer,
            0,
            1,
        );
        PipelineState::new(PipelineId(1), layout)
    }

    fn shader_view(fixture: &Fixture) -> ViewHandle {
        let allocation = fixture
            .device
            .create_buffer(&BufferDesc {
                label: None,
                byte_size: 16,
                kind: MemoryKind::DeviceLocal,
            })
            .unwrap();
        let resource = GpuResource::new(allocation, ResourceState::ShaderResource);
        fixture
            .heaps
            .shader_resource()
            .create_view(fixture.device.as_ref(), &resource)
    }

    #[test]
    fn identical_resource_sets_reuse_the_uploaded_block() {
        let mut fx = fixture();
        let pipeline = test_pipeline();
        fx.graphics.set_pipeline(&pipeline);

        let views: Vec<ViewHandle> = (0..4).map(|_| shader_view(&fx)).collect();
        for (i, view) in views.iter().enumerate() {
            fx.graphics
                .bind_texture(UpdateFrequency::PerMaterial, i as u32, Some(view));
        }
        fx.graphics.flush_pipeline_resources();
        let cursor_after_first = fx.heaps.frame_heap(0).cursor();
        assert_eq!(cursor_after_first, 4);
        assert_eq!(fx.graphics.stats().allocations, 1);

        for (i, view) in views.iter().enumerate() {
            fx.graphics
                .bind_texture(UpdateFrequency::PerMaterial, i as u32, Some(view));
        }
        fx.graphics.flush_pipeline_resources();

        // Cache hit: zero new transient slots.
        assert_eq!(fx.heaps.frame_heap(0).cursor(), cursor_after_first);
        assert_eq!(fx.graphics.stats().hits, 1);
        assert_eq!(fx.graphics.stats().allocations, 1);
    }

    #[test]
    fn changed_resource_set_allocates_a_new_block() {
        let mut fx = fixture();
        let pipeline = test_pipeline();
        fx.graphics.set_pipeline(&pipeline);

        let first = shader_view(&fx);
        let second = shader_view(&fx);

        fx.graphics
            .bind_texture(UpdateFrequency::PerMaterial, 0, Some(&first));
        fx.graphics.flush_pipeline_resources();
        fx.graphics
            .bind_texture(UpdateFrequency::PerMaterial, 0, Some(&second));
        fx.graphics.flush_pipeline_resources();

        assert_eq!(fx.graphics.stats().allocations, 2);
        assert_eq!(fx.graphics.stats().hits, 0);
    }

    #[test]
    fn unbound_texture_slots_get_null_views() {
        let mut fx = fixture();
        let pipeline = test_pipeline();
        fx.graphics.set_pipeline(&pipeline);

        let view = shader_view(&fx);
        fx.graphics
            .bind_texture(UpdateFrequency::PerMaterial, 0, Some(&view));
        fx.graphics.flush_pipeline_resources();

        let heap = fx.heaps.frame_heap(0);
        assert_ne!(fx.device.view(heap.slot_cpu(0)), Some(SoftwareView::Null));
        for slot in 1..4 {
            assert_eq!(
                fx.device.view(heap.slot_cpu(slot)),
                Some(SoftwareView::Null)
            );
        }
    }

    #[test]
    fn draw_flushes_pending_tables() {
        let mut fx = fixture();
        let pipeline = test_pipeline();
        fx.graphics.set_pipeline(&pipeline);

        let view = shader_view(&fx);
        fx.graphics
            .bind_texture(UpdateFrequency::PerMaterial, 0, Some(&view));
        fx.graphics.draw(3, 0);

        assert_eq!(fx.graphics.stats().allocations, 1);
    }

    #[test]
    #[should_panic(expected = "root parameter missing")]
    fn binding_an_undeclared_slot_is_fatal() {
        let mut fx = fixture();
        let pipeline = test_pipeline();
        fx.graphics.set_pipeline(&pipeline);

        let view = shader_view(&fx);
        fx.graphics
            .bind_texture(UpdateFrequency::PerFrame, 9, Some(&view));
    }

    #[test]
    #[should_panic(expected = "no active pipeline")]
    fn binding_without_a_pipeline_is_fatal() {
        let mut fx = fixture();
        let view = shader_view(&fx);
        fx.graphics
            .bind_constant_buffer(UpdateFrequency::PerObject, 0, &view);
    }

    #[test]
    fn group_count_rounds_up() {
        assert_eq!(group_count(1, 64), 1);
        assert_eq!(group_count(64, 64), 1);
        assert_eq!(group_count(65, 64), 2);
    }
}
