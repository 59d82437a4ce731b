//! End-to-end frame loop: upload, bind, draw, present, and slot pacing
//! against the software driver.

mod common;

use std::sync::Arc;

use pretty_assertions::assert_eq;

use common::{device_and_context, TestSurface};
use ember_gpu::driver::software::{CompletionMode, SoftwareCommand};
use ember_gpu::driver::{MemoryKind, PipelineId, PrimitiveTopology, VertexBufferView};
use ember_gpu::{
    FrameOrchestrator, GpuConfig, QueueClass, RegisterKind, ResourceState, RootParameterMap,
    PipelineState, TargetView, UpdateFrequency,
};

#[test]
fn two_frames_of_upload_draw_and_present() {
    let (device, context) = device_and_context(CompletionMode::Immediate, GpuConfig::default());
    let mut orchestrator = FrameOrchestrator::new(&context).expect("orchestrator");

    let vertex_data: Vec<u8> = (0..64u8).collect();
    let vertex_buffer = context
        .create_buffer_resource(
            Some("mesh vertices"),
            vertex_data.len() as u64,
            MemoryKind::DeviceLocal,
            ResourceState::CopyDest,
        )
        .unwrap();
    let constants = context
        .create_buffer_resource(
            Some("object constants"),
            256,
            MemoryKind::DeviceLocal,
            ResourceState::VertexOrConstantBuffer,
        )
        .unwrap();
    let texture = context
        .create_buffer_resource(
            Some("albedo"),
            1024,
            MemoryKind::DeviceLocal,
            ResourceState::ShaderResource,
        )
        .unwrap();

    let mut surface = TestSurface::new(&context, 4096);

    let constant_view = context
        .heaps()
        .constant_buffer()
        .create_view(context.driver().as_ref(), &constants);
    let texture_view = context
        .heaps()
        .shader_resource()
        .create_view(context.driver().as_ref(), &texture);
    let target_view = context
        .heaps()
        .render_target()
        .create_view(context.driver().as_ref(), &surface.resource);

    let mut layout = RootParameterMap::new();
    layout.add_table().add_range(
        UpdateFrequency::PerObject,
        RegisterKind::ConstantBuffer,
        0,
        1,
    );
    layout
        .add_table()
        .add_range(UpdateFrequency::PerMaterial, RegisterKind::Texture, 0, 1);
    let pipeline = PipelineState::new(PipelineId(7), layout);

    // Frame 0: stage the vertex upload and record a full draw.
    orchestrator.mark_frame_start().unwrap();
    orchestrator
        .upload_mut()
        .queue_buffer_upload(&vertex_buffer, &vertex_data);

    let graphics = orchestrator.graphics_mut();
    graphics.set_pipeline(&pipeline);
    graphics.set_render_targets(
        &[&TargetView {
            resource: Arc::clone(&surface.resource),
            view: target_view.clone(),
        }],
        None,
    );
    graphics.set_viewport_and_scissor(640, 480);
    graphics.set_primitive_topology(PrimitiveTopology::TriangleList);
    graphics.set_vertex_buffer(
        0,
        VertexBufferView {
            buffer: vertex_buffer.id(),
            byte_size: vertex_data.len() as u32,
            stride: 16,
        },
    );
    graphics.bind_constant_buffer(UpdateFrequency::PerObject, 0, &constant_view);
    graphics.bind_texture(UpdateFrequency::PerMaterial, 0, Some(&texture_view));
    graphics.draw(3, 0);

    orchestrator.mark_frame_end(&mut [&mut surface]).unwrap();

    // The staged bytes reached the destination through the copy queue.
    assert_eq!(
        device.allocation_bytes(vertex_buffer.id()).unwrap(),
        vertex_data
    );
    assert_eq!(device.executed_count(QueueClass::Copy), 1);
    assert_eq!(device.executed_count(QueueClass::Graphics), 1);
    assert_eq!(surface.presents, 1);

    // The graphics queue waited GPU-side on the copy fence.
    let waits = device.gpu_waits(QueueClass::Graphics);
    assert_eq!(waits.len(), 1);

    // The graphics submission carries the recorded draw.
    let submissions = device.executed(QueueClass::Graphics);
    let commands = &submissions[0].commands;
    assert!(commands
        .iter()
        .any(|command| matches!(command, SoftwareCommand::SetPipeline(PipelineId(7)))));
    assert!(commands.iter().any(|command| matches!(
        command,
        SoftwareCommand::DrawInstanced {
            vertex_count: 3,
            instance_count: 1,
            ..
        }
    )));

    // Frame 1 re-binds the same resource set: the table cache avoids new
    // transient allocations once the frame-heap state is rebuilt.
    orchestrator.mark_frame_start().unwrap();
    assert_eq!(context.heaps().frame_heap(1).cursor(), 0);
    let graphics = orchestrator.graphics_mut();
    graphics.set_pipeline(&pipeline);
    graphics.bind_constant_buffer(UpdateFrequency::PerObject, 0, &constant_view);
    graphics.bind_texture(UpdateFrequency::PerMaterial, 0, Some(&texture_view));
    graphics.draw(3, 0);
    graphics.draw(3, 0);
    // Two tables uploaded in frame 0, two after frame 1's reset; the second
    // draw of frame 1 hit the cache for both.
    let stats = orchestrator.graphics().stats();
    assert_eq!(stats.allocations, 4);
    assert!(stats.hits >= 2);
    orchestrator.mark_frame_end(&mut [&mut surface]).unwrap();

    // Frame 2 wraps back to slot 0 and resets its transient heap.
    orchestrator.mark_frame_start().unwrap();
    assert_eq!(orchestrator.frame_slot(), 0);
    assert_eq!(context.heaps().frame_heap(0).cursor(), 0);
    orchestrator.mark_frame_end(&mut []).unwrap();
}

#[test]
fn upload_backpressure_spreads_across_frames() {
    let config = GpuConfig {
        generic_staging_bytes: 1024,
        ..GpuConfig::default()
    };
    let (device, context) = device_and_context(CompletionMode::Immediate, config);
    let mut orchestrator = FrameOrchestrator::new(&context).expect("orchestrator");

    let destinations: Vec<_> = (0..6)
        .map(|i| {
            context
                .create_buffer_resource(
                    None,
                    400,
                    MemoryKind::DeviceLocal,
                    ResourceState::CopyDest,
                )
                .map(|dst| (i as u8, dst))
                .unwrap()
        })
        .collect();

    orchestrator.mark_frame_start().unwrap();
    for (seed, dst) in &destinations {
        orchestrator
            .upload_mut()
            .queue_buffer_upload(dst, &[*seed; 400]);
    }
    orchestrator.mark_frame_end(&mut []).unwrap();

    // 1024 bytes of staging fits two 400-byte payloads per frame.
    assert_eq!(orchestrator.upload().pending_uploads(), 4);

    for _ in 0..2 {
        orchestrator.mark_frame_start().unwrap();
        orchestrator.mark_frame_end(&mut []).unwrap();
    }
    assert_eq!(orchestrator.upload().pending_uploads(), 0);

    // Every destination received its bytes exactly once, in queue order.
    for (seed, dst) in &destinations {
        assert_eq!(device.allocation_bytes(dst.id()).unwrap(), vec![*seed; 400]);
    }
    assert_eq!(orchestrator.upload().stats().buffer_bytes_staged, 6 * 400);
}
