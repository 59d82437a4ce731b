//! Staging of CPU-authored data into GPU-resident resources.

use std::sync::Arc;

use bytemuck::Pod;

use crate::config::GpuConfig;
use crate::driver::{BufferDesc, DriverDevice, MemoryKind, SubresourceFootprint};
use crate::error::GpuError;
use crate::fence::QueueClass;
use crate::record::RecordingContext;
use crate::resource::{GpuResource, ResourceState};
use crate::views::ViewHeapManager;

/// Most subresources a single texture upload may describe.
pub const MAX_TEXTURE_SUBRESOURCES: usize = 32;

/// Round `value` up to the nearest multiple of `alignment`.
///
/// `alignment` must be a power of two.
pub(crate) fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + (alignment - 1)) & !(alignment - 1)
}

#[derive(Debug)]
struct BufferUpload {
    resource: Arc<GpuResource>,
    data: Box<[u8]>,
}

/// A queued texture upload, filled in by the caller after
/// [`UploadContext::queue_texture_upload`].
///
/// `footprints` describes where each subresource's rows live inside `data`;
/// offsets are relative to the start of `data`.
#[derive(Debug, Default)]
pub struct TextureUpload {
    pub resource: Option<Arc<GpuResource>>,
    pub data: Vec<u8>,
    pub footprints: Vec<SubresourceFootprint>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct UploadStats {
    pub buffer_bytes_staged: u64,
    pub texture_bytes_staged: u64,
    /// Records left pending by a `process_uploads` pass because the staging
    /// space for the frame was full.
    pub records_deferred: u64,
}

/// Recording context specialized for staging copies on the copy queue.
///
/// Payloads are bump-allocated into two persistent CPU-mapped staging
/// buffers, one for generic data and one for texture data, each walked from
/// offset zero every frame. Records that do not fit in the remaining staging
/// space stay pending for a future frame; that is backpressure, not an error.
pub struct UploadContext {
    ctx: RecordingContext,
    buffer_heap: Arc<GpuResource>,
    texture_heap: Arc<GpuResource>,
    texture_alignment: u64,
    pending_buffers: Vec<BufferUpload>,
    pending_textures: Vec<TextureUpload>,
    buffers_in_flight: Vec<Arc<GpuResource>>,
    textures_in_flight: Vec<Arc<GpuResource>>,
    stats: UploadStats,
}

impl UploadContext {
    pub fn new(device: &Arc<dyn DriverDevice>, config: &GpuConfig) -> Result<Self, GpuError> {
        let ctx = RecordingContext::new(device, config, QueueClass::Copy)?;
        let buffer_heap = device.create_buffer(&BufferDesc {
            label: Some("upload staging (generic)"),
            byte_size: config.generic_staging_bytes,
            kind: MemoryKind::Upload,
        })?;
        let texture_heap = device.create_buffer(&BufferDesc {
            label: Some("upload staging (texture)"),
            byte_size: config.texture_staging_bytes,
            kind: MemoryKind::Upload,
        })?;
        Ok(Self {
            ctx,
            buffer_heap: Arc::new(GpuResource::new(buffer_heap, ResourceState::GenericRead)),
            texture_heap: Arc::new(GpuResource::new(texture_heap, ResourceState::GenericRead)),
            texture_alignment: config.texture_placement_alignment,
            pending_buffers: Vec::new(),
            pending_textures: Vec::new(),
            buffers_in_flight: Vec::new(),
            textures_in_flight: Vec::new(),
            stats: UploadStats::default(),
        })
    }

    pub fn recording(&self) -> &RecordingContext {
        &self.ctx
    }

    pub fn recording_mut(&mut self) -> &mut RecordingContext {
        &mut self.ctx
    }

    pub fn reset(&mut self, frame_slot: usize, heaps: &ViewHeapManager) -> Result<(), GpuError> {
        self.ctx.reset(frame_slot, heaps)
    }

    pub fn stats(&self) -> UploadStats {
        self.stats
    }

    pub fn pending_uploads(&self) -> usize {
        self.pending_buffers.len() + self.pending_textures.len()
    }

    pub fn in_flight_uploads(&self) -> usize {
        self.buffers_in_flight.len() + self.textures_in_flight.len()
    }

    /// Queues `bytes` for upload into `destination`.
    ///
    /// The destination is held alive until its copy is confirmed complete and
    /// must already be in the copy-destination state when the copy is
    /// recorded.
    pub fn queue_buffer_upload(&mut self, destination: &Arc<GpuResource>, bytes: &[u8]) {
        self.pending_buffers.push(BufferUpload {
            resource: Arc::clone(destination),
            data: bytes.into(),
        });
    }

    /// Queues a single POD value for upload into `destination`.
    pub fn queue_pod_upload<T: Pod>(&mut self, destination: &Arc<GpuResource>, value: &T) {
        self.queue_buffer_upload(destination, bytemuck::bytes_of(value));
    }

    /// Appends an empty texture upload record and returns it for the caller
    /// to fill with the destination, payload and subresource footprints.
    pub fn queue_texture_upload(&mut self) -> &mut TextureUpload {
        self.pending_textures.push(TextureUpload::default());
        let last = self.pending_textures.len() - 1;
        &mut self.pending_textures[last]
    }

    /// Walks the pending lists in order, staging every record that still fits
    /// this frame and recording its copy to the destination. The first record
    /// that does not fit stops the walk for its list, so queue order is
    /// preserved across frames.
    pub fn process_uploads(&mut self) {
        let mut buffer_offset: u64 = 0;
        let mut buffers_processed = 0;
        for upload in &self.pending_buffers {
            let size = upload.data.len() as u64;
            if buffer_offset + size > self.buffer_heap.byte_size() {
                break;
            }
            debug_assert_eq!(upload.resource.usage_state(), ResourceState::CopyDest);
            if let Err(err) = self.buffer_heap.allocation().write(buffer_offset, &upload.data) {
                log::error!("staging write failed: {err}");
                break;
            }
            self.ctx.copy_buffer_region(
                &self.buffer_heap,
                buffer_offset,
                &upload.resource,
                0,
                size,
            );
            buffer_offset += size;
            self.buffers_in_flight.push(Arc::clone(&upload.resource));
            self.stats.buffer_bytes_staged += size;
            buffers_processed += 1;
        }
        self.pending_buffers.drain(..buffers_processed);

        let mut texture_offset: u64 = 0;
        let mut textures_processed = 0;
        for upload in &self.pending_textures {
            let resource = upload
                .resource
                .as_ref()
                .expect("texture upload queued without a destination");
            assert!(
                !upload.footprints.is_empty() && upload.footprints.len() <= MAX_TEXTURE_SUBRESOURCES,
                "texture upload must describe between 1 and {MAX_TEXTURE_SUBRESOURCES} subresources"
            );
            let size = upload.data.len() as u64;
            if texture_offset + size > self.texture_heap.byte_size() {
                break;
            }
            debug_assert_eq!(resource.usage_state(), ResourceState::CopyDest);
            if let Err(err) = self
                .texture_heap
                .allocation()
                .write(texture_offset, &upload.data)
            {
                log::error!("staging write failed: {err}");
                break;
            }
            self.ctx.copy_texture_region(
                &self.texture_heap,
                texture_offset,
                &upload.footprints,
                resource,
            );
            texture_offset = align_up(texture_offset + size, self.texture_alignment);
            self.textures_in_flight.push(Arc::clone(resource));
            self.stats.texture_bytes_staged += size;
            textures_processed += 1;
        }
        self.pending_textures.drain(..textures_processed);

        self.stats.records_deferred +=
            (self.pending_buffers.len() + self.pending_textures.len()) as u64;
    }

    /// Releases the in-flight records. Call only once the copy queue's fence
    /// for the processed work has completed; the destinations are then ready
    /// for use.
    pub fn resolve_uploads(&mut self) {
        self.buffers_in_flight.clear();
        self.textures_in_flight.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::software::{
        CompletionMode, SoftwareCommand, SoftwareCommandList, SoftwareDevice,
    };
    use crate::driver::AllocationId;

    fn setup(generic_staging_bytes: u64) -> (Arc<SoftwareDevice>, ViewHeapManager, UploadContext) {
        let device = SoftwareDevice::new(CompletionMode::Immediate);
        let config = GpuConfig {
            generic_staging_bytes,
            texture_staging_bytes: 4096,
            ..GpuConfig::default()
        };
        let driver: Arc<dyn DriverDevice> = device.clone();
        let heaps = ViewHeapManager::new(device.as_ref(), &config).unwrap();
        let mut upload = UploadContext::new(&driver, &config).unwrap();
        upload.reset(0, &heaps).unwrap();
        (device, heaps, upload)
    }

    fn destination(device: &SoftwareDevice, byte_size: u64) -> Arc<GpuResource> {
        let allocation = device
            .create_buffer(&BufferDesc {
                label: None,
                byte_size,
                kind: MemoryKind::DeviceLocal,
            })
            .unwrap();
        Arc::new(GpuResource::new(allocation, ResourceState::CopyDest))
    }

    fn copy_commands(upload: &mut UploadContext) -> Vec<(AllocationId, u64, u64)> {
        upload
            .recording_mut()
            .driver_list_mut()
            .as_any_mut()
            .downcast_mut::<SoftwareCommandList>()
            .unwrap()
            .commands()
            .iter()
            .filter_map(|command| match command {
                SoftwareCommand::CopyBufferRegion {
                    dst,
                    src_offset,
                    byte_count,
                    ..
                } => Some((*dst, *src_offset, *byte_count)),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn align_up_rounds_to_multiple() {
        assert_eq!(align_up(0, 512), 0);
        assert_eq!(align_up(1, 512), 512);
        assert_eq!(align_up(512, 512), 512);
        assert_eq!(align_up(513, 512), 1024);
    }

    #[test]
    fn uploads_drain_in_order_across_frames() {
        let (device, heaps, mut upload) = setup(256);

        let destinations: Vec<Arc<GpuResource>> =
            (0..5).map(|_| destination(&device, 100)).collect();
        for (i, dst) in destinations.iter().enumerate() {
            upload.queue_buffer_upload(dst, &[i as u8; 100]);
        }

        // 256-byte staging space fits two 100-byte payloads per frame.
        let mut staged: Vec<AllocationId> = Vec::new();
        for frame in 0..3usize {
            upload.reset(frame % 2, &heaps).unwrap();
            upload.process_uploads();
            staged.extend(copy_commands(&mut upload).iter().map(|(dst, _, _)| *dst));
            upload.resolve_uploads();
        }

        let expected: Vec<AllocationId> = destinations.iter().map(|dst| dst.id()).collect();
        assert_eq!(staged, expected);
        assert_eq!(upload.pending_uploads(), 0);
        assert_eq!(upload.stats().buffer_bytes_staged, 500);
    }

    #[test]
    fn oversized_record_backpressures_without_error() {
        let (device, _heaps, mut upload) = setup(256);

        let fits = destination(&device, 200);
        let too_big = destination(&device, 512);
        upload.queue_buffer_upload(&fits, &[1; 200]);
        upload.queue_buffer_upload(&too_big, &[2; 512]);

        upload.process_uploads();
        assert_eq!(upload.in_flight_uploads(), 1);
        assert_eq!(upload.pending_uploads(), 1);
        assert_eq!(upload.stats().records_deferred, 1);
    }

    #[test]
    fn staged_bytes_land_in_the_staging_buffer_back_to_back() {
        let (device, _heaps, mut upload) = setup(256);

        let first = destination(&device, 4);
        let second = destination(&device, 4);
        upload.queue_buffer_upload(&first, &[0xAA; 4]);
        upload.queue_buffer_upload(&second, &[0xBB; 4]);
        upload.process_uploads();

        let staging_id = upload.buffer_heap.id();
        let bytes = device.allocation_bytes(staging_id).unwrap();
        assert_eq!(&bytes[..8], &[0xAA, 0xAA, 0xAA, 0xAA, 0xBB, 0xBB, 0xBB, 0xBB]);

        let commands = copy_commands(&mut upload);
        assert_eq!(commands[0].1, 0);
        assert_eq!(commands[1].1, 4);
    }

    #[test]
    fn texture_offsets_round_up_to_placement_alignment() {
        let (device, _heaps, mut upload) = setup(256);

        for _ in 0..2 {
            let dst = destination(&device, 300);
            let record = upload.queue_texture_upload();
            record.resource = Some(dst);
            record.data = vec![7; 300];
            record.footprints = vec![SubresourceFootprint {
                offset: 0,
                row_pitch: 30,
                row_count: 10,
                depth: 1,
            }];
        }
        upload.process_uploads();

        let offsets: Vec<u64> = upload
            .recording_mut()
            .driver_list_mut()
            .as_any_mut()
            .downcast_mut::<SoftwareCommandList>()
            .unwrap()
            .commands()
            .iter()
            .filter_map(|command| match command {
                SoftwareCommand::CopyTextureRegion { src_offset, .. } => Some(*src_offset),
                _ => None,
            })
            .collect();
        assert_eq!(offsets, vec![0, 512]);
    }

    #[test]
    fn destinations_stay_alive_until_resolved() {
        let (device, _heaps, mut upload) = setup(256);

        let dst = destination(&device, 16);
        upload.queue_buffer_upload(&dst, &[0; 16]);
        assert_eq!(Arc::strong_count(&dst), 2);

        upload.process_uploads();
        assert_eq!(Arc::strong_count(&dst), 2);
        assert_eq!(upload.in_flight_uploads(), 1);

        upload.resolve_uploads();
        assert_eq!(Arc::strong_count(&dst), 1);
        assert_eq!(upload.in_flight_uploads(), 0);
    }

    #[test]
    fn pod_uploads_stage_their_raw_bytes() {
        let (device, _heaps, mut upload) = setup(256);

        let dst = destination(&device, 8);
        upload.queue_pod_upload(&dst, &0x1122_3344_5566_7788u64);
        upload.process_uploads();

        let bytes = device.allocation_bytes(upload.buffer_heap.id()).unwrap();
        assert_eq!(&bytes[..8], &0x1122_3344_5566_7788u64.to_le_bytes());
    }
}
