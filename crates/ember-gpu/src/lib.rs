//! `ember-gpu` is the command-submission and synchronization core of the
//! ember rendering stack.
//!
//! The crate sits between a driver binding layer (an explicit
//! command-queue/fence/descriptor style API, abstracted by the traits in
//! [`driver`]) and the higher rendering layers. It provides:
//!
//! - Fenced command queues and a per-class queue manager (see
//!   [`CommandQueue`] and [`QueueManager`]).
//! - Persistent and per-frame transient resource-view heaps with RAII slot
//!   recycling (see [`views`]).
//! - Usage-state tracking per GPU resource with minimal barrier emission
//!   (see [`GpuResource`]).
//! - Recording contexts that batch state-transition barriers and record
//!   copy/draw/dispatch work per frame slot (see [`RecordingContext`],
//!   [`UploadContext`], [`GraphicsContext`]).
//! - A frame orchestrator that paces N frames in flight and submits recorded
//!   work in dependency order (see [`FrameOrchestrator`]).

pub mod config;
pub mod driver;
pub mod error;
pub mod fence;
pub mod frame;
pub mod graphics;
pub mod pipeline;
pub mod queue;
pub mod record;
pub mod resource;
pub mod upload;
pub mod views;

mod device;

pub use config::{GpuConfig, ViewHeapCapacities};
pub use device::DeviceContext;
pub use error::GpuError;
pub use fence::{FenceValue, QueueClass};
pub use frame::{FrameOrchestrator, Presentable};
pub use graphics::{GraphicsContext, TableCacheStats, TargetView};
pub use pipeline::{ParameterInfo, PipelineState, RegisterKind, RootParameterMap, UpdateFrequency};
pub use queue::{CommandQueue, QueueManager};
pub use record::RecordingContext;
pub use resource::{Barrier, BarrierKind, GpuResource, ResourceState};
pub use upload::{TextureUpload, UploadContext, UploadStats, MAX_TEXTURE_SUBRESOURCES};
pub use views::{
    OverlayViewAllocator, OverlayViewBlock, OverlayViewKey, OverlayViewPool, PersistentViewHeap,
    TransientBlock, TransientViewHeap, ViewHandle, ViewHeapManager,
};
