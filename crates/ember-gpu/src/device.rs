//! The top-level device context.
//!
//! Every component receives its collaborators explicitly at construction;
//! there is no process-wide device or queue-manager state. The context is
//! built once at startup and torn down at shutdown, with the queue manager
//! outliving every recording context.

use std::rc::Rc;
use std::sync::Arc;

use crate::config::GpuConfig;
use crate::driver::{BufferDesc, DriverDevice, MemoryKind};
use crate::error::GpuError;
use crate::queue::QueueManager;
use crate::resource::{GpuResource, ResourceState};
use crate::views::ViewHeapManager;

/// Owns the driver handle, the queue trio and the view heaps.
///
/// The queue manager is shared behind an `Arc` so any thread may submit;
/// the heap manager stays on the owning thread.
pub struct DeviceContext {
    config: GpuConfig,
    heaps: Rc<ViewHeapManager>,
    queues: Arc<QueueManager>,
    driver: Arc<dyn DriverDevice>,
}

impl DeviceContext {
    pub fn new(driver: Arc<dyn DriverDevice>, config: GpuConfig) -> Result<Self, GpuError> {
        config.validate()?;
        let queues = Arc::new(QueueManager::new(driver.as_ref())?);
        let heaps = Rc::new(ViewHeapManager::new(driver.as_ref(), &config)?);
        Ok(Self {
            config,
            heaps,
            queues,
            driver,
        })
    }

    pub fn driver(&self) -> &Arc<dyn DriverDevice> {
        &self.driver
    }

    pub fn config(&self) -> &GpuConfig {
        &self.config
    }

    pub fn queues(&self) -> &Arc<QueueManager> {
        &self.queues
    }

    pub fn heaps(&self) -> &Rc<ViewHeapManager> {
        &self.heaps
    }

    /// Creates a buffer resource with its initial usage state.
    pub fn create_buffer_resource(
        &self,
        label: Option<&'static str>,
        byte_size: u64,
        kind: MemoryKind,
        initial_state: ResourceState,
    ) -> Result<Arc<GpuResource>, GpuError> {
        let allocation = self.driver.create_buffer(&BufferDesc {
            label,
            byte_size,
            kind,
        })?;
        Ok(Arc::new(GpuResource::new(allocation, initial_state)))
    }
}
