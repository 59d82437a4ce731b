#![allow(dead_code)]

use std::sync::Arc;

use ember_gpu::driver::software::{CompletionMode, SoftwareDevice};
use ember_gpu::driver::DriverDevice;
use ember_gpu::{DeviceContext, GpuConfig, GpuError, GpuResource, Presentable, ResourceState};

pub fn device_and_context(
    mode: CompletionMode,
    config: GpuConfig,
) -> (Arc<SoftwareDevice>, DeviceContext) {
    let device = SoftwareDevice::new(mode);
    let driver: Arc<dyn DriverDevice> = device.clone();
    let context = DeviceContext::new(driver, config).expect("device context");
    (device, context)
}

pub struct TestSurface {
    pub resource: Arc<GpuResource>,
    pub presents: u32,
}

impl TestSurface {
    pub fn new(context: &DeviceContext, byte_size: u64) -> Self {
        let resource = context
            .create_buffer_resource(
                Some("test swapchain image"),
                byte_size,
                ember_gpu::driver::MemoryKind::DeviceLocal,
                ResourceState::Present,
            )
            .expect("surface resource");
        Self {
            resource,
            presents: 0,
        }
    }
}

impl Presentable for TestSurface {
    fn backing_resource(&self) -> &Arc<GpuResource> {
        &self.resource
    }

    fn present(&mut self) -> Result<(), GpuError> {
        self.presents += 1;
        Ok(())
    }
}
