//! Fenced command queues and the per-class queue manager.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::driver::{DriverCommandList, DriverDevice, DriverFence, DriverQueue};
use crate::error::GpuError;
use crate::fence::{FenceValue, QueueClass};

/// One hardware queue plus the fence tracking its completed work.
///
/// Recording stays single-threaded elsewhere, but any thread may submit to or
/// wait on a queue: signal issuance is serialized by one mutex, CPU blocking
/// on the shared OS wait primitive by another.
#[derive(Debug)]
pub struct CommandQueue {
    class: QueueClass,
    queue: Box<dyn DriverQueue>,
    fence: Arc<dyn DriverFence>,
    /// Next raw fence value to issue; the lock also serializes the
    /// signal-then-increment pair.
    next_value: Mutex<u64>,
    /// Cached last-known completed raw value; refreshed lazily.
    last_completed: AtomicU64,
    wait_lock: Mutex<()>,
}

impl CommandQueue {
    pub fn new(device: &dyn DriverDevice, class: QueueClass) -> Result<Self, GpuError> {
        let queue = device.create_queue(class)?;
        let initial = FenceValue::new(class, 0).raw();
        let fence = device.create_fence(initial)?;
        Ok(Self {
            class,
            queue,
            fence,
            next_value: Mutex::new(initial + 1),
            last_completed: AtomicU64::new(initial),
            wait_lock: Mutex::new(()),
        })
    }

    pub fn class(&self) -> QueueClass {
        self.class
    }

    /// Signals the queue's fence without executing anything, recording a
    /// submission point.
    pub fn signal(&self) -> Result<FenceValue, GpuError> {
        let mut next = self.next_value.lock().unwrap();
        self.queue.signal(&self.fence, *next)?;
        let value = FenceValue::from_raw(*next);
        *next += 1;
        Ok(value)
    }

    /// The highest fence value issued so far; completion of this value means
    /// the queue is idle.
    pub fn last_issued(&self) -> FenceValue {
        FenceValue::from_raw(*self.next_value.lock().unwrap() - 1)
    }

    /// Asks the driver for the current completed value and refreshes the
    /// cache.
    pub fn poll_completed_value(&self) -> u64 {
        let completed = self.fence.completed_value();
        self.last_completed.fetch_max(completed, Ordering::AcqRel);
        self.last_completed.load(Ordering::Acquire)
    }

    /// Whether `value` has completed. Only polls the driver when the cached
    /// completed value is insufficient.
    pub fn is_complete(&self, value: FenceValue) -> bool {
        if value.raw() > self.last_completed.load(Ordering::Acquire) {
            self.poll_completed_value();
        }
        value.raw() <= self.last_completed.load(Ordering::Acquire)
    }

    /// Makes this queue wait GPU-side until `value` completes on `other`.
    pub fn wait_gpu(&self, other: &CommandQueue, value: FenceValue) -> Result<(), GpuError> {
        self.queue.wait_gpu(&other.fence, value.raw())
    }

    /// Makes this queue wait GPU-side for everything `other` has issued.
    pub fn wait_gpu_idle(&self, other: &CommandQueue) -> Result<(), GpuError> {
        self.wait_gpu(other, other.last_issued())
    }

    /// Blocks the CPU until `value` completes. Returns immediately when the
    /// value is already complete.
    pub fn block_until(&self, value: FenceValue) {
        if self.is_complete(value) {
            return;
        }
        let _wait = self.wait_lock.lock().unwrap();
        self.fence.wait_until(value.raw());
        self.last_completed.fetch_max(value.raw(), Ordering::AcqRel);
    }

    /// Blocks the CPU until the queue has no work in flight.
    pub fn block_until_idle(&self) {
        self.block_until(self.last_issued());
    }

    /// Closes `list`, submits it and signals. A close failure is recoverable:
    /// it is logged and returned so the caller can skip the submission.
    /// Submission failure itself means the device is lost.
    pub fn execute_command_list(
        &self,
        list: &mut dyn DriverCommandList,
    ) -> Result<FenceValue, GpuError> {
        debug_assert_eq!(list.class(), self.class);
        if let Err(err) = list.close() {
            log::error!("close of {} command list failed: {err}", self.class.name());
            return Err(err);
        }
        self.queue.execute(list)?;
        self.signal()
    }
}

/// Owns the graphics, compute and copy queues and routes fence values back to
/// the queue that issued them.
#[derive(Debug)]
pub struct QueueManager {
    graphics: CommandQueue,
    compute: CommandQueue,
    copy: CommandQueue,
}

impl QueueManager {
    pub fn new(device: &dyn DriverDevice) -> Result<Self, GpuError> {
        Ok(Self {
            graphics: CommandQueue::new(device, QueueClass::Graphics)?,
            compute: CommandQueue::new(device, QueueClass::Compute)?,
            copy: CommandQueue::new(device, QueueClass::Copy)?,
        })
    }

    pub fn graphics(&self) -> &CommandQueue {
        &self.graphics
    }

    pub fn compute(&self) -> &CommandQueue {
        &self.compute
    }

    pub fn copy(&self) -> &CommandQueue {
        &self.copy
    }

    pub fn queue(&self, class: QueueClass) -> &CommandQueue {
        match class {
            QueueClass::Graphics => &self.graphics,
            QueueClass::Compute => &self.compute,
            QueueClass::Copy => &self.copy,
        }
    }

    /// Resolves the queue that issued `value` from its class tag, so a caller
    /// holding only a fence value can wait on it correctly.
    pub fn route_by_fence_tag(&self, value: FenceValue) -> &CommandQueue {
        match value.class() {
            Some(class) => self.queue(class),
            None => {
                log::error!("fence value {value:?} carries an unknown queue tag");
                panic!("fence value with unknown queue tag");
            }
        }
    }

    pub fn is_complete(&self, value: FenceValue) -> bool {
        self.route_by_fence_tag(value).is_complete(value)
    }

    pub fn block_until(&self, value: FenceValue) {
        self.route_by_fence_tag(value).block_until(value);
    }

    /// Blocks until every queue is idle, forfeiting all CPU/GPU overlap. Only
    /// worth it around destructive operations such as a surface resize.
    pub fn wait_for_all_idle(&self) {
        self.graphics.block_until_idle();
        self.compute.block_until_idle();
        self.copy.block_until_idle();
    }
}
