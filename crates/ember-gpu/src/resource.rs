//! GPU resources and their usage-state tracking.

use std::fmt;
use std::sync::{Arc, Mutex};

use crate::driver::{AllocationId, DriverAllocation};

/// Usage state of a GPU resource, portable across explicit driver APIs.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ResourceState {
    Common,
    VertexOrConstantBuffer,
    IndexBuffer,
    RenderTarget,
    UnorderedAccess,
    DepthWrite,
    DepthRead,
    ShaderResource,
    CopyDest,
    CopySource,
    GenericRead,
    Present,
}

impl ResourceState {
    /// States that allow simultaneous reads and writes and therefore need an
    /// ordering barrier even without a state change.
    pub fn is_write_hazard(self) -> bool {
        matches!(self, ResourceState::UnorderedAccess)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BarrierKind {
    /// Declares a usage-state change so the driver can insert the required
    /// hardware synchronization.
    Transition {
        before: ResourceState,
        after: ResourceState,
    },
    /// Orders accesses to a read/write-hazard resource without changing its
    /// state.
    Execution,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Barrier {
    pub resource: AllocationId,
    pub kind: BarrierKind,
}

/// A GPU memory allocation plus its last-known usage state.
///
/// [`GpuResource::request_transition`] is the only code path that mutates the
/// state, so the `before` state recorded in any emitted barrier always equals
/// the state stored when the barrier was computed.
pub struct GpuResource {
    allocation: Arc<dyn DriverAllocation>,
    state: Mutex<ResourceState>,
}

impl GpuResource {
    pub fn new(allocation: Arc<dyn DriverAllocation>, initial_state: ResourceState) -> Self {
        Self {
            allocation,
            state: Mutex::new(initial_state),
        }
    }

    pub fn id(&self) -> AllocationId {
        self.allocation.id()
    }

    pub fn byte_size(&self) -> u64 {
        self.allocation.byte_size()
    }

    pub fn gpu_address(&self) -> u64 {
        self.allocation.gpu_address()
    }

    pub fn allocation(&self) -> &Arc<dyn DriverAllocation> {
        &self.allocation
    }

    pub fn usage_state(&self) -> ResourceState {
        *self.state.lock().unwrap()
    }

    /// Computes the minimal barrier needed to move this resource to
    /// `new_state` and updates the stored state in the same step.
    ///
    /// Returns `None` when the resource is already in a non-hazard
    /// `new_state`; an execution barrier when it is already in a hazard
    /// state; a transition barrier otherwise.
    #[must_use]
    pub fn request_transition(&self, new_state: ResourceState) -> Option<Barrier> {
        let mut state = self.state.lock().unwrap();
        if *state != new_state {
            let barrier = Barrier {
                resource: self.allocation.id(),
                kind: BarrierKind::Transition {
                    before: *state,
                    after: new_state,
                },
            };
            *state = new_state;
            Some(barrier)
        } else if new_state.is_write_hazard() {
            Some(Barrier {
                resource: self.allocation.id(),
                kind: BarrierKind::Execution,
            })
        } else {
            None
        }
    }
}

impl fmt::Debug for GpuResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuResource")
            .field("allocation", &self.allocation.id())
            .field("state", &self.usage_state())
            .finish()
    }
}
