use thiserror::Error;

use crate::driver::AllocationId;

/// Errors surfaced by the submission core.
///
/// Configuration-sizing problems (exhausted heaps, missing root parameters)
/// are programmer errors and panic instead of returning a variant; driver
/// failures propagate through this enum so the caller can decide whether the
/// device is still usable.
#[derive(Debug, Error)]
pub enum GpuError {
    #[error("invalid configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("driver call failed: {0}")]
    Driver(String),
    #[error("command list close failed: {0}")]
    CommandListClose(String),
    #[error("allocation {0:?} is not CPU-mapped")]
    NotCpuMapped(AllocationId),
    #[error("device lost")]
    DeviceLost,
}
