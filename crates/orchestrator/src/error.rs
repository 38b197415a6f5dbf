//! Top-level error taxonomy of a run.

use crate::config::ConfigError;
use lb_kernel::stream_map::IndexOverflow;
use lb_kernel::DeviceError;

/// Anything that ends a run early. None of these are retried.
#[derive(Debug, thiserror::Error)]
pub enum SimError {
    /// Rejected before any device resource is touched.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The lattice cannot be addressed with 32-bit device indices.
    #[error(transparent)]
    Layout(#[from] IndexOverflow),

    /// Allocation, transfer or dispatch failure.
    #[error(transparent)]
    Device(#[from] DeviceError),

    /// The sampling/output bridge could not write.
    #[error("output failed: {0}")]
    Output(#[from] std::io::Error),
}
