//! Device and kernel error types.

use crate::zone::ZoneOverflow;

/// Which device queue an operation was issued on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    /// Massively parallel queue for lattice kernels.
    Gpu,
    /// Smaller parallel queue for per-particle kernels.
    Cpu,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueKind::Gpu => write!(f, "GPU"),
            QueueKind::Cpu => write!(f, "CPU"),
        }
    }
}

/// Failure while executing a kernel body.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    /// The dispatch index space does not suit the kernel.
    #[error("invalid index space {range}: {reason}")]
    InvalidRange {
        /// Rendered index space
        range: String,
        /// What is wrong with it
        reason: String,
    },

    /// A bound buffer is shorter than the parameter blocks imply.
    #[error("buffer `{tag}` holds {len} elements, kernel needs {needed}")]
    BufferTooSmall {
        /// Buffer tag
        tag: &'static str,
        /// Elements present
        len: usize,
        /// Elements required
        needed: usize,
    },

    /// Write through a read-only binding.
    #[error("buffer `{tag}` is read-only")]
    ReadOnly {
        /// Buffer tag
        tag: &'static str,
    },

    /// Source and destination bound to the same buffer.
    #[error("buffer `{tag}` is bound as both source and destination")]
    Aliased {
        /// Buffer tag
        tag: &'static str,
    },

    /// An earlier panic left the buffer lock poisoned.
    #[error("buffer `{tag}` lock is poisoned")]
    Poisoned {
        /// Buffer tag
        tag: &'static str,
    },

    /// Zone rebuild ran out of membership slots.
    #[error(transparent)]
    ZoneOverflow(#[from] ZoneOverflow),
}

/// Fatal device-facing failure. Nothing here is retried.
#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    /// A buffer could not be created.
    #[error("allocating `{tag}` ({bytes} bytes) failed: {reason}")]
    Allocation {
        /// Buffer tag
        tag: String,
        /// Requested size
        bytes: u64,
        /// Budget, limit or allocator message
        reason: String,
    },

    /// Host write or map of a read-only buffer.
    #[error("buffer `{tag}` is read-only")]
    ReadOnly {
        /// Buffer tag
        tag: String,
    },

    /// Host/device copy failed.
    #[error("transfer on `{tag}` failed: {reason}")]
    Transfer {
        /// Buffer tag
        tag: String,
        /// Why
        reason: String,
    },

    /// A kernel was rejected at enqueue or failed while running.
    #[error("kernel `{kernel}` failed on the {queue} queue: {source}")]
    Dispatch {
        /// Kernel name
        kernel: &'static str,
        /// Queue it ran on
        queue: QueueKind,
        /// Underlying kernel failure
        #[source]
        source: KernelError,
    },

    /// The queue's worker thread has exited.
    #[error("{queue} queue worker is gone")]
    QueueLost {
        /// Queue that lost its worker
        queue: QueueKind,
    },
}
