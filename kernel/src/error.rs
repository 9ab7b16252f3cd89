//! Kernel error types.
//!
//! Failures are reported to the direct caller; there is no cross-subsystem
//! error routing. Unrecoverable invariant violations panic (the panic
//! handler halts forever); diagnostics-only conditions are logged and do
//! not produce an error value.

use core::fmt;

/// Main kernel error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// Memory-related errors
    OutOfMemory {
        requested: usize,
    },
    InvalidAddress {
        addr: u64,
    },
    UnmappedMemory {
        addr: u64,
    },

    /// Scheduler-related errors
    SchedulerError(SchedError),

    /// Network-related errors
    NetError(NetError),

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    ResourceExhausted {
        resource: &'static str,
    },
    AlreadyExists {
        resource: &'static str,
        id: u64,
    },
    NotFound {
        resource: &'static str,
        id: u64,
    },
    /// Subsystem not initialized (called before init())
    NotInitialized {
        subsystem: &'static str,
    },
}

/// Scheduler-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    InvalidCpuId { cpu: usize },
    TaskNotFound { tid: u64 },
    QueueEmpty,
}

/// Network-specific errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetError {
    /// Socket operation attempted from the wrong TCP state
    InvalidSocketState,
    /// Local port is already bound or listening
    PortInUse { port: u16 },
    /// Socket handle does not name a live socket
    BadSocket,
    /// No network device registered
    NoDevice,
    /// Destination hardware address not yet resolved
    ArpPending,
    /// Frame or header failed structural validation
    Malformed,
}

/// Result type alias for kernel operations
pub type KernelResult<T> = Result<T, KernelError>;

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory { requested } => {
                write!(f, "Out of memory: requested {} bytes", requested)
            }
            Self::InvalidAddress { addr } => write!(f, "Invalid address: {:#x}", addr),
            Self::UnmappedMemory { addr } => write!(f, "Unmapped memory at {:#x}", addr),
            Self::SchedulerError(e) => write!(f, "Scheduler error: {:?}", e),
            Self::NetError(e) => write!(f, "Network error: {:?}", e),
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
            Self::AlreadyExists { resource, id } => {
                write!(f, "{} with id {} already exists", resource, id)
            }
            Self::NotFound { resource, id } => write!(f, "{} with id {} not found", resource, id),
            Self::NotInitialized { subsystem } => {
                write!(f, "Subsystem not initialized: {}", subsystem)
            }
        }
    }
}

impl From<SchedError> for KernelError {
    fn from(err: SchedError) -> Self {
        Self::SchedulerError(err)
    }
}

impl From<NetError> for KernelError {
    fn from(err: NetError) -> Self {
        Self::NetError(err)
    }
}
