use core::fmt;

/// Kernel error kinds surfaced by the process and VM managers.
///
/// Syscall wrappers translate these into POSIX errno values; inside the
/// kernel only the kind matters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernError {
    /// Null, misaligned or out-of-range address/size, bad flag combination.
    InvalidArg,
    /// The pid does not name a live process.
    NoSuchProcess,
    /// The caller has no child (or no child matching the wait request).
    NoSuchChild,
    /// Capability or relationship check failed.
    PermissionDenied,
    /// PCB free list exhausted, region or page allocation failed.
    NoMemory,
    /// Address range already mapped, or the requested pid/gid is taken.
    Busy,
    /// The request combines flags this build does not implement.
    NotSupported,
    /// WNOHANG was set and no child has exited yet.
    WouldBlock,
    /// A signal arrived while blocked in wait.
    Interrupted,
}

impl fmt::Display for KernError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            KernError::InvalidArg => write!(f, "Invalid argument"),
            KernError::NoSuchProcess => write!(f, "No such process"),
            KernError::NoSuchChild => write!(f, "No child processes"),
            KernError::PermissionDenied => write!(f, "Operation not permitted"),
            KernError::NoMemory => write!(f, "Out of memory"),
            KernError::Busy => write!(f, "Resource busy"),
            KernError::NotSupported => write!(f, "Operation not supported"),
            KernError::WouldBlock => write!(f, "No child has exited yet"),
            KernError::Interrupted => write!(f, "Interrupted system call"),
        }
    }
}

pub type KResult<T> = Result<T, KernError>;
