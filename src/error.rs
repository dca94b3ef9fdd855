use thiserror::Error;

#[derive(Error, Debug)]
pub enum V3dError {
    #[error("I/O Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Out of memory")]
    OutOfMemory,

    #[error("Operation not permitted")]
    PermissionDenied,

    #[error("Unknown object handle: {0}")]
    NotFound(u32),

    #[error("Interrupted while waiting for the device lock")]
    Interrupted,

    #[error("Invariant violated: {0}")]
    Invariant(String),
}

impl V3dError {
    /// The positive errno reported through the ioctl interface.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            Self::InvalidArgument(_) => libc::EINVAL,
            Self::OutOfMemory => libc::ENOMEM,
            Self::PermissionDenied => libc::EPERM,
            Self::NotFound(_) => libc::ENOENT,
            Self::Interrupted => libc::EINTR,
            Self::Invariant(_) => libc::EFAULT,
        }
    }

    /// Whether the caller should simply retry the call.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Interrupted)
    }

    /// Logs and builds an [`V3dError::Invariant`].
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        log::error!("invariant violated: {msg}");
        Self::Invariant(msg)
    }
}

// A convenient alias
pub type V3dResult<T> = Result<T, V3dError>;
