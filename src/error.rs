//! Error taxonomy shared by every component.
//!
//! `thiserror` enums wrapping an I/O or sense cause, generalized to the
//! whole device stack so RAIT/file-tape/changer code shares one vocabulary
//! instead of ad hoc `anyhow::Error` strings.

use std::fmt;

/// Exit codes used at the process boundary (§6.5).
pub const EXIT_SUCCESS: i32 = 0;
pub const EXIT_RECOVERABLE: i32 = 1;
pub const EXIT_FATAL: i32 = 2;

#[derive(thiserror::Error, Debug)]
pub enum DeviceError {
    /// I/O or SCSI-transport failure, device-specific.
    #[error("device error: {0}")]
    Device(String),

    /// Label mismatch or corruption.
    #[error("volume error: {0}")]
    Volume(String),

    /// First read of a volume did not yield a TAPESTART header.
    #[error("volume not labeled")]
    VolumeUnlabeled,

    /// Read returned fewer bytes than the record size; data may still
    /// be usable at the caller's discretion.
    #[error("short read: got {got} of {expected} bytes")]
    SuccessButShort { got: usize, expected: usize },

    /// RAIT parity check failed while the set was in Complete mode.
    #[error("RAIT parity mismatch")]
    XorMismatch,

    /// A write would exceed the volume boundary.
    #[error("end of media reached")]
    EomReached,

    #[error("invalid argument: {0}")]
    InvalidArg(String),

    #[error("access denied: {0}")]
    Access(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Invariant violation. Propagates to exit code 2 at the process
    /// boundary; never silently recovered.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeviceError {
    /// Exit code this error would map to if it escaped to the process
    /// boundary unhandled (§6.5).
    pub fn exit_code(&self) -> i32 {
        match self {
            DeviceError::Fatal(_) => EXIT_FATAL,
            _ => EXIT_RECOVERABLE,
        }
    }
}

/// Per-device error/status surface: every failed call updates both of
/// these on the owning handle; callers decide whether to retry, skip,
/// or abort (§7 "User-visible behaviour").
#[derive(Debug, Default, Clone)]
pub struct DeviceStatus {
    pub last_error: Option<String>,
    pub flags: DeviceStatusFlags,
}

impl DeviceStatus {
    pub fn record(&mut self, err: &DeviceError) {
        self.last_error = Some(err.to_string());
        self.flags.insert(match err {
            DeviceError::EomReached => DeviceStatusFlags::EOM,
            DeviceError::VolumeUnlabeled | DeviceError::Volume(_) => {
                DeviceStatusFlags::VOLUME_ERROR
            }
            DeviceError::Fatal(_) => DeviceStatusFlags::FATAL,
            _ => DeviceStatusFlags::DEVICE_ERROR,
        });
    }
}

bitflags::bitflags! {
    #[derive(Default)]
    pub struct DeviceStatusFlags: u8 {
        const DEVICE_ERROR = 0b0000_0001;
        const VOLUME_ERROR = 0b0000_0010;
        const EOM          = 0b0000_0100;
        const FATAL        = 0b0000_1000;
    }
}

/// A `ChgExit`-class failure in the changer driver: unknown identity,
/// missing critical mode page, or an invariant breach. The original
/// design calls `process::exit(2)` directly; here it is a recoverable
/// error type so the outer caller decides whether to exit.
#[derive(thiserror::Error, Debug)]
#[error("changer exit: {0}")]
pub struct ChgExit(pub String);

impl ChgExit {
    pub fn exit_code(&self) -> i32 {
        EXIT_FATAL
    }
}

impl fmt::Display for DeviceStatusFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010b}", self.bits())
    }
}
