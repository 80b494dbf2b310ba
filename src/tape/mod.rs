//! Tape primitives (C3).
//!
//! Defines the seven operations every backend in [`crate::device`] must
//! provide on a single open handle — `rewind`, `fsf`, `bsf`, `weof`,
//! `eject`, `status`, `read`, `write` — plus the generic-tape semantics
//! layer (EOF latching, write-after-EOM, read-only enforcement) wrapped
//! around the raw per-op SCSI commands in [`sg_tape`].

pub mod linux_list_drives;
pub mod real_tape;
pub mod sg_tape;
pub mod tape_alert_flags;

use crate::error::DeviceError;

/// Validity-tagged status field: callers must ignore `value` when
/// `valid` is false (§4.3 "AmMtStatus fields carry per-field validity
/// bits").
#[derive(Debug, Clone, Copy, Default)]
pub struct MaybeValid<T: Copy + Default> {
    pub value: T,
    pub valid: bool,
}

impl<T: Copy + Default> MaybeValid<T> {
    pub fn some(value: T) -> Self {
        Self { value, valid: true }
    }

    pub fn none() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<T> {
        self.valid.then_some(self.value)
    }
}

/// Kind of SCSI-generic tape device discovered on the local host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    Tape,
    Changer,
}

/// A tape or changer device found under `/sys/class/scsi_generic`.
#[derive(Debug, Clone)]
pub struct TapeDeviceInfo {
    pub kind: DeviceKind,
    pub path: String,
    pub serial: String,
    pub vendor: String,
    pub model: String,
    pub major: u32,
    pub minor: u32,
}

/// Best-effort vendor/model/serial lookup for a device path; any field
/// may be unknown.
#[derive(Debug, Clone, Default)]
pub struct OptionalDeviceIdentification {
    pub vendor: Option<String>,
    pub model: Option<String>,
    pub serial: Option<String>,
}

/// Generic tape status, as returned by `status` (C3).
#[derive(Debug, Clone, Copy, Default)]
pub struct AmMtStatus {
    pub file_number: MaybeValid<u64>,
    pub block_number: MaybeValid<u64>,
    pub at_bot: MaybeValid<bool>,
    pub at_eof: MaybeValid<bool>,
    pub at_eom: MaybeValid<bool>,
    pub online: MaybeValid<bool>,
    pub write_protected: MaybeValid<bool>,
}

/// The C3 tape-primitive contract, implemented by every C4 backend.
///
/// Generic-tape semantics (§4.3), enforced identically by every
/// implementer:
/// - Write on a read-only handle fails with [`DeviceError::Access`].
/// - After a read returns 0, EOF latches until `rewind`/`fsf`; a second
///   read returns an error (explicit EOF guard).
/// - After EOM, EOF does not latch; writes fail with `EomReached`.
/// - `weof(0)` is a no-op that succeeds; negative counts are
///   `InvalidArg`.
pub trait TapeOps {
    fn rewind(&mut self) -> Result<(), DeviceError>;
    fn fsf(&mut self, count: i64) -> Result<(), DeviceError>;
    fn bsf(&mut self, count: i64) -> Result<(), DeviceError>;
    fn weof(&mut self, count: i64) -> Result<(), DeviceError>;
    fn eject(&mut self) -> Result<(), DeviceError>;
    fn status(&mut self) -> Result<AmMtStatus, DeviceError>;
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError>;
    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError>;
}

/// EOF-latch state machine shared by every [`TapeOps`] implementer.
///
/// Tracks only the cross-cutting invariants of §4.3 that are not
/// specific to any one backend's hardware/on-disk representation:
/// read-after-EOF guarding and read-only enforcement. Backends embed
/// this and delegate the actual I/O to their own raw primitives.
#[derive(Debug, Default)]
pub struct EofLatch {
    pub at_eof: bool,
    pub read_only: bool,
}

impl EofLatch {
    pub fn reset(&mut self) {
        self.at_eof = false;
    }

    /// Call before every read; returns an explicit error if EOF is
    /// already latched.
    pub fn guard_read(&self) -> Result<(), DeviceError> {
        if self.at_eof {
            return Err(DeviceError::Device(
                "read after latched EOF (rewind or fsf first)".into(),
            ));
        }
        Ok(())
    }

    /// Call on a read that returned 0 bytes: latches EOF.
    pub fn latch_eof(&mut self) {
        self.at_eof = true;
    }

    /// Call before every write; returns `Access` on a read-only handle.
    pub fn guard_write(&self) -> Result<(), DeviceError> {
        if self.read_only {
            return Err(DeviceError::Access("device opened read-only".into()));
        }
        Ok(())
    }

    /// Validate a `weof` count: negative is `InvalidArg`, zero is a
    /// no-op the caller should short-circuit on.
    pub fn check_weof_count(count: i64) -> Result<(), DeviceError> {
        if count < 0 {
            return Err(DeviceError::InvalidArg(format!(
                "weof: negative count {count}"
            )));
        }
        Ok(())
    }
}
