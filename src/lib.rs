//! Tape/changer device core: SCSI transport, sense interpretation,
//! virtual-tape dispatch (real tape / null / file / RAIT / raw handle),
//! the medium-changer driver and element model, and the handful of
//! collaborators built directly on top of the device layer (dump-file
//! headers, the restore path, the tapetype probe, device properties).
//!
//! # Layout
//!
//! - [`scsi`] — SCSI transport (`scsi_run`, C1) and the sense
//!   interpreter (C2).
//! - [`tape`] — the C3 tape-primitive contract ([`tape::TapeOps`]) and
//!   the real-SCSI-tape implementation of it ([`tape::real_tape`],
//!   [`tape::sg_tape`]).
//! - [`block`] — fixed-size block framing shared by the SCSI-tape and
//!   RAIT-child wire format.
//! - [`device`] — virtual-tape dispatch (C4): the closed [`device::Backend`]
//!   enum, the [`device::file_tape`] and [`device::rait`] backends, and
//!   the process-global handle registry.
//! - [`header`] — dump-file headers (§3.2) and the C7 label façade
//!   (`rdlabel`/`wrlabel`/`wrendmark`).
//! - [`changer`] — the medium-changer SCSI driver (C8), its element
//!   model (C9) and per-product quirk dispatch.
//! - [`restore`] — sequential dump-file iteration with match-filtering
//!   (C10).
//! - [`tapetype`] — capacity/speed/compression probe (C11).
//! - [`property`] — typed named device properties with surety/source
//!   metadata (C12).
//! - [`error`] — the shared error taxonomy and process exit codes (§7).

pub mod block;
pub mod changer;
pub mod device;
pub mod error;
pub mod header;
pub mod property;
pub mod restore;
pub mod scsi;
pub mod tape;
pub mod tapetype;

pub use device::{DeviceHandle, DeviceHandleId};
pub use error::{ChgExit, DeviceError, DeviceStatus, DeviceStatusFlags};
