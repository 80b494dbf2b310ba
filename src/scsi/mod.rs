//! SCSI transport (C1).
//!
//! `scsi_run` issues one CDB with an optional data buffer and classifies
//! the result as [`Outcome::Ok`], [`Outcome::Sense`], [`Outcome::Busy`],
//! [`Outcome::Check`] or [`Outcome::Error`]. Built on top of the raw
//! libsgutils2 pass-through in [`sgutils2`], which already does the hard
//! part (CDB validation, sense decoding); this module adds the
//! TEST UNIT READY polling contract and the Outcome classification the
//! rest of the device stack is written against.

pub mod sense;
pub mod sgutils2;

use std::os::unix::io::AsRawFd;
use std::thread::sleep;
use std::time::Duration;

use self::sense::{interpret, DeviceKind, SenseAction};
use self::sgutils2::{ScsiError, SenseInfo, SgRaw};

/// Direction of the data phase of a CDB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
    None,
}

/// Classification of a completed `scsi_run` call.
#[derive(Debug)]
pub enum Outcome {
    /// Command succeeded, no sense.
    Ok(Vec<u8>),
    /// Completed with sense data; caller must consult C2.
    Sense(SenseInfo),
    /// Transient, caller should retry.
    Busy,
    /// Transient, caller should retry.
    Check,
    /// Transport-level failure, fatal to this call.
    Error(String),
}

/// Bounded TEST UNIT READY polling budget (§5): up to `MAX_TUR_RETRIES`
/// attempts with 1-second backoff between them, i.e. ~200s worst case
/// for an `open`-time wait. `scsi_run` never blocks indefinitely.
pub const MAX_TUR_RETRIES: u32 = 200;

fn test_unit_ready<F: AsRawFd>(file: &mut F) -> Result<(), ScsiError> {
    let mut sg_raw = SgRaw::new(file, 0)?;
    sg_raw.set_timeout(30);
    let cmd = [0x00, 0, 0, 0, 0, 0]; // TEST UNIT READY
    sg_raw.do_command(&cmd)?;
    Ok(())
}

/// Poll TEST UNIT READY up to [`MAX_TUR_RETRIES`] times, with a 1-second
/// backoff between attempts, consulting the sense interpreter on every
/// SENSE result. Returns once the unit is ready, or `Error` if it never
/// clears within budget.
pub fn wait_unit_ready<F: AsRawFd>(
    file: &mut F,
    ident: &str,
    kind: DeviceKind,
) -> Result<(), String> {
    for attempt in 0..MAX_TUR_RETRIES {
        match test_unit_ready(file) {
            Ok(()) => return Ok(()),
            Err(ScsiError::Sense(sense)) => {
                match interpret(ident, kind, &sense) {
                    SenseAction::Retry | SenseAction::Ies | SenseAction::No => {
                        if attempt + 1 == MAX_TUR_RETRIES {
                            return Err(format!(
                                "TEST UNIT READY did not clear within budget: {}",
                                sense
                            ));
                        }
                        sleep(Duration::from_secs(1));
                    }
                    SenseAction::Abort => return Err(format!("TEST UNIT READY aborted: {}", sense)),
                    other => return Err(format!("TEST UNIT READY: unexpected action {:?}", other)),
                }
            }
            Err(err) => return Err(format!("TEST UNIT READY transport error: {}", err)),
        }
    }
    Err("TEST UNIT READY did not clear within budget".to_string())
}

/// Issue a CDB with an optional data-in buffer, classifying the
/// outcome. Before issuing a command that requires the unit to be
/// ready, callers are expected to have called [`wait_unit_ready`]
/// themselves; `scsi_run` does not implicitly poll on every call, only
/// on `open` per the original design (§4.1, §5).
///
/// CDB length is the caller's responsibility; a mismatch against the
/// command's opcode table entry is a programming error (§4.1).
pub fn scsi_run<F: AsRawFd>(
    file: &mut F,
    direction: Direction,
    cdb: &[u8],
    buffer_size: usize,
) -> Outcome {
    let mut sg_raw = match SgRaw::new(file, buffer_size) {
        Ok(sg) => sg,
        Err(err) => return Outcome::Error(err.to_string()),
    };

    let result = match direction {
        Direction::In | Direction::None => sg_raw.do_command(cdb).map(|d| d.to_vec()),
        Direction::Out => {
            // Out-direction callers must supply their own page-aligned
            // buffer via do_out_command; scsi_run only classifies the
            // in/none-direction happy path generically.
            return Outcome::Error(
                "scsi_run: Direction::Out requires do_out_command".to_string(),
            );
        }
    };

    match result {
        Ok(data) => Outcome::Ok(data),
        Err(ScsiError::Sense(sense)) => Outcome::Sense(sense),
        Err(ScsiError::Error(err)) => {
            let msg = err.to_string();
            if msg.contains("timeout") {
                Outcome::Busy
            } else {
                Outcome::Error(msg)
            }
        }
    }
}
