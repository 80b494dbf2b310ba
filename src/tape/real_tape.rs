//! Wraps [`super::sg_tape::SgTape`] with the generic C3 semantics layer
//! (EOF latching, read-only enforcement) so it can serve as the `tape:`
//! backend in [`crate::device`].

use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use crate::block::BlockReadError;
use crate::error::DeviceError;

use super::sg_tape::SgTape;
use super::{AmMtStatus, EofLatch, TapeOps};

pub struct RealTape {
    sg_tape: SgTape,
    eof: EofLatch,
}

impl RealTape {
    pub fn open<P: AsRef<Path>>(path: P, read_only: bool) -> Result<Self, DeviceError> {
        let file = OpenOptions::new()
            .read(true)
            .write(!read_only)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(DeviceError::Io)?;

        let sg_tape = SgTape::new(file).map_err(|err| DeviceError::Device(err.to_string()))?;

        Ok(Self {
            sg_tape,
            eof: EofLatch {
                at_eof: false,
                read_only,
            },
        })
    }
}

impl TapeOps for RealTape {
    fn rewind(&mut self) -> Result<(), DeviceError> {
        self.sg_tape
            .rewind()
            .map_err(|err| DeviceError::Device(err.to_string()))?;
        self.eof.reset();
        Ok(())
    }

    fn fsf(&mut self, count: i64) -> Result<(), DeviceError> {
        self.sg_tape
            .space_filemarks(count as isize)
            .map_err(|err| DeviceError::Device(err.to_string()))?;
        self.eof.reset();
        Ok(())
    }

    fn bsf(&mut self, count: i64) -> Result<(), DeviceError> {
        self.sg_tape
            .space_filemarks(-(count as isize))
            .map_err(|err| DeviceError::Device(err.to_string()))?;
        self.eof.reset();
        Ok(())
    }

    fn weof(&mut self, count: i64) -> Result<(), DeviceError> {
        EofLatch::check_weof_count(count)?;
        self.eof.guard_write()?;
        if count == 0 {
            return Ok(());
        }
        self.sg_tape
            .write_filemarks(count as usize, false)
            .map_err(DeviceError::Io)?;
        Ok(())
    }

    fn eject(&mut self) -> Result<(), DeviceError> {
        self.sg_tape
            .eject()
            .map_err(|err| DeviceError::Device(err.to_string()))
    }

    fn status(&mut self) -> Result<AmMtStatus, DeviceError> {
        let status = self
            .sg_tape
            .current_position_status()
            .map_err(|err| DeviceError::Device(err.to_string()))?;
        Ok(status.unwrap_or_default())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.eof.guard_read()?;
        match self.sg_tape.read_block(buf) {
            Ok(n) => Ok(n),
            Err(BlockReadError::EndOfFile) => {
                self.eof.latch_eof();
                Ok(0)
            }
            Err(BlockReadError::EndOfStream) => {
                self.eof.latch_eof();
                Ok(0)
            }
            Err(BlockReadError::Error(err)) => Err(DeviceError::Io(err)),
        }
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        self.eof.guard_write()?;
        let leom = self.sg_tape.write_block(buf).map_err(DeviceError::Io)?;
        if leom {
            return Err(DeviceError::EomReached);
        }
        Ok(buf.len())
    }
}
