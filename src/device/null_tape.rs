//! Null backend (C4, §6.1 `null:`): a sink that discards writes and
//! reports immediate EOF on read. Useful for throughput testing and as
//! the reserved `/dev/null` stand-in referenced by the file-tape
//! layout (§6.2).

use crate::error::DeviceError;
use crate::tape::{AmMtStatus, EofLatch, MaybeValid, TapeOps};

pub struct NullTape {
    eof: EofLatch,
    online: bool,
}

impl NullTape {
    pub fn open(read_only: bool) -> Self {
        Self {
            eof: EofLatch {
                at_eof: false,
                read_only,
            },
            online: true,
        }
    }
}

impl TapeOps for NullTape {
    fn rewind(&mut self) -> Result<(), DeviceError> {
        self.eof.reset();
        Ok(())
    }

    fn fsf(&mut self, _count: i64) -> Result<(), DeviceError> {
        Ok(())
    }

    fn bsf(&mut self, _count: i64) -> Result<(), DeviceError> {
        Ok(())
    }

    fn weof(&mut self, count: i64) -> Result<(), DeviceError> {
        EofLatch::check_weof_count(count)?;
        Ok(())
    }

    fn eject(&mut self) -> Result<(), DeviceError> {
        self.online = false;
        Ok(())
    }

    fn status(&mut self) -> Result<AmMtStatus, DeviceError> {
        Ok(AmMtStatus {
            file_number: MaybeValid::some(0),
            block_number: MaybeValid::some(0),
            at_bot: MaybeValid::some(true),
            at_eof: MaybeValid::some(self.eof.at_eof),
            at_eom: MaybeValid::some(false),
            online: MaybeValid::some(self.online),
            write_protected: MaybeValid::some(self.eof.read_only),
        })
    }

    fn read(&mut self, _buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.eof.guard_read()?;
        self.eof.latch_eof();
        Ok(0)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        self.eof.guard_write()?;
        Ok(buf.len())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn write_discards_and_reports_full_length() {
        let mut tape = NullTape::open(false);
        assert_eq!(tape.write(&[1, 2, 3, 4]).unwrap(), 4);
    }

    #[test]
    fn read_is_immediate_eof() {
        let mut tape = NullTape::open(false);
        let mut buf = [0u8; 16];
        assert_eq!(tape.read(&mut buf).unwrap(), 0);
        assert!(tape.read(&mut buf).is_err());
        tape.rewind().unwrap();
        assert_eq!(tape.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn write_on_readonly_fails() {
        let mut tape = NullTape::open(true);
        assert!(matches!(tape.write(&[1]), Err(DeviceError::Access(_))));
    }
}
