//! File-tape backend (C5): a directory of files standing in for a
//! physical tape volume, laid out per §3.4/§6.2:
//!
//! ```text
//! <root>/info                       # line: "position N\n"
//! <root>/data/NNNNN.<hostdisklevel>  # data
//! <root>/data/NNNNN-<hostdisklevel>  # record sizes: "start end size\n"*
//! ```
//!
//! The cursor state machine is `(file_current, record_current)` plus
//! the `at_bof`/`at_eof`/`at_eom`/`last_op_write` flags from §4.5; the
//! generic EOF-latch/read-only semantics of [`crate::tape::EofLatch`]
//! are layered on top exactly as [`crate::tape::real_tape::RealTape`]
//! does for the SCSI backend.

use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use crate::error::DeviceError;
use crate::tape::{AmMtStatus, EofLatch, MaybeValid, TapeOps};

/// Default record size when a fresh volume has never been written
/// (§3.4).
pub const DEFAULT_RECORD_SIZE: u64 = 32 * 1024;

#[derive(Debug, Clone, Copy)]
struct RecordRange {
    start: u64,
    end: u64,
    size: u64,
}

pub struct FileTape {
    root: PathBuf,
    name: String,
    read_only: bool,
    file_current: u64,
    record_current: u64,
    byte_offset: u64,
    file_count: u64,
    at_bof: bool,
    at_eom: bool,
    last_op_write: bool,
    is_online: bool,
    amount_written: u64,
    max_volume_usage: Option<u64>,
    ranges: Vec<RecordRange>,
    ranges_dirty: bool,
    cur_file: Option<File>,
    eof: EofLatch,
}

fn sanitise(name: &str) -> String {
    let s: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if s.is_empty() {
        "unknown".to_string()
    } else {
        s
    }
}

impl FileTape {
    fn data_path(&self, file_idx: u64) -> PathBuf {
        self.root.join("data").join(format!("{file_idx:05}.{}", self.name))
    }

    fn ranges_path(&self, file_idx: u64) -> PathBuf {
        self.root.join("data").join(format!("{file_idx:05}-{}", self.name))
    }

    fn info_path(&self) -> PathBuf {
        self.root.join("info")
    }

    fn write_info(&self) -> Result<(), DeviceError> {
        fs::write(self.info_path(), format!("position {}\n", self.file_current))?;
        Ok(())
    }

    fn read_info(root: &Path) -> u64 {
        fs::read_to_string(root.join("info"))
            .ok()
            .and_then(|s| {
                s.trim()
                    .strip_prefix("position ")
                    .and_then(|n| n.parse().ok())
            })
            .unwrap_or(0)
    }

    fn load_ranges(&mut self) {
        self.ranges.clear();
        self.ranges_dirty = false;
        let path = self.ranges_path(self.file_current);
        let Ok(text) = fs::read_to_string(&path) else {
            return;
        };
        for line in text.lines() {
            let mut parts = line.split_whitespace();
            if let (Some(s), Some(e), Some(sz)) = (parts.next(), parts.next(), parts.next()) {
                if let (Ok(start), Ok(end), Ok(size)) =
                    (s.parse::<u64>(), e.parse::<u64>(), sz.parse::<u64>())
                {
                    self.ranges.push(RecordRange { start, end, size });
                }
            }
        }
    }

    fn persist_ranges(&mut self) -> Result<(), DeviceError> {
        if !self.ranges_dirty {
            return Ok(());
        }
        let mut text = String::new();
        for r in &self.ranges {
            text.push_str(&format!("{} {} {}\n", r.start, r.end, r.size));
        }
        fs::write(self.ranges_path(self.file_current), text)?;
        self.ranges_dirty = false;
        Ok(())
    }

    fn total_records(&self) -> u64 {
        self.ranges.last().map(|r| r.end).unwrap_or(0)
    }

    fn record_size_at(&self, record: u64) -> Option<u64> {
        self.ranges
            .iter()
            .find(|r| record >= r.start && record < r.end)
            .map(|r| r.size)
    }

    fn byte_offset_of(&self, record: u64) -> u64 {
        self.ranges
            .iter()
            .filter(|r| r.start < record)
            .map(|r| (record.min(r.end) - r.start) * r.size)
            .sum()
    }

    fn reposition(&mut self, file_idx: u64, record: u64) {
        self.file_current = file_idx;
        self.record_current = record;
        self.cur_file = None;
        self.load_ranges();
        self.byte_offset = self.byte_offset_of(record);
    }

    fn ensure_open_for_read(&mut self) -> Result<(), DeviceError> {
        if self.cur_file.is_some() {
            return Ok(());
        }
        let path = self.data_path(self.file_current);
        // a missing data file (position known from a range list but no
        // backing file, e.g. after manual cleanup) reads as /dev/null
        // rather than erroring (§6.2).
        let f = OpenOptions::new()
            .read(true)
            .open(&path)
            .or_else(|_| File::open("/dev/null"))?;
        self.cur_file = Some(f);
        Ok(())
    }

    fn ensure_open_for_write(&mut self) -> Result<(), DeviceError> {
        if self.cur_file.is_none() {
            fs::create_dir_all(self.root.join("data"))?;
            let path = self.data_path(self.file_current);
            let f = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            self.cur_file = Some(f);
        }
        if let Some(f) = &mut self.cur_file {
            f.set_len(self.byte_offset)?;
            f.seek(SeekFrom::Start(self.byte_offset))?;
        }
        Ok(())
    }

    /// Scan `<root>/data` for `NNNNN.*` entries, the way a fresh mount
    /// discovers how many files already exist on the volume.
    fn scan_file_count(root: &Path) -> u64 {
        let mut count = 0u64;
        if let Ok(entries) = fs::read_dir(root.join("data")) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let name = name.to_string_lossy();
                let bytes = name.as_bytes();
                if bytes.len() > 5
                    && bytes[..5].iter().all(u8::is_ascii_digit)
                    && bytes[5] == b'.'
                {
                    if let Ok(pos) = name[..5].parse::<u64>() {
                        count = count.max(pos + 1);
                    }
                }
            }
        }
        count
    }

    /// Open or create the volume at `root` (§4.5, §6.2). `file_count`
    /// — how many files already exist — comes from scanning the data
    /// directory, not from anything written during this session; the
    /// `info` file only records the cursor position left by the last
    /// close.
    pub fn open(root: impl Into<PathBuf>, read_only: bool) -> Result<Self, DeviceError> {
        let root = root.into();
        fs::create_dir_all(root.join("data"))?;
        let file_count = Self::scan_file_count(&root);
        let file_current = Self::read_info(&root).min(file_count.max(1));
        let mut tape = FileTape {
            root,
            name: "stream".to_string(),
            read_only,
            file_current,
            record_current: 0,
            byte_offset: 0,
            file_count,
            at_bof: file_current == 0,
            at_eom: file_current >= file_count,
            last_op_write: false,
            is_online: true,
            amount_written: 0,
            max_volume_usage: None,
            ranges: Vec::new(),
            ranges_dirty: false,
            cur_file: None,
            eof: EofLatch {
                at_eof: false,
                read_only,
            },
        };
        tape.load_ranges();
        Ok(tape)
    }

    /// Set the `host.disk.level` name used to name the next file
    /// created by `weof`/the first write (§3.4).
    pub fn set_name(&mut self, host: &str, disk: &str, level: i32) {
        self.name = sanitise(&format!("{host}.{disk}.{level}"));
    }

    pub fn set_max_volume_usage(&mut self, bytes: Option<u64>) {
        self.max_volume_usage = bytes;
    }
}

impl TapeOps for FileTape {
    fn rewind(&mut self) -> Result<(), DeviceError> {
        if self.last_op_write {
            self.weof(1)?;
        }
        self.reposition(0, 0);
        self.at_bof = true;
        self.at_eom = self.file_count == 0;
        self.amount_written = 0;
        self.eof.reset();
        self.last_op_write = false;
        Ok(())
    }

    /// `fsf(n)`: `n > 0` skips forward, `n < 0` skips back (§4.5). A
    /// trailing write is flushed with an implicit `weof(1)` only when
    /// moving backward — forward skips never rewrite what's already
    /// there.
    fn fsf(&mut self, count: i64) -> Result<(), DeviceError> {
        if self.last_op_write && count < 0 {
            self.weof(1)?;
        }
        self.cur_file = None;

        let mut count = count;
        if self.at_eom && count < 0 {
            count -= 1;
        }

        let target = self.file_current as i64 + count;
        let (clamped, out_of_range) = if target > self.file_count as i64 {
            (self.file_count, true)
        } else if target < 0 {
            (0, true)
        } else {
            (target as u64, false)
        };

        self.reposition(clamped, 0);
        self.at_bof = true;
        if !out_of_range || count < 0 {
            self.eof.reset();
        } else {
            self.eof.latch_eof();
        }
        self.at_eom = self.file_current >= self.file_count;
        self.last_op_write = false;
        if self.file_current == 0 {
            self.amount_written = 0;
        }

        if out_of_range {
            return Err(DeviceError::InvalidArg(
                "fsf: position out of range".into(),
            ));
        }
        Ok(())
    }

    /// `bsf(n)`: skip back `n` files; expressed as `fsf(-n)` (§4.5).
    fn bsf(&mut self, count: i64) -> Result<(), DeviceError> {
        self.fsf(-count)
    }

    /// `weof(n)`: close out the current file (truncating at the
    /// current offset) and write `n` filemarks. Only the first
    /// filemark closes data actually written this session; any
    /// further ones create genuinely empty marker files and are the
    /// only case where `file_count` grows within a live session — the
    /// first file only becomes visible to `file_count` on the next
    /// fresh open's directory scan (§4.5, §6.2).
    fn weof(&mut self, count: i64) -> Result<(), DeviceError> {
        EofLatch::check_weof_count(count)?;
        self.eof.guard_write()?;
        if count == 0 {
            return Ok(());
        }
        let mut remaining = count;

        if self.cur_file.is_some() {
            self.persist_ranges()?;
            if let Some(f) = &mut self.cur_file {
                f.set_len(self.byte_offset)?;
            }
            self.cur_file = None;
            self.file_current += 1;
            self.record_current = 0;
            self.byte_offset = 0;
            self.ranges.clear();
            self.at_bof = true;
            self.eof.reset();
            self.at_eom = true;
            self.last_op_write = false;
            remaining -= 1;
        }

        if remaining > 0 {
            // everything from here on is an empty marker file; naming
            // information does not carry past the first file a weof
            // call terminates.
            self.name = "unknown".to_string();
        }
        while remaining > 0 {
            fs::create_dir_all(self.root.join("data"))?;
            let idx = self.file_current + 1;
            File::create(self.data_path(idx))?;
            fs::write(self.ranges_path(idx), "")?;
            self.file_current = idx;
            self.file_count = self.file_current;
            self.record_current = 0;
            self.byte_offset = 0;
            self.ranges.clear();
            self.at_bof = true;
            self.eof.reset();
            self.at_eom = true;
            self.last_op_write = false;
            remaining -= 1;
        }

        self.write_info()?;
        Ok(())
    }

    fn eject(&mut self) -> Result<(), DeviceError> {
        self.cur_file = None;
        self.is_online = false;
        Ok(())
    }

    fn status(&mut self) -> Result<AmMtStatus, DeviceError> {
        Ok(AmMtStatus {
            file_number: MaybeValid::some(self.file_current),
            block_number: MaybeValid::some(self.record_current),
            at_bot: MaybeValid::some(self.at_bof),
            at_eof: MaybeValid::some(self.eof.at_eof),
            at_eom: MaybeValid::some(self.at_eom),
            online: MaybeValid::some(self.is_online),
            write_protected: MaybeValid::some(self.read_only),
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, DeviceError> {
        self.eof.guard_read()?;
        if self.record_current >= self.total_records() {
            self.eof.latch_eof();
            return Ok(0);
        }
        self.ensure_open_for_read()?;
        let rsize = self
            .record_size_at(self.record_current)
            .unwrap_or(DEFAULT_RECORD_SIZE);
        let mut record = vec![0u8; rsize as usize];
        if let Some(f) = &mut self.cur_file {
            f.seek(SeekFrom::Start(self.byte_offset))?;
            f.read_exact(&mut record)?;
        }
        let n = buf.len().min(record.len());
        buf[..n].copy_from_slice(&record[..n]);
        self.record_current += 1;
        self.byte_offset += rsize;
        self.at_bof = false;
        self.last_op_write = false;
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize, DeviceError> {
        self.eof.guard_write()?;
        if !self.at_bof && !self.at_eom {
            return Err(DeviceError::Device(
                "file-tape write requires position at BOF or EOM".into(),
            ));
        }
        if let Some(cap) = self.max_volume_usage {
            if self.amount_written + buf.len() as u64 > cap {
                return Err(DeviceError::EomReached);
            }
        }
        self.ensure_open_for_write()?;
        if let Some(f) = &mut self.cur_file {
            f.write_all(buf)?;
        }

        let size = buf.len() as u64;
        match self.ranges.last_mut() {
            Some(r) if r.size == size && r.end == self.record_current => {
                r.end += 1;
            }
            _ => self.ranges.push(RecordRange {
                start: self.record_current,
                end: self.record_current + 1,
                size,
            }),
        }
        self.ranges_dirty = true;

        self.record_current += 1;
        self.byte_offset += size;
        self.amount_written += size;
        self.at_bof = false;
        self.at_eom = false;
        self.last_op_write = true;
        Ok(buf.len())
    }
}

impl Drop for FileTape {
    fn drop(&mut self) {
        let _ = self.persist_ranges();
        if let Some(f) = &mut self.cur_file {
            let _ = f.set_len(self.byte_offset);
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn tmp_root(tag: &str) -> PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("amanda-file-tape-test-{tag}-{}", std::process::id()));
        let _ = fs::remove_dir_all(&p);
        p
    }

    /// S2: write three 1 KiB blocks, finish, reopen, read them back in
    /// order; `info` records `position 1`.
    #[test]
    fn write_read_round_trip() {
        let root = tmp_root("s2");
        {
            let mut tape = FileTape::open(&root, false).unwrap();
            tape.set_name("localhost", "usr", 0);
            let a = vec![b'A'; 1024];
            let b = vec![b'B'; 1024];
            let c = vec![b'C'; 1024];
            tape.write(&a).unwrap();
            tape.write(&b).unwrap();
            tape.write(&c).unwrap();
            tape.weof(1).unwrap();
        }
        let info = fs::read_to_string(root.join("info")).unwrap();
        assert_eq!(info.trim(), "position 1");

        let mut tape = FileTape::open(&root, true).unwrap();
        tape.rewind().unwrap();
        let mut buf = [0u8; 1024];
        assert_eq!(tape.read(&mut buf).unwrap(), 1024);
        assert_eq!(buf, [b'A'; 1024]);
        assert_eq!(tape.read(&mut buf).unwrap(), 1024);
        assert_eq!(buf, [b'B'; 1024]);
        assert_eq!(tape.read(&mut buf).unwrap(), 1024);
        assert_eq!(buf, [b'C'; 1024]);
        assert_eq!(tape.read(&mut buf).unwrap(), 0);

        fs::remove_dir_all(&root).ok();
    }

    /// P4 (adapted to the directory-scan model, §4.5): writing two
    /// files of k blocks each, a fresh open picks up both from the
    /// directory scan; `fsf(1)` from file 0 lands exactly on file 1,
    /// and reading it to EOF yields its k blocks.
    #[test]
    fn fsf_navigates_to_the_next_written_file() {
        let root = tmp_root("p4");
        {
            let mut tape = FileTape::open(&root, false).unwrap();
            for _ in 0..5 {
                tape.write(&[7u8; 64]).unwrap();
            }
            tape.weof(1).unwrap();
            for _ in 0..5 {
                tape.write(&[9u8; 64]).unwrap();
            }
            tape.weof(1).unwrap();
        }
        let mut tape = FileTape::open(&root, true).unwrap();
        tape.rewind().unwrap();
        tape.fsf(1).unwrap();
        let mut count = 0;
        let mut buf = [0u8; 64];
        loop {
            let n = tape.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            assert_eq!(buf, [9u8; 64]);
            count += 1;
        }
        assert_eq!(count, 5);

        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn write_on_readonly_handle_fails() {
        let root = tmp_root("readonly");
        {
            FileTape::open(&root, false).unwrap();
        }
        let mut tape = FileTape::open(&root, true).unwrap();
        assert!(matches!(
            tape.write(&[1, 2, 3]),
            Err(DeviceError::Access(_))
        ));
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn read_buffer_smaller_than_record_discards_tail() {
        let root = tmp_root("short-read");
        {
            let mut tape = FileTape::open(&root, false).unwrap();
            tape.write(&[9u8; 100]).unwrap();
            tape.weof(1).unwrap();
        }
        let mut tape = FileTape::open(&root, true).unwrap();
        tape.rewind().unwrap();
        let mut small = [0u8; 10];
        assert_eq!(tape.read(&mut small).unwrap(), 10);
        assert_eq!(small, [9u8; 10]);
        // position has advanced a full record, not just 10 bytes.
        assert_eq!(tape.read(&mut small).unwrap(), 0);
        fs::remove_dir_all(&root).ok();
    }

    #[test]
    fn max_volume_usage_enforced() {
        let root = tmp_root("cap");
        let mut tape = FileTape::open(&root, false).unwrap();
        tape.set_max_volume_usage(Some(100));
        assert!(tape.write(&[0u8; 100]).is_ok());
        assert!(matches!(tape.write(&[0u8; 1]), Err(DeviceError::EomReached)));
        fs::remove_dir_all(&root).ok();
    }
}
