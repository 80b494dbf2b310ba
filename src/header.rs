//! Dump-file header (§3.2, §6.3) and the tape-I/O header façade (C7,
//! §4.7): `rdlabel`/`wrlabel`/`wrendmark` rewind, read or write the
//! first block of a volume and parse it as one of these headers.
//!
//! The header is a fixed-size (`MAX_HEADER_SIZE`), line-oriented ASCII
//! block, the same way the file-tape layout's `info` file is line
//! oriented (§6.2): plain `key: value` pairs, one per line, rather than
//! a binary struct.

use std::collections::BTreeMap;

use crate::error::DeviceError;

/// Headers never exceed this size on the wire (§3.2).
pub const MAX_HEADER_SIZE: usize = 32 * 1024;

const MAGIC: &str = "AMANDA";
const ENDDLE_SENTINEL: &str = "ENDDLE";

/// Variant tag carried by every dump-file header (§3.2).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderKind {
    TapeStart,
    DumpFile,
    ContDumpFile,
    SplitDumpFile,
    TapeEnd,
    Unknown,
}

impl HeaderKind {
    fn as_str(&self) -> &'static str {
        match self {
            HeaderKind::TapeStart => "TAPESTART",
            HeaderKind::DumpFile => "DUMPFILE",
            HeaderKind::ContDumpFile => "CONT_DUMPFILE",
            HeaderKind::SplitDumpFile => "SPLIT_DUMPFILE",
            HeaderKind::TapeEnd => "TAPEEND",
            HeaderKind::Unknown => "UNKNOWN",
        }
    }

    fn parse(s: &str) -> HeaderKind {
        match s {
            "TAPESTART" => HeaderKind::TapeStart,
            "DUMPFILE" => HeaderKind::DumpFile,
            "CONT_DUMPFILE" => HeaderKind::ContDumpFile,
            "SPLIT_DUMPFILE" => HeaderKind::SplitDumpFile,
            "TAPEEND" => HeaderKind::TapeEnd,
            _ => HeaderKind::Unknown,
        }
    }
}

/// One dump-file header (§3.2). Every field beyond `kind`/`datestamp`
/// is optional; which ones are meaningful depends on `kind`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpFileHeader {
    pub kind: Option<HeaderKind>,
    pub datestamp: String,
    pub name: String, // volume name / host, depending on kind
    pub disk: String,
    pub dumplevel: i32,
    pub partnum: i32,
    pub totalparts: i32,
    pub compressed: bool,
    pub comp_suffix: String,
    pub encrypted: bool,
    pub encrypt_suffix: String,
    pub application: String,
    pub program: String,
    pub dle_str: Option<String>,
    pub srv_encrypt: String,
    pub srv_decrypt: String,
    pub continuation_filename: String,
}

impl DumpFileHeader {
    pub fn new(kind: HeaderKind, datestamp: impl Into<String>) -> Self {
        Self {
            kind: Some(kind),
            datestamp: datestamp.into(),
            dumplevel: -1,
            partnum: -1,
            totalparts: -1,
            ..Default::default()
        }
    }

    /// Invariant check (§3.2): TAPESTART/TAPEEND carry no disk/host;
    /// SPLIT_DUMPFILE has `1 <= partnum <= totalparts` (or
    /// `totalparts == -1` for "unknown total").
    pub fn validate(&self) -> Result<(), DeviceError> {
        match self.kind {
            Some(HeaderKind::TapeStart) | Some(HeaderKind::TapeEnd) => {
                if !self.disk.is_empty() {
                    return Err(DeviceError::InvalidArg(
                        "TAPESTART/TAPEEND header must not carry a disk field".into(),
                    ));
                }
            }
            Some(HeaderKind::SplitDumpFile) => {
                if self.partnum < 1 {
                    return Err(DeviceError::InvalidArg(
                        "SPLIT_DUMPFILE requires partnum >= 1".into(),
                    ));
                }
                if self.totalparts != -1 && self.partnum > self.totalparts {
                    return Err(DeviceError::InvalidArg(
                        "SPLIT_DUMPFILE requires partnum <= totalparts".into(),
                    ));
                }
            }
            _ => {}
        }
        if self.compressed && self.comp_suffix.is_empty() {
            return Err(DeviceError::InvalidArg(
                "compressed flag set without a compression suffix".into(),
            ));
        }
        Ok(())
    }
}

fn push_field(out: &mut String, key: &str, value: &str) {
    if !value.is_empty() {
        out.push_str(key);
        out.push(' ');
        out.push_str(value);
        out.push('\n');
    }
}

/// Build the on-wire representation of a header, padded with NUL bytes
/// to exactly `size` (§4.7 `wrlabel`/`wrendmark`: "writes a header of
/// exactly `size` bytes").
pub fn build_header(header: &DumpFileHeader, size: usize) -> Result<Vec<u8>, DeviceError> {
    header.validate()?;

    let mut text = String::new();
    text.push_str(MAGIC);
    text.push_str(": ");
    text.push_str(header.kind.map(|k| k.as_str()).unwrap_or("UNKNOWN"));
    text.push(' ');
    text.push_str(&header.datestamp);
    text.push('\n');

    push_field(&mut text, "NAME", &header.name);
    push_field(&mut text, "DISK", &header.disk);
    if header.dumplevel >= 0 {
        push_field(&mut text, "DUMPLEVEL", &header.dumplevel.to_string());
    }
    if header.kind == Some(HeaderKind::SplitDumpFile) {
        push_field(&mut text, "PART", &format!("{}/{}", header.partnum, header.totalparts));
    }
    if header.compressed {
        text.push_str("COMPRESS APP\n");
        push_field(&mut text, "COMPRESS_SUFFIX", &header.comp_suffix);
    }
    if header.encrypted {
        text.push_str("ENCRYPT SRV\n");
        push_field(&mut text, "ENCRYPT_SUFFIX", &header.encrypt_suffix);
    }
    push_field(&mut text, "APPLICATION", &header.application);
    push_field(&mut text, "PROGRAM", &header.program);
    push_field(&mut text, "SRVCOMPPROG", &header.srv_encrypt);
    push_field(&mut text, "SRV_DECRYPT", &header.srv_decrypt);
    push_field(&mut text, "CONT_FILENAME", &header.continuation_filename);

    if let Some(dle) = &header.dle_str {
        text.push_str("DLE\n");
        text.push_str(dle);
        if !dle.ends_with('\n') {
            text.push('\n');
        }
        text.push_str(ENDDLE_SENTINEL);
        text.push('\n');
    }

    let mut bytes = text.into_bytes();
    if bytes.len() > size {
        return Err(DeviceError::InvalidArg(format!(
            "header does not fit in {size} bytes (needs {})",
            bytes.len()
        )));
    }
    bytes.resize(size, 0);
    Ok(bytes)
}

/// Parse a header previously produced by [`build_header`]. Any type
/// other than the recognised tags yields `kind = Unknown`
/// (`rdlabel`/C7 treats anything but TAPESTART as `NotAmandaTape`).
pub fn parse_file_header(data: &[u8]) -> Result<DumpFileHeader, DeviceError> {
    let text_len = data.iter().position(|&b| b == 0).unwrap_or(data.len());
    let text = std::str::from_utf8(&data[..text_len])
        .map_err(|_| DeviceError::Volume("header is not valid UTF-8".into()))?;

    let mut lines = text.lines();
    let first = lines
        .next()
        .ok_or_else(|| DeviceError::Volume("empty header".into()))?;

    let rest = first
        .strip_prefix(MAGIC)
        .and_then(|s| s.strip_prefix(": "))
        .ok_or_else(|| DeviceError::VolumeUnlabeled)?;

    let mut parts = rest.splitn(2, ' ');
    let kind = HeaderKind::parse(parts.next().unwrap_or(""));
    let datestamp = parts.next().unwrap_or("").to_string();

    let mut header = DumpFileHeader::new(kind, datestamp);

    let mut fields: BTreeMap<String, String> = BTreeMap::new();
    let mut dle_lines: Option<Vec<String>> = None;

    while let Some(line) = lines.next() {
        if let Some(ref mut dle) = dle_lines {
            if line == ENDDLE_SENTINEL {
                header.dle_str = Some(dle.join("\n"));
                dle_lines = None;
            } else {
                dle.push(line.to_string());
            }
            continue;
        }
        if line == "DLE" {
            dle_lines = Some(Vec::new());
            continue;
        }
        if line == "COMPRESS APP" {
            header.compressed = true;
            continue;
        }
        if line == "ENCRYPT SRV" {
            header.encrypted = true;
            continue;
        }
        if let Some((key, value)) = line.split_once(' ') {
            fields.insert(key.to_string(), value.to_string());
        }
    }

    if let Some(v) = fields.get("NAME") {
        header.name = v.clone();
    }
    if let Some(v) = fields.get("DISK") {
        header.disk = v.clone();
    }
    if let Some(v) = fields.get("DUMPLEVEL") {
        header.dumplevel = v.parse().unwrap_or(-1);
    }
    if let Some(v) = fields.get("PART") {
        if let Some((part, total)) = v.split_once('/') {
            header.partnum = part.parse().unwrap_or(-1);
            header.totalparts = total.parse().unwrap_or(-1);
        }
    }
    if let Some(v) = fields.get("COMPRESS_SUFFIX") {
        header.comp_suffix = v.clone();
    }
    if let Some(v) = fields.get("ENCRYPT_SUFFIX") {
        header.encrypt_suffix = v.clone();
    }
    if let Some(v) = fields.get("APPLICATION") {
        header.application = v.clone();
    }
    if let Some(v) = fields.get("PROGRAM") {
        header.program = v.clone();
    }
    if let Some(v) = fields.get("SRVCOMPPROG") {
        header.srv_encrypt = v.clone();
    }
    if let Some(v) = fields.get("SRV_DECRYPT") {
        header.srv_decrypt = v.clone();
    }
    if let Some(v) = fields.get("CONT_FILENAME") {
        header.continuation_filename = v.clone();
    }

    header.validate()?;
    Ok(header)
}

/// C7 façade: label identity propagated through per-handle setters to
/// the next dump file written (§4.7, §3.1).
#[derive(Debug, Clone, Default)]
pub struct LabelIdentity {
    pub host: String,
    pub disk: String,
    pub dumplevel: i32,
    pub datestamp: String,
    pub tapetype: String,
    pub fake_label: bool,
}

/// `rdlabel` (§4.7): rewind (caller's job), read the first block and
/// parse it. Anything but TAPESTART — including a read error — yields
/// `VolumeUnlabeled`.
pub fn rdlabel(first_block: &[u8]) -> Result<(String, String), DeviceError> {
    let header = parse_file_header(first_block)?;
    match header.kind {
        Some(HeaderKind::TapeStart) => Ok((header.datestamp, header.name)),
        _ => Err(DeviceError::VolumeUnlabeled),
    }
}

/// `wrlabel` (§4.7): build a TAPESTART header of exactly `size` bytes.
pub fn wrlabel(datestamp: &str, label: &str, size: usize) -> Result<Vec<u8>, DeviceError> {
    let mut header = DumpFileHeader::new(HeaderKind::TapeStart, datestamp);
    header.name = label.to_string();
    build_header(&header, size)
}

/// `wrendmark` (§4.7): build a TAPEEND header of exactly `size` bytes.
pub fn wrendmark(datestamp: &str, size: usize) -> Result<Vec<u8>, DeviceError> {
    let header = DumpFileHeader::new(HeaderKind::TapeEnd, datestamp);
    build_header(&header, size)
}

#[cfg(test)]
mod test {
    use super::*;

    /// S1: header round-trip.
    #[test]
    fn header_round_trip() {
        let mut header = DumpFileHeader::new(HeaderKind::DumpFile, "20100102030405");
        header.name = "localhost".to_string();
        header.disk = "/usr".to_string();
        header.dumplevel = 1;
        header.compressed = true;
        header.comp_suffix = ".gz".to_string();

        let bytes = build_header(&header, MAX_HEADER_SIZE).unwrap();
        assert_eq!(bytes.len(), MAX_HEADER_SIZE);

        let parsed = parse_file_header(&bytes).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn tapestart_round_trip() {
        let header = DumpFileHeader::new(HeaderKind::TapeStart, "20260101000000");
        let bytes = build_header(&header, 1024).unwrap();
        let (datestamp, _label) = rdlabel(&bytes).unwrap();
        assert_eq!(datestamp, "20260101000000");
    }

    #[test]
    fn non_tapestart_is_unlabeled() {
        let header = DumpFileHeader::new(HeaderKind::DumpFile, "20260101000000");
        let bytes = build_header(&header, 1024).unwrap();
        assert!(matches!(rdlabel(&bytes), Err(DeviceError::VolumeUnlabeled)));
    }

    #[test]
    fn split_dumpfile_requires_valid_partnum() {
        let mut header = DumpFileHeader::new(HeaderKind::SplitDumpFile, "20260101000000");
        header.partnum = 0;
        header.totalparts = 3;
        assert!(header.validate().is_err());

        header.partnum = 4;
        assert!(header.validate().is_err());

        header.partnum = 2;
        assert!(header.validate().is_ok());
    }

    #[test]
    fn split_dumpfile_allows_unknown_total() {
        let mut header = DumpFileHeader::new(HeaderKind::SplitDumpFile, "20260101000000");
        header.partnum = 7;
        header.totalparts = -1;
        assert!(header.validate().is_ok());
    }

    #[test]
    fn header_too_large_for_size_is_rejected() {
        let mut header = DumpFileHeader::new(HeaderKind::DumpFile, "20260101000000");
        header.dle_str = Some("x".repeat(MAX_HEADER_SIZE));
        assert!(build_header(&header, MAX_HEADER_SIZE).is_err());
    }

    #[test]
    fn dle_block_round_trips_multiline() {
        let mut header = DumpFileHeader::new(HeaderKind::DumpFile, "20260101000000");
        header.dle_str = Some("line one\nline two".to_string());
        let bytes = build_header(&header, MAX_HEADER_SIZE).unwrap();
        let parsed = parse_file_header(&bytes).unwrap();
        assert_eq!(parsed.dle_str.as_deref(), Some("line one\nline two"));
    }
}
