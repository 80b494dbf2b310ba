//! Fixed-size block framing shared by every backend that sits under a
//! [`BlockedReader`]/[`BlockedWriter`] pair: real SCSI tape, file-tape and
//! RAIT children all read and write blocks of exactly [`DEFAULT_BLOCK_SIZE`]
//! bytes, each prefixed with a [`BlockHeader`].

use std::alloc::{alloc_zeroed, Layout};
use std::io::Read;

use proxmox_io::vec;

/// Default block size used when a device property does not override it.
pub const DEFAULT_BLOCK_SIZE: usize = 256 * 1024;

bitflags::bitflags! {
    pub struct BlockHeaderFlags: u8 {
        /// Marks the last block in a stream.
        const END_OF_STREAM = 0b0000_0001;
        /// Set on the last block of a stream that was not finished
        /// normally (multivolume continuation).
        const INCOMPLETE    = 0b0000_0010;
    }
}

/// Block header with an inline payload.
///
/// This is an unsized type: the payload length is fixed for a given
/// allocation (`DEFAULT_BLOCK_SIZE - size_of::<BlockHeader fixed part>`) but
/// is not known at compile time, so instances always live behind a `Box`.
#[repr(C, packed)]
pub struct BlockHeader {
    pub flags: BlockHeaderFlags,
    /// payload size as 3 bytes unsigned, little endian
    pub size: [u8; 3],
    pub seq_nr: u32,
    pub payload: [u8],
}

impl BlockHeader {
    /// Total on-wire size of a block (header + payload).
    pub const SIZE: usize = DEFAULT_BLOCK_SIZE;

    const HEADER_LEN: usize = 8; // flags(1) + size(3) + seq_nr(4)

    /// Allocate a new, zeroed block header with a full-sized payload.
    pub fn new() -> Box<Self> {
        let payload_len = Self::SIZE - Self::HEADER_LEN;

        let layout = Layout::array::<u8>(Self::SIZE).unwrap();

        unsafe {
            let ptr = alloc_zeroed(layout);
            if ptr.is_null() {
                std::alloc::handle_alloc_error(layout);
            }
            let fat_ptr =
                std::ptr::slice_from_raw_parts_mut(ptr, payload_len) as *mut BlockHeader;
            Box::from_raw(fat_ptr)
        }
    }

    pub fn set_size(&mut self, size: usize) {
        let bytes = (size as u32).to_le_bytes();
        self.size = [bytes[0], bytes[1], bytes[2]];
    }

    pub fn size(&self) -> usize {
        let size = self.size; // copy out of packed struct
        u32::from_le_bytes([size[0], size[1], size[2], 0]) as usize
    }

    pub fn set_seq_nr(&mut self, seq_nr: u32) {
        self.seq_nr = seq_nr;
    }

    pub fn seq_nr(&self) -> u32 {
        self.seq_nr
    }
}

/// Read trait for tape-like devices, with extra end-of-stream metadata
/// only knowable once EOF has been reached.
pub trait TapeRead: Read {
    /// True if the final block carried the INCOMPLETE flag.
    ///
    /// Raises an error if queried before EOF.
    fn is_incomplete(&self) -> Result<bool, std::io::Error>;

    /// True if a file end marker (filemark) preceded EOF.
    ///
    /// Raises an error if queried before EOF.
    fn has_end_marker(&self) -> Result<bool, std::io::Error>;

    /// Skip remaining data by reading to EOF. Returns bytes skipped.
    fn skip_data(&mut self) -> Result<usize, std::io::Error>;
}

#[derive(thiserror::Error, Debug)]
pub enum BlockReadError {
    #[error("{0}")]
    Error(#[from] std::io::Error),
    #[error("end of file")]
    EndOfFile,
    #[error("end of data stream")]
    EndOfStream,
}

/// Read streams of fixed-size blocks.
pub trait BlockRead {
    /// Read the next block (whole buffer, or error).
    fn read_block(&mut self, buffer: &mut [u8]) -> Result<usize, BlockReadError>;
}

/// Write streams of fixed-size blocks.
pub trait BlockWrite {
    /// Write a data block. Returns true on Logical End Of Media (early warning).
    fn write_block(&mut self, buffer: &[u8]) -> Result<bool, std::io::Error>;

    /// Write a filemark.
    fn write_filemark(&mut self) -> Result<(), std::io::Error>;
}

/// Assembles and writes variable-length data as a stream of fixed-size,
/// sequence-numbered blocks.
pub struct BlockedWriter<W: BlockWrite> {
    writer: W,
    buffer: Box<BlockHeader>,
    buffer_pos: usize,
    seq_nr: u32,
    logical_end_of_media: bool,
    bytes_written: usize,
    wrote_eof: bool,
}

impl<W: BlockWrite> Drop for BlockedWriter<W> {
    fn drop(&mut self) {
        if !self.wrote_eof {
            let _ = self.writer.write_filemark();
        }
    }
}

impl<W: BlockWrite> BlockedWriter<W> {
    pub fn writer_ref_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: BlockHeader::new(),
            buffer_pos: 0,
            seq_nr: 0,
            logical_end_of_media: false,
            bytes_written: 0,
            wrote_eof: false,
        }
    }

    fn write_block(buffer: &BlockHeader, writer: &mut W) -> Result<bool, std::io::Error> {
        let data = unsafe {
            std::slice::from_raw_parts((buffer as *const BlockHeader) as *const u8, BlockHeader::SIZE)
        };
        writer.write_block(data)
    }

    fn write_eof(&mut self) -> Result<(), std::io::Error> {
        if self.wrote_eof {
            proxmox_lang::io_bail!("BlockedWriter: detected multiple EOF writes");
        }
        self.wrote_eof = true;
        self.writer.write_filemark()
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, std::io::Error> {
        if data.is_empty() {
            return Ok(0);
        }

        let rest = self.buffer.payload.len() - self.buffer_pos;
        let bytes = if data.len() < rest { data.len() } else { rest };
        self.buffer.payload[self.buffer_pos..(self.buffer_pos + bytes)]
            .copy_from_slice(&data[..bytes]);

        let rest = rest - bytes;

        if rest == 0 {
            self.buffer.flags = BlockHeaderFlags::empty();
            self.buffer.set_size(self.buffer.payload.len());
            self.buffer.set_seq_nr(self.seq_nr);
            self.seq_nr += 1;
            let leom = Self::write_block(&self.buffer, &mut self.writer)?;
            if leom {
                self.logical_end_of_media = true;
            }
            self.buffer_pos = 0;
            self.bytes_written += BlockHeader::SIZE;
        } else {
            self.buffer_pos += bytes;
        }

        Ok(bytes)
    }
}

impl<W: BlockWrite> TapeWrite for BlockedWriter<W> {
    fn write_all(&mut self, mut data: &[u8]) -> Result<bool, std::io::Error> {
        while !data.is_empty() {
            let n = self.write(data)?;
            data = &data[n..];
        }
        Ok(self.logical_end_of_media)
    }

    fn bytes_written(&self) -> usize {
        self.bytes_written
    }

    fn finish(&mut self, incomplete: bool) -> Result<bool, std::io::Error> {
        vec::clear(&mut self.buffer.payload[self.buffer_pos..]);
        self.buffer.flags = BlockHeaderFlags::END_OF_STREAM;
        if incomplete {
            self.buffer.flags |= BlockHeaderFlags::INCOMPLETE;
        }
        self.buffer.set_size(self.buffer_pos);
        self.buffer.set_seq_nr(self.seq_nr);
        self.seq_nr += 1;
        self.bytes_written += BlockHeader::SIZE;
        let leom = Self::write_block(&self.buffer, &mut self.writer)?;
        self.write_eof()?;
        Ok(leom)
    }

    fn logical_end_of_media(&self) -> bool {
        self.logical_end_of_media
    }
}

/// Write trait for tape-like devices.
///
/// There is no `flush`: tapes flush their internal buffer only when
/// writing a filemark, via [`TapeWrite::finish`].
pub trait TapeWrite {
    /// Writes all data, returns true on LEOM.
    fn write_all(&mut self, data: &[u8]) -> Result<bool, std::io::Error>;

    /// Bytes (raw, on-tape) written so far.
    fn bytes_written(&self) -> usize;

    /// Flush the last block and write the file end mark.
    ///
    /// `incomplete` marks a multivolume continuation.
    fn finish(&mut self, incomplete: bool) -> Result<bool, std::io::Error>;

    /// True once the writer has already observed Logical End Of Media.
    fn logical_end_of_media(&self) -> bool;
}

/// Reassembles a stream of fixed-size blocks back into a flat byte stream.
///
/// Mirrors [`BlockedWriter`]: validates the monotonic sequence number and
/// exposes the END_OF_STREAM/INCOMPLETE flags carried by the final block.
pub struct BlockedReader<R: BlockRead> {
    reader: R,
    buffer: Box<BlockHeader>,
    buffer_pos: usize,
    buffer_len: usize,
    seq_nr: u32,
    got_eod: bool,
    incomplete: bool,
    has_end_marker: bool,
}

impl<R: BlockRead> BlockedReader<R> {
    /// Open a reader, reading and validating the first block.
    ///
    /// Returns `Ok(None)` equivalent is not modeled; an empty stream is
    /// represented by `got_eod == true` right after open.
    pub fn open(mut reader: R) -> Result<Self, BlockReadError> {
        let mut buffer = BlockHeader::new();

        let (buffer_len, got_eod, incomplete, has_end_marker) =
            match Self::read_raw_block(&mut reader, &mut buffer) {
                Ok(()) => {
                    let eod = buffer.flags.contains(BlockHeaderFlags::END_OF_STREAM);
                    let incomplete = eod && buffer.flags.contains(BlockHeaderFlags::INCOMPLETE);
                    (buffer.size(), eod, incomplete, eod)
                }
                Err(BlockReadError::EndOfFile) => (0, true, false, false),
                Err(err) => return Err(err),
            };

        Ok(Self {
            reader,
            buffer,
            buffer_pos: 0,
            buffer_len,
            seq_nr: 1,
            got_eod,
            incomplete,
            has_end_marker,
        })
    }

    fn read_raw_block(reader: &mut R, buffer: &mut BlockHeader) -> Result<(), BlockReadError> {
        let len = {
            let data = unsafe {
                std::slice::from_raw_parts_mut(
                    (buffer.as_mut() as *mut BlockHeader) as *mut u8,
                    BlockHeader::SIZE,
                )
            };
            reader.read_block(data)?
        };
        if len != BlockHeader::SIZE {
            return Err(BlockReadError::Error(proxmox_lang::io_format_err!(
                "BlockedReader: short block read ({} != {})",
                len,
                BlockHeader::SIZE,
            )));
        }
        Ok(())
    }

    fn fill_buffer(&mut self) -> std::io::Result<()> {
        if self.got_eod {
            return Ok(());
        }

        match Self::read_raw_block(&mut self.reader, &mut self.buffer) {
            Ok(()) => {
                let seq_nr = self.buffer.seq_nr();
                if seq_nr != self.seq_nr {
                    return Err(proxmox_lang::io_format_err!(
                        "BlockedReader: unexpected sequence number ({} != {})",
                        seq_nr,
                        self.seq_nr,
                    ));
                }
                self.seq_nr += 1;
                self.buffer_pos = 0;
                self.buffer_len = self.buffer.size();
                if self.buffer.flags.contains(BlockHeaderFlags::END_OF_STREAM) {
                    self.got_eod = true;
                    self.has_end_marker = true;
                    self.incomplete = self.buffer.flags.contains(BlockHeaderFlags::INCOMPLETE);
                }
                Ok(())
            }
            Err(BlockReadError::EndOfFile) => {
                self.got_eod = true;
                self.buffer_len = 0;
                Ok(())
            }
            Err(BlockReadError::Error(err)) => Err(err),
            Err(BlockReadError::EndOfStream) => {
                self.got_eod = true;
                self.buffer_len = 0;
                Ok(())
            }
        }
    }
}

impl<R: BlockRead> Read for BlockedReader<R> {
    fn read(&mut self, buffer: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.buffer_pos < self.buffer_len {
                let rest = self.buffer_len - self.buffer_pos;
                let n = rest.min(buffer.len());
                buffer[..n].copy_from_slice(
                    &self.buffer.payload[self.buffer_pos..(self.buffer_pos + n)],
                );
                self.buffer_pos += n;
                return Ok(n);
            }

            if self.got_eod {
                return Ok(0);
            }

            self.fill_buffer()?;
        }
    }
}

impl<R: BlockRead> TapeRead for BlockedReader<R> {
    fn is_incomplete(&self) -> Result<bool, std::io::Error> {
        if !self.got_eod {
            return Err(proxmox_lang::io_format_err!(
                "BlockedReader: is_incomplete() called before EOF"
            ));
        }
        Ok(self.incomplete)
    }

    fn has_end_marker(&self) -> Result<bool, std::io::Error> {
        if !self.got_eod {
            return Err(proxmox_lang::io_format_err!(
                "BlockedReader: has_end_marker() called before EOF"
            ));
        }
        Ok(self.has_end_marker)
    }

    fn skip_data(&mut self) -> Result<usize, std::io::Error> {
        let mut buf = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let n = self.read(&mut buf)?;
            if n == 0 {
                break;
            }
            total += n;
        }
        Ok(total)
    }
}

/// Emulates tape read behaviour (fixed-size whole-block reads) on a
/// normal [`Read`].
pub struct EmulateTapeReader<R: Read> {
    reader: R,
    got_eof: bool,
}

impl<R: Read> EmulateTapeReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            got_eof: false,
        }
    }
}

impl<R: Read> BlockRead for EmulateTapeReader<R> {
    fn read_block(&mut self, buffer: &mut [u8]) -> Result<usize, BlockReadError> {
        if self.got_eof {
            return Err(BlockReadError::Error(proxmox_lang::io_format_err!(
                "detected read after EOF!"
            )));
        }
        match proxmox_io::ReadExt::read_exact_or_eof(&mut self.reader, buffer)? {
            false => {
                self.got_eof = true;
                Err(BlockReadError::EndOfFile)
            }
            true => {
                if buffer.len() != BlockHeader::SIZE {
                    return Err(BlockReadError::Error(proxmox_lang::io_format_err!(
                        "EmulateTapeReader: read_block with wrong block size ({} != {})",
                        buffer.len(),
                        BlockHeader::SIZE,
                    )));
                }
                Ok(buffer.len())
            }
        }
    }
}

/// Emulates tape write behaviour (fixed-size blocks, ENOSPC near a
/// configured size) on a normal [`std::io::Write`].
pub struct EmulateTapeWriter<W> {
    block_nr: usize,
    max_blocks: usize,
    writer: W,
    wrote_eof: bool,
}

impl<W: std::io::Write> EmulateTapeWriter<W> {
    /// Create a new instance allowing to write about `max_size` bytes.
    pub fn new(writer: W, max_size: usize) -> Self {
        let mut max_blocks = max_size / BlockHeader::SIZE;
        if max_blocks < 2 {
            max_blocks = 2;
        }
        Self {
            block_nr: 0,
            wrote_eof: false,
            writer,
            max_blocks,
        }
    }
}

impl<W: std::io::Write> BlockWrite for EmulateTapeWriter<W> {
    fn write_block(&mut self, buffer: &[u8]) -> Result<bool, std::io::Error> {
        if buffer.len() != BlockHeader::SIZE {
            proxmox_lang::io_bail!(
                "EmulateTapeWriter: got write with wrong block size ({} != {})",
                buffer.len(),
                BlockHeader::SIZE,
            );
        }

        if self.block_nr >= self.max_blocks + 2 {
            return Err(std::io::Error::from_raw_os_error(nix::errno::Errno::ENOSPC as i32));
        }

        self.writer.write_all(buffer)?;
        self.block_nr += 1;

        Ok(self.block_nr > self.max_blocks)
    }

    fn write_filemark(&mut self) -> Result<(), std::io::Error> {
        if self.wrote_eof {
            proxmox_lang::io_bail!("EmulateTapeWriter: detected multiple EOF writes");
        }
        self.wrote_eof = true;
        Ok(())
    }
}
