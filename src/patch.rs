//! Binary delta patch application (JojoDiff format)
//!
//! Applies a JojoDiff patch stream to a source image, producing the target
//! image. Streams are generic: the source needs `Read + Seek`, the patch is
//! forward-only `Read`, the target is forward-only `Write`. Flash-backed
//! adapters live here too: [`FlashSource`] serves 1 KiB pages from the
//! running image with an invalidate-on-seek cache, [`FlashTarget`] appends
//! to the update partition.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use thiserror::Error;

use crate::flash::Flash;

/// Escape byte introducing a patch opcode
const ESC: u8 = 0xA7;
/// Modify: subsequent bytes replace source bytes one for one
const OP_MOD: u8 = 0xA6;
/// Insert: subsequent bytes are emitted without consuming source
const OP_INS: u8 = 0xA5;
/// Delete: skip a run of source bytes
const OP_DEL: u8 = 0xA4;
/// Equal: copy a run of source bytes to the target
const OP_EQL: u8 = 0xA3;
/// Backtrace: seek the source backwards
const OP_BKT: u8 = 0xA2;

/// Source page cache size
pub const PAGE_SIZE: usize = 1024;

/// Delta patch failures
#[derive(Error, Debug)]
pub enum PatchError {
    /// Patch stream ended inside a length field
    #[error("patch stream truncated")]
    TruncatedPatch,

    /// Length field uses a reserved prefix
    #[error("invalid length encoding")]
    BadLength,

    /// Source image ended inside a copy run
    #[error("source image exhausted")]
    TruncatedSource,

    /// Stream IO error
    #[error("patch IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Clone, Copy, PartialEq)]
enum Mode {
    Modify,
    Insert,
}

fn next_byte<P: Read>(patch: &mut P) -> Result<Option<u8>, PatchError> {
    let mut byte = [0u8; 1];
    loop {
        match patch.read(&mut byte) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(byte[0])),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

fn must_byte<P: Read>(patch: &mut P) -> Result<u8, PatchError> {
    next_byte(patch)?.ok_or(PatchError::TruncatedPatch)
}

/// JojoDiff run length: 1 byte for 1..=252, then 252/253/254-prefixed wider
/// encodings.
fn read_length<P: Read>(patch: &mut P) -> Result<u64, PatchError> {
    let first = must_byte(patch)?;
    Ok(match first {
        0..=251 => first as u64 + 1,
        252 => 253 + must_byte(patch)? as u64,
        253 => {
            let hi = must_byte(patch)? as u64;
            let lo = must_byte(patch)? as u64;
            509 + (hi << 8) + lo
        }
        254 => {
            let mut value: u64 = 0;
            for _ in 0..4 {
                value = (value << 8) + must_byte(patch)? as u64;
            }
            65_789 + value
        }
        _ => return Err(PatchError::BadLength),
    })
}

fn copy_run<S: Read, T: Write>(
    source: &mut S,
    target: &mut T,
    mut len: u64,
) -> Result<u64, PatchError> {
    let mut chunk = [0u8; PAGE_SIZE];
    let mut copied = 0u64;
    while len > 0 {
        let want = (len as usize).min(PAGE_SIZE);
        let got = source.read(&mut chunk[..want])?;
        if got == 0 {
            return Err(PatchError::TruncatedSource);
        }
        target.write_all(&chunk[..got])?;
        copied += got as u64;
        len -= got as u64;
    }
    Ok(copied)
}

/// Apply a JojoDiff patch stream.
///
/// Reads `patch` to EOF, consuming `source` runs as directed and writing the
/// reconstructed image to `target`. Returns the number of target bytes
/// written.
pub fn apply<S, P, T>(source: &mut S, patch: &mut P, target: &mut T) -> Result<u64, PatchError>
where
    S: Read + Seek,
    P: Read,
    T: Write,
{
    let mut mode = Mode::Modify;
    let mut written: u64 = 0;
    let mut scratch = [0u8; 1];

    // Emit one data byte in the current mode; Modify also consumes one
    // source byte to keep positions aligned.
    macro_rules! emit {
        ($byte:expr) => {{
            target.write_all(&[$byte])?;
            written += 1;
            if mode == Mode::Modify {
                let _ = source.read(&mut scratch)?;
            }
        }};
    }

    while let Some(byte) = next_byte(patch)? {
        if byte != ESC {
            emit!(byte);
            continue;
        }

        let Some(op) = next_byte(patch)? else {
            // Trailing lone ESC is data
            emit!(ESC);
            break;
        };

        match op {
            OP_EQL => {
                let len = read_length(patch)?;
                written += copy_run(source, target, len)?;
            }
            OP_DEL => {
                let len = read_length(patch)?;
                source.seek(SeekFrom::Current(len as i64))?;
            }
            OP_BKT => {
                let len = read_length(patch)?;
                source.seek(SeekFrom::Current(-(len as i64)))?;
            }
            OP_MOD => mode = Mode::Modify,
            OP_INS => mode = Mode::Insert,
            other => {
                // Not an opcode: ESC and the byte after it are data
                emit!(ESC);
                emit!(other);
            }
        }
    }

    target.flush()?;
    Ok(written)
}

// ============================================================================
// Flash-backed streams
// ============================================================================

/// Read adapter over the running image with a one-page cache.
///
/// The cache is invalidated by every seek; sequential reads within a page
/// hit the cache.
pub struct FlashSource {
    flash: Arc<dyn Flash>,
    pos: u64,
    size: u64,
    cache: Box<[u8; PAGE_SIZE]>,
    cached_page: u64,
    cache_valid: bool,
}

impl FlashSource {
    pub fn new(flash: Arc<dyn Flash>) -> Self {
        let size = flash.running_size() as u64;
        Self {
            flash,
            pos: 0,
            size,
            cache: Box::new([0u8; PAGE_SIZE]),
            cached_page: 0,
            cache_valid: false,
        }
    }
}

impl Read for FlashSource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.pos >= self.size {
            return Ok(0);
        }

        let page = self.pos / PAGE_SIZE as u64;
        let page_start = page * PAGE_SIZE as u64;
        let page_len = PAGE_SIZE.min((self.size - page_start) as usize);

        if !self.cache_valid || self.cached_page != page {
            self.flash
                .read_running(page_start as u32, &mut self.cache[..page_len])?;
            self.cached_page = page;
            self.cache_valid = true;
        }

        let page_off = (self.pos - page_start) as usize;
        let n = buf.len().min(page_len - page_off);
        buf[..n].copy_from_slice(&self.cache[page_off..page_off + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FlashSource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(p) => p as i64,
            SeekFrom::Current(d) => self.pos as i64 + d,
            SeekFrom::End(d) => self.size as i64 + d,
        };
        if new_pos < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before start",
            ));
        }
        self.pos = new_pos as u64;
        self.cache_valid = false;
        Ok(self.pos)
    }
}

/// Forward-only write adapter over the update partition
pub struct FlashTarget {
    flash: Arc<dyn Flash>,
    offset: u32,
}

impl FlashTarget {
    pub fn new(flash: Arc<dyn Flash>) -> Self {
        Self { flash, offset: 0 }
    }

    /// Bytes written so far
    pub fn written(&self) -> u32 {
        self.offset
    }
}

impl Write for FlashTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.flash.write_update(self.offset, buf)?;
        self.offset += buf.len() as u32;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
