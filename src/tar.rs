//! Streaming USTAR archive writer.
//!
//! Exported FITS files go out on a single forward pass over a byte sink
//! that may not be seekable (a pipe, an HTTP response). Each member is a
//! 512-byte header whose checksum is computed with the checksum field
//! blanked to spaces, the payload, and zero padding to the next block; the
//! archive ends with 1024 zero bytes. The stream is flushed after every
//! header and every payload so a truncated stream is a legal archive prefix
//! up to the last completed member.
//!
//! Two size regimes exist: a hard ~2 GiB cap when the sink is a single HTTP
//! response, and a ~50 GiB cap per file when staging to disk, where the
//! writer rolls over to `<reqid>_NNNN.tar` siblings instead of failing.

use std::ffi::CStr;
use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{ExportError, Result};

pub const BLOCK_SIZE: u64 = 512;
pub const END_OF_ARCHIVE: u64 = 1024;

/// Cap for a single-response (CGI) sink.
pub const URL_CGI_CAP: u64 = 2 * 1024 * 1024 * 1024;
/// Cap per staged archive file before rolling.
pub const STAGING_CAP: u64 = 50 * 1024 * 1024 * 1024;

const NAME_LEN: usize = 100;

/// Process identity stamped into member headers.
#[derive(Debug, Clone)]
pub struct TarOwner {
    pub uid: u32,
    pub gid: u32,
    pub uname: String,
    pub gname: String,
}

impl TarOwner {
    /// The running process's identity, names resolved through the passwd
    /// and group databases (empty on lookup failure).
    pub fn current() -> TarOwner {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };

        TarOwner {
            uid,
            gid,
            uname: lookup_user_name(uid).unwrap_or_default(),
            gname: lookup_group_name(gid).unwrap_or_default(),
        }
    }
}

fn lookup_user_name(uid: u32) -> Option<String> {
    unsafe {
        let pw = libc::getpwuid(uid);
        if pw.is_null() {
            warn!(uid, "user id not found");
            return None;
        }
        Some(CStr::from_ptr((*pw).pw_name).to_string_lossy().into_owned())
    }
}

fn lookup_group_name(gid: u32) -> Option<String> {
    unsafe {
        let gr = libc::getgrgid(gid);
        if gr.is_null() {
            warn!(gid, "group id not found");
            return None;
        }
        Some(CStr::from_ptr((*gr).gr_name).to_string_lossy().into_owned())
    }
}

fn octal_field(buf: &mut [u8], value: u64) {
    // width-1 octal digits, NUL terminated
    let digits = buf.len() - 1;
    let text = format!("{:0width$o}", value, width = digits);
    buf[..digits].copy_from_slice(&text.as_bytes()[text.len() - digits..]);
    buf[digits] = 0;
}

fn text_field(buf: &mut [u8], text: &str) {
    let bytes = text.as_bytes();
    let n = bytes.len().min(buf.len());
    buf[..n].copy_from_slice(&bytes[..n]);
}

/// Compose one member header. The checksum is the unsigned byte sum of the
/// header with the checksum field counted as eight spaces, written back as
/// a seven-digit octal field.
pub fn member_header(name: &str, size: u64, mtime: u64, owner: &TarOwner) -> Result<[u8; 512]> {
    if name.len() > NAME_LEN {
        return Err(ExportError::BadRequest(format!(
            "member name '{name}' exceeds {NAME_LEN} bytes"
        )));
    }

    let mut h = [0u8; 512];

    text_field(&mut h[0..100], name);
    octal_field(&mut h[100..108], 0o664);
    octal_field(&mut h[108..116], owner.uid as u64);
    octal_field(&mut h[116..124], owner.gid as u64);
    octal_field(&mut h[124..136], size);
    octal_field(&mut h[136..148], mtime);
    h[148..156].copy_from_slice(b"        ");
    h[156] = b'0'; // regular file
    h[257..263].copy_from_slice(b"ustar\0");
    h[263..265].copy_from_slice(b"00");
    text_field(&mut h[265..297], &owner.uname);
    text_field(&mut h[297..329], &owner.gname);
    // device major/minor and prefix stay zeroed

    let checksum: u64 = h.iter().map(|b| *b as u64).sum();
    octal_field(&mut h[148..156], checksum);

    Ok(h)
}

fn padded(size: u64) -> u64 {
    (size + BLOCK_SIZE - 1) / BLOCK_SIZE * BLOCK_SIZE
}

pub struct TarStreamer<W: Write> {
    sink: W,
    owner: TarOwner,
    written: u64,
    cap: Option<u64>,
    finished: bool,
}

impl<W: Write> TarStreamer<W> {
    pub fn new(sink: W, cap: Option<u64>) -> TarStreamer<W> {
        TarStreamer {
            sink,
            owner: TarOwner::current(),
            written: 0,
            cap,
            finished: false,
        }
    }

    pub fn with_owner(sink: W, cap: Option<u64>, owner: TarOwner) -> TarStreamer<W> {
        TarStreamer {
            sink,
            owner,
            written: 0,
            cap,
            finished: false,
        }
    }

    pub fn written(&self) -> u64 {
        self.written
    }

    /// Would appending a member of `size` bytes (plus the end-of-archive
    /// marker) overrun the cap?
    pub fn would_exceed(&self, size: u64) -> bool {
        match self.cap {
            Some(cap) => self.written + BLOCK_SIZE + padded(size) + END_OF_ARCHIVE > cap,
            None => false,
        }
    }

    /// Append one regular-file member.
    pub fn append(&mut self, name: &str, data: &[u8], mtime: u64) -> Result<()> {
        if self.finished {
            return Err(ExportError::Internal("archive already finished".into()));
        }

        let size = data.len() as u64;
        if self.would_exceed(size) {
            return Err(ExportError::Truncated {
                limit: self.cap.unwrap_or(0),
            });
        }

        let header = member_header(name, size, mtime, &self.owner)?;
        self.sink.write_all(&header)?;
        self.sink.flush()?;

        self.sink.write_all(data)?;
        let pad = padded(size) - size;
        if pad > 0 {
            self.sink.write_all(&vec![0u8; pad as usize])?;
        }
        self.sink.flush()?;

        self.written += BLOCK_SIZE + padded(size);
        debug!(name, size, "archived member");
        Ok(())
    }

    /// Write the end-of-archive marker. Idempotent.
    pub fn finish(&mut self) -> Result<()> {
        if self.finished {
            return Ok(());
        }

        self.sink.write_all(&[0u8; END_OF_ARCHIVE as usize])?;
        self.sink.flush()?;
        self.written += END_OF_ARCHIVE;
        self.finished = true;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.sink
    }
}

/// Archive writer over staging files that rolls to a numbered sibling when
/// the per-file cap is reached.
pub struct RollingTarWriter {
    dir: PathBuf,
    reqid: String,
    cap: u64,
    index: u32,
    current: Option<TarStreamer<File>>,
}

impl RollingTarWriter {
    pub fn new(dir: &Path, reqid: &str, cap: u64) -> RollingTarWriter {
        RollingTarWriter {
            dir: dir.to_path_buf(),
            reqid: reqid.to_owned(),
            cap,
            index: 0,
            current: None,
        }
    }

    fn archive_path(&self) -> PathBuf {
        if self.index == 0 {
            self.dir.join(format!("{}.tar", self.reqid))
        } else {
            self.dir.join(format!("{}_{:04}.tar", self.reqid, self.index))
        }
    }

    fn open_current(&mut self) -> Result<&mut TarStreamer<File>> {
        if self.current.is_none() {
            let file = File::create(self.archive_path())?;
            self.current = Some(TarStreamer::new(file, Some(self.cap)));
        }
        Ok(self.current.as_mut().unwrap())
    }

    pub fn append(&mut self, name: &str, data: &[u8], mtime: u64) -> Result<()> {
        let needs_roll = match &self.current {
            Some(cur) => cur.would_exceed(data.len() as u64),
            None => false,
        };

        if needs_roll {
            if let Some(mut cur) = self.current.take() {
                cur.finish()?;
            }
            self.index += 1;
            debug!(index = self.index, "rolling archive");
        }

        self.open_current()?.append(name, data, mtime)
    }

    pub fn finish(mut self) -> Result<()> {
        if let Some(mut cur) = self.current.take() {
            cur.finish()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner() -> TarOwner {
        TarOwner {
            uid: 1000,
            gid: 1000,
            uname: "tester".into(),
            gname: "testers".into(),
        }
    }

    fn verify_checksum(header: &[u8]) -> bool {
        let mut scratch = [0u8; 512];
        scratch.copy_from_slice(header);
        scratch[148..156].copy_from_slice(b"        ");
        let sum: u64 = scratch.iter().map(|b| *b as u64).sum();

        let text = std::str::from_utf8(&header[148..155]).unwrap();
        let parsed = u64::from_str_radix(text, 8).unwrap();
        parsed == sum
    }

    #[test]
    fn two_member_archive_layout() {
        let mut out = Vec::new();
        let mut tar = TarStreamer::with_owner(&mut out, None, owner());

        tar.append("a.fits", b"abc", 1_700_000_000).unwrap();
        tar.append("b.fits", &vec![7u8; 513], 1_700_000_000).unwrap();
        tar.finish().unwrap();

        // 512 + 512 + 512 + 1024 + 1024
        assert_eq!(out.len(), 3584);

        // member names sit at their block starts
        assert_eq!(&out[0..6], b"a.fits");
        assert_eq!(&out[1024..1030], b"b.fits");

        // trailing end-of-archive is all zero
        assert!(out[out.len() - 1024..].iter().all(|b| *b == 0));
    }

    #[test]
    fn header_fields_and_checksum() {
        let h = member_header("x.fits", 3, 1_700_000_000, &owner()).unwrap();

        assert_eq!(&h[100..108], b"0000664\0");
        assert_eq!(&h[257..263], b"ustar\0");
        assert_eq!(&h[263..265], b"00");
        assert_eq!(h[156], b'0');
        assert_eq!(&h[265..271], b"tester");

        // size: 11 octal digits, NUL terminated
        assert_eq!(&h[124..136], b"00000000003\0");
        assert!(verify_checksum(&h));
    }

    #[test]
    fn payload_is_zero_padded() {
        let mut out = Vec::new();
        let mut tar = TarStreamer::with_owner(&mut out, None, owner());
        tar.append("a", b"xyz", 0).unwrap();

        assert_eq!(&out[512..515], b"xyz");
        assert!(out[515..1024].iter().all(|b| *b == 0));
    }

    #[test]
    fn cap_produces_truncated_error() {
        let mut out = Vec::new();
        let mut tar = TarStreamer::with_owner(&mut out, Some(4096), owner());

        tar.append("one", &vec![1u8; 512], 0).unwrap();
        let err = tar.append("two", &vec![2u8; 4096], 0).unwrap_err();
        assert!(matches!(err, ExportError::Truncated { limit: 4096 }));

        // the archive still terminates cleanly
        tar.finish().unwrap();
        assert_eq!(out.len() as u64, 512 + 512 + 1024);
    }

    #[test]
    fn rolling_writer_rolls_at_cap() {
        let tmp = tempfile::tempdir().unwrap();
        let mut writer = RollingTarWriter::new(tmp.path(), "REQ_9", 8192);

        for _ in 0..4 {
            writer.append("member", &vec![0u8; 2048], 0).unwrap();
        }
        writer.finish().unwrap();

        assert!(tmp.path().join("REQ_9.tar").exists());
        assert!(tmp.path().join("REQ_9_0001.tar").exists());
    }

    #[test]
    fn long_names_are_rejected() {
        let name = "x".repeat(101);
        assert!(member_header(&name, 0, 0, &owner()).is_err());
    }
}
