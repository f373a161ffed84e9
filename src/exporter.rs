//! Drives one export: record set in, TAR archive of FITS files out.
//!
//! Each record's segments are read in raw form, mapped to a self-contained
//! FITS file through the bridge, named by the request's file-name template,
//! and streamed into the archive. Per-file failures are collected into an
//! error report rather than aborting the run; the manifest
//! (`jsoc/file_list.txt`) and the error report (`jsoc/error_list.txt`) go
//! into the archive when non-empty, followed by the end-of-archive marker.
//!
//! A broken sink (or a size cap) sets the terminate flag: the current
//! file's bytes are already out, no further member headers are written, and
//! `finish` still produces a well-formed archive tail.

use std::io::Write;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{info, warn};

use crate::bridge::{self, BridgeOptions, KeyMap, KeyMapRegistry};
use crate::error::Result;
use crate::fits::{self, Compression, CompressSpec, FitsKeyword};
use crate::filename;
use crate::keyword::KeywordBinding;
use crate::record::Record;
use crate::segment::SegmentIo;
use crate::tar::TarStreamer;
use crate::types::StoreType;

pub const FILE_LIST_PATH: &str = "jsoc/file_list.txt";
pub const ERROR_LIST_PATH: &str = "jsoc/error_list.txt";

#[derive(Debug, Default)]
pub struct ExportOptions {
    pub filename_format: Option<String>,
    pub keymap_class: Option<String>,
    pub keymap: Option<KeyMap>,
    pub bridge: BridgeOptions,
    /// Per-segment compression, extended by repeating the last entry.
    pub compression: Vec<Option<Compression>>,
    /// Acknowledgement file appended into the archive when present.
    pub ack_file: Option<PathBuf>,
}

impl ExportOptions {
    fn compression_for(&self, segnum: usize) -> Option<Compression> {
        match self.compression.get(segnum) {
            Some(c) => *c,
            None => self.compression.last().copied().flatten(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExportSummary {
    pub files: u64,
    pub bytes: u64,
    pub had_errors: bool,
    pub terminated: bool,
}

pub struct ExportSession<'a, W: Write> {
    tar: TarStreamer<W>,
    io: SegmentIo<'a>,
    registry: &'a KeyMapRegistry,
    opts: ExportOptions,
    info_buf: String,
    error_buf: String,
    name_counter: u64,
    files: u64,
    bytes: u64,
    terminated: bool,
}

impl<'a, W: Write> ExportSession<'a, W> {
    pub fn new(
        tar: TarStreamer<W>,
        io: SegmentIo<'a>,
        registry: &'a KeyMapRegistry,
        opts: ExportOptions,
    ) -> ExportSession<'a, W> {
        ExportSession {
            tar,
            io,
            registry,
            opts,
            info_buf: String::new(),
            error_buf: String::new(),
            name_counter: 0,
            files: 0,
            bytes: 0,
            terminated: false,
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Export every segment of one record. Per-segment problems are logged
    /// into the error report; only template failures and sink termination
    /// cut the run short.
    pub fn export_record(&mut self, rec: &Record) -> Result<()> {
        if self.terminated {
            return Ok(());
        }

        let spec = rec.spec();

        for seg in &rec.segments {
            let file_name = filename::make_export_filename(
                rec,
                &seg.name,
                self.opts.filename_format.as_deref(),
                &mut self.name_counter,
            )?;

            // a segment whose file was never produced is not an error;
            // there is simply nothing to export
            if let Ok(path) = rec
                .segment_followed(&seg.name)
                .and_then(|(owner, s)| owner.segment_path(s))
            {
                if !path.exists() {
                    info!(segment = %seg.name, record = %spec, "no segment file, skipping");
                    continue;
                }
            }

            match self.render_fits(rec, &seg.name, seg.segnum) {
                Ok(bytes) => {
                    if self.terminated {
                        return Ok(());
                    }

                    match self.tar.append(&file_name, &bytes, unix_now()) {
                        Ok(()) => {
                            self.files += 1;
                            self.bytes += bytes.len() as u64;
                            self.info_buf.push_str(&format!(
                                "record = {spec}, file = {file_name}, message = successful export\n"
                            ));
                        }
                        Err(err) => {
                            self.error_buf.push_str(&format!(
                                "record = {spec}, file = {file_name}, message = {err}\n"
                            ));
                            self.terminated = true;
                            warn!(error = %err, "archive sink terminated");
                            return Ok(());
                        }
                    }
                }
                Err(err) => {
                    self.error_buf.push_str(&format!(
                        "record = {spec}, file = {file_name}, message = {err}\n"
                    ));
                }
            }
        }

        Ok(())
    }

    /// Produce the complete FITS byte stream for one segment.
    fn render_fits(&mut self, rec: &Record, segname: &str, segnum: usize) -> Result<Vec<u8>> {
        let arr = self.io.read(rec, segname, StoreType::Raw)?;
        let info = bridge::set_image_info(&arr)?;

        let mut cards: Vec<FitsKeyword> = Vec::new();
        for key in rec.keywords.iter_ranked() {
            // per-segment keywords belong to their own segment only
            if key.info.flags.per_segment() && !key.info.name.starts_with(segname) {
                continue;
            }

            let resolved = match &key.binding {
                KeywordBinding::Stored(_) => key,
                KeywordBinding::Link { .. } => match rec.keyword_followed(&key.info.name) {
                    Ok(k) => k,
                    Err(err) => {
                        warn!(keyword = %key.info.name, error = %err, "skipping unresolvable keyword");
                        continue;
                    }
                },
            };

            match bridge::export_keyword(
                resolved,
                self.opts.keymap_class.as_deref(),
                self.opts.keymap.as_ref(),
                self.registry,
                self.opts.bridge,
            ) {
                Ok(card) => cards.push(card),
                Err(err) => {
                    warn!(keyword = %key.info.name, error = %err, "cannot map keyword to FITS");
                }
            }
        }

        let comp = self
            .opts
            .compression_for(segnum)
            .map(CompressSpec::rows);

        let mut bytes = Vec::new();
        fits::write_fits(&mut bytes, &info, &cards, &arr.to_be_bytes(), comp)?;
        Ok(bytes)
    }

    /// Write the manifest, the error report, the acknowledgement file, and
    /// the end-of-archive marker.
    pub fn finish(mut self) -> Result<ExportSummary> {
        let now = unix_now();
        let had_errors = !self.error_buf.is_empty();

        if !self.info_buf.is_empty() && !self.terminated {
            let body = std::mem::take(&mut self.info_buf);
            if let Err(err) = self.tar.append(FILE_LIST_PATH, body.as_bytes(), now) {
                warn!(error = %err, "could not archive the manifest");
                self.terminated = true;
            }
        }

        if had_errors {
            let body = std::mem::take(&mut self.error_buf);
            if let Err(err) = self.tar.append(ERROR_LIST_PATH, body.as_bytes(), now) {
                warn!(error = %err, "could not archive the error report");
            }
        }

        if let Some(ack) = self.opts.ack_file.take() {
            match std::fs::read(&ack) {
                Ok(body) => {
                    let name = ack
                        .file_name()
                        .map(|n| format!("jsoc/{}", n.to_string_lossy()))
                        .unwrap_or_else(|| "jsoc/ack".to_owned());
                    if let Err(err) = self.tar.append(&name, &body, now) {
                        warn!(error = %err, "could not archive the acknowledgement file");
                    }
                }
                Err(err) => warn!(path = %ack.display(), error = %err, "cannot read acknowledgement file"),
            }
        }

        self.tar.finish()?;

        Ok(ExportSummary {
            files: self.files,
            bytes: self.bytes,
            had_errors,
            terminated: self.terminated,
        })
    }
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayFlat, DataArray};
    use crate::error::ExportError;
    use crate::keyword::{Keyword, KeywordFlags, KeywordInfo, RecScope};
    use crate::record::{Protocol, SegmentInfo, SeriesInfo};
    use crate::segment::StorageAllocator;
    use crate::types::StoreValue;
    use crate::vds::VdsCache;
    use std::path::PathBuf;
    use std::rc::Rc;

    struct NoStorage;

    impl StorageAllocator for NoStorage {
        fn stage(&self, series: &str, sunum: i64) -> Result<PathBuf> {
            Err(ExportError::Offline(format!("{series}:{sunum}")))
        }

        fn record_dir(&self, series: &str, recnum: i64) -> Result<PathBuf> {
            Err(ExportError::Offline(format!("{series}:#{recnum}")))
        }
    }

    fn staged_record(dir: &std::path::Path) -> Record {
        let series = Rc::new(SeriesInfo::new("lab.obs"));
        let mut rec = Record::new(series, 42);
        rec.su_dir = Some(dir.to_path_buf());
        rec.sunum = 9;
        rec.segments.push(SegmentInfo::new(
            "image",
            0,
            StoreType::Short,
            &[2, 2],
            Protocol::Fits,
        ));
        rec.keywords.insert(Keyword::stored(
            KeywordInfo {
                name: "quality".into(),
                ty: StoreType::Int,
                format: "%d".into(),
                unit: String::new(),
                description: String::new(),
                scope: RecScope::Variable,
                flags: KeywordFlags::default(),
                rank: 0,
            },
            StoreValue::Int(0),
        ));
        rec
    }

    fn write_image(rec: &mut Record) {
        let su = NoStorage;
        let mut vds = VdsCache::default();
        let mut io = SegmentIo::new(&su, None, &mut vds);

        let mut arr = DataArray::from_flat(
            StoreType::Short,
            &[2, 2],
            ArrayFlat::Short(vec![1, 2, 3, 4]),
        )
        .unwrap();
        arr.israw = true;
        io.write(rec, "image", &arr, false).unwrap();
    }

    #[test]
    fn export_produces_archive_with_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = staged_record(tmp.path());
        write_image(&mut rec);

        let su = NoStorage;
        let mut vds = VdsCache::default();
        let io = SegmentIo::new(&su, None, &mut vds);
        let registry = KeyMapRegistry::new();

        let mut out = Vec::new();
        let tar = TarStreamer::new(&mut out, None);
        let mut session =
            ExportSession::new(tar, io, &registry, ExportOptions::default());

        session.export_record(&rec).unwrap();
        let summary = session.finish().unwrap();

        assert_eq!(summary.files, 1);
        assert!(!summary.had_errors);
        assert!(!summary.terminated);

        // default template: lab.obs.42.image
        assert_eq!(&out[0..15], b"lab.obs.42.imag");
        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("jsoc/file_list.txt"));
        assert!(text.contains("message = successful export"));
        assert!(!text.contains("jsoc/error_list.txt"));
    }

    #[test]
    fn missing_segment_file_is_skipped_silently() {
        let tmp = tempfile::tempdir().unwrap();
        let rec = staged_record(tmp.path());

        let su = NoStorage;
        let mut vds = VdsCache::default();
        let io = SegmentIo::new(&su, None, &mut vds);
        let registry = KeyMapRegistry::new();

        let mut out = Vec::new();
        let tar = TarStreamer::new(&mut out, None);
        let mut session =
            ExportSession::new(tar, io, &registry, ExportOptions::default());

        session.export_record(&rec).unwrap();
        let summary = session.finish().unwrap();

        assert_eq!(summary.files, 0);
        assert!(!summary.had_errors);
        // just the end-of-archive marker
        assert_eq!(out.len(), 1024);
    }

    #[test]
    fn cap_terminates_cleanly_with_error_report() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = staged_record(tmp.path());
        write_image(&mut rec);

        let su = NoStorage;
        let mut vds = VdsCache::default();
        let io = SegmentIo::new(&su, None, &mut vds);
        let registry = KeyMapRegistry::new();

        let mut out = Vec::new();
        // far too small for even one member
        let tar = TarStreamer::new(&mut out, Some(2048));
        let mut session =
            ExportSession::new(tar, io, &registry, ExportOptions::default());

        session.export_record(&rec).unwrap();
        assert!(session.is_terminated());
        let summary = session.finish().unwrap();

        assert_eq!(summary.files, 0);
        assert!(summary.had_errors);
        assert!(summary.terminated);

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("jsoc/error_list.txt"));
        assert!(text.contains("truncated"));
    }

    #[test]
    fn gzip_compression_request_is_honored() {
        let tmp = tempfile::tempdir().unwrap();
        let mut rec = staged_record(tmp.path());
        write_image(&mut rec);

        let su = NoStorage;
        let mut vds = VdsCache::default();
        let io = SegmentIo::new(&su, None, &mut vds);
        let registry = KeyMapRegistry::new();

        let mut out = Vec::new();
        let tar = TarStreamer::new(&mut out, None);
        let opts = ExportOptions {
            compression: vec![Some(Compression::Gzip1)],
            ..Default::default()
        };
        let mut session = ExportSession::new(tar, io, &registry, opts);

        session.export_record(&rec).unwrap();
        let summary = session.finish().unwrap();
        assert_eq!(summary.files, 1);

        let text = String::from_utf8_lossy(&out);
        assert!(text.contains("ZIMAGE"));
        assert!(text.contains("GZIP_1"));
    }
}
