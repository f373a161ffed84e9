//! Protocol-dispatched segment payload I/O.
//!
//! A segment's payload lives in one of several on-disk container formats;
//! this module reads and writes them behind one typed interface. Reads
//! convert to the caller's requested type (or hand back the raw on-disk
//! form), writes scale into the segment's declared storage type, optionally
//! choosing the scaling automatically.
//!
//! BINARY containers are a raw big-endian element stream with a small
//! trailing header (magic, type tag, axes, scaling, trailer length last so
//! the reader can find it from the end of the file). BINZIP is the same
//! stream gzip-wrapped. TAS stacks every record of a storage unit into one
//! FITS file with an extra trailing axis indexed by slot number.

use std::any::Any;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use tracing::warn;

use crate::array::DataArray;
use crate::bridge;
use crate::error::{ExportError, Result};
use crate::fits::{self, CompressSpec, Compression};
use crate::keyword::SLOT_EPSILON;
use crate::record::{Protocol, Record, SegScope, SegmentInfo};
use crate::types::{StoreType, StoreValue};
use crate::vds::VdsCache;

/// Provides directories for record payloads. Staging may block for a long
/// time when tape retrieval is involved; implementations distinguish
/// `Offline` (unit cannot be brought online) from hard errors.
pub trait StorageAllocator {
    fn stage(&self, series: &str, sunum: i64) -> Result<PathBuf>;

    /// Directory of an arbitrary record's storage slot, used to reach the
    /// canonical copy of a constant segment.
    fn record_dir(&self, series: &str, recnum: i64) -> Result<PathBuf>;
}

/// Opaque externally-opened container.
pub type LegacyHandle = Box<dyn Any>;

/// The external legacy library serving the `LOCAL` and `DSDS` protocols.
/// Only reads exist; the containers are cached per request in a `VdsCache`.
pub trait LegacyReader {
    /// Cache key for the container serving this record's segment.
    fn handle_key(&self, rec: &Record, seg: &SegmentInfo) -> String;

    fn open(&self, rec: &Record, seg: &SegmentInfo) -> Result<LegacyHandle>;

    /// Read the record's payload in raw on-disk form.
    fn read(&self, handle: &LegacyHandle, rec: &Record, seg: &SegmentInfo) -> Result<DataArray>;
}

/// The segment I/O engine: protocol dispatch plus the context it needs.
pub struct SegmentIo<'a> {
    pub su: &'a dyn StorageAllocator,
    pub legacy: Option<&'a dyn LegacyReader>,
    pub vds: &'a mut VdsCache<LegacyHandle>,
}

impl<'a> SegmentIo<'a> {
    pub fn new(
        su: &'a dyn StorageAllocator,
        legacy: Option<&'a dyn LegacyReader>,
        vds: &'a mut VdsCache<LegacyHandle>,
    ) -> SegmentIo<'a> {
        SegmentIo { su, legacy, vds }
    }

    /// Read a segment's full payload, converted to `ty` (or raw on-disk
    /// form for `StoreType::Raw`). A missing file yields a fresh array
    /// filled with the missing sentinel.
    pub fn read(&mut self, rec: &Record, segname: &str, ty: StoreType) -> Result<DataArray> {
        let (owner, seg) = rec.segment_followed(segname)?;
        self.read_resolved(owner, seg, ty)
    }

    /// Read a sub-array. `start`/`end` are inclusive bounds per axis in the
    /// segment's own rank; for TAS segments the record axis is addressed
    /// internally and the returned array has the segment's rank.
    pub fn read_slice(
        &mut self,
        rec: &Record,
        segname: &str,
        ty: StoreType,
        start: &[usize],
        end: &[usize],
    ) -> Result<DataArray> {
        let (owner, seg) = rec.segment_followed(segname)?;

        let full = self.read_resolved(owner, seg, StoreType::Raw)?;
        let mut sliced = full.slice(start, end)?;
        sliced.bzero = full.bzero;
        sliced.bscale = full.bscale;
        sliced.israw = true;

        finish_read(sliced, seg, ty)
    }

    fn read_resolved(&mut self, owner: &Record, seg: &SegmentInfo, ty: StoreType) -> Result<DataArray> {
        if seg.scope == SegScope::Constant && seg.const_record_recnum == 0 {
            return Err(ExportError::BadRequest(format!(
                "constant segment '{}' has not been initialized in {}",
                seg.name, owner.series.name
            )));
        }

        if seg.protocol == Protocol::Generic {
            return Err(ExportError::Unsupported(format!(
                "typed read of generic segment '{}'",
                seg.name
            )));
        }

        if matches!(seg.protocol, Protocol::Local | Protocol::Dsds) {
            return self.read_legacy(owner, seg, ty);
        }

        let dir = self.segment_dir(owner, seg)?;
        let path = dir.join(seg.disk_name());

        if !path.exists() {
            // No such file: a fresh array filled with MISSING.
            let elem = if ty == StoreType::Raw { seg.ty } else { ty };
            let mut arr = DataArray::filled_missing(elem, &seg.axes)?;
            arr.bzero = seg.bzero;
            arr.bscale = seg.bscale;
            arr.israw = ty == StoreType::Raw;
            return Ok(arr);
        }

        let mut arr = match seg.protocol {
            Protocol::Fits | Protocol::FitsTiled => {
                let img = fits::read_fits_file(&path)?;
                let arr = bridge::create_array(&img)?;
                check_scaling(&arr, seg, &path)?;
                arr
            }
            Protocol::Binary => binfile_read(&path)?,
            Protocol::Binzip => zipfile_read(&path)?,
            Protocol::Tas => {
                let arr = tas_read_slice(&path, seg, owner.slotnum)?;
                check_scaling(&arr, seg, &path)?;
                arr
            }
            Protocol::Generic | Protocol::Local | Protocol::Dsds => unreachable!(),
        };

        // dimensions must match the descriptor
        if seg.protocol != Protocol::Tas && arr.ty != seg.ty {
            return Err(ExportError::Internal(format!(
                "type in file ({}) does not match segment descriptor ({})",
                arr.ty.name(),
                seg.ty.name()
            )));
        }
        if arr.axes() != seg.axes {
            return Err(ExportError::Internal(format!(
                "axes in file ({:?}) do not match segment descriptor ({:?})",
                arr.axes(),
                seg.axes
            )));
        }

        arr.start = vec![0; seg.naxis()];
        finish_read(arr, seg, ty)
    }

    fn read_legacy(&mut self, owner: &Record, seg: &SegmentInfo, ty: StoreType) -> Result<DataArray> {
        let reader = self.legacy.ok_or_else(|| {
            ExportError::Unsupported(
                "this environment has no legacy container library".into(),
            )
        })?;

        let key = reader.handle_key(owner, seg);
        if self.vds.get(&key).is_none() {
            let handle = reader.open(owner, seg)?;
            self.vds.insert(&key, handle);
        }

        let handle = self.vds.get(&key).unwrap();
        let arr = reader.read(handle, owner, seg)?;
        check_scaling(&arr, seg, Path::new(&key))?;
        finish_read(arr, seg, ty)
    }

    /// Write an array into a segment, scaling into the declared storage
    /// type. With `autoscale`, the segment's scaling is first chosen from
    /// the array's value range.
    pub fn write(
        &mut self,
        rec: &mut Record,
        segname: &str,
        arr: &DataArray,
        autoscale: bool,
    ) -> Result<()> {
        if rec.readonly {
            return Err(ExportError::BadRequest(
                "cannot write a segment of a read-only record".into(),
            ));
        }

        let slotnum = rec.slotnum;
        let unit_size = rec.series.unit_size;
        let dir = rec.su_dir()?.to_path_buf();
        let recnum = rec.recnum;

        // validate against the descriptor, settle scaling, then let the
        // mutable borrow go so keyword updates are possible afterwards
        let seg = {
            let seg = rec.segment_mut(segname).ok_or_else(|| {
                ExportError::BadRequest(format!("unknown segment '{segname}'"))
            })?;

            if seg.link.is_some() {
                // Writing through a segment link would desynchronize the
                // link target's scaling keywords; refuse.
                return Err(ExportError::Unsupported(format!(
                    "segment '{}' is a link; write to the target record instead",
                    seg.name
                )));
            }

            if seg.scope == SegScope::Constant && seg.const_record_recnum != 0 {
                return Err(ExportError::BadRequest(format!(
                    "constant segment '{}' has already been initialized",
                    seg.name
                )));
            }

            if seg.protocol == Protocol::Generic {
                return Err(ExportError::Unsupported(
                    "use write_from_file for generic segments".into(),
                ));
            }

            if matches!(seg.protocol, Protocol::Local | Protocol::Dsds) {
                return Err(ExportError::Unsupported(format!(
                    "protocol {:?} has no writer",
                    seg.protocol
                )));
            }

            if arr.axes() != seg.axes {
                return Err(ExportError::BadRequest(format!(
                    "array axes {:?} do not match segment axes {:?}",
                    arr.axes(),
                    seg.axes
                )));
            }

            if autoscale {
                autoscale_segment(seg, arr);
            }

            if seg.filename.is_empty() {
                seg.filename = seg.disk_name();
            }

            seg.clone()
        };

        // Re-express the array in the segment's storage scale. For raw
        // input with a different scaling, compose the two scalings; for
        // physical input, invert the segment scaling.
        let (mut bzero, mut bscale) = (seg.bzero, seg.bscale);
        if arr.israw {
            if arr.bzero != bzero || arr.bscale != bscale {
                bzero = (arr.bzero - bzero) / bscale;
                bscale = arr.bscale / bscale;
            } else {
                bzero = 0.0;
                bscale = 1.0;
            }
        } else if bzero.abs() != 0.0 || bscale != 1.0 {
            bzero = -bzero / bscale;
            bscale = 1.0 / bscale;
        }

        let out;
        let out_ref: &DataArray = if arr.ty != seg.ty || bzero.abs() != 0.0 || bscale != 1.0 {
            let mut converted = arr.convert_scaled(seg.ty, bzero, bscale)?;
            converted.bzero = seg.bzero;
            converted.bscale = seg.bscale;
            converted.israw = true;
            out = converted;
            &out
        } else {
            arr
        };

        let path = dir.join(&seg.filename);

        match seg.protocol {
            Protocol::Binary => binfile_write(&path, out_ref)?,
            Protocol::Binzip => zipfile_write(&path, out_ref)?,
            Protocol::Fits => {
                write_fits_segment(&path, out_ref, seg.cparms)?;
            }
            Protocol::FitsTiled => {
                let cparms = seg
                    .cparms
                    .unwrap_or(CompressSpec::rows(Compression::Gzip1));
                write_fits_segment(&path, out_ref, Some(cparms))?;
            }
            Protocol::Tas => {
                if !path.exists() {
                    tas_create(&path, &seg, unit_size)?;
                }
                tas_write_slice(&path, &seg, slotnum, out_ref)?;

                // Persist the slice's scaling into the per-segment scaling
                // keywords, when the series declares them.
                for (suffix, value) in [("_bzero", out_ref.bzero), ("_bscale", out_ref.bscale)] {
                    let kwname = format!("{}{}", seg.name, suffix);
                    if rec.keywords.contains(&kwname) {
                        rec.keywords.set_value(&kwname, StoreValue::Double(value));
                    } else {
                        warn!(keyword = %kwname, "keyword not defined, cannot save scaling");
                    }
                }
            }
            _ => unreachable!(),
        }

        let seg = rec.segment_mut(segname).unwrap();
        if seg.scope == SegScope::Constant && seg.const_record_recnum == 0 {
            seg.const_record_recnum = recnum;
        }

        Ok(())
    }

    /// Stream a file into a `GENERIC` segment.
    pub fn write_from_file(&mut self, rec: &mut Record, segname: &str, infile: &Path) -> Result<()> {
        if rec.readonly {
            return Err(ExportError::BadRequest(
                "cannot write a segment of a read-only record".into(),
            ));
        }

        let dir = rec.su_dir()?.to_path_buf();
        let recnum = rec.recnum;

        let seg = rec.segment_mut(segname).ok_or_else(|| {
            ExportError::BadRequest(format!("unknown segment '{segname}'"))
        })?;

        if seg.protocol != Protocol::Generic {
            return Err(ExportError::Unsupported(
                "write_from_file applies to generic segments only".into(),
            ));
        }

        if seg.scope == SegScope::Constant && seg.const_record_recnum != 0 {
            return Err(ExportError::BadRequest(format!(
                "constant segment '{}' has already been initialized",
                seg.name
            )));
        }

        let basename = infile
            .file_name()
            .ok_or_else(|| ExportError::BadRequest(format!("bad input path {infile:?}")))?
            .to_string_lossy()
            .into_owned();

        let outpath = dir.join(&basename);
        let mut input = fs::File::open(infile)
            .map_err(|e| ExportError::MissingFile(format!("{}: {e}", infile.display())))?;
        let mut output = fs::File::create(&outpath)?;
        std::io::copy(&mut input, &mut output)?;

        seg.filename = basename;

        if seg.scope == SegScope::Constant && seg.const_record_recnum == 0 {
            seg.const_record_recnum = recnum;
        }

        Ok(())
    }

    fn segment_dir(&self, owner: &Record, seg: &SegmentInfo) -> Result<PathBuf> {
        if seg.scope == SegScope::Constant
            && seg.const_record_recnum != 0
            && seg.const_record_recnum != owner.recnum
        {
            // The canonical copy lives with another record of the series.
            return self
                .su
                .record_dir(&owner.series.name, seg.const_record_recnum);
        }

        if let Some(dir) = &owner.su_dir {
            return Ok(dir.clone());
        }

        if owner.sunum != -1 {
            return self.su.stage(&owner.series.name, owner.sunum);
        }

        Err(ExportError::Offline(format!(
            "record {} has no storage unit",
            owner.spec()
        )))
    }
}

/// Shared tail of every read: attach catalog scaling and convert to the
/// requested type. The returned array has `israw = false` unless the caller
/// asked for `Raw`.
fn finish_read(mut arr: DataArray, seg: &SegmentInfo, ty: StoreType) -> Result<DataArray> {
    arr.bzero = seg.bzero;
    arr.bscale = seg.bscale;

    if ty == StoreType::Raw {
        arr.israw = true;
        return Ok(arr);
    }

    if arr.ty != ty || arr.bscale != 1.0 || arr.bzero != 0.0 {
        let start = arr.start.clone();
        let mut converted = arr.convert_scaled(ty, arr.bzero, arr.bscale)?;
        converted.bzero = seg.bzero;
        converted.bscale = seg.bscale;
        converted.start = start;
        arr = converted;
    }

    arr.israw = false;
    Ok(arr)
}

/// Verify that the scaling carried by a file agrees with the catalog's,
/// within relative tolerance.
fn check_scaling(arr: &DataArray, seg: &SegmentInfo, path: &Path) -> Result<()> {
    let close = |a: f64, b: f64| (a - b).abs() <= SLOT_EPSILON * (a.abs() + b.abs()).max(1.0);

    if close(arr.bzero, seg.bzero) && close(arr.bscale, seg.bscale) {
        Ok(())
    } else {
        Err(ExportError::ScalingConflict {
            file: path.display().to_string(),
            file_bzero: arr.bzero,
            file_bscale: arr.bscale,
            cat_bzero: seg.bzero,
            cat_bscale: seg.bscale,
        })
    }
}

// ---------------------------------------------------------------------------
// autoscaling

fn integer_bounds(ty: StoreType) -> Option<(f64, f64)> {
    // The storage minimum is reserved for missing and the extremes are left
    // out of the span for rounding headroom.
    match ty {
        StoreType::Char => Some((-(i8::MAX as f64 - 1.0), i8::MAX as f64 - 1.0)),
        StoreType::Short => Some((-(i16::MAX as f64 - 1.0), i16::MAX as f64 - 1.0)),
        StoreType::Int => Some((-(i32::MAX as f64 - 1.0), i32::MAX as f64 - 1.0)),
        StoreType::Long => Some((-(i64::MAX as f64 - 1.0), i64::MAX as f64 - 1.0)),
        _ => None,
    }
}

/// Choose the segment scaling so the array's physical values fit the
/// declared integer storage type without overflow.
///
/// An existing raw scaling that preserves integers and fits is kept; a
/// non-raw integer array that fits as-is keeps identity scaling; everything
/// else gets the midpoint/span choice `bzero = (hi+lo)/2`,
/// `bscale = (hi−lo)/(outmax−outmin)`.
pub fn autoscale_segment(seg: &mut SegmentInfo, arr: &DataArray) {
    let (outmin, outmax) = match integer_bounds(seg.ty) {
        Some(b) => b,
        None => {
            // float, double, time, string destinations never scale
            seg.bzero = 0.0;
            seg.bscale = 1.0;
            return;
        }
    };

    let (inmin, inmax) = match arr.physical_range() {
        Some(r) => r,
        None => {
            seg.bzero = 0.0;
            seg.bscale = 1.0;
            return;
        }
    };

    let integral_scaling =
        arr.bscale.trunc() == arr.bscale && arr.bzero.trunc() == arr.bzero;

    let (bzero, bscale);
    if arr.israw && integral_scaling && inmax <= outmax && inmin >= outmin {
        // the existing scaling preserves integers and fits: keep it
        bzero = arr.bzero;
        bscale = arr.bscale;
    } else if !arr.israw && arr.ty.is_integer() && inmax <= outmax && inmin >= outmin {
        bzero = 0.0;
        bscale = 1.0;
    } else if inmax == inmin {
        bzero = inmin;
        bscale = 1.0;
    } else {
        bzero = (inmax + inmin) / 2.0;
        bscale = (inmax - inmin) / (outmax - outmin);
    }

    seg.bzero = bzero;
    seg.bscale = bscale;
}

// ---------------------------------------------------------------------------
// BINARY / BINZIP

const BIN_MAGIC: &[u8; 4] = b"HXB1";

fn type_tag(ty: StoreType) -> u8 {
    match ty {
        StoreType::Char => 0,
        StoreType::Short => 1,
        StoreType::Int => 2,
        StoreType::Long => 3,
        StoreType::Float => 4,
        StoreType::Double => 5,
        StoreType::Time => 6,
        _ => 255,
    }
}

fn tag_type(tag: u8) -> Result<StoreType> {
    Ok(match tag {
        0 => StoreType::Char,
        1 => StoreType::Short,
        2 => StoreType::Int,
        3 => StoreType::Long,
        4 => StoreType::Float,
        5 => StoreType::Double,
        6 => StoreType::Time,
        other => {
            return Err(ExportError::FitsFormat(format!(
                "unknown binary type tag {other}"
            )))
        }
    })
}

fn bin_encode(arr: &DataArray) -> Vec<u8> {
    let mut buf = arr.to_be_bytes();
    let trailer_start = buf.len();

    buf.extend_from_slice(BIN_MAGIC);
    buf.push(type_tag(arr.ty));
    let axes = arr.axes();
    buf.push(axes.len() as u8);
    for len in &axes {
        buf.write_u32::<BigEndian>(*len as u32).unwrap();
    }
    buf.write_f64::<BigEndian>(arr.bzero).unwrap();
    buf.write_f64::<BigEndian>(arr.bscale).unwrap();
    buf.push(arr.israw as u8);

    let trailer_len = (buf.len() - trailer_start + 2) as u16;
    buf.write_u16::<BigEndian>(trailer_len).unwrap();
    buf
}

fn bin_decode(bytes: &[u8]) -> Result<DataArray> {
    if bytes.len() < 2 {
        return Err(ExportError::FitsFormat("binary segment too short".into()));
    }

    let trailer_len = BigEndian::read_u16(&bytes[bytes.len() - 2..]) as usize;
    if trailer_len > bytes.len() {
        return Err(ExportError::FitsFormat("binary trailer overruns file".into()));
    }

    let trailer = &bytes[bytes.len() - trailer_len..];
    if &trailer[0..4] != BIN_MAGIC {
        return Err(ExportError::FitsFormat("bad binary segment magic".into()));
    }

    let ty = tag_type(trailer[4])?;
    let naxis = trailer[5] as usize;
    let mut pos = 6;
    let mut axes = Vec::with_capacity(naxis);
    for _ in 0..naxis {
        axes.push(BigEndian::read_u32(&trailer[pos..pos + 4]) as usize);
        pos += 4;
    }
    let bzero = BigEndian::read_f64(&trailer[pos..pos + 8]);
    pos += 8;
    let bscale = BigEndian::read_f64(&trailer[pos..pos + 8]);
    pos += 8;
    let israw = trailer[pos] != 0;

    let payload = &bytes[..bytes.len() - trailer_len];
    let mut arr = DataArray::from_be_bytes(ty, &axes, payload)?;
    arr.bzero = bzero;
    arr.bscale = bscale;
    arr.israw = israw;
    Ok(arr)
}

fn binfile_write(path: &Path, arr: &DataArray) -> Result<()> {
    fs::write(path, bin_encode(arr))?;
    Ok(())
}

fn binfile_read(path: &Path) -> Result<DataArray> {
    let bytes = fs::read(path)?;
    bin_decode(&bytes)
}

fn zipfile_write(path: &Path, arr: &DataArray) -> Result<()> {
    let file = fs::File::create(path)?;
    let mut enc = GzEncoder::new(file, flate2::Compression::default());
    enc.write_all(&bin_encode(arr))?;
    enc.finish()?;
    Ok(())
}

fn zipfile_read(path: &Path) -> Result<DataArray> {
    let file = fs::File::open(path)?;
    let mut dec = GzDecoder::new(file);
    let mut bytes = Vec::new();
    dec.read_to_end(&mut bytes)?;
    bin_decode(&bytes)
}

// ---------------------------------------------------------------------------
// FITS protocol

fn write_fits_segment(path: &Path, arr: &DataArray, cparms: Option<CompressSpec>) -> Result<()> {
    if arr.ty == StoreType::String {
        return Err(ExportError::Unsupported(
            "cannot save string data into a FITS file".into(),
        ));
    }

    let info = bridge::set_image_info(arr)?;
    let mut file = fs::File::create(path)?;
    fits::write_fits(&mut file, &info, &[], &arr.to_be_bytes(), cparms)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// TAS

/// Create an empty TAS container: the segment's axes plus a trailing record
/// axis of `nslots`, filled with the missing sentinel, carrying the
/// segment's declared scaling.
pub fn tas_create(path: &Path, seg: &SegmentInfo, nslots: usize) -> Result<()> {
    if seg.ty == StoreType::Raw {
        return Err(ExportError::Unsupported("cannot create a raw TAS file".into()));
    }

    let mut axes = seg.axes.clone();
    axes.push(nslots.max(1));

    let mut arr = DataArray::filled_missing(seg.ty, &axes)?;
    arr.bzero = seg.bzero;
    arr.bscale = seg.bscale;
    arr.israw = !(seg.bzero == 0.0 && seg.bscale == 1.0);

    let info = bridge::set_image_info(&arr)?;
    let mut file = fs::File::create(path)?;
    fits::write_fits(&mut file, &info, &[], &arr.to_be_bytes(), None)?;
    Ok(())
}

/// Read one record's hyperplane out of a TAS container. The returned array
/// has the segment's rank (the record axis is dropped) and is raw.
fn tas_read_slice(path: &Path, seg: &SegmentInfo, slotnum: usize) -> Result<DataArray> {
    let img = fits::read_fits_file(path)?;
    let arr = bridge::create_array(&img)?;

    let naxis = seg.naxis();
    if arr.naxis() != naxis + 1 {
        return Err(ExportError::FitsFormat(format!(
            "TAS file rank {} does not match segment rank {} + 1",
            arr.naxis(),
            naxis
        )));
    }

    let axes = arr.axes();
    if slotnum >= axes[naxis] {
        return Err(ExportError::BadRequest(format!(
            "slot {} outside TAS record axis of length {}",
            slotnum, axes[naxis]
        )));
    }

    let mut start = vec![0; naxis + 1];
    let mut end: Vec<usize> = axes.iter().map(|a| a - 1).collect();
    start[naxis] = slotnum;
    end[naxis] = slotnum;

    let (bzero, bscale, israw) = (arr.bzero, arr.bscale, arr.israw);
    let mut sliced = arr.slice(&start, &end)?;
    sliced.drop_trailing_axis()?;
    sliced.bzero = bzero;
    sliced.bscale = bscale;
    sliced.israw = israw;
    sliced.start = vec![0; naxis];
    Ok(sliced)
}

/// Write one record's hyperplane into a TAS container. The hyperplane of
/// slot `k` is a contiguous span of the payload, so this is a byte patch.
fn tas_write_slice(path: &Path, seg: &SegmentInfo, slotnum: usize, arr: &DataArray) -> Result<()> {
    let mut img = fits::read_fits_file(path)?;

    let naxis = seg.naxis();
    if img.info.naxis() != naxis + 1 {
        return Err(ExportError::FitsFormat(format!(
            "TAS file rank {} does not match segment rank {} + 1",
            img.info.naxis(),
            naxis
        )));
    }

    let nslots = img.info.axes[naxis];
    if slotnum >= nslots {
        return Err(ExportError::BadRequest(format!(
            "slot {slotnum} outside TAS record axis of length {nslots}"
        )));
    }

    let plane = img.info.payload_size() / nslots;
    let bytes = arr.to_be_bytes();
    if bytes.len() != plane {
        return Err(ExportError::Internal(format!(
            "hyperplane is {} bytes, TAS slot holds {}",
            bytes.len(),
            plane
        )));
    }

    let offset = slotnum * plane;
    img.payload[offset..offset + plane].copy_from_slice(&bytes);

    let mut file = fs::File::create(path)?;
    fits::write_fits(&mut file, &img.info, &img.keywords, &img.payload, None)?;
    Ok(())
}
