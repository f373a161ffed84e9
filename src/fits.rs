//! Pure-Rust FITS image codec.
//!
//! Only what the export core needs: simple primary-HDU images with the
//! required keyword set, plus the tiled-image compression convention for
//! GZIP-compressed tiles. Headers are sequences of 80-byte cards packed into
//! 2880-byte blocks; payloads are big-endian.
//!
//! The value model is the usual FITS sum type: logical, integer, float,
//! string. `COMMENT` and `HISTORY` cards carry their text in the comment
//! position and have no value.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use byteorder::{BigEndian, ByteOrder, WriteBytesExt};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::error::{ExportError, Result};

pub const BLOCK_SIZE: usize = 2880;
pub const CARD_SIZE: usize = 80;
pub const MAX_DIM: usize = 9;

#[derive(Debug, Clone, PartialEq)]
pub enum FitsValue {
    Logical(bool),
    Integer(i64),
    Float(f64),
    Str(String),
}

#[derive(Debug, Clone)]
pub struct FitsKeyword {
    pub name: String,
    /// `None` for commentary cards (COMMENT, HISTORY).
    pub value: Option<FitsValue>,
    pub comment: Option<String>,
}

impl FitsKeyword {
    pub fn new(name: &str, value: FitsValue) -> FitsKeyword {
        FitsKeyword {
            name: name.to_owned(),
            value: Some(value),
            comment: None,
        }
    }

    pub fn commentary(name: &str, text: &str) -> FitsKeyword {
        FitsKeyword {
            name: name.to_owned(),
            value: None,
            comment: Some(text.to_owned()),
        }
    }

    pub fn is_commentary(&self) -> bool {
        self.value.is_none()
    }
}

/// The header facts needed to reproduce an image, the analogue of a
/// CFITSIO-style image-info block.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImageInfo {
    pub bitpix: i32,
    pub axes: Vec<usize>,
    pub simple: bool,
    pub extend: bool,
    pub blank: Option<i64>,
    pub bzero: Option<f64>,
    pub bscale: Option<f64>,
}

impl ImageInfo {
    pub fn naxis(&self) -> usize {
        self.axes.len()
    }

    pub fn element_size(&self) -> usize {
        (self.bitpix.unsigned_abs() / 8) as usize
    }

    pub fn payload_size(&self) -> usize {
        self.axes.iter().product::<usize>() * self.element_size()
    }
}

/// Tile compression algorithms named by the on-disk convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Rice,
    Gzip1,
    Gzip2,
    Plio,
    Hcompress,
}

impl Compression {
    /// Parse either a compression-parameter token (`rice`, `gzip1`, ...) or
    /// the on-disk algorithm name (`RICE_1`, `GZIP_1`, ...). `none` and the
    /// `**NONE**` placeholder map to `None`.
    pub fn parse(token: &str) -> Result<Option<Compression>> {
        match token.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "**none**" => Ok(None),
            "rice" | "rice_1" => Ok(Some(Compression::Rice)),
            "gzip" | "gzip1" | "gzip_1" => Ok(Some(Compression::Gzip1)),
            "gzip2" | "gzip_2" => Ok(Some(Compression::Gzip2)),
            "plio" | "plio_1" => Ok(Some(Compression::Plio)),
            "hcomp" | "hcompress" | "hcompress_1" => Ok(Some(Compression::Hcompress)),
            other => Err(ExportError::BadRequest(format!(
                "unknown compression parameter '{other}'"
            ))),
        }
    }

    pub fn on_disk_name(&self) -> &'static str {
        match self {
            Compression::Rice => "RICE_1",
            Compression::Gzip1 => "GZIP_1",
            Compression::Gzip2 => "GZIP_2",
            Compression::Plio => "PLIO_1",
            Compression::Hcompress => "HCOMPRESS_1",
        }
    }
}

/// How to tile a compressed image: whole-image tiles or one row at a time
/// (the usual choice, since each row is then independently seekable).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressSpec {
    pub algo: Compression,
    pub row_by_row: bool,
}

impl CompressSpec {
    pub fn rows(algo: Compression) -> CompressSpec {
        CompressSpec {
            algo,
            row_by_row: true,
        }
    }
}

/// A decoded FITS image: header facts, the remaining header keywords, and
/// the raw big-endian payload.
#[derive(Debug, Clone)]
pub struct FitsImage {
    pub info: ImageInfo,
    pub keywords: Vec<FitsKeyword>,
    pub payload: Vec<u8>,
}

// ---------------------------------------------------------------------------
// card rendering

fn render_value(value: &FitsValue) -> String {
    match value {
        FitsValue::Logical(b) => format!("{:>20}", if *b { "T" } else { "F" }),
        FitsValue::Integer(v) => format!("{v:>20}"),
        FitsValue::Float(v) => {
            let s = if v.fract() == 0.0 && v.abs() < 1e15 {
                format!("{v:.1}")
            } else {
                let s = format!("{v:.15E}");
                // FITS wants a plain exponent: 1.5E3, not 1.5E3_0-padded
                s
            };
            format!("{s:>20}")
        }
        FitsValue::Str(s) => {
            let escaped = s.replace('\'', "''");
            let mut quoted = format!("'{escaped:<8}'");
            if quoted.len() > 70 {
                quoted.truncate(69);
                quoted.push('\'');
            }
            quoted
        }
    }
}

fn render_card(kw: &FitsKeyword) -> Result<[u8; CARD_SIZE]> {
    let mut card = [b' '; CARD_SIZE];

    if kw.name.len() > 8 || !kw.name.bytes().all(legal_name_byte) {
        return Err(ExportError::FitsFormat(format!(
            "illegal FITS keyword name '{}'",
            kw.name
        )));
    }

    let text = if kw.is_commentary() {
        let body = kw.comment.as_deref().unwrap_or("");
        let mut t = format!("{:<8}{}", kw.name, body);
        t.truncate(CARD_SIZE);
        t
    } else {
        let mut t = format!(
            "{:<8}= {}",
            kw.name,
            render_value(kw.value.as_ref().unwrap())
        );
        if let Some(c) = &kw.comment {
            if t.len() + 3 < CARD_SIZE {
                t.push_str(" / ");
                t.push_str(c);
            }
        }
        t.truncate(CARD_SIZE);
        t
    };

    // cards are ASCII; replace anything else rather than corrupting the grid
    for (i, b) in text.bytes().enumerate() {
        card[i] = if (0x20..0x7f).contains(&b) { b } else { b'?' };
    }

    Ok(card)
}

fn legal_name_byte(b: u8) -> bool {
    b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_'
}

fn parse_card(card: &[u8]) -> Result<Option<FitsKeyword>> {
    let name = std::str::from_utf8(&card[0..8])
        .map_err(|_| ExportError::FitsFormat("non-ASCII keyword name".into()))?
        .trim_end()
        .to_owned();

    if name == "END" {
        return Ok(None);
    }

    let rest = std::str::from_utf8(&card[8..])
        .map_err(|_| ExportError::FitsFormat("non-ASCII card body".into()))?;

    if name.is_empty() {
        return Ok(Some(FitsKeyword::commentary("", rest.trim_end())));
    }

    if !rest.starts_with("= ") {
        // commentary card: COMMENT, HISTORY, or vendor junk
        return Ok(Some(FitsKeyword::commentary(&name, rest.trim_end())));
    }

    let body = &rest[2..];
    let trimmed = body.trim_start();

    if let Some(stripped) = trimmed.strip_prefix('\'') {
        // quoted string; doubled quotes are escapes
        let mut value = String::new();
        let mut chars = stripped.chars().peekable();
        let mut closed = false;
        while let Some(c) = chars.next() {
            if c == '\'' {
                if chars.peek() == Some(&'\'') {
                    chars.next();
                    value.push('\'');
                } else {
                    closed = true;
                    break;
                }
            } else {
                value.push(c);
            }
        }
        if !closed {
            return Err(ExportError::FitsFormat(format!(
                "unterminated string value in card '{name}'"
            )));
        }

        let tail: String = chars.collect();
        let comment = tail.trim().strip_prefix('/').map(|c| c.trim().to_owned());

        return Ok(Some(FitsKeyword {
            name,
            value: Some(FitsValue::Str(value.trim_end().to_owned())),
            comment,
        }));
    }

    let (value_text, comment) = match trimmed.find('/') {
        Some(pos) => (
            trimmed[..pos].trim(),
            Some(trimmed[pos + 1..].trim().to_owned()),
        ),
        None => (trimmed.trim(), None),
    };

    let value = match value_text {
        "T" => FitsValue::Logical(true),
        "F" => FitsValue::Logical(false),
        "" => FitsValue::Str(String::new()),
        _ => {
            let looks_float = value_text
                .bytes()
                .any(|b| b == b'.' || b == b'e' || b == b'E' || b == b'D' || b == b'd');
            if looks_float {
                let norm = value_text.replace(['D', 'd'], "E");
                FitsValue::Float(norm.parse::<f64>().map_err(|_| {
                    ExportError::FitsFormat(format!("bad numeric value '{value_text}' in '{name}'"))
                })?)
            } else {
                FitsValue::Integer(value_text.parse::<i64>().map_err(|_| {
                    ExportError::FitsFormat(format!("bad integer value '{value_text}' in '{name}'"))
                })?)
            }
        }
    };

    Ok(Some(FitsKeyword {
        name,
        value: Some(value),
        comment,
    }))
}

// ---------------------------------------------------------------------------
// header blocks

struct HeaderWriter {
    buf: Vec<u8>,
}

impl HeaderWriter {
    fn new() -> HeaderWriter {
        HeaderWriter { buf: Vec::new() }
    }

    fn push(&mut self, kw: &FitsKeyword) -> Result<()> {
        let card = render_card(kw)?;
        self.buf.extend_from_slice(&card);
        Ok(())
    }

    fn logical(&mut self, name: &str, v: bool) -> Result<()> {
        self.push(&FitsKeyword::new(name, FitsValue::Logical(v)))
    }

    fn integer(&mut self, name: &str, v: i64) -> Result<()> {
        self.push(&FitsKeyword::new(name, FitsValue::Integer(v)))
    }

    fn float(&mut self, name: &str, v: f64) -> Result<()> {
        self.push(&FitsKeyword::new(name, FitsValue::Float(v)))
    }

    fn string(&mut self, name: &str, v: &str) -> Result<()> {
        self.push(&FitsKeyword::new(name, FitsValue::Str(v.to_owned())))
    }

    fn finish(mut self) -> Vec<u8> {
        self.buf.extend_from_slice(b"END");
        self.buf.extend_from_slice(&[b' '; CARD_SIZE - 3]);
        pad_to_block(&mut self.buf, b' ');
        self.buf
    }
}

fn pad_to_block(buf: &mut Vec<u8>, fill: u8) {
    let rem = buf.len() % BLOCK_SIZE;
    if rem != 0 {
        buf.extend(std::iter::repeat(fill).take(BLOCK_SIZE - rem));
    }
}

/// Read header blocks until END; returns the parsed cards.
fn read_header<R: Read>(rd: &mut R) -> Result<Vec<FitsKeyword>> {
    let mut cards = Vec::new();
    let mut block = [0u8; BLOCK_SIZE];

    loop {
        rd.read_exact(&mut block).map_err(|e| {
            ExportError::FitsFormat(format!("truncated FITS header: {e}"))
        })?;

        for chunk in block.chunks(CARD_SIZE) {
            if chunk.iter().all(|&b| b == b' ') {
                continue;
            }
            match parse_card(chunk)? {
                Some(kw) => cards.push(kw),
                None => return Ok(cards),
            }
        }
    }
}

fn take_keyword(cards: &mut Vec<FitsKeyword>, name: &str) -> Option<FitsValue> {
    let pos = cards.iter().position(|k| k.name == name)?;
    cards.remove(pos).value
}

fn want_integer(v: Option<FitsValue>, name: &str) -> Result<i64> {
    match v {
        Some(FitsValue::Integer(i)) => Ok(i),
        Some(FitsValue::Float(f)) if f.fract() == 0.0 => Ok(f as i64),
        other => Err(ExportError::FitsFormat(format!(
            "missing or non-integer {name} ({other:?})"
        ))),
    }
}

fn want_float(v: FitsValue, name: &str) -> Result<f64> {
    match v {
        FitsValue::Integer(i) => Ok(i as f64),
        FitsValue::Float(f) => Ok(f),
        other => Err(ExportError::FitsFormat(format!(
            "non-numeric {name} ({other:?})"
        ))),
    }
}

fn extract_image_info(cards: &mut Vec<FitsKeyword>, primary: bool) -> Result<ImageInfo> {
    let simple = if primary {
        match take_keyword(cards, "SIMPLE") {
            Some(FitsValue::Logical(b)) => b,
            _ => return Err(ExportError::FitsFormat("not a simple FITS file".into())),
        }
    } else {
        true
    };

    let bitpix = want_integer(take_keyword(cards, "BITPIX"), "BITPIX")? as i32;
    if ![8, 16, 32, 64, -32, -64].contains(&bitpix) {
        return Err(ExportError::FitsFormat(format!("invalid BITPIX {bitpix}")));
    }

    let naxis = want_integer(take_keyword(cards, "NAXIS"), "NAXIS")? as usize;
    if naxis > MAX_DIM {
        return Err(ExportError::FitsFormat(format!(
            "NAXIS {naxis} outside the allowed range [0, {MAX_DIM}]"
        )));
    }

    let mut axes = Vec::with_capacity(naxis);
    for i in 1..=naxis {
        let len = want_integer(take_keyword(cards, &format!("NAXIS{i}")), "NAXISn")?;
        if len < 0 {
            return Err(ExportError::FitsFormat(format!("negative NAXIS{i}")));
        }
        axes.push(len as usize);
    }

    let extend = matches!(take_keyword(cards, "EXTEND"), Some(FitsValue::Logical(true)));
    let blank = match take_keyword(cards, "BLANK") {
        Some(v) => Some(want_integer(Some(v), "BLANK")?),
        None => None,
    };
    let bzero = match take_keyword(cards, "BZERO") {
        Some(v) => Some(want_float(v, "BZERO")?),
        None => None,
    };
    let bscale = match take_keyword(cards, "BSCALE") {
        Some(v) => Some(want_float(v, "BSCALE")?),
        None => None,
    };

    Ok(ImageInfo {
        bitpix,
        axes,
        simple,
        extend,
        blank,
        bzero,
        bscale,
    })
}

// ---------------------------------------------------------------------------
// uncompressed images

/// Serialize a simple FITS image. The payload must already be big-endian in
/// on-disk element order.
pub fn write_fits<W: Write>(
    w: &mut W,
    info: &ImageInfo,
    keywords: &[FitsKeyword],
    payload: &[u8],
    comp: Option<CompressSpec>,
) -> Result<()> {
    if let Some(spec) = comp {
        return write_fits_tiled(w, info, keywords, payload, spec);
    }

    if payload.len() != info.payload_size() {
        return Err(ExportError::Internal(format!(
            "payload is {} bytes but the header wants {}",
            payload.len(),
            info.payload_size()
        )));
    }

    let mut hdr = HeaderWriter::new();
    hdr.logical("SIMPLE", info.simple)?;
    hdr.integer("BITPIX", info.bitpix as i64)?;
    hdr.integer("NAXIS", info.naxis() as i64)?;
    for (i, len) in info.axes.iter().enumerate() {
        hdr.integer(&format!("NAXIS{}", i + 1), *len as i64)?;
    }
    if info.extend {
        hdr.logical("EXTEND", true)?;
    }
    if let Some(blank) = info.blank {
        hdr.integer("BLANK", blank)?;
    }
    if let Some(bzero) = info.bzero {
        hdr.float("BZERO", bzero)?;
    }
    if let Some(bscale) = info.bscale {
        hdr.float("BSCALE", bscale)?;
    }
    for kw in keywords {
        hdr.push(kw)?;
    }

    w.write_all(&hdr.finish())?;

    let mut body = payload.to_vec();
    pad_to_block(&mut body, 0);
    w.write_all(&body)?;
    Ok(())
}

/// Decode a FITS image from a byte buffer. Detects the tiled-image
/// convention (empty primary HDU followed by a ZIMAGE binary table).
pub fn read_fits_bytes(bytes: &[u8]) -> Result<FitsImage> {
    let mut rd = std::io::Cursor::new(bytes);
    let mut cards = read_header(&mut rd)?;
    let info = extract_image_info(&mut cards, true)?;

    if info.naxis() == 0 {
        // possibly a tiled-image file: look at the first extension
        let mut ext = read_header(&mut rd)?;
        if matches!(
            ext.iter().find(|k| k.name == "ZIMAGE").and_then(|k| k.value.clone()),
            Some(FitsValue::Logical(true))
        ) {
            return read_tiled(&mut rd, &mut ext);
        }
        return Err(ExportError::FitsFormat(
            "image has no axes and no tiled extension".into(),
        ));
    }

    let want = info.payload_size();
    let mut payload = vec![0u8; want];
    rd.read_exact(&mut payload)
        .map_err(|e| ExportError::FitsFormat(format!("truncated FITS payload: {e}")))?;

    Ok(FitsImage {
        info,
        keywords: cards,
        payload,
    })
}

pub fn read_fits_file<P: AsRef<Path>>(path: P) -> Result<FitsImage> {
    let mut bytes = Vec::new();
    File::open(path.as_ref())?.read_to_end(&mut bytes)?;
    read_fits_bytes(&bytes)
}

// ---------------------------------------------------------------------------
// tiled-image compression
//
// The tiled convention stores the image as a binary table whose single
// column holds one variable-length byte array per tile, addressed through
// (length, offset) descriptors into the table heap. We emit GZIP-compressed
// tiles; the other algorithm names are accepted as parameters but their
// codecs live in the external FITS library this module replaces.

fn tile_shape(info: &ImageInfo, row_by_row: bool) -> Vec<usize> {
    if row_by_row && info.naxis() > 1 {
        let mut t = vec![1; info.naxis()];
        t[0] = info.axes[0];
        t
    } else {
        info.axes.clone()
    }
}

fn gzip2_shuffle(tile: &[u8], esize: usize) -> Vec<u8> {
    // GZIP_2 byte-shuffles each element so that the most significant bytes
    // of all elements come first, which compresses better.
    let n = tile.len() / esize;
    let mut out = vec![0u8; tile.len()];
    for e in 0..n {
        for b in 0..esize {
            out[b * n + e] = tile[e * esize + b];
        }
    }
    out
}

fn gzip2_unshuffle(tile: &[u8], esize: usize) -> Vec<u8> {
    let n = tile.len() / esize;
    let mut out = vec![0u8; tile.len()];
    for e in 0..n {
        for b in 0..esize {
            out[e * esize + b] = tile[b * n + e];
        }
    }
    out
}

fn write_fits_tiled<W: Write>(
    w: &mut W,
    info: &ImageInfo,
    keywords: &[FitsKeyword],
    payload: &[u8],
    spec: CompressSpec,
) -> Result<()> {
    let esize = info.element_size();
    let shuffle = match spec.algo {
        Compression::Gzip1 => false,
        Compression::Gzip2 => true,
        other => {
            return Err(ExportError::Unsupported(format!(
                "cannot compress tiles with {}",
                other.on_disk_name()
            )))
        }
    };

    let tile = tile_shape(info, spec.row_by_row);
    let tile_elems: usize = tile.iter().product();
    let tile_bytes = tile_elems * esize;
    let total = info.payload_size();
    let ntiles = if tile_bytes == 0 { 0 } else { (total + tile_bytes - 1) / tile_bytes };

    // Row-by-row tiles are contiguous spans of the payload, and so are
    // whole-image tiles, so tiling reduces to chunking the payload.
    let mut heap: Vec<u8> = Vec::new();
    let mut descriptors: Vec<(u32, u32)> = Vec::with_capacity(ntiles);

    for chunk in payload.chunks(tile_bytes.max(1)) {
        let offset = heap.len() as u32;
        let shuffled;
        let src: &[u8] = if shuffle {
            shuffled = gzip2_shuffle(chunk, esize);
            &shuffled
        } else {
            chunk
        };

        let mut enc = GzEncoder::new(Vec::new(), flate2::Compression::default());
        enc.write_all(src)?;
        let compressed = enc.finish()?;
        heap.extend_from_slice(&compressed);
        descriptors.push((compressed.len() as u32, offset));
    }

    // primary HDU: no data, just a signpost to the extension
    let mut primary = HeaderWriter::new();
    primary.logical("SIMPLE", true)?;
    primary.integer("BITPIX", 8)?;
    primary.integer("NAXIS", 0)?;
    primary.logical("EXTEND", true)?;
    w.write_all(&primary.finish())?;

    let table_bytes = descriptors.len() * 8;
    let mut ext = HeaderWriter::new();
    ext.string("XTENSION", "BINTABLE")?;
    ext.integer("BITPIX", 8)?;
    ext.integer("NAXIS", 2)?;
    ext.integer("NAXIS1", 8)?;
    ext.integer("NAXIS2", descriptors.len() as i64)?;
    ext.integer("PCOUNT", heap.len() as i64)?;
    ext.integer("GCOUNT", 1)?;
    ext.integer("TFIELDS", 1)?;
    ext.string("TTYPE1", "COMPRESSED_DATA")?;
    ext.string("TFORM1", "1PB")?;
    ext.logical("ZIMAGE", true)?;
    ext.string("ZCMPTYPE", spec.algo.on_disk_name())?;
    ext.integer("ZBITPIX", info.bitpix as i64)?;
    ext.integer("ZNAXIS", info.naxis() as i64)?;
    for (i, len) in info.axes.iter().enumerate() {
        ext.integer(&format!("ZNAXIS{}", i + 1), *len as i64)?;
    }
    for (i, len) in tile.iter().enumerate() {
        ext.integer(&format!("ZTILE{}", i + 1), *len as i64)?;
    }
    if let Some(blank) = info.blank {
        ext.integer("BLANK", blank)?;
    }
    if let Some(bzero) = info.bzero {
        ext.float("BZERO", bzero)?;
    }
    if let Some(bscale) = info.bscale {
        ext.float("BSCALE", bscale)?;
    }
    for kw in keywords {
        ext.push(kw)?;
    }
    w.write_all(&ext.finish())?;

    let mut body = Vec::with_capacity(table_bytes + heap.len());
    for (len, off) in &descriptors {
        body.write_u32::<BigEndian>(*len)?;
        body.write_u32::<BigEndian>(*off)?;
    }
    body.extend_from_slice(&heap);
    pad_to_block(&mut body, 0);
    w.write_all(&body)?;
    Ok(())
}

fn read_tiled<R: Read>(rd: &mut R, cards: &mut Vec<FitsKeyword>) -> Result<FitsImage> {
    let _ = take_keyword(cards, "XTENSION");
    let _ = take_keyword(cards, "ZIMAGE");

    let naxis1 = want_integer(take_keyword(cards, "NAXIS1"), "NAXIS1")? as usize;
    let nrows = want_integer(take_keyword(cards, "NAXIS2"), "NAXIS2")? as usize;
    let pcount = want_integer(take_keyword(cards, "PCOUNT"), "PCOUNT")? as usize;
    if naxis1 < 8 {
        return Err(ExportError::FitsFormat(format!(
            "tile table rows are {naxis1} bytes, descriptors need 8"
        )));
    }
    for boilerplate in ["BITPIX", "NAXIS", "GCOUNT", "TFIELDS", "TTYPE1", "TFORM1"] {
        let _ = take_keyword(cards, boilerplate);
    }

    let algo = match take_keyword(cards, "ZCMPTYPE") {
        Some(FitsValue::Str(s)) => Compression::parse(&s)?.ok_or_else(|| {
            ExportError::FitsFormat("tiled image without a compression type".into())
        })?,
        _ => return Err(ExportError::FitsFormat("missing ZCMPTYPE".into())),
    };

    let bitpix = want_integer(take_keyword(cards, "ZBITPIX"), "ZBITPIX")? as i32;
    let znaxis = want_integer(take_keyword(cards, "ZNAXIS"), "ZNAXIS")? as usize;
    let mut axes = Vec::with_capacity(znaxis);
    for i in 1..=znaxis {
        axes.push(want_integer(take_keyword(cards, &format!("ZNAXIS{i}")), "ZNAXISn")? as usize);
    }
    for i in 1..=znaxis {
        let _ = take_keyword(cards, &format!("ZTILE{i}"));
    }

    let blank = match take_keyword(cards, "BLANK") {
        Some(v) => Some(want_integer(Some(v), "BLANK")?),
        None => None,
    };
    let bzero = match take_keyword(cards, "BZERO") {
        Some(v) => Some(want_float(v, "BZERO")?),
        None => None,
    };
    let bscale = match take_keyword(cards, "BSCALE") {
        Some(v) => Some(want_float(v, "BSCALE")?),
        None => None,
    };

    let info = ImageInfo {
        bitpix,
        axes,
        simple: true,
        extend: false,
        blank,
        bzero,
        bscale,
    };

    let esize = info.element_size();
    let shuffle = match algo {
        Compression::Gzip1 => false,
        Compression::Gzip2 => true,
        other => {
            return Err(ExportError::Unsupported(format!(
                "cannot decompress {} tiles",
                other.on_disk_name()
            )))
        }
    };

    let mut table = vec![0u8; naxis1 * nrows];
    rd.read_exact(&mut table)
        .map_err(|e| ExportError::FitsFormat(format!("truncated tile table: {e}")))?;
    let mut heap = vec![0u8; pcount];
    rd.read_exact(&mut heap)
        .map_err(|e| ExportError::FitsFormat(format!("truncated tile heap: {e}")))?;

    let mut payload = Vec::with_capacity(info.payload_size());
    for row in table.chunks(naxis1) {
        let len = BigEndian::read_u32(&row[0..4]) as usize;
        let off = BigEndian::read_u32(&row[4..8]) as usize;
        if off + len > heap.len() {
            return Err(ExportError::FitsFormat("tile descriptor outside heap".into()));
        }

        let mut dec = GzDecoder::new(&heap[off..off + len]);
        let mut tile = Vec::new();
        dec.read_to_end(&mut tile)
            .map_err(|e| ExportError::FitsFormat(format!("bad tile stream: {e}")))?;

        if shuffle {
            payload.extend_from_slice(&gzip2_unshuffle(&tile, esize));
        } else {
            payload.extend_from_slice(&tile);
        }
    }

    if payload.len() != info.payload_size() {
        return Err(ExportError::FitsFormat(format!(
            "tiles decode to {} bytes, header wants {}",
            payload.len(),
            info.payload_size()
        )));
    }

    Ok(FitsImage {
        info,
        keywords: std::mem::take(cards),
        payload,
    })
}
