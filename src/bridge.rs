//! The bridge between the store's keyword/array model and FITS.
//!
//! Two jobs live here. Image-side: deriving the FITS header facts (BITPIX,
//! BLANK, BZERO/BSCALE) from an array and reconstituting an array from a
//! decoded file, including replacing on-disk BLANK values with the store's
//! missing sentinel ("blank shooting"). Keyword-side: the name-resolution
//! ladder and cast semantics that map store keywords onto legal FITS cards
//! and back, byte-for-byte round-trippable.

use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read};

use tracing::warn;

use crate::array::DataArray;
use crate::error::{ExportError, Result};
use crate::fits::{FitsImage, FitsKeyword, FitsValue, ImageInfo};
use crate::keyword::{Keyword, KeywordBinding, KeywordFlags, KeywordInfo, KeywordSet, RecScope};
use crate::types::{StoreType, StoreValue, MISSING_CHAR, MISSING_INT, MISSING_LONG, MISSING_SHORT};

/// Options governing export-side conventions.
#[derive(Debug, Clone, Copy, Default)]
pub struct BridgeOptions {
    /// The historical exporter writes FITS logicals inverted (store true →
    /// `F`). Setting this restores the standard mapping.
    pub standard_logical: bool,
}

// ---------------------------------------------------------------------------
// BITPIX and image info

pub fn bitpix_to_type(bitpix: i32) -> Result<StoreType> {
    match bitpix {
        8 => Ok(StoreType::Char),
        16 => Ok(StoreType::Short),
        32 => Ok(StoreType::Int),
        64 => Ok(StoreType::Long),
        -32 => Ok(StoreType::Float),
        -64 => Ok(StoreType::Double),
        other => Err(ExportError::FitsFormat(format!("invalid BITPIX {other}"))),
    }
}

pub fn type_to_bitpix(ty: StoreType) -> Result<i32> {
    match ty {
        StoreType::Char => Ok(8),
        StoreType::Short => Ok(16),
        StoreType::Int => Ok(32),
        StoreType::Long => Ok(64),
        StoreType::Float => Ok(-32),
        StoreType::Double | StoreType::Time => Ok(-64),
        other => Err(ExportError::Unsupported(format!(
            "type {} has no BITPIX representation",
            other.name()
        ))),
    }
}

fn integer_missing(ty: StoreType) -> i64 {
    match ty {
        StoreType::Char => MISSING_CHAR as i64,
        StoreType::Short => MISSING_SHORT as i64,
        StoreType::Int => MISSING_INT as i64,
        StoreType::Long => MISSING_LONG,
        _ => unreachable!("integer_missing on non-integer type"),
    }
}

/// Derive the FITS header facts for an array, the way the exporter writes
/// them: `BLANK` for integer BITPIX only (always, since the sentinel is the
/// missing marker), `BZERO`/`BSCALE` only when the data are raw and the
/// scaling is non-trivial.
pub fn set_image_info(arr: &DataArray) -> Result<ImageInfo> {
    let bitpix = type_to_bitpix(arr.ty)?;
    if arr.naxis() == 0 {
        return Err(ExportError::Internal("array has no axes".into()));
    }

    let mut info = ImageInfo {
        bitpix,
        axes: arr.axes(),
        simple: true,
        extend: false,
        blank: None,
        bzero: None,
        bscale: None,
    };

    if bitpix > 0 {
        info.blank = Some(integer_missing(arr.ty));

        if arr.israw && (arr.bscale != 1.0 || arr.bzero.abs() != 0.0) {
            info.bzero = Some(arr.bzero);
            info.bscale = Some(arr.bscale);
        }
    }

    Ok(info)
}

/// Replace every element equal to the file's BLANK with the missing
/// sentinel. Runs only for integer arrays; floating payloads mark missing
/// with NaN already.
pub fn shoot_blanks(arr: &mut DataArray, blank: i64) {
    use crate::array::ArrayData;

    match &mut arr.data {
        ArrayData::Char(a) => {
            for v in a.iter_mut() {
                if *v as i64 == blank {
                    *v = MISSING_CHAR;
                }
            }
        }
        ArrayData::Short(a) => {
            for v in a.iter_mut() {
                if *v as i64 == blank {
                    *v = MISSING_SHORT;
                }
            }
        }
        ArrayData::Int(a) => {
            for v in a.iter_mut() {
                if *v as i64 == blank {
                    *v = MISSING_INT;
                }
            }
        }
        ArrayData::Long(a) => {
            for v in a.iter_mut() {
                if *v == blank {
                    *v = MISSING_LONG;
                }
            }
        }
        ArrayData::Float(_) | ArrayData::Double(_) => {}
    }
}

/// Reconstitute an array from a decoded FITS image. The array is raw (the
/// file's values, unscaled) with the file's scaling attached; BLANK values
/// are shot to the missing sentinel.
pub fn create_array(img: &FitsImage) -> Result<DataArray> {
    if !img.info.simple {
        return Err(ExportError::FitsFormat("simple FITS file expected".into()));
    }

    let ty = bitpix_to_type(img.info.bitpix)?;
    let mut arr = DataArray::from_be_bytes(ty, &img.info.axes, &img.payload)?;

    arr.bzero = 0.0;
    arr.bscale = 1.0;

    if img.info.bitpix > 0 {
        if let Some(blank) = img.info.blank {
            shoot_blanks(&mut arr, blank);
        }
        if let Some(bzero) = img.info.bzero {
            arr.bzero = bzero;
        }
        if let Some(bscale) = img.info.bscale {
            arr.bscale = bscale;
        }
    }

    arr.israw = true;
    Ok(arr)
}

// ---------------------------------------------------------------------------
// external casts and description hints

/// The external type a keyword is forced to, declared as a `:CAST` suffix in
/// the keyword's description hint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtCast {
    None,
    Integer,
    Float,
    Str,
    Logical,
}

impl ExtCast {
    pub fn parse(s: &str) -> ExtCast {
        match s.trim().to_ascii_uppercase().as_str() {
            "INTEGER" => ExtCast::Integer,
            "FLOAT" => ExtCast::Float,
            "STRING" => ExtCast::Str,
            "LOGICAL" => ExtCast::Logical,
            _ => ExtCast::None,
        }
    }

    pub fn tag(&self) -> &'static str {
        match self {
            ExtCast::Integer => "INTEGER",
            ExtCast::Float => "FLOAT",
            ExtCast::Str => "STRING",
            ExtCast::Logical => "LOGICAL",
            ExtCast::None => "",
        }
    }
}

/// Parse the leading `[NAME]` or `[NAME:CAST]` hint off a description
/// field. Returns (external name, cast).
pub fn description_hint(description: &str) -> (Option<String>, ExtCast) {
    let first = match description.split_whitespace().next() {
        Some(f) => f,
        None => return (None, ExtCast::None),
    };

    if first.len() < 3 || !first.is_ascii() || !first.starts_with('[') || !first.ends_with(']') {
        return (None, ExtCast::None);
    }

    let inner = &first[1..first.len() - 1];
    match inner.split_once(':') {
        Some((name, cast)) => (Some(name.to_owned()), ExtCast::parse(cast)),
        None => (Some(inner.to_owned()), ExtCast::None),
    }
}

// ---------------------------------------------------------------------------
// keyword maps

/// An explicit internal↔external keyword name map, loaded from a file of
/// whitespace- or comma-separated pairs, `#` comments allowed.
#[derive(Debug, Clone, Default)]
pub struct KeyMap {
    int_to_ext: HashMap<String, String>,
    ext_to_int: HashMap<String, String>,
}

impl KeyMap {
    pub fn parse<R: Read>(rd: R) -> Result<KeyMap> {
        let mut map = KeyMap::default();
        let reader = BufReader::new(rd);

        for line in reader.lines() {
            let line = line?;
            let line = line.split('#').next().unwrap_or("").trim();
            if line.is_empty() {
                continue;
            }

            let mut parts = line.split(|c: char| c.is_whitespace() || c == ',').filter(|p| !p.is_empty());
            let internal = parts.next();
            let external = parts.next();

            if let (Some(int), Some(ext)) = (internal, external) {
                map.int_to_ext.insert(int.to_ascii_lowercase(), ext.to_owned());
                map.ext_to_int.insert(ext.to_ascii_uppercase(), int.to_owned());
            } else {
                warn!(line, "skipping malformed keyword-map line");
            }
        }

        Ok(map)
    }

    pub fn ext_name(&self, internal: &str) -> Option<&str> {
        self.int_to_ext.get(&internal.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn int_name(&self, external: &str) -> Option<&str> {
        self.ext_to_int.get(&external.to_ascii_uppercase()).map(|s| s.as_str())
    }
}

/// Named keyword-map classes, consulted between an explicit map file and the
/// description-hint fallbacks.
#[derive(Debug, Clone, Default)]
pub struct KeyMapRegistry {
    classes: HashMap<String, KeyMap>,
}

impl KeyMapRegistry {
    pub fn new() -> KeyMapRegistry {
        KeyMapRegistry::default()
    }

    pub fn register(&mut self, class: &str, map: KeyMap) {
        self.classes.insert(class.to_ascii_lowercase(), map);
    }

    pub fn class(&self, name: &str) -> Option<&KeyMap> {
        self.classes.get(&name.to_ascii_lowercase())
    }
}

// ---------------------------------------------------------------------------
// name legality

const RESERVED_FITS_NAMES: &[&str] = &[
    "SIMPLE", "BITPIX", "NAXIS", "EXTEND", "BLANK", "BZERO", "BSCALE", "END", "XTENSION",
    "PCOUNT", "GCOUNT", "TFIELDS",
];

/// 0 = legal, 1 = illegal, 2 = reserved (mirrors the classic tri-state
/// check).
fn fits_name_check(name: &str) -> u8 {
    if name.is_empty() || name.len() > 8 {
        return 1;
    }
    if !name
        .bytes()
        .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit() || b == b'-' || b == b'_')
    {
        return 1;
    }
    if RESERVED_FITS_NAMES.contains(&name) || (name.starts_with("NAXIS") && name.len() > 5) {
        return 2;
    }
    0
}

fn store_name_check(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= 31
        && name.chars().next().unwrap().is_ascii_alphabetic()
        && name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Synthesize a legal FITS name from an arbitrary store name: uppercase,
/// illegal characters to `_`, truncated to eight, digit-led names prefixed.
fn generate_fits_name(name: &str) -> Result<String> {
    let mut out = String::new();
    for c in name.chars() {
        let c = c.to_ascii_uppercase();
        if c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-' || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
        if out.len() == 8 {
            break;
        }
    }

    if out.is_empty() {
        return Err(ExportError::Unsupported(format!(
            "cannot derive a FITS keyword name from '{name}'"
        )));
    }

    if out.as_bytes()[0].is_ascii_digit() {
        out.insert(0, '_');
        out.truncate(8);
    }

    if fits_name_check(&out) == 2 {
        out.insert(0, '_');
        out.truncate(8);
    }

    Ok(out)
}

/// Synthesize a legal store name from a FITS name: lowercase, illegal
/// characters to `_`, letter-led.
fn generate_store_name(name: &str) -> String {
    let mut out = String::new();
    for c in name.chars() {
        let c = c.to_ascii_lowercase();
        if c.is_ascii_alphanumeric() || c == '_' {
            out.push(c);
        } else {
            out.push('_');
        }
    }

    if out.is_empty() || !out.chars().next().unwrap().is_ascii_alphabetic() {
        out.insert(0, 'k');
    }
    out.truncate(31);
    out
}

/// Resolve the external FITS name for a store keyword: explicit map, then
/// named class, then the `[NAME]` description hint, then the uppercased
/// store name if legal, then a synthesized name.
pub fn external_name(
    key: &Keyword,
    class: Option<&str>,
    map: Option<&KeyMap>,
    registry: &KeyMapRegistry,
) -> Result<String> {
    if let Some(m) = map {
        if let Some(ext) = m.ext_name(&key.info.name) {
            return Ok(ext.to_owned());
        }
    }

    if let Some(cls) = class {
        if let Some(ext) = registry.class(cls).and_then(|m| m.ext_name(&key.info.name)) {
            return Ok(ext.to_owned());
        }
    }

    let (hint, _) = description_hint(&key.info.description);
    if let Some(h) = hint {
        if fits_name_check(&h) == 0 {
            return Ok(h);
        }
    }

    let upper = key.info.name.to_ascii_uppercase();
    match fits_name_check(&upper) {
        0 => return Ok(upper),
        2 => warn!(name = %key.info.name, "store keyword name is reserved in FITS"),
        _ => {}
    }

    generate_fits_name(&key.info.name)
}

/// Resolve the store name for an incoming FITS keyword: explicit map, then
/// class, then the name itself if legal, then a synthesized name.
pub fn internal_name(
    fits_name: &str,
    class: Option<&str>,
    map: Option<&KeyMap>,
    registry: &KeyMapRegistry,
) -> String {
    if let Some(m) = map {
        if let Some(int) = m.int_name(fits_name) {
            return int.to_owned();
        }
    }

    if let Some(cls) = class {
        if let Some(int) = registry.class(cls).and_then(|m| m.int_name(fits_name)) {
            return int.to_owned();
        }
    }

    if store_name_check(fits_name) {
        return fits_name.to_owned();
    }

    generate_store_name(fits_name)
}

// ---------------------------------------------------------------------------
// keyword export

/// Map one store keyword onto a FITS card. The caller has already followed
/// any link, so the keyword carries a stored value.
pub fn export_keyword(
    key: &Keyword,
    class: Option<&str>,
    map: Option<&KeyMap>,
    registry: &KeyMapRegistry,
    opts: BridgeOptions,
) -> Result<FitsKeyword> {
    let name = external_name(key, class, map, registry)?;
    let value = key.value_or_err()?;
    let (_, cast) = description_hint(&key.info.description);

    if name == "COMMENT" || name == "HISTORY" {
        return Ok(FitsKeyword::commentary(&name, &key.snprintf_value()?));
    }

    let fits_value = match cast {
        ExtCast::Integer => FitsValue::Integer(value.as_i64()?),
        ExtCast::Float => FitsValue::Float(value.as_f64()?),
        ExtCast::Str => FitsValue::Str(key.snprintf_value()?),
        ExtCast::Logical => {
            let truthy = value.as_i64()? != 0;
            // The historical mapping is inverted relative to the FITS
            // convention and is preserved until standard_logical is set.
            let logical = if opts.standard_logical { truthy } else { !truthy };
            FitsValue::Logical(logical)
        }
        ExtCast::None => match key.info.ty {
            StoreType::Char | StoreType::Short | StoreType::Int | StoreType::Long => {
                FitsValue::Integer(value.as_i64()?)
            }
            StoreType::Float | StoreType::Double => FitsValue::Float(value.as_f64()?),
            StoreType::Time | StoreType::String => FitsValue::Str(key.snprintf_value()?),
            other => {
                return Err(ExportError::Unsupported(format!(
                    "cannot export a keyword of type {}",
                    other.name()
                )))
            }
        },
    };

    Ok(FitsKeyword::new(&name, fits_value))
}

// ---------------------------------------------------------------------------
// keyword import

fn narrow_fits_integer(v: i64) -> (StoreType, StoreValue) {
    if v >= i8::MIN as i64 && v <= i8::MAX as i64 {
        (StoreType::Char, StoreValue::Char(v as i8))
    } else if v >= i16::MIN as i64 && v <= i16::MAX as i64 {
        (StoreType::Short, StoreValue::Short(v as i16))
    } else if v >= i32::MIN as i64 && v <= i32::MAX as i64 {
        (StoreType::Int, StoreValue::Int(v as i32))
    } else {
        (StoreType::Long, StoreValue::Long(v))
    }
}

/// Import one FITS card into a keyword set.
///
/// Integers narrow to the smallest containing store type, floats to `Float`
/// iff they fit, logicals become `Char ∈ {0,1}` tagged with a Logical cast.
/// `COMMENT`/`HISTORY` accumulate into a single newline-joined string
/// keyword. When the store name differs from the FITS name (or the cast is
/// Logical), the description records `[FITSNAME:CAST]` so a later export
/// round-trips.
pub fn import_keyword(
    fitskey: &FitsKeyword,
    class: Option<&str>,
    map: Option<&KeyMap>,
    registry: &KeyMapRegistry,
    keys: &mut KeywordSet,
) -> Result<()> {
    if fitskey.is_commentary() {
        let name = if fitskey.name.is_empty() {
            "comment"
        } else {
            fitskey.name.as_str()
        };
        let store_name = name.to_ascii_lowercase();
        let text = fitskey.comment.clone().unwrap_or_default();

        if let Some(existing) = keys.get_mut(&store_name) {
            if let KeywordBinding::Stored(StoreValue::String(s)) = &mut existing.binding {
                if !s.is_empty() {
                    s.push('\n');
                }
                s.push_str(&text);
                return Ok(());
            }
        }

        keys.insert(Keyword::stored(
            KeywordInfo {
                name: store_name,
                ty: StoreType::String,
                format: "%s".to_owned(),
                unit: String::new(),
                description: String::new(),
                scope: RecScope::Variable,
                flags: KeywordFlags::default(),
                rank: keys.len() as u32,
            },
            StoreValue::String(text),
        ));
        return Ok(());
    }

    let store_name = internal_name(&fitskey.name, class, map, registry);

    let (ty, value, cast) = match fitskey.value.as_ref().unwrap() {
        FitsValue::Str(s) => (
            StoreType::String,
            StoreValue::String(s.trim().to_owned()),
            ExtCast::Str,
        ),
        FitsValue::Logical(b) => (
            StoreType::Char,
            StoreValue::Char(if *b { 1 } else { 0 }),
            ExtCast::Logical,
        ),
        FitsValue::Integer(v) => {
            let (ty, value) = narrow_fits_integer(*v);
            (ty, value, ExtCast::Integer)
        }
        FitsValue::Float(v) => {
            if v.abs() <= f32::MAX as f64 {
                (StoreType::Float, StoreValue::Float(*v as f32), ExtCast::Float)
            } else {
                (StoreType::Double, StoreValue::Double(*v), ExtCast::Float)
            }
        }
    };

    let description = if !store_name.eq_ignore_ascii_case(&fitskey.name) || cast == ExtCast::Logical
    {
        format!("[{}:{}]", fitskey.name, cast.tag())
    } else {
        String::new()
    };

    keys.insert(Keyword::stored(
        KeywordInfo {
            name: store_name,
            ty,
            format: crate::keyword::default_format(ty).to_owned(),
            unit: String::new(),
            description,
            scope: RecScope::Variable,
            flags: KeywordFlags::default(),
            rank: keys.len() as u32,
        },
        value,
    ));

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::array::{ArrayFlat, DataArray};

    fn kw(name: &str, ty: StoreType, value: StoreValue, description: &str) -> Keyword {
        Keyword::stored(
            KeywordInfo {
                name: name.to_owned(),
                ty,
                format: crate::keyword::default_format(ty).to_owned(),
                unit: String::new(),
                description: description.to_owned(),
                scope: RecScope::Variable,
                flags: KeywordFlags::default(),
                rank: 0,
            },
            value,
        )
    }

    #[test]
    fn image_info_for_raw_short() {
        let mut arr = DataArray::from_flat(
            StoreType::Short,
            &[2, 2],
            ArrayFlat::Short(vec![-1, 0, 32767, MISSING_SHORT]),
        )
        .unwrap();
        arr.israw = true;
        arr.bzero = 0.0;
        arr.bscale = 1.0;

        let info = set_image_info(&arr).unwrap();
        assert_eq!(info.bitpix, 16);
        assert_eq!(info.blank, Some(-32768));
        // trivial scaling is not emitted
        assert_eq!(info.bzero, None);
        assert_eq!(info.bscale, None);
    }

    #[test]
    fn image_info_emits_nontrivial_scaling() {
        let mut arr = DataArray::from_flat(StoreType::Short, &[2], ArrayFlat::Short(vec![0, 1]))
            .unwrap();
        arr.israw = true;
        arr.bzero = 1.0;
        arr.bscale = 2.0 / 32766.0;

        let info = set_image_info(&arr).unwrap();
        assert_eq!(info.bzero, Some(1.0));
        assert_eq!(info.bscale, Some(2.0 / 32766.0));
    }

    #[test]
    fn string_arrays_are_rejected() {
        // no array of strings can exist, so exercise the type map directly
        assert!(matches!(
            type_to_bitpix(StoreType::String),
            Err(ExportError::Unsupported(_))
        ));
    }

    #[test]
    fn name_ladder_prefers_hint_then_uppercase() {
        let registry = KeyMapRegistry::new();

        let hinted = kw(
            "telescope",
            StoreType::String,
            StoreValue::String("x".into()),
            "[TELESCOP] the instrument",
        );
        assert_eq!(
            external_name(&hinted, None, None, &registry).unwrap(),
            "TELESCOP"
        );

        let plain = kw("quality", StoreType::Int, StoreValue::Int(1), "");
        assert_eq!(
            external_name(&plain, None, None, &registry).unwrap(),
            "QUALITY"
        );

        let long = kw(
            "a_rather_long_name",
            StoreType::Int,
            StoreValue::Int(1),
            "",
        );
        assert_eq!(
            external_name(&long, None, None, &registry).unwrap(),
            "A_RATHER"
        );
    }

    #[test]
    fn logical_export_is_inverted_by_default() {
        let registry = KeyMapRegistry::new();
        let key = kw(
            "calflag",
            StoreType::Char,
            StoreValue::Char(1),
            "[CALFLAG:LOGICAL]",
        );

        let card = export_keyword(&key, None, None, &registry, BridgeOptions::default()).unwrap();
        assert_eq!(card.value, Some(FitsValue::Logical(false)));

        let std = export_keyword(
            &key,
            None,
            None,
            &registry,
            BridgeOptions {
                standard_logical: true,
            },
        )
        .unwrap();
        assert_eq!(std.value, Some(FitsValue::Logical(true)));
    }

    #[test]
    fn import_narrows_and_tags() {
        let registry = KeyMapRegistry::new();
        let mut keys = KeywordSet::new();

        import_keyword(
            &FitsKeyword::new("NVAL", FitsValue::Integer(1000)),
            None,
            None,
            &registry,
            &mut keys,
        )
        .unwrap();
        let kw = keys.get("nval").unwrap();
        assert_eq!(kw.info.ty, StoreType::Short);
        // name round-trips case-insensitively, so no hint is needed
        assert!(kw.info.description.is_empty());

        import_keyword(
            &FitsKeyword::new("FLAG", FitsValue::Logical(true)),
            None,
            None,
            &registry,
            &mut keys,
        )
        .unwrap();
        let kw = keys.get("flag").unwrap();
        assert_eq!(kw.value(), Some(&StoreValue::Char(1)));
        assert_eq!(kw.info.description, "[FLAG:LOGICAL]");
    }

    #[test]
    fn commentary_accumulates() {
        let registry = KeyMapRegistry::new();
        let mut keys = KeywordSet::new();

        for text in ["first pass", "second pass"] {
            import_keyword(
                &FitsKeyword::commentary("HISTORY", text),
                None,
                None,
                &registry,
                &mut keys,
            )
            .unwrap();
        }

        let kw = keys.get("history").unwrap();
        assert_eq!(
            kw.value(),
            Some(&StoreValue::String("first pass\nsecond pass".into()))
        );
    }

    #[test]
    fn blank_shooting_round_trip() {
        let mut arr = DataArray::from_flat(
            StoreType::Short,
            &[4],
            ArrayFlat::Short(vec![5, -32768, 0, -32768]),
        )
        .unwrap();
        shoot_blanks(&mut arr, -32768);
        assert!(arr.raw_f64(1).is_nan());
        assert!(arr.raw_f64(3).is_nan());
        assert_eq!(arr.raw_f64(0), 5.0);
    }
}
