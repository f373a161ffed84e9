//! End-to-end scenarios: byte-level FITS round trips, keyword mapping
//! fidelity, and the archive layout of a full export.

use std::path::PathBuf;
use std::rc::Rc;

use helios_export::array::{ArrayFlat, DataArray};
use helios_export::bridge::{self, BridgeOptions, KeyMapRegistry};
use helios_export::error::{ExportError, Result};
use helios_export::exporter::{ExportOptions, ExportSession};
use helios_export::fits;
use helios_export::keyword::{Keyword, KeywordFlags, KeywordInfo, KeywordSet, RecScope};
use helios_export::record::{Protocol, Record, SegmentInfo, SeriesInfo};
use helios_export::segment::{SegmentIo, StorageAllocator};
use helios_export::tar::TarStreamer;
use helios_export::timefmt;
use helios_export::types::{StoreType, StoreValue, MISSING_SHORT};
use helios_export::vds::VdsCache;

struct NoStorage;

impl StorageAllocator for NoStorage {
    fn stage(&self, series: &str, sunum: i64) -> Result<PathBuf> {
        Err(ExportError::Offline(format!("{series}:{sunum}")))
    }

    fn record_dir(&self, series: &str, recnum: i64) -> Result<PathBuf> {
        Err(ExportError::Offline(format!("{series}:#{recnum}")))
    }
}

fn keyword(name: &str, ty: StoreType, value: StoreValue, description: &str, rank: u32) -> Keyword {
    Keyword::stored(
        KeywordInfo {
            name: name.to_owned(),
            ty,
            format: helios_export::keyword::default_format(ty).to_owned(),
            unit: String::new(),
            description: description.to_owned(),
            scope: RecScope::Variable,
            flags: KeywordFlags::default(),
            rank,
        },
        value,
    )
}

/// Scenario 1: a raw Short array round-trips byte-identically, with BLANK
/// for the missing sentinel and no scaling cards for trivial scaling.
#[test]
fn integer_round_trip_is_byte_identical() {
    let tmp = tempfile::tempdir().unwrap();
    let series = Rc::new(SeriesInfo::new("lab.obs"));
    let mut rec = Record::new(series, 1);
    rec.su_dir = Some(tmp.path().to_path_buf());
    rec.sunum = 1;
    rec.segments.push(SegmentInfo::new(
        "image",
        0,
        StoreType::Short,
        &[2, 2],
        Protocol::Fits,
    ));

    let su = NoStorage;
    let mut vds = VdsCache::default();
    let mut io = SegmentIo::new(&su, None, &mut vds);

    let mut arr = DataArray::from_flat(
        StoreType::Short,
        &[2, 2],
        ArrayFlat::Short(vec![-1, 0, 32767, MISSING_SHORT]),
    )
    .unwrap();
    arr.israw = true;

    io.write(&mut rec, "image", &arr, false).unwrap();

    // inspect the file the bridge produced
    let img = fits::read_fits_file(tmp.path().join("image.fits")).unwrap();
    assert_eq!(img.info.bitpix, 16);
    assert_eq!(img.info.blank, Some(-32768));
    assert_eq!(img.info.bzero, None);
    assert_eq!(img.info.bscale, None);
    assert_eq!(
        img.payload,
        vec![0xff, 0xff, 0x00, 0x00, 0x7f, 0xff, 0x80, 0x00]
    );

    // and the raw read reproduces the payload bit for bit
    let back = io.read(&rec, "image", StoreType::Raw).unwrap();
    assert_eq!(back.to_be_bytes(), arr.to_be_bytes());
    assert_eq!((back.bzero, back.bscale), (0.0, 1.0));
}

/// Scenario 2: autoscaling a float array into Short storage centers the
/// range and scales the extremes onto ±32766.
#[test]
fn scaled_round_trip_through_autoscale() {
    let tmp = tempfile::tempdir().unwrap();
    let series = Rc::new(SeriesInfo::new("lab.obs"));
    let mut rec = Record::new(series, 2);
    rec.su_dir = Some(tmp.path().to_path_buf());
    rec.sunum = 1;
    rec.segments.push(SegmentInfo::new(
        "image",
        0,
        StoreType::Short,
        &[3],
        Protocol::Fits,
    ));

    let su = NoStorage;
    let mut vds = VdsCache::default();
    let mut io = SegmentIo::new(&su, None, &mut vds);

    let arr = DataArray::from_flat(
        StoreType::Float,
        &[3],
        ArrayFlat::Float(vec![0.0, 1.0, 2.0]),
    )
    .unwrap();

    io.write(&mut rec, "image", &arr, true).unwrap();

    let seg = rec.segment("image").unwrap();
    assert_eq!(seg.bzero, 1.0);
    assert!((seg.bscale - 2.0 / 65532.0).abs() < 1e-18);

    let img = fits::read_fits_file(tmp.path().join("image.fits")).unwrap();
    assert_eq!(img.info.bzero, Some(1.0));

    // stored extremes land symmetrically
    let raw = io.read(&rec, "image", StoreType::Raw).unwrap();
    assert_eq!(raw.raw_f64(0), -32766.0);
    assert_eq!(raw.raw_f64(1), 0.0);
    assert_eq!(raw.raw_f64(2), 32766.0);

    // the physical values come back within the scaling quantum
    let phys = io.read(&rec, "image", StoreType::Double).unwrap();
    for (i, expect) in [0.0, 1.0, 2.0].iter().enumerate() {
        assert!((phys.raw_f64(i) - expect).abs() < 1e-4);
    }
}

/// Every keyword whose store name round-trips exports and re-imports with
/// an equal value under the documented cast semantics.
#[test]
fn keyword_export_import_round_trip() {
    let registry = KeyMapRegistry::new();
    let opts = BridgeOptions::default();

    let originals = vec![
        keyword("quality", StoreType::Int, StoreValue::Int(1024), "", 0),
        keyword(
            "exptime",
            StoreType::Double,
            StoreValue::Double(12.5),
            "",
            1,
        ),
        keyword(
            "telescop",
            StoreType::String,
            StoreValue::String("ground station".into()),
            "",
            2,
        ),
        keyword(
            "calflag",
            StoreType::Char,
            StoreValue::Char(1),
            "[CALFLAG:LOGICAL]",
            3,
        ),
    ];

    // export
    let mut cards = Vec::new();
    for key in &originals {
        cards.push(bridge::export_keyword(key, None, None, &registry, opts).unwrap());
    }

    // import into a fresh keyword set
    let mut keys = KeywordSet::new();
    for card in &cards {
        bridge::import_keyword(card, None, None, &registry, &mut keys).unwrap();
    }

    // integer narrows to Short but the value is preserved
    assert_eq!(
        keys.get("quality").unwrap().value().unwrap().as_i64().unwrap(),
        1024
    );
    assert_eq!(
        keys.get("exptime").unwrap().value().unwrap().as_f64().unwrap(),
        12.5
    );
    assert_eq!(
        keys.get("telescop").unwrap().value(),
        Some(&StoreValue::String("ground station".into()))
    );

    // the inverted logical: store 1 went out as F, and F comes back as 0
    // with the cast recorded for the next export
    let calflag = keys.get("calflag").unwrap();
    assert_eq!(calflag.value(), Some(&StoreValue::Char(0)));
    assert_eq!(calflag.info.description, "[CALFLAG:LOGICAL]");
}

/// Scenario 3, end to end through keyword storage: the slot boundary at
/// one minute belongs to slot 1, a hair less to slot 0.
#[test]
fn slot_calculation_against_epoch() {
    let mut keys = KeywordSet::new();
    let slot = Keyword::stored(
        KeywordInfo {
            name: "t_rec".into(),
            ty: StoreType::Time,
            format: "0".into(),
            unit: "TAI".into(),
            description: String::new(),
            scope: RecScope::TsEq,
            flags: KeywordFlags::default(),
            rank: 0,
        },
        StoreValue::Time(0.0),
    );
    keys.insert(slot.clone());
    keys.insert(keyword(
        "t_rec_epoch",
        StoreType::String,
        StoreValue::String("1993.01.01_00:00:00_TAI".into()),
        "",
        1,
    ));
    keys.insert(keyword(
        "t_rec_step",
        StoreType::String,
        StoreValue::String("60s".into()),
        "",
        2,
    ));

    let at = |text: &str| {
        let t = timefmt::parse_time(text).unwrap();
        helios_export::keyword::slot_to_index(&keys, &slot, &StoreValue::Time(t)).unwrap()
    };

    assert_eq!(at("1993.01.01_00:01:00_TAI"), 1);
    assert_eq!(at("1993.01.01_00:00:59.999_TAI"), 0);
    assert_eq!(at("1993.01.01_00:00:00_TAI"), 0);
    assert_eq!(at("1993.01.01_00:02:00_TAI"), 2);
}

/// A full export over two records produces an archive whose members and
/// manifest line up, terminated by the 1024-byte end marker.
#[test]
fn full_export_archive_layout() {
    let tmp = tempfile::tempdir().unwrap();
    let series = Rc::new(SeriesInfo::new("lab.obs"));

    let mut records = Vec::new();
    for recnum in [10, 11] {
        let mut rec = Record::new(series.clone(), recnum);
        let dir = tmp.path().join(format!("su{recnum}"));
        std::fs::create_dir(&dir).unwrap();
        rec.su_dir = Some(dir);
        rec.sunum = recnum;
        rec.segments.push(SegmentInfo::new(
            "image",
            0,
            StoreType::Short,
            &[2, 2],
            Protocol::Fits,
        ));
        rec.keywords.insert(keyword(
            "quality",
            StoreType::Int,
            StoreValue::Int(recnum as i32),
            "",
            0,
        ));

        let su = NoStorage;
        let mut vds = VdsCache::default();
        let mut io = SegmentIo::new(&su, None, &mut vds);
        let mut arr = DataArray::from_flat(
            StoreType::Short,
            &[2, 2],
            ArrayFlat::Short(vec![1, 2, 3, recnum as i16]),
        )
        .unwrap();
        arr.israw = true;
        io.write(&mut rec, "image", &arr, false).unwrap();

        records.push(rec);
    }

    let su = NoStorage;
    let mut vds = VdsCache::default();
    let io = SegmentIo::new(&su, None, &mut vds);
    let registry = KeyMapRegistry::new();

    let mut out = Vec::new();
    let tar = TarStreamer::new(&mut out, None);
    let mut session = ExportSession::new(tar, io, &registry, ExportOptions::default());

    for rec in &records {
        session.export_record(rec).unwrap();
    }
    let summary = session.finish().unwrap();

    assert_eq!(summary.files, 2);
    assert!(!summary.had_errors);

    // each member is one header block + one FITS file (2 blocks of 2880),
    // plus the manifest member and the end marker
    assert_eq!(out.len() % 512, 0);
    let text = String::from_utf8_lossy(&out);
    assert!(text.contains("lab.obs.10.image.fits"));
    assert!(text.contains("lab.obs.11.image.fits"));
    assert!(text.contains("jsoc/file_list.txt"));
    assert!(out[out.len() - 1024..].iter().all(|b| *b == 0));
}
