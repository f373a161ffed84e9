//! Records, series, and segment descriptors.
//!
//! The store's full record/link machinery is an external collaborator; what
//! lives here is the shape the export core needs: a record owns its keyword
//! set and segment descriptors, knows its storage-unit directory, and can
//! resolve keyword and segment links to other records with a bounded-depth
//! walk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::error::{ExportError, Result};
use crate::fits::CompressSpec;
use crate::keyword::{Keyword, KeywordBinding, KeywordSet, MAX_LINK_DEPTH};
use crate::types::StoreType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Fits,
    FitsTiled,
    Binary,
    Binzip,
    Tas,
    Generic,
    Local,
    Dsds,
}

impl Protocol {
    pub fn parse(s: &str) -> Result<Protocol> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fits" => Ok(Protocol::Fits),
            "fits_tiled" | "fitz" => Ok(Protocol::FitsTiled),
            "binary" | "bin" => Ok(Protocol::Binary),
            "binzip" | "bin.gz" => Ok(Protocol::Binzip),
            "tas" => Ok(Protocol::Tas),
            "generic" => Ok(Protocol::Generic),
            "local" => Ok(Protocol::Local),
            "dsds" => Ok(Protocol::Dsds),
            other => Err(ExportError::BadRequest(format!(
                "unknown segment protocol '{other}'"
            ))),
        }
    }

    /// Default file extension for segment files under the storage unit.
    pub fn extension(&self) -> &'static str {
        match self {
            Protocol::Fits | Protocol::FitsTiled => ".fits",
            Protocol::Binary => ".bin",
            Protocol::Binzip => ".bin.gz",
            Protocol::Tas => ".tas",
            Protocol::Generic | Protocol::Local | Protocol::Dsds => "",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegScope {
    Constant,
    Variable,
    Vardim,
}

#[derive(Debug, Clone)]
pub struct SegmentInfo {
    pub name: String,
    pub segnum: usize,
    pub ty: StoreType,
    /// axes[0] is the fastest-varying axis; rank is at most 9.
    pub axes: Vec<usize>,
    pub protocol: Protocol,
    pub scope: SegScope,
    /// Tile blocking for tiled protocols; empty otherwise.
    pub blocksize: Vec<usize>,
    /// On-disk file name within the storage unit; derived from the segment
    /// name when empty.
    pub filename: String,
    pub cparms: Option<CompressSpec>,
    /// For constant-scope segments: recnum of the record owning the
    /// canonical copy. Zero until the first write.
    pub const_record_recnum: i64,
    /// Catalog scaling for integer storage.
    pub bzero: f64,
    pub bscale: f64,
    /// When set, this segment is a link: resolve through the record link of
    /// that name to the same-named segment of the target record.
    pub link: Option<String>,
}

impl SegmentInfo {
    pub fn new(name: &str, segnum: usize, ty: StoreType, axes: &[usize], protocol: Protocol) -> SegmentInfo {
        SegmentInfo {
            name: name.to_owned(),
            segnum,
            ty,
            axes: axes.to_vec(),
            protocol,
            scope: SegScope::Variable,
            blocksize: Vec::new(),
            filename: String::new(),
            cparms: None,
            const_record_recnum: 0,
            bzero: 0.0,
            bscale: 1.0,
            link: None,
        }
    }

    pub fn naxis(&self) -> usize {
        self.axes.len()
    }

    /// The file name this segment uses inside its storage-unit slot.
    pub fn disk_name(&self) -> String {
        if self.filename.is_empty() {
            format!("{}{}", self.name, self.protocol.extension())
        } else {
            self.filename.clone()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SeriesInfo {
    pub name: String,
    pub prime_keys: Vec<String>,
    /// Records per storage unit; a record's slot number indexes the TAS
    /// record axis.
    pub unit_size: usize,
}

impl SeriesInfo {
    pub fn new(name: &str) -> SeriesInfo {
        SeriesInfo {
            name: name.to_owned(),
            prime_keys: Vec::new(),
            unit_size: 1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Record {
    pub series: Rc<SeriesInfo>,
    pub recnum: i64,
    /// Storage-unit number; −1 when the record owns no storage.
    pub sunum: i64,
    /// Slot within the storage unit.
    pub slotnum: usize,
    /// Directory of the record's storage-unit slot once staged.
    pub su_dir: Option<PathBuf>,
    pub keywords: KeywordSet,
    pub segments: Vec<SegmentInfo>,
    /// Record links, by link name.
    pub links: HashMap<String, Rc<Record>>,
    pub readonly: bool,
}

impl Record {
    pub fn new(series: Rc<SeriesInfo>, recnum: i64) -> Record {
        Record {
            series,
            recnum,
            sunum: -1,
            slotnum: 0,
            su_dir: None,
            keywords: KeywordSet::new(),
            segments: Vec::new(),
            links: HashMap::new(),
            readonly: false,
        }
    }

    /// `series[:#recnum]`, the unambiguous spec for messages and manifests.
    pub fn spec(&self) -> String {
        format!("{}[:#{}]", self.series.name, self.recnum)
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        self.segments
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn segment_mut(&mut self, name: &str) -> Option<&mut SegmentInfo> {
        self.segments
            .iter_mut()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn segment_by_num(&self, segnum: usize) -> Option<&SegmentInfo> {
        self.segments.iter().find(|s| s.segnum == segnum)
    }

    /// Look a keyword up without following links.
    pub fn keyword(&self, name: &str) -> Option<&Keyword> {
        self.keywords.get(name)
    }

    /// Look a keyword up, following link bindings through record links. A
    /// chain deeper than `MAX_LINK_DEPTH` is treated as a cycle and is a
    /// hard error.
    pub fn keyword_followed(&self, name: &str) -> Result<&Keyword> {
        let mut rec: &Record = self;
        let mut name = name.to_owned();

        for _ in 0..MAX_LINK_DEPTH {
            let kw = rec.keywords.get(&name).ok_or_else(|| {
                ExportError::BadRequest(format!(
                    "unknown keyword '{}' in {}",
                    name,
                    rec.series.name
                ))
            })?;

            match &kw.binding {
                KeywordBinding::Stored(_) => return Ok(kw),
                KeywordBinding::Link { link, target } => {
                    rec = rec.links.get(link).ok_or_else(|| {
                        ExportError::BadRequest(format!(
                            "keyword '{}' links through undefined record link '{}'",
                            name, link
                        ))
                    })?;
                    name = target.clone();
                }
            }
        }

        Err(ExportError::Internal(format!(
            "keyword link depth exceeded resolving '{}' (cycle?)",
            name
        )))
    }

    /// Resolve a segment, following segment links to the target record.
    /// Returns the owning record and the segment descriptor.
    pub fn segment_followed<'a>(&'a self, name: &str) -> Result<(&'a Record, &'a SegmentInfo)> {
        let mut rec: &Record = self;

        for _ in 0..MAX_LINK_DEPTH {
            let seg = rec.segment(name).ok_or_else(|| {
                ExportError::BadRequest(format!(
                    "unknown segment '{}' in {}",
                    name,
                    rec.series.name
                ))
            })?;

            match &seg.link {
                None => return Ok((rec, seg)),
                Some(link) => {
                    rec = rec.links.get(link).ok_or_else(|| {
                        ExportError::BadRequest(format!(
                            "segment '{}' links through undefined record link '{}'",
                            name, link
                        ))
                    })?;
                }
            }
        }

        Err(ExportError::Internal(format!(
            "segment link depth exceeded resolving '{}' (cycle?)",
            name
        )))
    }

    /// The staged storage-unit directory, or an error if the record has
    /// never been staged.
    pub fn su_dir(&self) -> Result<&Path> {
        self.su_dir.as_deref().ok_or_else(|| {
            ExportError::Offline(format!("record {} has no staged storage unit", self.spec()))
        })
    }

    /// Full path of a segment's file within this record's storage unit.
    pub fn segment_path(&self, seg: &SegmentInfo) -> Result<PathBuf> {
        Ok(self.su_dir()?.join(seg.disk_name()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keyword::{KeywordFlags, KeywordInfo, RecScope};
    use crate::types::StoreValue;

    fn plain_info(name: &str) -> KeywordInfo {
        KeywordInfo {
            name: name.to_owned(),
            ty: StoreType::Int,
            format: "%d".to_owned(),
            unit: String::new(),
            description: String::new(),
            scope: RecScope::Variable,
            flags: KeywordFlags::default(),
            rank: 0,
        }
    }

    #[test]
    fn keyword_links_follow_to_target() {
        let target_series = Rc::new(SeriesInfo::new("lab.calib"));
        let mut target = Record::new(target_series, 7);
        target
            .keywords
            .insert(Keyword::stored(plain_info("exposure"), StoreValue::Int(42)));

        let series = Rc::new(SeriesInfo::new("lab.obs"));
        let mut rec = Record::new(series, 1);
        rec.keywords.insert(Keyword {
            info: plain_info("exposure"),
            binding: KeywordBinding::Link {
                link: "calib".to_owned(),
                target: "exposure".to_owned(),
            },
        });
        rec.links.insert("calib".to_owned(), Rc::new(target));

        let kw = rec.keyword_followed("exposure").unwrap();
        assert_eq!(kw.value(), Some(&StoreValue::Int(42)));
    }

    #[test]
    fn keyword_link_cycles_error() {
        let series = Rc::new(SeriesInfo::new("lab.selfref"));
        let mut rec = Record::new(series, 1);
        rec.keywords.insert(Keyword {
            info: plain_info("loop"),
            binding: KeywordBinding::Link {
                link: "me".to_owned(),
                target: "loop".to_owned(),
            },
        });
        let rc = Rc::new(rec);

        // a record linking to itself: the walk must terminate with an error
        let mut outer = Record::new(Rc::new(SeriesInfo::new("lab.outer")), 2);
        outer.keywords.insert(Keyword {
            info: plain_info("loop"),
            binding: KeywordBinding::Link {
                link: "me".to_owned(),
                target: "loop".to_owned(),
            },
        });
        outer.links.insert("me".to_owned(), rc.clone());

        // the inner record has no "me" link, so resolution fails cleanly
        assert!(outer.keyword_followed("loop").is_err());
    }

    #[test]
    fn segment_disk_names_follow_protocol() {
        let seg = SegmentInfo::new("image", 0, StoreType::Short, &[4, 4], Protocol::Fits);
        assert_eq!(seg.disk_name(), "image.fits");

        let mut named = seg.clone();
        named.filename = "custom.dat".to_owned();
        assert_eq!(named.disk_name(), "custom.dat");
    }
}
