//! Export request rows and the field grammars they carry.
//!
//! A request row arrives from the work queue with free-text `processing` and
//! `protocol` fields. The processing field is a `|`-separated ordered list
//! of steps, each `name,arg=val,arg=val,…`; a legacy leading `n=K` entry is
//! a record-limit directive, not a step. The protocol field is a protocol
//! name optionally followed by comma-separated per-segment compression
//! parameters.

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::fits::Compression;

/// Status codes of a request row, shared with the queue's schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Done,
    Queued,
    New,
    Failed,
    DevNew,
}

impl RequestStatus {
    pub fn code(&self) -> i32 {
        match self {
            RequestStatus::Done => 0,
            RequestStatus::Queued => 1,
            RequestStatus::New => 2,
            RequestStatus::Failed => 4,
            RequestStatus::DevNew => 12,
        }
    }

    pub fn from_code(code: i32) -> Result<RequestStatus> {
        match code {
            0 => Ok(RequestStatus::Done),
            1 => Ok(RequestStatus::Queued),
            2 => Ok(RequestStatus::New),
            4 => Ok(RequestStatus::Failed),
            12 => Ok(RequestStatus::DevNew),
            other => Err(ExportError::BadRequest(format!(
                "unknown request status code {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestRow {
    pub request_id: String,
    pub user_id: i64,
    pub spec: String,
    #[serde(default)]
    pub processing: String,
    pub protocol: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub filename_format: String,
    #[serde(default)]
    pub method: String,
    #[serde(default)]
    pub size_mb: i64,
    pub status: i32,
    #[serde(default)]
    pub error_msg: Option<String>,
}

impl RequestRow {
    pub fn status(&self) -> Result<RequestStatus> {
        RequestStatus::from_code(self.status)
    }
}

/// The protocol field split into protocol name and per-segment compression
/// parameters. A parameter list shorter than the segment count repeats its
/// last entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolField {
    pub protocol: String,
    pub cparms: Vec<Option<Compression>>,
}

impl ProtocolField {
    pub fn parse(field: &str) -> Result<ProtocolField> {
        let mut parts = field.split(',');
        let protocol = parts
            .next()
            .map(|p| p.trim().to_ascii_lowercase())
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ExportError::BadRequest("empty protocol field".into()))?;

        let mut cparms = Vec::new();
        for token in parts {
            cparms.push(Compression::parse(token)?);
        }

        Ok(ProtocolField { protocol, cparms })
    }

    /// Compression for segment `i`, extending the list by repetition.
    pub fn compression_for(&self, i: usize) -> Option<Compression> {
        match self.cparms.get(i) {
            Some(c) => *c,
            None => self.cparms.last().copied().flatten(),
        }
    }
}

/// One parsed (unresolved) processing step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawStep {
    pub name: String,
    /// Literal `arg=val` bindings, in order. Arguments without `=` carry an
    /// empty value.
    pub args: Vec<(String, String)>,
}

/// Parse the processing field into an optional record limit and the ordered
/// step list. An empty or `Not Specified` field parses to no steps.
pub fn parse_processing(field: &str) -> Result<(Option<String>, Vec<RawStep>)> {
    let field = field.trim();
    let mut reclim = None;
    let mut steps = Vec::new();

    if field.is_empty() || field.eq_ignore_ascii_case("not specified") {
        return Ok((None, steps));
    }

    for chunk in field.split('|') {
        let chunk = chunk.trim();
        if chunk.is_empty() {
            // doubled separators appear in legacy rows
            continue;
        }

        let mut fields = chunk.split(',').map(str::trim);
        let name = fields.next().unwrap_or("");
        if name.is_empty() {
            return Err(ExportError::BadRequest(format!(
                "processing step without a name in '{field}'"
            )));
        }

        // the legacy record-limit directive rides along as a pseudo-step
        if let Some(limit) = name.strip_prefix("n=").or_else(|| name.strip_prefix("N=")) {
            if steps.is_empty() && reclim.is_none() {
                reclim = Some(limit.trim().to_owned());
                continue;
            }
            return Err(ExportError::BadRequest(
                "record-limit directive must come first".into(),
            ));
        }

        let mut args = Vec::new();
        for f in fields {
            if f.is_empty() {
                continue;
            }
            match f.split_once('=') {
                Some((k, v)) => args.push((k.trim().to_owned(), v.trim().to_owned())),
                None => args.push((f.to_owned(), String::new())),
            }
        }

        steps.push(RawStep {
            name: name.to_owned(),
            args,
        });
    }

    Ok((reclim, steps))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        for status in [
            RequestStatus::Done,
            RequestStatus::Queued,
            RequestStatus::New,
            RequestStatus::Failed,
            RequestStatus::DevNew,
        ] {
            assert_eq!(RequestStatus::from_code(status.code()).unwrap(), status);
        }
        assert!(RequestStatus::from_code(3).is_err());
    }

    #[test]
    fn protocol_field_with_cparms() {
        let pf = ProtocolField::parse("fits,rice,none,gzip1").unwrap();
        assert_eq!(pf.protocol, "fits");
        assert_eq!(pf.cparms.len(), 3);
        assert_eq!(pf.compression_for(0), Some(Compression::Rice));
        assert_eq!(pf.compression_for(1), None);
        assert_eq!(pf.compression_for(2), Some(Compression::Gzip1));
        // extension by repetition
        assert_eq!(pf.compression_for(7), Some(Compression::Gzip1));

        let bare = ProtocolField::parse("fits").unwrap();
        assert!(bare.cparms.is_empty());
        assert_eq!(bare.compression_for(0), None);
    }

    #[test]
    fn processing_with_reclim_and_steps() {
        let (reclim, steps) =
            parse_processing("n=32|resize,scale=0.5,method=bilinear|im_patch,t_start=x").unwrap();
        assert_eq!(reclim.as_deref(), Some("32"));
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].name, "resize");
        assert_eq!(
            steps[0].args,
            vec![
                ("scale".to_owned(), "0.5".to_owned()),
                ("method".to_owned(), "bilinear".to_owned())
            ]
        );
        assert_eq!(steps[1].name, "im_patch");
    }

    #[test]
    fn empty_processing_is_no_steps() {
        assert_eq!(parse_processing("").unwrap(), (None, vec![]));
        assert_eq!(parse_processing("Not Specified").unwrap(), (None, vec![]));
    }

    #[test]
    fn misplaced_reclim_is_rejected() {
        assert!(parse_processing("resize|n=5").is_err());
    }
}
