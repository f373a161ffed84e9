//! Contracts for the SQL catalog, plus an in-memory implementation.
//!
//! The real catalog is an external collaborator; the scheduler only needs
//! the handful of queries modeled by the `Catalog` trait. `MemCatalog`
//! backs the tests and any embedded use with plain maps; its rows can be
//! loaded from JSON fixtures through serde.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::error::{ExportError, Result};
use crate::request::{RequestRow, RequestStatus};

/// How a processing step derives its output series name from its input
/// series name. Parsed from the catalog's `out` column: `_X` appends a
/// suffix, `s/$/X/` is the same thing spelled as a substitution, `s/A/B/`
/// substitutes text, anything else replaces the series outright, and an
/// empty column leaves the series unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputRule {
    None,
    Suffix(String),
    Replacement(String),
    Substitution(String, String),
}

impl OutputRule {
    pub fn parse(column: &str) -> Result<OutputRule> {
        let column = column.trim();

        if column.is_empty() {
            return Ok(OutputRule::None);
        }

        if let Some(suffix) = column.strip_prefix('_') {
            if suffix.is_empty() {
                return Err(ExportError::BadRequest(
                    "empty suffix in output rule".into(),
                ));
            }
            return Ok(OutputRule::Suffix(suffix.to_owned()));
        }

        if let Some(body) = column.strip_prefix("s/") {
            let mut parts = body.split('/');
            let from = parts.next().unwrap_or("");
            let to = parts.next();
            match (from, to) {
                ("", _) | (_, None) => {
                    return Err(ExportError::BadRequest(format!(
                        "malformed substitution pattern '{column}'"
                    )))
                }
                ("$", Some(suffix)) => return Ok(OutputRule::Suffix(suffix.to_owned())),
                (from, Some(to)) => {
                    return Ok(OutputRule::Substitution(from.to_owned(), to.to_owned()))
                }
            }
        }

        Ok(OutputRule::Replacement(column.to_owned()))
    }
}

/// A processing-step declaration from the processing catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcStepInfo {
    pub name: String,
    /// Path of the program the run script invokes; empty for steps that
    /// never touch image data.
    pub path: String,
    #[serde(default)]
    pub required: Vec<String>,
    /// Optional arguments with their catalog defaults (`None` = omit when
    /// unbound).
    #[serde(default)]
    pub optional: Vec<(String, Option<String>)>,
    /// Argument-name translation applied when emitting the command line.
    #[serde(default)]
    pub name_map: HashMap<String, String>,
    /// The raw `out` column; parse with [`OutputRule::parse`].
    #[serde(default)]
    pub out: String,
}

impl ProcStepInfo {
    pub fn output_rule(&self) -> Result<OutputRule> {
        OutputRule::parse(&self.out)
    }
}

/// The catalog queries the export core needs. Implementations map these
/// onto the SQL store; failures that should be retried surface as
/// `CatalogUnavailable`.
pub trait Catalog {
    fn series_exists(&self, series: &str) -> Result<bool>;

    fn prime_key_count(&self, series: &str) -> Result<usize>;

    fn key_exists(&self, series: &str, key: &str) -> Result<bool>;

    /// Materialize a record-set specification into recnums.
    fn resolve_recnums(&self, spec: &str) -> Result<Vec<i64>>;

    fn processing_step(&self, name: &str) -> Result<Option<ProcStepInfo>>;

    /// Queue rows awaiting the scheduler: status `New`, or `DevNew` when
    /// the dev flag is up.
    fn fetch_queued(&self, dev: bool) -> Result<Vec<RequestRow>>;

    /// Clone a queue row into the durable export table.
    fn clone_to_export(&self, row: &RequestRow) -> Result<()>;

    /// Stamp a request's status (and optionally an error message) in both
    /// the queue and export tables.
    fn update_status(
        &self,
        request_id: &str,
        status: RequestStatus,
        message: Option<&str>,
    ) -> Result<()>;

    /// The requestor's notification address, if registered.
    fn notify_address(&self, user_id: i64) -> Result<Option<String>>;

    /// Release the user's pending-requests row, re-enabling submissions.
    fn release_pending(&self, address: &str) -> Result<()>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SeriesMeta {
    pub prime_keys: Vec<String>,
    #[serde(default)]
    pub keywords: HashSet<String>,
}

#[derive(Debug, Default)]
struct MemState {
    series: HashMap<String, SeriesMeta>,
    recnums: HashMap<String, Vec<i64>>,
    steps: HashMap<String, ProcStepInfo>,
    requests: HashMap<String, RequestRow>,
    exports: HashMap<String, RequestRow>,
    notify: HashMap<i64, String>,
    pending: HashSet<String>,
}

/// In-memory catalog for tests and embedded use.
#[derive(Debug, Default)]
pub struct MemCatalog {
    state: RefCell<MemState>,
}

impl MemCatalog {
    pub fn new() -> MemCatalog {
        MemCatalog::default()
    }

    pub fn add_series(&self, name: &str, meta: SeriesMeta) {
        self.state
            .borrow_mut()
            .series
            .insert(name.to_ascii_lowercase(), meta);
    }

    pub fn add_recnums(&self, spec: &str, recnums: Vec<i64>) {
        self.state.borrow_mut().recnums.insert(spec.to_owned(), recnums);
    }

    pub fn add_step(&self, step: ProcStepInfo) {
        self.state
            .borrow_mut()
            .steps
            .insert(step.name.to_ascii_lowercase(), step);
    }

    pub fn add_request(&self, row: RequestRow) {
        self.state
            .borrow_mut()
            .requests
            .insert(row.request_id.clone(), row);
    }

    pub fn add_notify(&self, user_id: i64, address: &str) {
        self.state.borrow_mut().notify.insert(user_id, address.to_owned());
    }

    pub fn mark_pending(&self, address: &str) {
        self.state.borrow_mut().pending.insert(address.to_owned());
    }

    pub fn is_pending(&self, address: &str) -> bool {
        self.state.borrow().pending.contains(address)
    }

    pub fn export_row(&self, request_id: &str) -> Option<RequestRow> {
        self.state.borrow().exports.get(request_id).cloned()
    }

    pub fn request_row(&self, request_id: &str) -> Option<RequestRow> {
        self.state.borrow().requests.get(request_id).cloned()
    }
}

impl Catalog for MemCatalog {
    fn series_exists(&self, series: &str) -> Result<bool> {
        Ok(self
            .state
            .borrow()
            .series
            .contains_key(&series.to_ascii_lowercase()))
    }

    fn prime_key_count(&self, series: &str) -> Result<usize> {
        self.state
            .borrow()
            .series
            .get(&series.to_ascii_lowercase())
            .map(|m| m.prime_keys.len())
            .ok_or_else(|| {
                ExportError::CatalogUnavailable(format!("no such series {series}"))
            })
    }

    fn key_exists(&self, series: &str, key: &str) -> Result<bool> {
        Ok(self
            .state
            .borrow()
            .series
            .get(&series.to_ascii_lowercase())
            .map(|m| {
                m.keywords
                    .iter()
                    .any(|k| k.eq_ignore_ascii_case(key))
                    || m.prime_keys.iter().any(|k| k.eq_ignore_ascii_case(key))
            })
            .unwrap_or(false))
    }

    fn resolve_recnums(&self, spec: &str) -> Result<Vec<i64>> {
        self.state
            .borrow()
            .recnums
            .get(spec)
            .cloned()
            .ok_or_else(|| {
                ExportError::BadRequest(format!("record-set {spec} matches no records"))
            })
    }

    fn processing_step(&self, name: &str) -> Result<Option<ProcStepInfo>> {
        Ok(self
            .state
            .borrow()
            .steps
            .get(&name.to_ascii_lowercase())
            .cloned())
    }

    fn fetch_queued(&self, dev: bool) -> Result<Vec<RequestRow>> {
        let want = if dev {
            RequestStatus::DevNew
        } else {
            RequestStatus::New
        };

        let mut rows: Vec<RequestRow> = self
            .state
            .borrow()
            .requests
            .values()
            .filter(|r| r.status == want.code())
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.request_id.cmp(&b.request_id));
        Ok(rows)
    }

    fn clone_to_export(&self, row: &RequestRow) -> Result<()> {
        self.state
            .borrow_mut()
            .exports
            .insert(row.request_id.clone(), row.clone());
        Ok(())
    }

    fn update_status(
        &self,
        request_id: &str,
        status: RequestStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        let state = &mut *state;

        for table in [&mut state.requests, &mut state.exports] {
            if let Some(row) = table.get_mut(request_id) {
                row.status = status.code();
                if let Some(msg) = message {
                    row.error_msg = Some(msg.to_owned());
                }
            }
        }

        Ok(())
    }

    fn notify_address(&self, user_id: i64) -> Result<Option<String>> {
        Ok(self.state.borrow().notify.get(&user_id).cloned())
    }

    fn release_pending(&self, address: &str) -> Result<()> {
        self.state.borrow_mut().pending.remove(address);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_rule_forms() {
        assert_eq!(OutputRule::parse("").unwrap(), OutputRule::None);
        assert_eq!(
            OutputRule::parse("_mod").unwrap(),
            OutputRule::Suffix("mod".into())
        );
        assert_eq!(
            OutputRule::parse("s/$/cutout/").unwrap(),
            OutputRule::Suffix("cutout".into())
        );
        assert_eq!(
            OutputRule::parse("s/720s/720s_mod/").unwrap(),
            OutputRule::Substitution("720s".into(), "720s_mod".into())
        );
        assert_eq!(
            OutputRule::parse("lab.scratch").unwrap(),
            OutputRule::Replacement("lab.scratch".into())
        );
        assert!(OutputRule::parse("s//x/").is_err());
    }

    #[test]
    fn mem_catalog_queue() {
        let cat = MemCatalog::new();
        cat.add_request(RequestRow {
            request_id: "X_001".into(),
            user_id: 1,
            spec: "s[a]".into(),
            processing: String::new(),
            protocol: "fits".into(),
            format: String::new(),
            filename_format: String::new(),
            method: "url".into(),
            size_mb: 0,
            status: RequestStatus::New.code(),
            error_msg: None,
        });

        assert_eq!(cat.fetch_queued(false).unwrap().len(), 1);
        assert!(cat.fetch_queued(true).unwrap().is_empty());

        cat.update_status("X_001", RequestStatus::Failed, Some("boom"))
            .unwrap();
        let row = cat.request_row("X_001").unwrap();
        assert_eq!(row.status, 4);
        assert_eq!(row.error_msg.as_deref(), Some("boom"));
    }
}
