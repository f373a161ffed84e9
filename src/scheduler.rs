//! The export request scheduler.
//!
//! Each pass claims queue rows, resolves every request's processing pipeline
//! into concrete program invocations with derived output record-sets, emits
//! the two-stage script pair into the request's staging directory, and
//! stamps the row `Queued`. One request's failure never propagates to the
//! others in the same pass; transient catalog failures leave the row in
//! `New` so the next pass retries it.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::{info, warn};

use crate::catalog::{Catalog, OutputRule, ProcStepInfo};
use crate::error::{ExportError, Result};
use crate::recset;
use crate::request::{parse_processing, ProtocolField, RawStep, RequestRow, RequestStatus};
use crate::scripts;
use crate::ExportConfig;

/// A processing step with everything resolved: program, bound argument
/// text, and the input/output record-sets it transforms.
#[derive(Debug, Clone)]
pub struct ResolvedStep {
    pub name: String,
    pub path: String,
    pub args: String,
    pub input: String,
    pub output: String,
    /// The step writes to a series that may not exist yet and must be
    /// cloned into existence by the run script.
    pub creates_output: bool,
}

/// The fully resolved shape of one request, ready for script emission.
#[derive(Debug, Clone)]
pub struct ResolvedRequest {
    pub row: RequestRow,
    pub notify: Option<String>,
    pub protocol: ProtocolField,
    pub reclim: String,
    pub steps: Vec<ResolvedStep>,
    /// The record-set the exporter itself consumes (the last step's output,
    /// or the original spec when there is no processing).
    pub dataset: String,
}

#[derive(Debug)]
pub struct PassOutcome {
    pub request_id: String,
    pub status: RequestStatus,
    pub message: Option<String>,
}

pub struct Scheduler<'a> {
    pub catalog: &'a dyn Catalog,
    pub config: &'a ExportConfig,
    /// Scheduler-internal variables available to argument binding.
    pub internal_vars: HashMap<String, String>,
    /// Captured shell variables, consulted after the internal ones.
    pub shell_vars: HashMap<String, String>,
    /// Look at dev rows (`DevNew`) instead of production rows.
    pub dev: bool,
}

impl<'a> Scheduler<'a> {
    pub fn new(catalog: &'a dyn Catalog, config: &'a ExportConfig) -> Scheduler<'a> {
        Scheduler {
            catalog,
            config,
            internal_vars: HashMap::new(),
            shell_vars: HashMap::new(),
            dev: false,
        }
    }

    /// One scheduler pass: claim every waiting row, emit its scripts under
    /// `staging_root/<request_id>/`, and stamp it `Queued`.
    pub fn run_pass(&self, staging_root: &Path) -> Result<Vec<PassOutcome>> {
        let rows = self.catalog.fetch_queued(self.dev)?;
        let mut outcomes = Vec::with_capacity(rows.len());

        for row in rows {
            let request_id = row.request_id.clone();
            let user_id = row.user_id;
            let staging_dir = staging_root.join(&request_id);

            match self.process_request(row, &staging_dir) {
                Ok(()) => {
                    info!(request_id = %request_id, "request queued");
                    outcomes.push(PassOutcome {
                        request_id,
                        status: RequestStatus::Queued,
                        message: None,
                    });
                }
                Err(err) if err.is_transient() => {
                    // leave the row in New; the next pass retries
                    warn!(request_id = %request_id, error = %err, "transient failure, will retry");
                    outcomes.push(PassOutcome {
                        request_id,
                        status: RequestStatus::New,
                        message: Some(err.to_string()),
                    });
                }
                Err(err) => {
                    let msg = err.to_string();
                    warn!(request_id = %request_id, error = %msg, "request failed");
                    if let Err(e) =
                        self.catalog
                            .update_status(&request_id, RequestStatus::Failed, Some(&msg))
                    {
                        warn!(request_id = %request_id, error = %e, "could not record failure");
                    }
                    self.release_pending_for(user_id);
                    outcomes.push(PassOutcome {
                        request_id,
                        status: RequestStatus::Failed,
                        message: Some(msg),
                    });
                }
            }
        }

        Ok(outcomes)
    }

    fn release_pending_for(&self, user_id: i64) {
        // failure must not leave the user blocked from retrying
        if let Ok(Some(addr)) = self.catalog.notify_address(user_id) {
            let _ = self.catalog.release_pending(&addr);
        }
    }

    fn process_request(&self, row: RequestRow, staging_dir: &Path) -> Result<()> {
        // Clone into the durable export table first; a failure here leaves
        // the queue row in New for the next pass.
        self.catalog.clone_to_export(&row).map_err(|e| {
            ExportError::CatalogUnavailable(format!("cannot clone request row: {e}"))
        })?;

        let resolved = self.resolve_request(row)?;

        fs::create_dir_all(staging_dir)?;
        self.emit_scripts(&resolved, staging_dir)?;

        self.catalog
            .update_status(&resolved.row.request_id, RequestStatus::Queued, None)?;
        Ok(())
    }

    /// Resolve a request row into its pipeline: record limit, processing
    /// steps with derived output specs, and the exporter's dataset.
    pub fn resolve_request(&self, row: RequestRow) -> Result<ResolvedRequest> {
        let protocol = ProtocolField::parse(&row.protocol)?;
        let notify = self.catalog.notify_address(row.user_id)?;

        let (reclim, raw_steps) = parse_processing(&row.processing)?;
        let reclim = reclim.unwrap_or_else(|| "0".to_owned());

        let mut dataset = row.spec.trim().to_owned();
        let mut steps: Vec<ResolvedStep> = Vec::new();

        if !raw_steps.is_empty() {
            dataset = self.normalize_dataset(&dataset)?;

            let mut ancestry: Vec<String> = Vec::new();
            let subs = recset::parse_spec(&dataset)?;
            ancestry.push(subs[0].series.clone());

            let mut input = dataset.clone();
            for raw in &raw_steps {
                let pinfo = self
                    .catalog
                    .processing_step(&raw.name)?
                    .ok_or_else(|| {
                        ExportError::BadRequest(format!("unknown processing step '{}'", raw.name))
                    })?;

                if pinfo.path.is_empty() {
                    // a declared no-op: it cannot modify data, so the
                    // record-set flows through unchanged
                    continue;
                }

                let rule = pinfo.output_rule()?;
                let (output, creates_output) =
                    self.derive_output(&input, &rule, &row.request_id, &ancestry)?;

                let out_series = recset::parse_spec(&output)?[0].series.clone();
                let args = self.bind_args(&pinfo, raw, &input, &out_series, &reclim)?;

                ancestry.insert(0, out_series);
                steps.push(ResolvedStep {
                    name: pinfo.name.clone(),
                    path: pinfo.path.clone(),
                    args,
                    input: input.clone(),
                    output: output.clone(),
                    creates_output,
                });

                input = output;
            }

            dataset = input;
        }

        Ok(ResolvedRequest {
            row,
            notify,
            protocol,
            reclim,
            steps,
            dataset,
        })
    }

    /// Processing applies to exactly one input series. A union over one
    /// series is materialized as a recnum list through the catalog and
    /// rewritten as `series[:#r1,#r2,…]`; a union over several series is
    /// rejected.
    fn normalize_dataset(&self, dataset: &str) -> Result<String> {
        let subs = recset::parse_spec(dataset)?;

        if subs.len() == 1 {
            return Ok(dataset.to_owned());
        }

        if !recset::single_series(&subs) {
            return Err(ExportError::BadRequest(
                "the export system does not support multiple input series with processing".into(),
            ));
        }

        let recnums = self.catalog.resolve_recnums(dataset)?;
        if recnums.is_empty() {
            return Err(ExportError::BadRequest(format!(
                "record-set {dataset} contains no records"
            )));
        }

        let list = recnums
            .iter()
            .map(|r| format!("#{r}"))
            .collect::<Vec<_>>()
            .join(",");
        let converted = format!("{}[:{}]", subs[0].series, list);

        // the rewrite must itself be a well-formed specification
        recset::parse_spec(&converted)?;
        Ok(converted)
    }

    /// Derive a step's output record-set from its input: apply the output
    /// rule to the series name, strip the input filters, and append one
    /// empty filter per prime-key constituent with the request id in the
    /// last position.
    fn derive_output(
        &self,
        input: &str,
        rule: &OutputRule,
        reqid: &str,
        ancestry: &[String],
    ) -> Result<(String, bool)> {
        let subs = recset::parse_spec(input)?;
        if subs.len() > 1 {
            // a multi-subset spec is resolved to recnums before any step
            // derivation; leave it untouched if one sneaks through
            return Ok((input.to_owned(), false));
        }

        let in_series = &subs[0].series;
        let (out_series, changed) = apply_output_rule(in_series, rule);

        let npkeys = self.pipeline_prime_keys(&out_series, ancestry)?;
        if npkeys < 1 {
            return Err(ExportError::BadRequest(format!(
                "cannot determine the prime keys of series {out_series}"
            )));
        }

        let mut filter = String::new();
        for _ in 0..npkeys - 1 {
            filter.push_str("[]");
        }
        filter.push('[');
        filter.push_str(reqid);
        filter.push(']');

        Ok((format!("{out_series}{filter}"), changed))
    }

    /// Prime-key count of the first existing series in the pipeline
    /// ancestry (the derived output first, then its inputs back to the
    /// original), plus one when that series lacks a RequestID component
    /// (the derived series will gain one).
    fn pipeline_prime_keys(&self, out_series: &str, ancestry: &[String]) -> Result<usize> {
        let mut candidates: Vec<&str> = vec![out_series];
        candidates.extend(ancestry.iter().map(|s| s.as_str()));

        for series in candidates {
            if self.catalog.series_exists(series)? {
                let mut n = self.catalog.prime_key_count(series)?;
                if !self.catalog.key_exists(series, "RequestID")? {
                    n += 1;
                }
                return Ok(n);
            }
        }

        Err(ExportError::BadRequest(format!(
            "no existing series found in the processing pipeline of {out_series}"
        )))
    }

    /// Bind a step's arguments. Each required argument is searched for in
    /// the step's literal arguments, then the scheduler's internal
    /// variables, then the captured shell variables; absence is an error.
    /// Optional arguments fall back to their catalog default and are
    /// omitted entirely when still unbound. `in`, `out`, and `reclim` are
    /// bound from the pipeline.
    fn bind_args(
        &self,
        pinfo: &ProcStepInfo,
        raw: &RawStep,
        input: &str,
        out_series: &str,
        reclim: &str,
    ) -> Result<String> {
        let lookup = |name: &str| -> Option<String> {
            match name {
                "in" => return Some(input.to_owned()),
                "out" => return Some(out_series.to_owned()),
                "reclim" => return Some(reclim.to_owned()),
                _ => {}
            }

            raw.args
                .iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(name))
                .map(|(_, v)| v.clone())
                .or_else(|| self.internal_vars.get(name).cloned())
                .or_else(|| self.shell_vars.get(name).cloned())
        };

        let emit_name = |name: &str| -> String {
            pinfo
                .name_map
                .get(name)
                .cloned()
                .unwrap_or_else(|| name.to_owned())
        };

        let mut parts: Vec<String> = Vec::new();

        for req in &pinfo.required {
            let value = lookup(req).ok_or_else(|| {
                ExportError::BadRequest(format!(
                    "required argument '{}' of step '{}' is unbound",
                    req, pinfo.name
                ))
            })?;
            parts.push(format!("{}={}", emit_name(req), shell_quote(&value)));
        }

        for (opt, default) in &pinfo.optional {
            let value = lookup(opt).or_else(|| default.clone());
            if let Some(v) = value {
                parts.push(format!("{}={}", emit_name(opt), shell_quote(&v)));
            }
        }

        Ok(parts.join(" "))
    }

    fn emit_scripts(&self, resolved: &ResolvedRequest, staging_dir: &Path) -> Result<()> {
        let reqid = &resolved.row.request_id;

        let qsub = scripts::qsub_script(
            self.config,
            reqid,
            staging_dir,
            resolved.notify.as_deref(),
            resolved.row.status,
        );
        write_script(&staging_dir.join(format!("{reqid}.qsub")), &qsub)?;

        let drmsrun = scripts::drmsrun_script(self.config, resolved);
        write_script(&staging_dir.join(format!("{reqid}.drmsrun")), &drmsrun)?;

        if !resolved.steps.is_empty() {
            let mut report = String::new();
            for step in &resolved.steps {
                report.push_str(&format!("\nProcessing-step applied: {}\n", step.name));
                report.push_str("  argument\t\tvalue\n");
                report.push_str("  --------\t\t-----\n");
                for piece in step.args.split_whitespace() {
                    match piece.split_once('=') {
                        Some((k, v)) => report.push_str(&format!("  {k}\t\t{v}\n")),
                        None => report.push_str(&format!("  {piece}\n")),
                    }
                }
            }
            fs::write(staging_dir.join("proc-steps.txt"), report)?;
        }

        Ok(())
    }
}

/// Apply an output rule to a series name; the boolean reports whether the
/// output differs from the input (and may therefore need creating).
pub fn apply_output_rule(series: &str, rule: &OutputRule) -> (String, bool) {
    match rule {
        OutputRule::None => (series.to_owned(), false),
        OutputRule::Suffix(suffix) => {
            let tail = format!("_{suffix}");
            if series.to_ascii_lowercase().ends_with(&tail.to_ascii_lowercase()) {
                (series.to_owned(), false)
            } else {
                (format!("{series}{tail}"), true)
            }
        }
        OutputRule::Replacement(replacement) => {
            if series.eq_ignore_ascii_case(replacement) {
                (series.to_owned(), false)
            } else {
                (replacement.clone(), true)
            }
        }
        OutputRule::Substitution(from, to) => {
            if from == to || !series.contains(from.as_str()) {
                (series.to_owned(), false)
            } else {
                (series.replace(from.as_str(), to), true)
            }
        }
    }
}

/// Quote a value for a shell command line when it needs it.
pub fn shell_quote(value: &str) -> String {
    let safe = value
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_-./:@#[]{},=+".contains(c));

    if safe && !value.is_empty() {
        value.to_owned()
    } else {
        format!("'{}'", value.replace('\'', r"'\''"))
    }
}

fn write_script(path: &Path, body: &str) -> Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(body.as_bytes())?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = file.metadata()?.permissions();
        perms.set_mode(0o555);
        fs::set_permissions(path, perms)?;
    }

    Ok(())
}
