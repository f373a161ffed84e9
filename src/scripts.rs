//! Shell-text emission for the two-stage request pipeline.
//!
//! The scheduler never executes anything itself: it writes a submission
//! wrapper (`<reqid>.qsub`) and a run script (`<reqid>.drmsrun`) into the
//! request's staging directory and leaves execution to the batch system.
//! The wrapper waits for the queue row's status commit, exports the database
//! environment, runs the run script under `drms_run`, waits for the export
//! row's commit (bounded), and mails the requestor. The run script acquires
//! the export row, executes each processing step, invokes the exporter,
//! builds the index, and finalizes the row.

use std::fmt::Write as _;
use std::path::Path;

use crate::error::{ExportError, Result};
use crate::scheduler::ResolvedRequest;
use crate::ExportConfig;

/// Iterations (one per second) the wrapper waits for the export row's
/// recnum to appear after the run script exits.
pub const COMMIT_WAIT_ITERATIONS: u32 = 20;

/// The submission wrapper.
///
/// `submit_code` is the status code the row carried when the scheduler
/// claimed it; the wrapper spins until the commit flipping it away lands.
pub fn qsub_script(
    config: &ExportConfig,
    reqid: &str,
    staging_dir: &Path,
    notify: Option<&str>,
    submit_code: i32,
) -> String {
    let mut s = String::new();
    let dir = staging_dir.display();

    let _ = writeln!(s, "#! /bin/csh -f");
    let _ = writeln!(s, "set echo");
    let _ = writeln!(s, "if (${{?JSOCROOT_EXPORT}}) then");
    let _ = writeln!(
        s,
        "  set path = ($JSOCROOT_EXPORT/bin/$JSOC_MACHINE $JSOCROOT_EXPORT/scripts $path)"
    );
    let _ = writeln!(s, "endif");

    // wait for the scheduler's own status update to commit
    let _ = writeln!(
        s,
        "while (`show_info JSOC_DBHOST={} -q 'jsoc.export_new[{}]' key=Status` == {})",
        config.db_host, reqid, submit_code
    );
    let _ = writeln!(s, "  echo waiting for status commit");
    let _ = writeln!(s, "  sleep 1");
    let _ = writeln!(s, "end");

    let _ = writeln!(s, "setenv JSOC_DBNAME {}", config.db_name);
    let _ = writeln!(s, "setenv JSOC_DBUSER {}", config.db_user);
    let _ = writeln!(s, "setenv JSOC_DBHOST {}", config.db_host);
    let _ = writeln!(s, "setenv JSOC_DBEXPORTHOST {}", config.db_host);

    let _ = writeln!(s, "drms_run {}/{}.drmsrun", dir, reqid);
    let _ = writeln!(s, "set DRMS_ERROR=$status");

    // wait, bounded, for the run script's final commit
    let _ = writeln!(s, "set WAITCOUNT = {COMMIT_WAIT_ITERATIONS}");
    let _ = writeln!(
        s,
        "while (`show_info JSOC_DBHOST={} -q key=Status 'jsoc.export[{}]'` == 1)",
        config.db_host, reqid
    );
    let _ = writeln!(s, "  echo waiting for run commit");
    let _ = writeln!(s, "  @ WAITCOUNT = $WAITCOUNT - 1");
    let _ = writeln!(s, "  if ($WAITCOUNT <= 0) then");
    let _ = writeln!(s, "    set DRMS_ERROR = -1");
    let _ = writeln!(s, "    break");
    let _ = writeln!(s, "  endif");
    let _ = writeln!(s, "  sleep 1");
    let _ = writeln!(s, "end");

    // addresses with quotes or whitespace are invalid anyway; disable
    let notify = notify
        .filter(|n| !n.chars().any(|c| c == '\'' || c == '"' || c.is_whitespace()))
        .unwrap_or("0");
    let _ = writeln!(s, "set Notify={notify}");

    let _ = writeln!(s, "if ($DRMS_ERROR) then");
    let _ = writeln!(s, "  # export failure");
    let _ = writeln!(
        s,
        "  set_info -C JSOC_DBHOST={} ds='jsoc.export[{}]' Status=4",
        config.db_host, reqid
    );
    let _ = writeln!(s, "  if (\"$Notify\" != 0) then");
    let _ = writeln!(s, "    mail -n -s 'export FAILED - {reqid}' \"$Notify\" <<!");
    let _ = writeln!(s, "Error status returned from the export session.");
    let _ = writeln!(s, "See log files at {dir}");
    let _ = writeln!(s, "!");
    let _ = writeln!(s, "  endif");
    let _ = writeln!(s, "else");
    let _ = writeln!(s, "  # export success");
    let _ = writeln!(s, "  if (\"$Notify\" != 0) then");
    let _ = writeln!(s, "    mail -n -s 'export complete - {reqid}' \"$Notify\" <<!");
    let _ = writeln!(s, "Export request {reqid} is complete.");
    let _ = writeln!(s, "Results at {dir}");
    let _ = writeln!(s, "!");
    let _ = writeln!(s, "  endif");
    let _ = writeln!(s, "  mv {dir}/{reqid}.runlog {dir}/done >& /dev/null");
    let _ = writeln!(s, "endif");

    // release the pending-requests row on both databases; a missing row is
    // a no-op (in-house identities never have one and may run many
    // requests at once)
    let _ = writeln!(
        s,
        "psql -h {} -U {} -c \"DELETE FROM jsoc.export_pending WHERE address = '$Notify'\" {}",
        config.db_host, config.db_user, config.db_name
    );

    s
}

/// The run script.
pub fn drmsrun_script(config: &ExportConfig, resolved: &ResolvedRequest) -> String {
    let reqid = &resolved.row.request_id;
    let mut s = String::new();

    let _ = writeln!(s, "#! /bin/csh -f");
    let _ = writeln!(s, "set echo");
    let _ = writeln!(s, "set histchars");

    // acquire the export record for update
    let _ = writeln!(
        s,
        "set_info_sock -C JSOC_DBHOST={} ds='jsoc.export[{}]' Status=1",
        config.db_host, reqid
    );
    error_check(&mut s);

    let _ = writeln!(
        s,
        "set REQDIR = `show_info_sock JSOC_DBHOST={} -q -p 'jsoc.export[{}]'`",
        config.db_host, reqid
    );
    error_check(&mut s);
    let _ = writeln!(s, "cd $REQDIR");
    error_check(&mut s);
    let _ = writeln!(s, "echo Node = $HOSTNAME");

    // processing steps, in pipeline order
    for step in &resolved.steps {
        if step.creates_output {
            // a no-op when the output series already exists
            let _ = writeln!(
                s,
                "jsoc_export_clone JSOC_DBHOST={} dsin='{}' dsout='{}'",
                config.db_main_host,
                step.input,
                series_of(&step.output)
            );
            error_check(&mut s);
        }

        let _ = writeln!(
            s,
            "{} {} JSOC_DBHOST={}",
            step.path, step.args, config.db_main_host
        );
        error_check(&mut s);
    }

    // the protocol exporter itself
    let _ = writeln!(
        s,
        "jsoc_export_as_fits JSOC_DBHOST={} reqid='{}' rsquery={} n={} path=$REQDIR ffmt='{}' method='{}' protocol='{}'",
        config.db_main_host,
        reqid,
        crate::scheduler::shell_quote(&resolved.dataset),
        resolved.reclim,
        resolved.row.filename_format,
        resolved.row.method,
        resolved.row.protocol,
    );
    error_check(&mut s);

    let _ = writeln!(s, "jsoc_export_make_index");
    error_check(&mut s);

    // the true payload size comes from the generated index
    let _ = writeln!(
        s,
        "set EXPSIZE = `extract_export_size index.json`"
    );
    error_check(&mut s);

    let _ = writeln!(
        s,
        "set_info_sock JSOC_DBHOST={} ds='jsoc.export[{}]' Status=0 ExpTime=`date +%Y.%m.%d_%H:%M:%S` Size=$EXPSIZE",
        config.db_host, reqid
    );
    error_check(&mut s);

    let _ = writeln!(s, "EXITPLACE:");
    let _ = writeln!(s, "exit $RUNSTAT");

    s
}

/// The batch-system submission line for a staged request. Emitted for the
/// operator (or an outer wrapper) to run; the scheduler itself never
/// executes it.
pub fn submit_command(config: &ExportConfig, reqid: &str, staging_dir: &Path) -> String {
    format!(
        "{} {}/{}.qsub",
        config.submit_cmd,
        staging_dir.display(),
        reqid
    )
}

fn error_check(s: &mut String) {
    let _ = writeln!(s, "set RUNSTAT = $status");
    let _ = writeln!(s, "if ($RUNSTAT) goto EXITPLACE");
}

fn series_of(spec: &str) -> &str {
    match spec.find('[') {
        Some(pos) => &spec[..pos],
        None => spec,
    }
}

/// Extract the integer `size` member (megabytes) from an export index
/// document, the number the run script writes back into the request row.
pub fn parse_index_size(json: &str) -> Result<i64> {
    let value: serde_json::Value = serde_json::from_str(json)
        .map_err(|e| ExportError::BadRequest(format!("malformed index.json: {e}")))?;

    match value.get("size") {
        Some(serde_json::Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f.round() as i64))
            .ok_or_else(|| ExportError::BadRequest("non-integer size in index.json".into())),
        Some(serde_json::Value::String(st)) => st
            .trim()
            .parse::<i64>()
            .map_err(|_| ExportError::BadRequest("non-integer size in index.json".into())),
        _ => Err(ExportError::BadRequest(
            "index.json carries no size member".into(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{RequestRow, RequestStatus};
    use crate::scheduler::{ResolvedStep, ResolvedRequest};
    use crate::request::ProtocolField;
    use std::path::PathBuf;

    fn config() -> ExportConfig {
        ExportConfig {
            db_host: "dbhost".into(),
            db_main_host: "dbmain".into(),
            db_name: "jsoc".into(),
            db_user: "production".into(),
            export_root: PathBuf::from("/opt/export"),
            submit_cmd: "qsub -q x.q".into(),
        }
    }

    fn resolved() -> ResolvedRequest {
        ResolvedRequest {
            row: RequestRow {
                request_id: "REQ_7".into(),
                user_id: 1,
                spec: "series.X[a]".into(),
                processing: "resize,scale=0.5".into(),
                protocol: "fits".into(),
                format: "json".into(),
                filename_format: "{seriesname}.{recnum:%lld}.{segment}".into(),
                method: "url".into(),
                size_mb: 0,
                status: RequestStatus::New.code(),
                error_msg: None,
            },
            notify: Some("user@example.org".into()),
            protocol: ProtocolField::parse("fits").unwrap(),
            reclim: "0".into(),
            steps: vec![ResolvedStep {
                name: "resize".into(),
                path: "/opt/bin/resize".into(),
                args: "in=series.X[a] out=series.X_mod scale=0.5".into(),
                input: "series.X[a]".into(),
                output: "series.X_mod[][REQ_7]".into(),
                creates_output: true,
            }],
            dataset: "series.X_mod[][REQ_7]".into(),
        }
    }

    #[test]
    fn qsub_polls_status_and_mails() {
        let cfg = config();
        let s = qsub_script(&cfg, "REQ_7", Path::new("/stage/REQ_7"), Some("user@example.org"), 2);

        assert!(s.starts_with("#! /bin/csh -f"));
        assert!(s.contains("jsoc.export_new[REQ_7]"));
        assert!(s.contains("== 2)"));
        assert!(s.contains("setenv JSOC_DBNAME jsoc"));
        assert!(s.contains("setenv JSOC_DBEXPORTHOST dbhost"));
        assert!(s.contains("drms_run /stage/REQ_7/REQ_7.drmsrun"));
        assert!(s.contains("set WAITCOUNT = 20"));
        assert!(s.contains("set Notify=user@example.org"));
        assert!(s.contains("Status=4"));
        assert!(s.contains("DELETE FROM jsoc.export_pending"));
    }

    #[test]
    fn qsub_disables_bad_notify_addresses() {
        let cfg = config();
        let s = qsub_script(&cfg, "REQ_7", Path::new("/stage"), Some("evil' addr"), 2);
        assert!(s.contains("set Notify=0"));
    }

    #[test]
    fn drmsrun_sequences_steps_then_exporter() {
        let cfg = config();
        let s = drmsrun_script(&cfg, &resolved());

        let clone_pos = s.find("jsoc_export_clone").unwrap();
        let step_pos = s.find("/opt/bin/resize").unwrap();
        let export_pos = s.find("jsoc_export_as_fits").unwrap();
        let index_pos = s.find("jsoc_export_make_index").unwrap();
        let final_pos = s.find("Status=0").unwrap();

        assert!(clone_pos < step_pos);
        assert!(step_pos < export_pos);
        assert!(export_pos < index_pos);
        assert!(index_pos < final_pos);
        assert!(s.contains("set_info_sock -C JSOC_DBHOST=dbhost ds='jsoc.export[REQ_7]' Status=1"));
        assert!(s.contains("rsquery=series.X_mod[][REQ_7]"));
    }

    #[test]
    fn submit_line_uses_configured_command() {
        let cfg = config();
        assert_eq!(
            submit_command(&cfg, "REQ_7", Path::new("/stage/REQ_7")),
            "qsub -q x.q /stage/REQ_7/REQ_7.qsub"
        );
    }

    #[test]
    fn index_size_extraction() {
        assert_eq!(parse_index_size(r#"{"size": 345}"#).unwrap(), 345);
        assert_eq!(parse_index_size(r#"{"size": "12"}"#).unwrap(), 12);
        assert!(parse_index_size(r#"{"count": 1}"#).is_err());
        assert!(parse_index_size("not json").is_err());
    }
}
