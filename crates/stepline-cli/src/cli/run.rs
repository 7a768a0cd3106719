//! `start` and `stop` commands.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result, bail};
use console::style;
use stepline_core::controller::{request_stop, start_run};
use stepline_types::subject::{Subject, SubjectField};

use crate::state::AppState;

/// Parse a subject batch file into queue subjects.
///
/// The file is a JSON array of flat objects; insertion order of fields is
/// not significant. Fields named in `optional` may be empty, everything
/// else is required.
fn parse_subjects(content: &str, optional: &[String]) -> Result<Vec<Subject>> {
    let rows: Vec<BTreeMap<String, String>> =
        serde_json::from_str(content).context("subject file must be a JSON array of string maps")?;

    Ok(rows
        .into_iter()
        .map(|row| {
            let fields = row
                .into_iter()
                .map(|(name, value)| {
                    if optional.iter().any(|o| o == &name) {
                        SubjectField::new(name, value)
                    } else {
                        SubjectField::required(name, value)
                    }
                })
                .collect();
            Subject::new(fields)
        })
        .collect())
}

/// Validate and enqueue a subject batch, then arm the run flag.
pub async fn start(state: &AppState, path: &Path, optional: &[String], json: bool) -> Result<()> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    let subjects = parse_subjects(&content, optional)?;
    let count = subjects.len();

    if let Err(err) = start_run(state.store.clone(), &state.config, subjects).await {
        bail!("run rejected: {err}");
    }

    if json {
        println!("{}", serde_json::json!({ "started": true, "subjects": count }));
    } else {
        println!(
            "{} run started with {} subject(s)",
            style("✓").green().bold(),
            style(count).bold()
        );
    }
    Ok(())
}

/// Request a graceful stop.
pub async fn stop(state: &AppState, json: bool) -> Result<()> {
    request_stop(state.store.clone(), &state.config).await?;

    if json {
        println!("{}", serde_json::json!({ "stop_requested": true }));
    } else {
        println!(
            "{} stop requested; workers will halt at their next suspension point",
            style("✓").green().bold()
        );
    }
    Ok(())
}
