//! `queue` command: list the subjects still in the queue.

use anyhow::Result;
use comfy_table::{Cell, Table, presets::UTF8_FULL_CONDENSED};
use console::style;
use stepline_core::queue::SubjectQueue;
use stepline_types::subject::SubjectOutcome;

use crate::state::AppState;

/// List all subjects in the persisted queue.
pub async fn list(state: &AppState, json: bool) -> Result<()> {
    let queue = SubjectQueue::new(state.store.clone());
    let subjects = queue.load_all().await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&subjects)?);
        return Ok(());
    }

    if subjects.is_empty() {
        println!("{}", style("queue is empty").dim());
        return Ok(());
    }

    let mut table = Table::new();
    table.load_preset(UTF8_FULL_CONDENSED);
    table.set_header(vec!["#", "Subject", "Fields", "Attempts", "Outcome"]);

    for (index, subject) in subjects.iter().enumerate() {
        let summary = subject
            .fields
            .iter()
            .take(3)
            .map(|f| format!("{}={}", f.name, f.value))
            .collect::<Vec<_>>()
            .join(", ");
        let outcome = match subject.outcome {
            SubjectOutcome::Pending => "pending",
            SubjectOutcome::Success => "success",
            SubjectOutcome::Failed => "failed",
        };
        table.add_row(vec![
            Cell::new(index),
            Cell::new(subject.id),
            Cell::new(summary),
            Cell::new(subject.attempt_count),
            Cell::new(outcome),
        ]);
    }

    println!("{table}");
    Ok(())
}
