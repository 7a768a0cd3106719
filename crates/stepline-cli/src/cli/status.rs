//! `status` command: run checkpoint, counters, and queue depth.

use anyhow::Result;
use console::style;
use stepline_core::controller::load_status;

use crate::state::AppState;

/// Display the run status.
pub async fn status(state: &AppState, json: bool) -> Result<()> {
    let report = load_status(state.store.clone()).await?;

    if json {
        let status = serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "data_dir": state.data_dir.display().to_string(),
            "running": report.state.run_flag,
            "current_subject_id": report.state.current_subject_id,
            "current_step_id": report.state.current_step_id,
            "step_attempt_count": report.state.step_attempt_count,
            "halt_reason": report.state.halt_reason,
            "pending": report.pending,
            "stats": {
                "processed": report.state.stats.processed,
                "success": report.state.stats.success,
                "failed": report.state.stats.failed,
            },
        });
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    println!();
    println!(
        "  {} Stepline v{}",
        style("⚙").bold(),
        env!("CARGO_PKG_VERSION")
    );
    println!();

    println!("  {}", style("── Run ──").dim());
    if report.state.run_flag {
        println!("  State:    {}", style("running").green());
    } else if let Some(reason) = &report.state.halt_reason {
        println!("  State:    {}", style("halted").red().bold());
        println!("  Reason:   {reason}");
    } else {
        println!("  State:    {}", style("stopped").yellow());
    }
    if let Some(subject) = report.state.current_subject_id {
        println!("  Subject:  {subject}");
    }
    if let Some(step) = &report.state.current_step_id {
        println!(
            "  Step:     {} (attempt {})",
            style(step).bold(),
            report.state.step_attempt_count
        );
    }
    println!();

    println!("  {}", style("── Progress ──").dim());
    println!("  Pending:    {}", style(report.pending).bold());
    println!("  Processed:  {}", report.state.stats.processed);
    println!("  Succeeded:  {}", style(report.state.stats.success).green());
    if report.state.stats.failed > 0 {
        println!("  Failed:     {}", style(report.state.stats.failed).red());
    }
    println!();

    Ok(())
}
