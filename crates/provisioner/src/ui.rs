//! Console output for the provision CLI.
//!
//! Human-readable rendering of plans, run reports, stage records and
//! verification results. Machine-readable output bypasses this module.

use std::collections::BTreeMap;

use colored::{ColoredString, Colorize};

use crate::report::{RunReport, StageOutcome};
use crate::stage::Stage;
use crate::state::{ExecutionRecord, StageStatus};
use crate::verify::{UnitOutcome, VerificationResult};

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a progress step with step number.
pub fn print_progress_step(current: usize, total: usize, message: &str) {
    println!(
        "{} {} {}",
        format!("[{current}/{total}]").bright_black(),
        "▶".cyan(),
        message.bold()
    );
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print an info message.
pub fn print_info(message: &str) {
    println!("{} {}", "ℹ".blue().bold(), message);
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

fn status_label(status: StageStatus) -> ColoredString {
    match status {
        StageStatus::Succeeded | StageStatus::Skipped => status.as_str().green(),
        StageStatus::Failed => status.as_str().red(),
        StageStatus::Running | StageStatus::Unknown => status.as_str().yellow(),
        StageStatus::Pending => status.as_str().bright_black(),
    }
}

/// Print the stages an install would run, in order.
pub fn print_plan(target: &str, stages: &[&Stage], force: bool) {
    print_section(&format!("Plan for {target}"));
    if stages.is_empty() {
        print_success("Nothing to do, every stage is up to date");
        return;
    }
    for (i, stage) in stages.iter().enumerate() {
        print_progress_step(i + 1, stages.len(), stage.label());
        if !stage.depends_on.is_empty() {
            println!("      {} {}", "after".bright_black(), stage.depends_on.join(", "));
        }
    }
    if force {
        print_info("--force: succeeded stages are re-run");
    }
}

/// Print every stage record of a target.
pub fn print_status(target: &str, records: &BTreeMap<String, ExecutionRecord>, order: &[&Stage]) {
    print_section(&format!("Status of {target}"));
    for stage in order {
        match records.get(&stage.id) {
            Some(record) => {
                println!(
                    "  {:<24} {:<10} {} {}",
                    stage.id,
                    status_label(record.status),
                    format!("attempts={}", record.attempts).bright_black(),
                    record.updated_at.format("%Y-%m-%d %H:%M:%S").to_string().bright_black()
                );
                if let Some(error) = &record.error {
                    println!("      {}", error.red());
                }
                if let Some(output) = &record.output {
                    println!("      {} {}", "log".bright_black(), output.display());
                }
            }
            None => println!("  {:<24} {}", stage.id, "absent".bright_black()),
        }
    }
}

/// Print an install or uninstall report.
pub fn print_report(report: &RunReport) {
    print_section(&format!("{} on {}", report.operation, report.target));
    for entry in &report.stages {
        let label = entry.outcome.label();
        let detail = match &entry.outcome {
            StageOutcome::Succeeded { attempts } | StageOutcome::Removed { attempts } => {
                format!("{attempts} attempt(s)")
            }
            StageOutcome::Failed { attempts, error, .. } => format!("{attempts} attempt(s): {error}"),
            StageOutcome::Blocked { by } => format!("by {by}"),
            StageOutcome::Skipped
            | StageOutcome::NotAttempted
            | StageOutcome::Cleared
            | StageOutcome::Absent => String::new(),
        };
        let mark = match &entry.outcome {
            StageOutcome::Failed { .. } => "✗".red().bold(),
            StageOutcome::Blocked { .. } | StageOutcome::NotAttempted => "•".yellow(),
            _ => "✓".green().bold(),
        };
        println!("  {mark} {:<24} {:<14} {}", entry.stage, label, detail.bright_black());
        if let StageOutcome::Failed {
            output: Some(path), ..
        } = &entry.outcome
        {
            println!("      {} {}", "log".bright_black(), path.display());
        }
    }
    println!();

    if report.aborted {
        print_warning("Run aborted; completed stages were kept");
    } else if report.is_success() {
        print_success(&format!(
            "{} complete ({} action(s) taken)",
            report.operation,
            report.actions_taken()
        ));
    } else {
        print_error(&format!(
            "{} failed: {} failed, {} blocked, {} not attempted",
            report.operation,
            report.failures().len(),
            report.blocked().len(),
            report.not_attempted().len()
        ));
    }
}

/// Print a verification result.
pub fn print_verification(result: &VerificationResult) {
    print_section(&format!("Verification {} ({})", result.job, result.run_id));
    for unit in &result.units {
        let outcome = match unit.outcome {
            UnitOutcome::Matched if unit.conflict.is_none() => unit.outcome.to_string().green(),
            UnitOutcome::Matched => "conflict".red(),
            UnitOutcome::Mismatched | UnitOutcome::Failed => unit.outcome.to_string().red(),
            UnitOutcome::TimedOut => unit.outcome.to_string().yellow(),
        };
        let devices = if unit.devices.is_empty() {
            "no device reported".to_string()
        } else {
            unit.devices.join(", ")
        };
        println!("  {:<32} {:<12} {}", unit.unit, outcome, devices.bright_black());
        if let Some(error) = &unit.error {
            println!("      {}", error.red());
        }
    }
    for conflict in &result.conflicts {
        print_warning(&format!(
            "{} and {} both reported {}",
            conflict.units.0, conflict.units.1, conflict.device
        ));
    }
    println!();

    if result.aborted {
        print_warning("Verification aborted; unfinished units reported as timed-out");
    } else if result.passed() {
        print_success(&format!("All {} unit(s) emitted '{}'", result.units.len(), result.marker));
    } else {
        print_error(&format!(
            "{} of {} unit(s) did not pass",
            result.failing().len(),
            result.units.len()
        ));
    }
}
