#![allow(dead_code)]

use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use reconcile::{ActionKind, Address, ExecutionReport, Plan, ProgressSink, Value};
use std::collections::BTreeMap;

/// Print an info message
pub fn info(msg: &str) {
    println!("{} {}", "ℹ".blue(), msg);
}

/// Print a success message
pub fn success(msg: &str) {
    println!("{} {}", "✓".green(), msg);
}

/// Print a warning message
pub fn warn(msg: &str) {
    println!("{} {}", "⚠".yellow(), msg);
}

/// Print an error message
pub fn error(msg: &str) {
    eprintln!("{} {}", "✗".red(), msg);
}

/// Print a dim/muted message
pub fn dim(msg: &str) {
    println!("  {}", msg.dimmed());
}

/// Print a header/title
pub fn header(title: &str) {
    println!();
    println!("{}", title.bold());
    println!("{}", "─".repeat(title.len()).dimmed());
}

/// Print a key-value pair
pub fn kv(key: &str, value: &str) {
    println!("  {}: {}", key.dimmed(), value);
}

/// Colored one-character marker for an action kind
pub fn glyph(kind: ActionKind) -> String {
    match kind {
        ActionKind::Create => "+".green().to_string(),
        ActionKind::Update => "~".yellow().to_string(),
        ActionKind::Replace => "±".magenta().to_string(),
        ActionKind::Destroy => "-".red().to_string(),
        ActionKind::NoOp => " ".to_string(),
    }
}

/// Print the ordered action list and the change summary.
pub fn print_plan(plan: &Plan) {
    header("Plan");
    if !plan.has_changes() {
        success("No changes. Desired state matches recorded state.");
        return;
    }
    for action in &plan.actions {
        if action.kind.is_noop() {
            continue;
        }
        println!(
            "{} {} ({})",
            glyph(action.kind),
            action.addr.to_string().bold(),
            action.kind
        );
        for change in &action.changes {
            let before = change
                .before
                .as_ref()
                .map_or("(absent)".to_string(), Value::to_string);
            let after = change
                .after
                .as_ref()
                .map_or("(absent)".to_string(), Value::to_string);
            println!(
                "    {} {} -> {}",
                format!("{}:", change.attr).dimmed(),
                before,
                after
            );
        }
    }
    println!();
    println!("{}", plan.summary().to_string().bold());
}

/// Print what actually happened during apply.
pub fn print_report(report: &ExecutionReport) {
    println!();
    for (addr, kind) in &report.succeeded {
        success(&format!("{addr}: {kind} complete"));
    }
    for (addr, message) in &report.failed {
        error(&format!("{addr}: {message}"));
    }
    for (addr, cause) in &report.skipped {
        warn(&format!("{addr}: skipped because {cause} failed"));
    }
    if report.cancelled {
        warn("run cancelled; completed actions are recorded in state");
    }
}

/// Print output values.
pub fn print_outputs(outputs: &BTreeMap<String, Value>) {
    if outputs.is_empty() {
        return;
    }
    header("Outputs");
    for (name, value) in outputs {
        kv(name, &value.to_string());
    }
}

/// Progress bar over the plan's non-no-op actions.
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    pub fn new(total: u64) -> Self {
        let bar = ProgressBar::new(total);
        bar.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
                .expect("progress template is valid")
                .progress_chars("=>-"),
        );
        Self { bar }
    }

    pub fn finish(&self) {
        self.bar.finish_and_clear();
    }
}

impl ProgressSink for BarProgress {
    fn started(&self, addr: &Address, kind: ActionKind) {
        self.bar.set_message(format!("{kind} {addr}"));
    }

    fn succeeded(&self, _addr: &Address, _kind: ActionKind) {
        self.bar.inc(1);
    }

    fn failed(&self, _addr: &Address, _kind: ActionKind, _message: &str) {
        self.bar.inc(1);
    }

    fn skipped(&self, _addr: &Address, _cause: &Address) {
        self.bar.inc(1);
    }
}
