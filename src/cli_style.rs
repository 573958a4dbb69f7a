/*!
 * Freight CLI Style System
 *
 * Styling helpers for terminal output: themed text, plan and summary
 * tables, byte and duration formatting.
 */

use comfy_table::{presets, Attribute, Cell, Color, ContentArrangement, Table};
use console::{measure_text_width, style, StyledObject};

use crate::core::scheduler::RunPlan;
use crate::core::types::{Outcome, RunReport, SizeClass};

// ============================================================================
// THEME COLORS
// ============================================================================

/// Brand colors for consistent styling
pub struct Theme;

impl Theme {
    pub fn primary<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan()
    }

    pub fn success<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).green()
    }

    pub fn warning<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).yellow()
    }

    pub fn error<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).red()
    }

    pub fn muted<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).dim()
    }

    /// Header style (bold cyan)
    pub fn header<D: std::fmt::Display>(text: D) -> StyledObject<D> {
        style(text).cyan().bold()
    }
}

/// Status glyphs
pub struct Icons;

impl Icons {
    pub const SUCCESS: &'static str = "✓";
    pub const ERROR: &'static str = "✗";
    pub const WARNING: &'static str = "⚠";
    pub const INFO: &'static str = "ℹ";
    pub const CANCELLED: &'static str = "○";
    pub const ARROW_RIGHT: &'static str = "→";
}

// ============================================================================
// SECTIONS
// ============================================================================

/// Draw a section header with a trailing rule
pub fn section_header(title: &str) {
    let line_len = 50usize.saturating_sub(measure_text_width(title).min(40));
    println!(
        "\n{} {}",
        Theme::header(title),
        Theme::muted("─".repeat(line_len))
    );
}

// ============================================================================
// TABLES
// ============================================================================

pub fn create_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Table without outer borders
pub fn create_minimal_table() -> Table {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_NO_BORDERS)
        .set_content_arrangement(ContentArrangement::Dynamic);
    table
}

/// Key/value table
pub fn stats_table(items: &[(&str, String)]) -> Table {
    let mut table = create_minimal_table();

    for (key, value) in items {
        table.add_row(vec![
            Cell::new(key).fg(Color::Cyan),
            Cell::new(value)
                .fg(Color::White)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table
}

fn header_cell(text: &str) -> Cell {
    Cell::new(text)
        .fg(Color::Cyan)
        .add_attribute(Attribute::Bold)
}

/// Lane assignment for a planned run
pub fn plan_table(plan: &RunPlan, threshold: u64) -> Table {
    let mut table = create_table();
    table.set_header(vec![
        header_cell("Destination"),
        header_cell("Size"),
        header_cell("Lane"),
        header_cell("Chunks"),
    ]);

    let lanes = plan
        .small
        .iter()
        .map(|f| (f, SizeClass::Small))
        .chain(plan.large.iter().map(|f| (f, SizeClass::Large)));

    for (file, class) in lanes {
        let lane = match class {
            SizeClass::Small => Cell::new(class).fg(Color::Green),
            SizeClass::Large => Cell::new(class).fg(Color::Magenta),
        };
        table.add_row(vec![
            Cell::new(file.dest_key()),
            Cell::new(format_bytes(file.size())),
            lane,
            Cell::new(plan.chunk_plan.total_chunks(file.size())),
        ]);
    }

    table.add_row(vec![
        Cell::new(format!(
            "chunk {} ({}), threshold {}",
            format_bytes(plan.chunk_plan.chunk_size),
            plan.chunk_plan.source,
            format_bytes(threshold)
        ))
        .fg(Color::DarkGrey),
        Cell::new(format_bytes(plan.bytes_total)).add_attribute(Attribute::Bold),
        Cell::new(format!("{} small / {} large", plan.small.len(), plan.large.len())),
        Cell::new(""),
    ]);

    table
}

/// Aggregate numbers for a finished run
pub fn run_summary_table(report: &RunReport) -> Table {
    let summary = report.summary();
    let mut table = create_table();
    table.set_header(vec![header_cell("Transfer Summary"), Cell::new("")]);

    table.add_row(vec![
        Cell::new("Files Succeeded"),
        Cell::new(summary.succeeded)
            .fg(Color::Green)
            .add_attribute(Attribute::Bold),
    ]);

    if summary.failed > 0 {
        table.add_row(vec![
            Cell::new("Files Failed"),
            Cell::new(summary.failed)
                .fg(Color::Red)
                .add_attribute(Attribute::Bold),
        ]);
    }

    if summary.cancelled > 0 {
        table.add_row(vec![
            Cell::new("Files Cancelled"),
            Cell::new(summary.cancelled).fg(Color::Yellow),
        ]);
    }

    if summary.retries > 0 {
        table.add_row(vec![
            Cell::new("Retries"),
            Cell::new(summary.retries).fg(Color::Yellow),
        ]);
    }

    table.add_row(vec![
        Cell::new("Transferred"),
        Cell::new(format!(
            "{} of {}",
            format_bytes(summary.bytes_transferred),
            format_bytes(report.bytes_total)
        ))
        .add_attribute(Attribute::Bold),
    ]);

    let secs = report.elapsed.as_secs_f64();
    table.add_row(vec![
        Cell::new("Duration"),
        Cell::new(format_duration(secs)),
    ]);

    if secs > 0.0 {
        let rate = (summary.bytes_transferred as f64 / secs) as u64;
        table.add_row(vec![
            Cell::new("Speed"),
            Cell::new(format!("{}/s", format_bytes(rate)))
                .fg(Color::Cyan)
                .add_attribute(Attribute::Bold),
        ]);
    }

    table.add_row(vec![
        Cell::new("Chunk Size"),
        Cell::new(format!(
            "{} ({})",
            format_bytes(report.chunk_plan.chunk_size),
            report.chunk_plan.source
        ))
        .fg(Color::DarkGrey),
    ]);

    table
}

/// One row per file that did not succeed
pub fn failure_table(report: &RunReport) -> Option<Table> {
    let mut rows = report
        .results
        .iter()
        .filter(|r| !r.outcome.is_success())
        .peekable();
    rows.peek()?;

    let mut table = create_table();
    table.set_header(vec![
        header_cell("Destination"),
        header_cell("Status"),
        header_cell("Attempts"),
        header_cell("Reason"),
    ]);

    for result in rows {
        let (status, reason) = match &result.outcome {
            Outcome::PermanentFailure { kind, reason } => (
                Cell::new(format!("{} {}", Icons::ERROR, kind)).fg(Color::Red),
                reason.as_str(),
            ),
            Outcome::Cancelled => (
                Cell::new(format!("{} cancelled", Icons::CANCELLED)).fg(Color::Yellow),
                "",
            ),
            Outcome::Success => continue,
        };
        table.add_row(vec![
            Cell::new(&result.dest_key),
            status,
            Cell::new(result.attempts),
            Cell::new(reason).fg(Color::DarkGrey),
        ]);
    }

    Some(table)
}

// ============================================================================
// FORMATTING
// ============================================================================

/// Format bytes into human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let base = 1024.0_f64;
    let exp = (bytes_f.ln() / base.ln()).floor() as usize;
    let exp = exp.min(UNITS.len() - 1);

    let value = bytes_f / base.powi(exp as i32);

    if exp == 0 {
        format!("{} {}", bytes, UNITS[exp])
    } else {
        format!("{:.2} {}", value, UNITS[exp])
    }
}

/// Format duration into human-readable string
pub fn format_duration(secs: f64) -> String {
    if secs < 1.0 {
        format!("{:.0}ms", secs * 1000.0)
    } else if secs < 60.0 {
        format!("{:.1}s", secs)
    } else if secs < 3600.0 {
        let mins = (secs / 60.0).floor();
        let remaining = secs % 60.0;
        format!("{}m {:.0}s", mins, remaining)
    } else {
        let hours = (secs / 3600.0).floor();
        let mins = ((secs % 3600.0) / 60.0).floor();
        format!("{}h {}m", hours, mins)
    }
}

// ============================================================================
// MESSAGES
// ============================================================================

/// Print a styled error message with optional suggestion
pub fn print_error(message: &str, suggestion: Option<&str>) {
    eprintln!(
        "\n{} {}",
        Theme::error(format!("{} Error:", Icons::ERROR)),
        message
    );

    if let Some(hint) = suggestion {
        eprintln!(
            "  {} {}",
            Theme::muted(Icons::ARROW_RIGHT),
            Theme::muted(hint)
        );
    }
    eprintln!();
}

pub fn print_warning(message: &str) {
    eprintln!(
        "{} {}",
        Theme::warning(Icons::WARNING),
        Theme::warning(message)
    );
}

pub fn print_success(message: &str) {
    println!(
        "{} {}",
        Theme::success(Icons::SUCCESS),
        Theme::success(message)
    );
}

pub fn print_info(message: &str) {
    println!("{} {}", Theme::primary(Icons::INFO), message);
}

/// One-line run verdict
pub fn print_run_verdict(report: &RunReport) {
    let summary = report.summary();
    let line = format!(
        "{} succeeded, {} failed, {} cancelled",
        summary.succeeded, summary.failed, summary.cancelled
    );
    if report.exit_code() == crate::error::EXIT_SUCCESS {
        print_success(&line);
    } else {
        print_warning(&line);
    }
}
