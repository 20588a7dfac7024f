//! Renders violation rows as a text grid.
//!
//! ```text
//! +------------+--------+
//! | account_id | amount |
//! +------------+--------+
//! | 42         | -5     |
//! +------------+--------+
//! ```
//!
//! Column widths are measured in terminal cells, so wide CJK text and emoji
//! keep the borders aligned. A result with duplicate column names is refused
//! outright: the grid would be ambiguous to whoever reads the report.

use crate::error::SdicError;
use crate::models::{ConstraintFile, ScalarValue, ViolationResult};
use crate::Result;
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::time::Duration;
use unicode_width::UnicodeWidthStr;

/// A formatted violation report, ready for a sink.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderedReport {
    /// The full grid, lines separated by `\n`, no trailing newline
    pub grid: String,
    /// Number of violating rows
    pub row_count: usize,
    /// Query execution time
    pub elapsed: Duration,
}

/// Formats a result set.
///
/// Returns `Ok(None)` when the constraint passed (no rows).
///
/// # Errors
/// Returns [`SdicError::Formatting`] naming every column that appears more
/// than once (case-sensitive).
pub fn format(constraint: &ConstraintFile, result: ViolationResult) -> Result<Option<RenderedReport>> {
    if !result.is_violation() {
        return Ok(None);
    }

    let duplicates = duplicate_columns(result.column_names());
    if !duplicates.is_empty() {
        return Err(SdicError::Formatting {
            server: constraint.server_name.clone(),
            constraint: constraint.relative_path.clone(),
            duplicates,
        });
    }

    Ok(Some(RenderedReport {
        grid: render_grid(result.column_names(), result.rows()),
        row_count: result.row_count(),
        elapsed: result.elapsed(),
    }))
}

/// Names occurring more than once, in order of first repetition.
pub fn duplicate_columns(columns: &[String]) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut duplicates: Vec<String> = Vec::new();
    for name in columns {
        if !seen.insert(name.as_str()) && !duplicates.contains(name) {
            duplicates.push(name.clone());
        }
    }
    duplicates
}

/// Display form of one cell: single line, `NULL` for nulls.
pub fn display_cell(value: &ScalarValue) -> String {
    escape_control(&value.to_string())
}

fn escape_control(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                let _ = write!(out, "\\u{{{:x}}}", u32::from(c));
            }
            c => out.push(c),
        }
    }
    out
}

fn render_grid(columns: &[String], rows: &[Vec<ScalarValue>]) -> String {
    let header: Vec<String> = columns.iter().map(|c| escape_control(c)).collect();
    let body: Vec<Vec<String>> = rows
        .iter()
        .map(|row| {
            // Pad short rows so every header gets a cell
            (0..columns.len())
                .map(|idx| row.get(idx).map_or_else(String::new, display_cell))
                .collect()
        })
        .collect();

    let mut widths: Vec<usize> = header.iter().map(|h| h.width()).collect();
    for row in &body {
        for (width, cell) in widths.iter_mut().zip(row) {
            *width = (*width).max(cell.width());
        }
    }

    let rule = {
        let mut line = String::from("+");
        for width in &widths {
            line.push_str(&"-".repeat(width + 2));
            line.push('+');
        }
        line
    };

    let mut lines = Vec::with_capacity(body.len() + 4);
    lines.push(rule.clone());
    lines.push(render_line(&header, &widths));
    lines.push(rule.clone());
    lines.extend(body.iter().map(|row| render_line(row, &widths)));
    lines.push(rule);
    lines.join("\n")
}

fn render_line(cells: &[String], widths: &[usize]) -> String {
    let mut line = String::from("|");
    for (cell, width) in cells.iter().zip(widths) {
        line.push(' ');
        line.push_str(cell);
        line.push_str(&" ".repeat(width.saturating_sub(cell.width())));
        line.push_str(" |");
    }
    line
}
