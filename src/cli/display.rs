//! Terminal output helpers: styled action messages, the report table, and
//! the in-place progress line.

use std::io::Write;

use comfy_table::{presets, Cell, Color, Table};
use crossterm::style::Stylize;

use crate::framework::check::report::{CheckSummary, TaskStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Info,
    Success,
    Error,
    Highlight,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub action: String,
    pub details: String,
}

impl Message {
    pub fn new(action: String, details: String) -> Self {
        Self { action, details }
    }
}

macro_rules! show_message {
    ($message_type:expr, $message:expr) => {
        $crate::cli::display::show_message_wrapper($message_type, $message)
    };
}

pub fn show_message_wrapper(message_type: MessageType, message: Message) {
    let action = format!("{:>12}", message.action);
    let styled = match message_type {
        MessageType::Info => action.cyan(),
        MessageType::Success => action.green(),
        MessageType::Error => action.red(),
        MessageType::Highlight => action.magenta().bold(),
    };
    println!("{} {}", styled, message.details);
}

fn status_cell(status: TaskStatus) -> Cell {
    let cell = Cell::new(status.to_string());
    match status {
        TaskStatus::Pass => cell.fg(Color::Green),
        TaskStatus::Warn => cell.fg(Color::Yellow),
        TaskStatus::Fail => cell.fg(Color::Red),
        TaskStatus::Skip => cell.fg(Color::DarkGrey),
    }
}

/// Render the finalized report as a table, one row per task.
pub fn show_report_table(summary: &CheckSummary) {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_BORDERS_ONLY)
        .set_header(vec!["Task", "Status", "Details"]);

    for entry in &summary.entries {
        table.add_row(vec![
            Cell::new(&entry.task_name),
            status_cell(entry.status),
            Cell::new(entry.messages.join("\n")),
        ]);
    }
    println!("{table}");

    let counts = &summary.counts;
    println!(
        "{} {} passed, {} warned, {} failed, {} skipped",
        format!("{:>12}", "Report").cyan(),
        counts.pass,
        counts.warn,
        counts.fail,
        counts.skip
    );
}

/// Overwrite the current line with run progress; drops to a fresh line once
/// every task is accounted for.
pub fn show_progress(done: usize, total: usize) {
    let mut stdout = std::io::stdout();
    let _ = crossterm::execute!(
        stdout,
        crossterm::cursor::MoveToColumn(0),
        crossterm::terminal::Clear(crossterm::terminal::ClearType::CurrentLine),
        crossterm::style::Print(format!("running diagnostics {done}/{total}")),
    );
    if done >= total {
        println!();
    }
    let _ = stdout.flush();
}
