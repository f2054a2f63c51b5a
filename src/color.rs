//! Styling for the latency report printed by `relaybench run`.
//!
//! ANSI codes are emitted only when stdout is a TTY and `NO_COLOR` is unset
//! (https://no-color.org/).

use std::io::IsTerminal;
use std::sync::OnceLock;

/// Width of the label column in report tables.
pub const LABEL_WIDTH: usize = 9;

static ENABLED: OnceLock<bool> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Style {
    Heading,
    Muted,
    Warning,
}

impl Style {
    fn sgr(self) -> &'static str {
        match self {
            Style::Heading => "1",
            Style::Muted => "2",
            Style::Warning => "33",
        }
    }
}

fn wanted(no_color: bool, tty: bool) -> bool {
    !no_color && tty
}

fn enabled() -> bool {
    *ENABLED.get_or_init(|| {
        wanted(std::env::var_os("NO_COLOR").is_some(), std::io::stdout().is_terminal())
    })
}

fn paint_if(on: bool, style: Style, s: &str) -> String {
    if on {
        format!("\x1b[{}m{}\x1b[0m", style.sgr(), s)
    } else {
        s.to_string()
    }
}

pub fn paint(style: Style, s: &str) -> String {
    paint_if(enabled(), style, s)
}

/// One `label  value` line of a report table, value in microseconds.
/// The label is padded before styling so escape codes never skew the column.
pub fn row(style: Option<Style>, label: &str, value_us: f64) -> String {
    let label = format!("{:<width$}", label, width = LABEL_WIDTH);
    let label = match style {
        Some(style) => paint(style, &label),
        None => label,
    };
    format!("  {}  {:>12.3}", label, value_us)
}
