//! Subscriber setup and colored labels for `pd-tts-dump`.

use std::sync::OnceLock;

use owo_colors::{AnsiColors, OwoColorize};
use supports_color::Stream;
use tracing_subscriber::EnvFilter;

use crate::plan::Outcome;

static ANSI_ENABLED: OnceLock<bool> = OnceLock::new();

/// Installs the global `tracing` subscriber. `RUST_LOG` overrides the
/// default `info` filter.
pub fn init() -> Result<(), Box<dyn std::error::Error>> {
    let ansi = ansi_enabled();
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(ansi)
        .with_target(false)
        .compact()
        .try_init()
        .map_err(|err| std::io::Error::other(err.to_string()))?;
    Ok(())
}

/// Line prefixes printed by the dump tool.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Category {
    Plan,
    Code,
    Run,
}

pub fn category(category: Category) -> String {
    match category {
        Category::Plan => paint("PLAN", AnsiColors::BrightCyan, true),
        Category::Code => paint("CODE", AnsiColors::BrightGreen, true),
        Category::Run => paint("RUN", AnsiColors::BrightMagenta, true),
    }
}

pub fn outcome_label(outcome: Outcome) -> String {
    let color = match outcome {
        Outcome::Accept => AnsiColors::BrightGreen,
        Outcome::Reject => AnsiColors::BrightRed,
        Outcome::FallThroughToSlowPath => AnsiColors::BrightYellow,
    };
    paint(&outcome.to_string(), color, false)
}

/// `ok` when the stub agreed with the general routine.
pub fn verdict_label(agrees: bool) -> String {
    if agrees {
        paint("ok", AnsiColors::BrightGreen, false)
    } else {
        paint("MISMATCH", AnsiColors::BrightRed, true)
    }
}

fn paint(text: &str, color: AnsiColors, bold: bool) -> String {
    if !ansi_enabled() {
        return text.to_string();
    }
    let colored = text.color(color);
    if bold {
        colored.bold().to_string()
    } else {
        colored.to_string()
    }
}

fn ansi_enabled() -> bool {
    *ANSI_ENABLED.get_or_init(detect_ansi)
}

fn detect_ansi() -> bool {
    if std::env::var_os("NO_COLOR").is_some() {
        return false;
    }
    let console_vt = enable_virtual_terminal();
    std::env::var_os("FORCE_COLOR").is_some()
        || console_vt
        || supports_color::on_cached(Stream::Stdout).is_some()
}

/// Turns on escape sequence processing for the Windows console.
#[cfg(windows)]
fn enable_virtual_terminal() -> bool {
    use windows::Win32::System::Console::{
        ENABLE_VIRTUAL_TERMINAL_PROCESSING, GetConsoleMode, GetStdHandle, STD_OUTPUT_HANDLE,
        SetConsoleMode,
    };

    unsafe {
        let Ok(handle) = GetStdHandle(STD_OUTPUT_HANDLE) else {
            return false;
        };
        if handle.is_invalid() {
            return false;
        }
        let mut mode = Default::default();
        GetConsoleMode(handle, &mut mode).is_ok()
            && SetConsoleMode(handle, mode | ENABLE_VIRTUAL_TERMINAL_PROCESSING).is_ok()
    }
}

#[cfg(not(windows))]
fn enable_virtual_terminal() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_keep_their_text() {
        assert!(category(Category::Plan).contains("PLAN"));
        assert!(outcome_label(Outcome::Reject).contains(&Outcome::Reject.to_string()));
        assert!(verdict_label(false).contains("MISMATCH"));
        assert!(verdict_label(true).contains("ok"));
    }
}
