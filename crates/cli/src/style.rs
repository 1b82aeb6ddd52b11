//! Shared styling utilities for the CLI.

use console::Style;

use patchkeeper_core::PatchStatus;

/// Create a success-styled string (green with checkmark).
pub fn success(msg: &str) -> String {
    let style = Style::new().green();
    format!("{} {}", style.apply_to("✓"), msg)
}

/// Create an error-styled string (red with cross).
pub fn error(msg: &str) -> String {
    let style = Style::new().red();
    format!("{} {}", style.apply_to("✗"), msg)
}

/// Create a warning-styled string (yellow).
pub fn warn(msg: &str) -> String {
    let style = Style::new().yellow();
    format!("{} {}", style.apply_to("⚠"), msg)
}

/// Create a header-styled string (bold, white).
pub fn header(msg: &str) -> String {
    let style = Style::new().bold();
    style.apply_to(msg).to_string()
}

/// Create a dim-styled string.
pub fn dim(msg: &str) -> String {
    let style = Style::new().dim();
    style.apply_to(msg).to_string()
}

/// Colored patch status label.
pub fn status(status: PatchStatus) -> String {
    let style = match status {
        PatchStatus::Active => Style::new().green(),
        PatchStatus::Merged => Style::new().blue(),
        PatchStatus::Abandoned => Style::new().dim(),
    };
    style.apply_to(status.to_string()).to_string()
}

/// First 12 characters of an object id or resolution hash.
pub fn short(id: &str) -> &str {
    id.get(..12).unwrap_or(id)
}
