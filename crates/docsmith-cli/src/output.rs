use std::io::Write;

use docsmith_core::ToolStatus;
use owo_colors::OwoColorize;

/// Whether to use colored output.
#[derive(Debug, Clone, Copy)]
pub struct ColorMode(pub bool);

impl ColorMode {
    pub fn enabled(&self) -> bool {
        self.0
    }
}

/// Print one line per probed tool. Returns how many are unavailable.
pub fn print_tool_statuses(
    w: &mut dyn Write,
    statuses: &[ToolStatus],
    color: ColorMode,
) -> std::io::Result<usize> {
    let mut missing = 0;
    for status in statuses {
        let (label, detail) = match &status.result {
            Ok(version) => ("ok", version.clone()),
            Err(e) => {
                missing += 1;
                ("missing", e.to_string())
            }
        };
        let label = format!("{label:<7}");
        if color.enabled() {
            let label = if status.result.is_ok() {
                label.green().to_string()
            } else {
                label.red().to_string()
            };
            writeln!(
                w,
                "{} {:<10} {} {}",
                label,
                status.tool.bold(),
                status.binary.display().dimmed(),
                detail
            )?;
        } else {
            writeln!(
                w,
                "{} {:<10} {} {}",
                label,
                status.tool,
                status.binary.display(),
                detail
            )?;
        }
    }
    Ok(missing)
}
