use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Creates a progress spinner with consistent styling.
///
/// When `visible` is false the spinner is hidden, so it does not fight with
/// log lines written to the same terminal.
pub fn create_spinner(visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let spinner = ProgressBar::new_spinner();
    if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} {msg}") {
        spinner.set_style(style.tick_chars("⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏"));
    }
    spinner.enable_steady_tick(Duration::from_millis(100));
    spinner
}
