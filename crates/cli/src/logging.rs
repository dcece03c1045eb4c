use std::fs::{self, OpenOptions};
use std::sync::Mutex;

use sparkfleet_core::config::LoggingSettings;
use tracing_subscriber::EnvFilter;

const OWN_CRATES: &[&str] = &["sparkfleet", "sparkfleet_core", "sparkfleet_lambda"];

/// Filter directives for the given settings level and `-v` count.
/// Verbosity only raises the level of this workspace's crates.
fn directives(level: &str, verbose: u8) -> String {
    let own_level = match verbose {
        0 => return level.to_string(),
        1 => "debug",
        _ => "trace",
    };
    let mut directives = vec![level.to_string()];
    directives.extend(OWN_CRATES.iter().map(|c| format!("{}={}", c, own_level)));
    directives.join(",")
}

/// Install the global subscriber. Returns whether log lines go to the terminal.
pub fn init(settings: &LoggingSettings, verbose: u8) -> Result<bool, Box<dyn std::error::Error>> {
    if !settings.enabled && verbose == 0 {
        return Ok(false);
    }

    // RUST_LOG wins over the settings file; -v wins over both.
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) if verbose == 0 => filter,
        _ => EnvFilter::try_new(directives(&settings.level, verbose))?,
    };

    match &settings.file {
        Some(path) => {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_target(true)
                .try_init()
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
            Ok(false)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_target(true)
                .try_init()
                .map_err(|e| -> Box<dyn std::error::Error> { e })?;
            Ok(true)
        }
    }
}
