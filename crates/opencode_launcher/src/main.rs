use std::process::ExitCode;

use opencode_launcher::{run, LauncherConfig};
use tracing_subscriber::EnvFilter;

const LOG_ENV: &str = "OPENCODE_LAUNCHER_LOG";

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_env(LOG_ENV).unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();

    let result = LauncherConfig::from_env().and_then(|config| run(&config));
    match result {
        Ok(code) => ExitCode::from(u8::try_from(code).unwrap_or(1)),
        Err(error) => {
            tracing::error!(%error, "failed to launch");
            eprintln!("[launcher] {error}");
            ExitCode::FAILURE
        }
    }
}
