//! Starts an opencode backend, waits for it to announce its URL, then runs
//! the terminal client against it and tears both down together.
//!
//! Unix only: interrupts are delivered with `kill(2)`.

use std::env;
use std::io::{BufRead, BufReader, Read};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use regex::Regex;
use signal_hook::iterator::Signals;
use thiserror::Error;
use wait_timeout::ChildExt;

pub const BACKEND_ENV: &str = "OPENCODE_LAUNCHER_BACKEND";
pub const CLIENT_ENV: &str = "OPENCODE_LAUNCHER_CLIENT";
pub const STARTUP_TIMEOUT_ENV: &str = "OPENCODE_LAUNCHER_STARTUP_TIMEOUT_SEC";

/// Variables handed to the client, both set to the discovered URL.
pub const CLIENT_ENDPOINT_ENV: &str = "OPENCODE_VIEW_ENDPOINT";
pub const PROXY_TARGET_ENV: &str = "API_PROXY_TARGET";

pub const DEFAULT_BACKEND: &str = "opencode serve";
pub const DEFAULT_CLIENT: &str = "opencode-view";
pub const DEFAULT_STARTUP_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("{0} command is empty")]
    EmptyCommand(&'static str),

    #[error("invalid {key} value '{value}'")]
    InvalidSetting { key: &'static str, value: String },

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("backend exited before announcing its URL ({status})")]
    EarlyExit { status: String },

    #[error("backend did not announce a URL within {0:?}")]
    StartupTimeout(Duration),

    #[error("failed waiting for {what}: {source}")]
    Wait {
        what: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to install signal handlers: {0}")]
    Signals(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LauncherConfig {
    pub backend: Vec<String>,
    pub client: Vec<String>,
    pub startup_timeout: Duration,
    pub shutdown_grace: Duration,
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            backend: split_command(DEFAULT_BACKEND),
            client: split_command(DEFAULT_CLIENT),
            startup_timeout: DEFAULT_STARTUP_TIMEOUT,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl LauncherConfig {
    pub fn from_env() -> Result<Self, LaunchError> {
        let mut config = Self::default();
        if let Some(backend) = env_string_opt(BACKEND_ENV) {
            config.backend = split_command(&backend);
        }
        if let Some(client) = env_string_opt(CLIENT_ENV) {
            config.client = split_command(&client);
        }
        if let Some(raw) = env_string_opt(STARTUP_TIMEOUT_ENV) {
            let seconds = raw
                .parse::<u64>()
                .ok()
                .filter(|seconds| *seconds > 0)
                .ok_or(LaunchError::InvalidSetting {
                    key: STARTUP_TIMEOUT_ENV,
                    value: raw.clone(),
                })?;
            config.startup_timeout = Duration::from_secs(seconds);
        }
        Ok(config)
    }
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

pub fn split_command(raw: &str) -> Vec<String> {
    raw.split_whitespace().map(str::to_string).collect()
}

fn url_regex() -> &'static Regex {
    static CACHED: OnceLock<Regex> = OnceLock::new();
    CACHED.get_or_init(|| Regex::new(r"https?://\S+").expect("url regex must compile"))
}

/// First http(s) URL in a line of backend output.
pub fn extract_url(text: &str) -> Option<&str> {
    url_regex().find(text).map(|found| found.as_str())
}

fn command_for(argv: &[String], role: &'static str) -> Result<Command, LaunchError> {
    let (program, args) = argv.split_first().ok_or(LaunchError::EmptyCommand(role))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

fn spawn(mut command: Command, argv: &[String]) -> Result<Child, LaunchError> {
    command.spawn().map_err(|source| LaunchError::Spawn {
        program: argv.join(" "),
        source,
    })
}

fn forward_lines<R>(pipe: R, stream: &'static str, sender: Sender<String>) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        // Keep draining after the receiver is gone so the backend never blocks on a full pipe.
        for chunk in BufReader::new(pipe).split(b'\n') {
            let Ok(bytes) = chunk else { break };
            let line = String::from_utf8_lossy(&bytes).trim_end().to_string();
            tracing::debug!(stream, line = %line, "backend output");
            let _ = sender.send(line);
        }
    })
}

/// Send SIGINT to `pid`. Returns `false` when the process is already gone.
pub fn interrupt(pid: u32) -> bool {
    let Ok(pid) = libc::pid_t::try_from(pid) else {
        return false;
    };
    unsafe { libc::kill(pid, libc::SIGINT) == 0 }
}

/// Interrupt `child` and wait up to `grace` before killing it.
pub fn terminate(child: &mut Child, grace: Duration) -> Result<ExitStatus, LaunchError> {
    let wait_error = |source| LaunchError::Wait {
        what: "child shutdown",
        source,
    };
    if let Some(status) = child.try_wait().map_err(wait_error)? {
        return Ok(status);
    }

    interrupt(child.id());
    match child.wait_timeout(grace) {
        Ok(Some(status)) => Ok(status),
        Ok(None) => {
            tracing::warn!(pid = child.id(), ?grace, "child ignored interrupt; killing");
            let _ = child.kill();
            child.wait().map_err(wait_error)
        }
        Err(source) => {
            let _ = child.kill();
            Err(wait_error(source))
        }
    }
}

pub fn describe_status(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("exit code {code}"),
        (None, Some(signal)) => format!("signal {signal}"),
        (None, None) => "unknown status".to_string(),
    }
}

/// Shell-style exit code: the process code, or 128 + signal.
pub fn exit_code(status: ExitStatus) -> i32 {
    status
        .code()
        .unwrap_or_else(|| 128 + status.signal().unwrap_or(0))
}

/// A running backend whose URL has been discovered.
#[derive(Debug)]
pub struct Backend {
    child: Child,
    url: String,
}

impl Backend {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn stop(mut self, grace: Duration) -> Result<ExitStatus, LaunchError> {
        terminate(&mut self.child, grace)
    }
}

/// Spawn the backend and wait for the first URL on stdout or stderr.
pub fn start_backend(config: &LauncherConfig) -> Result<Backend, LaunchError> {
    let mut command = command_for(&config.backend, "backend")?;
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    let mut child = spawn(command, &config.backend)?;
    tracing::info!(pid = child.id(), command = %config.backend.join(" "), "backend started");

    let (sender, receiver) = mpsc::channel();
    if let Some(stdout) = child.stdout.take() {
        forward_lines(stdout, "stdout", sender.clone());
    }
    if let Some(stderr) = child.stderr.take() {
        forward_lines(stderr, "stderr", sender);
    }

    let deadline = Instant::now() + config.startup_timeout;
    loop {
        let now = Instant::now();
        if now >= deadline {
            let _ = terminate(&mut child, config.shutdown_grace);
            return Err(LaunchError::StartupTimeout(config.startup_timeout));
        }

        match receiver.recv_timeout(POLL_INTERVAL.min(deadline - now)) {
            Ok(line) => {
                if let Some(url) = extract_url(&line) {
                    return Ok(Backend {
                        child,
                        url: url.to_string(),
                    });
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                thread::sleep(POLL_INTERVAL.min(deadline - now));
            }
        }

        let exited = child.try_wait().map_err(|source| LaunchError::Wait {
            what: "backend",
            source,
        })?;
        if let Some(status) = exited {
            return Err(LaunchError::EarlyExit {
                status: describe_status(status),
            });
        }
    }
}

/// Spawn the client with its endpoint pointed at `url`, sharing our terminal.
pub fn start_client(config: &LauncherConfig, url: &str) -> Result<Child, LaunchError> {
    let mut command = command_for(&config.client, "client")?;
    command
        .env(CLIENT_ENDPOINT_ENV, url)
        .env(PROXY_TARGET_ENV, url);
    let child = spawn(command, &config.client)?;
    tracing::info!(pid = child.id(), url, "client started");
    Ok(child)
}

/// Wait for the client while forwarding SIGINT/SIGTERM to both children,
/// then stop the backend. Returns the client's exit code.
pub fn supervise(
    backend: Backend,
    mut client: Child,
    grace: Duration,
) -> Result<i32, LaunchError> {
    let mut signals =
        Signals::new([libc::SIGINT, libc::SIGTERM]).map_err(LaunchError::Signals)?;
    let handle = signals.handle();
    let interrupted = Arc::new(AtomicBool::new(false));

    let watcher = {
        let interrupted = Arc::clone(&interrupted);
        let client_pid = client.id();
        let backend_pid = backend.pid();
        thread::spawn(move || {
            for signal in signals.forever() {
                tracing::info!(signal, "forwarding interrupt");
                interrupted.store(true, Ordering::SeqCst);
                interrupt(client_pid);
                interrupt(backend_pid);
            }
        })
    };

    let mut interrupted_at: Option<Instant> = None;
    let mut killed = false;
    let waited = loop {
        match client.wait_timeout(POLL_INTERVAL) {
            Ok(Some(status)) => break Ok(status),
            Ok(None) => {}
            Err(source) => {
                let _ = client.kill();
                break Err(LaunchError::Wait {
                    what: "client",
                    source,
                });
            }
        }
        if interrupted.load(Ordering::SeqCst) && !killed {
            let since = *interrupted_at.get_or_insert_with(Instant::now);
            if since.elapsed() >= grace {
                tracing::warn!(pid = client.id(), "client ignored interrupt; killing");
                let _ = client.kill();
                killed = true;
            }
        }
    };

    handle.close();
    let _ = watcher.join();

    match backend.stop(grace) {
        Ok(status) => tracing::info!(status = %describe_status(status), "backend stopped"),
        Err(error) => tracing::warn!(%error, "backend did not stop cleanly"),
    }

    let status = waited?;
    tracing::info!(status = %describe_status(status), "client exited");
    Ok(exit_code(status))
}

/// Full launch sequence: backend, client, supervision.
pub fn run(config: &LauncherConfig) -> Result<i32, LaunchError> {
    let backend = start_backend(config)?;
    tracing::info!(url = backend.url(), "detected opencode API");

    let client = match start_client(config, backend.url()) {
        Ok(client) => client,
        Err(error) => {
            let _ = backend.stop(config.shutdown_grace);
            return Err(error);
        }
    };
    supervise(backend, client, config.shutdown_grace)
}
