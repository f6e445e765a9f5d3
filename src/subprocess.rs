use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use crate::cancel::CancelScope;
use crate::env::RunnerEnv;
use crate::health::Terminate;

/// How often the exit waiter polls the child.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything needed to start one runner process.
#[derive(Debug, Clone)]
pub struct RunnerCommand {
    program: String,
    args: Vec<String>,
    workdir: Option<PathBuf>,
    env: Option<Vec<(String, String)>>,
}

impl RunnerCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            workdir: None,
            env: None,
        }
    }

    #[must_use]
    pub fn args<S: AsRef<str>>(mut self, args: &[S]) -> Self {
        self.args.extend(args.iter().map(|s| s.as_ref().to_string()));
        self
    }

    #[must_use]
    pub fn workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.workdir = Some(dir.into());
        self
    }

    /// Replace the inherited environment entirely with `env`.
    #[must_use]
    pub fn env(mut self, env: &RunnerEnv) -> Self {
        self.env = Some(
            env.iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Start the process with stdout/stderr forwarded to the log.
    pub fn spawn(&self) -> std::io::Result<RunnerProcess> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(env) = &self.env {
            cmd.env_clear()
                .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        }
        if let Some(dir) = &self.workdir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        let pid = child.id();

        if let Some(stdout) = child.stdout.take() {
            forward_lines(stdout, Stream::Stdout);
        }
        if let Some(stderr) = child.stderr.take() {
            forward_lines(stderr, Stream::Stderr);
        }

        tracing::info!(pid, program = %self.program, "runner process started");

        Ok(RunnerProcess {
            child: Arc::new(Mutex::new(child)),
            pid,
        })
    }
}

#[derive(Debug, Clone, Copy)]
enum Stream {
    Stdout,
    Stderr,
}

/// Relay each non-blank line of the runner's output into the log.
fn forward_lines<R: Read + Send + 'static>(reader: R, stream: Stream) {
    thread::spawn(move || relay(reader, stream));
}

/// Read until EOF so the runner never writes into a closed pipe. Lines that
/// are not UTF-8 are logged lossily.
fn relay<R: Read>(reader: R, stream: Stream) {
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(?stream, error = %e, "stopped reading runner output");
                return;
            }
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim_end_matches(['\n', '\r']);
        if line.trim().is_empty() {
            continue;
        }
        match stream {
            Stream::Stdout => tracing::debug!(target: "runner", "{line}"),
            Stream::Stderr => tracing::error!(target: "runner", "{line}"),
        }
    }
}

/// A running runner. The exit waiter and the health monitor's killer share
/// the underlying child through [`ProcessHandle`].
#[derive(Debug)]
pub struct RunnerProcess {
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl RunnerProcess {
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    pub fn handle(&self) -> ProcessHandle {
        ProcessHandle {
            child: Arc::clone(&self.child),
            pid: self.pid,
        }
    }

    /// Block until the process exits. Cancelling `scope` kills the process if
    /// it is still running.
    pub fn wait(&self, scope: &CancelScope) -> std::io::Result<ExitStatus> {
        let mut kill_sent = false;
        loop {
            {
                let mut child = lock(&self.child);
                if let Some(status) = child.try_wait()? {
                    return Ok(status);
                }
                if scope.is_cancelled() && !kill_sent {
                    tracing::debug!(pid = self.pid, "scope cancelled, killing runner process");
                    child.kill()?;
                    kill_sent = true;
                }
            }
            if kill_sent {
                thread::sleep(POLL_INTERVAL);
            } else {
                scope.wait_timeout(POLL_INTERVAL);
            }
        }
    }
}

fn lock(child: &Mutex<Child>) -> MutexGuard<'_, Child> {
    child.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shared handle used to terminate the runner from another thread.
#[derive(Debug, Clone)]
pub struct ProcessHandle {
    child: Arc<Mutex<Child>>,
    pid: u32,
}

impl Terminate for ProcessHandle {
    /// Kill the process. A child that was already reaped is a no-op.
    fn terminate(&self) -> std::io::Result<()> {
        tracing::debug!(pid = self.pid, "sending kill to runner process");
        lock(&self.child).kill()
    }
}
