//! Command execution against external binaries
//!
//! The orchestration CLI and the container runtime are opaque process
//! boundaries: the contract is exit code plus stdout/stderr text. A non-zero
//! exit code is data, not an error, so scenarios can assert on expected
//! failures; only a failure to spawn at all is fatal.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Grace period between SIGTERM and SIGKILL when terminating a background
/// process.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Immutable description of one external command: program, ordered arguments,
/// working directory and environment overrides.
#[derive(Debug, Clone)]
pub struct Invocation {
    program: PathBuf,
    args: Vec<String>,
    dir: Option<PathBuf>,
    env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            dir: None,
            env: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.dir {
            cmd.current_dir(dir);
        }
        for (key, value) in &self.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }

    fn spawn_error(&self, source: std::io::Error) -> Error {
        Error::Spawn {
            program: self.program.display().to_string(),
            source,
        }
    }

    /// Run synchronously, blocking until the process exits. Both streams are
    /// captured in full.
    pub fn run(&self) -> Result<CommandResult> {
        debug!(program = %self.program.display(), args = ?self.args, "running command");
        let output = self
            .command()
            .output()
            .map_err(|e| self.spawn_error(e))?;

        let result = CommandResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: exit_code_of(output.status),
        };
        debug!(exit_code = result.exit_code, "command finished");
        Ok(result)
    }

    /// Spawn without waiting. The returned handle owns the process and its
    /// output streams for the handle's lifetime.
    pub fn start(&self) -> Result<ProcessHandle> {
        debug!(program = %self.program.display(), args = ?self.args, "starting background command");
        let mut child = self.command().spawn().map_err(|e| self.spawn_error(e))?;

        let buf = Arc::new(Mutex::new(OutputBuf::default()));
        let mut readers = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(spawn_reader(stdout, buf.clone(), StreamKind::Stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(spawn_reader(stderr, buf.clone(), StreamKind::Stderr));
        }

        Ok(ProcessHandle {
            program: self.program.display().to_string(),
            child,
            buf,
            readers,
            done: Arc::new(AtomicBool::new(false)),
        })
    }
}

/// Signal-terminated processes have no exit code; report -1 so callers can
/// still assert on it as data.
fn exit_code_of(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

/// Captured output of a finished command. Owned exclusively by the caller
/// that issued the invocation.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Both streams, stdout first. Capture is per-stream, so the two halves
    /// are not interleaved in emission order.
    pub fn combined(&self) -> String {
        let mut combined = String::with_capacity(self.stdout.len() + self.stderr.len());
        combined.push_str(&self.stdout);
        combined.push_str(&self.stderr);
        combined
    }

    pub fn stdout_contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle)
    }

    pub fn stderr_contains(&self, needle: &str) -> bool {
        self.stderr.contains(needle)
    }

    pub fn combined_contains(&self, needle: &str) -> bool {
        self.stdout.contains(needle) || self.stderr.contains(needle)
    }

    /// Number of times `needle` appears in stdout, for "log line appeared N
    /// times" convergence checks.
    pub fn stdout_count(&self, needle: &str) -> usize {
        self.stdout.matches(needle).count()
    }

    pub fn stdout_matches(&self, pattern: &regex::Regex) -> bool {
        pattern.is_match(&self.stdout)
    }

    /// Parse stdout as JSON, for structured `ps --format json` style output.
    pub fn stdout_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::from_str(self.stdout.trim())?)
    }

    /// Scenario-level assertion: the command was expected to succeed.
    pub fn expect_success(&self) -> Result<&Self> {
        self.expect_exit_code(0)
    }

    /// Scenario-level assertion on a specific exit code, including expected
    /// failures.
    pub fn expect_exit_code(&self, expected: i32) -> Result<&Self> {
        if self.exit_code == expected {
            Ok(self)
        } else {
            Err(Error::UnexpectedExitCode {
                expected,
                actual: self.exit_code,
                output: self.combined(),
            })
        }
    }
}

#[derive(Default)]
struct OutputBuf {
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

#[derive(Clone, Copy)]
enum StreamKind {
    Stdout,
    Stderr,
}

/// Reader loop: the single writer for its stream's buffer. Runs until the
/// child closes the pipe so the child never blocks on a full pipe.
fn spawn_reader(
    mut stream: impl Read + Send + 'static,
    buf: Arc<Mutex<OutputBuf>>,
    kind: StreamKind,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        let mut chunk = [0u8; 4096];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut guard = buf.lock();
                    match kind {
                        StreamKind::Stdout => guard.stdout.extend_from_slice(&chunk[..n]),
                        StreamKind::Stderr => guard.stderr.extend_from_slice(&chunk[..n]),
                    }
                }
            }
        }
    })
}

/// Live background process. Output accumulates concurrently and can be
/// snapshotted at any point; the process must be terminated or waited before
/// scenario teardown, and [`Drop`] enforces that as a last resort.
pub struct ProcessHandle {
    program: String,
    child: Child,
    buf: Arc<Mutex<OutputBuf>>,
    readers: Vec<thread::JoinHandle<()>>,
    done: Arc<AtomicBool>,
}

impl ProcessHandle {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Snapshot of stdout accumulated so far
    pub fn stdout(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().stdout).into_owned()
    }

    /// Snapshot of stderr accumulated so far
    pub fn stderr(&self) -> String {
        String::from_utf8_lossy(&self.buf.lock().stderr).into_owned()
    }

    /// Snapshot of both streams, stdout first
    pub fn combined(&self) -> String {
        let guard = self.buf.lock();
        let mut combined = String::with_capacity(guard.stdout.len() + guard.stderr.len());
        combined.push_str(&String::from_utf8_lossy(&guard.stdout));
        combined.push_str(&String::from_utf8_lossy(&guard.stderr));
        combined
    }

    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Set when the process has been reaped, shared with the owning session
    /// so teardown can skip handles that were already cleaned up.
    pub(crate) fn done_flag(&self) -> Arc<AtomicBool> {
        self.done.clone()
    }

    /// Block until the process exits on its own, then return its captured
    /// output.
    pub fn wait(&mut self) -> Result<CommandResult> {
        let status = self.child.wait()?;
        Ok(self.finish(status))
    }

    /// SIGTERM, a short grace period, then SIGKILL. Returns the output
    /// captured up to termination.
    pub fn terminate(&mut self) -> Result<CommandResult> {
        if self.done.load(Ordering::SeqCst) {
            let status = self.child.wait()?;
            return Ok(self.finish(status));
        }

        debug!(program = %self.program, pid = self.pid(), "terminating background process");
        if self.child.try_wait()?.is_none() {
            let pid = Pid::from_raw(self.child.id() as i32);
            if kill(pid, Signal::SIGTERM).is_ok() {
                let deadline = Instant::now() + TERM_GRACE;
                while Instant::now() < deadline {
                    if self.child.try_wait()?.is_some() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(25));
                }
            }
            if self.child.try_wait()?.is_none() {
                warn!(program = %self.program, pid = self.pid(), "force killing");
                let _ = self.child.kill();
            }
        }

        let status = self.child.wait()?;
        Ok(self.finish(status))
    }

    fn finish(&mut self, status: ExitStatus) -> CommandResult {
        self.done.store(true, Ordering::SeqCst);
        // Pipes are closed once the child is gone, so the readers drain and
        // exit.
        for reader in self.readers.drain(..) {
            let _ = reader.join();
        }
        let guard = self.buf.lock();
        CommandResult {
            stdout: String::from_utf8_lossy(&guard.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&guard.stderr).into_owned(),
            exit_code: exit_code_of(status),
        }
    }
}

impl Drop for ProcessHandle {
    fn drop(&mut self) {
        if !self.done.load(Ordering::SeqCst) {
            let _ = self.terminate();
        }
    }
}
