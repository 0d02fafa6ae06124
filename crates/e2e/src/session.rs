//! Project-scoped CLI sessions and the factory that hands them out
//!
//! Every scenario drives the CLI through its own session: a unique project
//! name plus a private temp directory used as the CLI's config/state home.
//! Isolation between parallel scenarios rests entirely on that uniqueness,
//! since the container runtime underneath is shared. Scenarios that touch a
//! genuinely shared fixture (a fixed host port, a well-known project name)
//! take an exclusive session instead, which holds a process-wide lock on the
//! fixture for its whole lifetime.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{kill, Signal};
use nix::sys::wait::waitpid;
use nix::unistd::Pid;
use once_cell::sync::Lazy;
use parking_lot::lock_api::ArcMutexGuard;
use parking_lot::{Mutex, RawMutex};
use tempfile::TempDir;
use tracing::{debug, info, warn};

use crate::command::{CommandResult, Invocation, ProcessHandle};
use crate::error::Result;
use crate::poll::{CancelToken, Poller, Step};

/// One mutual-exclusion token per named shared fixture, process-wide.
static FIXTURE_LOCKS: Lazy<Mutex<HashMap<String, Arc<Mutex<()>>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

fn fixture_lock(fixture: &str) -> Arc<Mutex<()>> {
    FIXTURE_LOCKS
        .lock()
        .entry(fixture.to_string())
        .or_default()
        .clone()
}

/// Whether a session may overlap with other scenarios.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Concurrency {
    /// Serialized against other exclusive sessions on the same fixture
    Exclusive,
    /// Free to overlap with any other parallel session
    Parallel,
}

/// Binary paths and scoping knobs for sessions produced by one factory.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Orchestration CLI under test
    pub cli_bin: PathBuf,

    /// Container runtime binary for global inspection queries
    pub runtime_bin: PathBuf,

    /// Env var pointed at the session's temp directory so concurrent CLI
    /// invocations do not share mutable config/state
    pub config_home_env: String,

    /// Shared fixture guarded by exclusive sessions from this factory
    pub fixture: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cli_bin: env::var_os("CONDUCTOR_E2E_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("conductor")),
            runtime_bin: env::var_os("CONDUCTOR_E2E_RUNTIME_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("docker")),
            config_home_env: "CONDUCTOR_CONFIG_HOME".to_string(),
            fixture: "default".to_string(),
        }
    }
}

/// Produces exclusive or parallel-safe sessions.
#[derive(Debug, Clone, Default)]
pub struct SessionFactory {
    config: SessionConfig,
}

impl SessionFactory {
    pub fn new(config: SessionConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session that may run concurrently with any other parallel session.
    pub fn parallel(&self, test_name: &str) -> Result<Session> {
        self.session(test_name, Concurrency::Parallel)
    }

    /// Session serialized against other exclusive sessions on this factory's
    /// fixture. Blocks until the fixture is free; the lock is released by the
    /// session's teardown.
    pub fn exclusive(&self, test_name: &str) -> Result<Session> {
        self.session(test_name, Concurrency::Exclusive)
    }

    fn session(&self, test_name: &str, concurrency: Concurrency) -> Result<Session> {
        let dir = tempfile::Builder::new()
            .prefix("conductor-e2e-")
            .tempdir()?;
        let project = project_name(test_name, dir.path());

        let guard = match concurrency {
            Concurrency::Exclusive => {
                debug!(fixture = %self.config.fixture, project = %project, "waiting for exclusive fixture");
                Some(fixture_lock(&self.config.fixture).lock_arc())
            }
            Concurrency::Parallel => None,
        };

        info!(project = %project, ?concurrency, "session ready");
        Ok(Session {
            project,
            dir,
            concurrency,
            config: self.config.clone(),
            spawned: Mutex::new(Vec::new()),
            cancel: CancelToken::new(),
            guard,
        })
    }
}

/// Project name derived from the test name plus the temp directory's random
/// suffix, so two live sessions can never collide.
fn project_name(test_name: &str, dir: &Path) -> String {
    let base: String = test_name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect();

    let mut suffix: Vec<char> = dir
        .file_name()
        .map(|name| {
            name.to_string_lossy()
                .chars()
                .rev()
                .filter(|c| c.is_ascii_alphanumeric())
                .take(6)
                .map(|c| c.to_ascii_lowercase())
                .collect()
        })
        .unwrap_or_default();
    suffix.reverse();

    format!(
        "{}-{}",
        base.trim_matches('-'),
        suffix.into_iter().collect::<String>()
    )
}

/// Isolated execution context for one scenario.
///
/// Dropping the session is its teardown: outstanding polls are cancelled, a
/// best-effort `down` is issued for the project, leaked background processes
/// are reaped, and any exclusive-fixture lock is released. Drop runs on panic
/// unwind too, so a failed assertion mid-scenario still cleans up.
pub struct Session {
    project: String,
    dir: TempDir,
    concurrency: Concurrency,
    config: SessionConfig,
    spawned: Mutex<Vec<(u32, Arc<AtomicBool>)>>,
    cancel: CancelToken,
    guard: Option<ArcMutexGuard<RawMutex, ()>>,
}

impl Session {
    /// Exclusive session from a default-configured factory.
    pub fn exclusive(test_name: &str) -> Result<Session> {
        SessionFactory::default().exclusive(test_name)
    }

    /// Parallel-safe session from a default-configured factory.
    pub fn parallel(test_name: &str) -> Result<Session> {
        SessionFactory::default().parallel(test_name)
    }

    pub fn project_name(&self) -> &str {
        &self.project
    }

    /// The session's private config/state directory
    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn concurrency(&self) -> Concurrency {
        self.concurrency
    }

    /// Token cancelled at teardown; long waits built on it abort early.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    fn cli_invocation(&self, scoped: bool, args: &[&str]) -> Invocation {
        let mut invocation = Invocation::new(&self.config.cli_bin);
        if scoped {
            invocation = invocation.args(["--project-name", self.project.as_str()]);
        }
        invocation
            .args(args.iter().copied())
            .env(
                self.config.config_home_env.as_str(),
                self.dir.path().to_string_lossy(),
            )
    }

    /// Run a CLI command scoped to this session's project, blocking to exit.
    pub fn run(&self, args: &[&str]) -> Result<CommandResult> {
        self.cli_invocation(true, args).run()
    }

    /// Run a CLI command without project scoping, for invocations that carry
    /// their own `--project-directory` or `-p`.
    pub fn run_plain(&self, args: &[&str]) -> Result<CommandResult> {
        self.cli_invocation(false, args).run()
    }

    /// Query the container runtime directly (`ps`, `inspect`, `network ls`),
    /// still under this session's config home.
    pub fn runtime(&self, args: &[&str]) -> Result<CommandResult> {
        Invocation::new(&self.config.runtime_bin)
            .args(args.iter().copied())
            .env(
                self.config.config_home_env.as_str(),
                self.dir.path().to_string_lossy(),
            )
            .run()
    }

    /// Start a scoped CLI command in the background. The handle is registered
    /// so teardown can reap it if the scenario never does.
    pub fn start(&self, args: &[&str]) -> Result<ProcessHandle> {
        let handle = self.cli_invocation(true, args).start()?;
        self.spawned.lock().push((handle.pid(), handle.done_flag()));
        Ok(handle)
    }

    /// Poll an arbitrary predicate under this session's cancellation token.
    pub fn wait_for(
        &self,
        predicate: impl FnMut() -> (bool, String),
        timeout: Duration,
        interval: Duration,
    ) -> Result<Duration> {
        Poller::new()
            .cancel_with(self.cancel.clone())
            .wait_for(timeout, interval, predicate)
    }

    /// Re-run a scoped CLI command each tick until `check` accepts its
    /// result. On timeout the last combined output is the diagnostic.
    pub fn run_until(
        &self,
        args: &[&str],
        mut check: impl FnMut(&CommandResult) -> bool,
        timeout: Duration,
        interval: Duration,
    ) -> Result<CommandResult> {
        let poller = Poller::new().cancel_with(self.cancel.clone());
        let (result, _elapsed) = poller.poll(timeout, interval, || match self.run(args) {
            Ok(result) => {
                if check(&result) {
                    Step::Done(result)
                } else {
                    Step::Retry(result.combined())
                }
            }
            Err(err) => Step::Abort(err),
        })?;
        Ok(result)
    }

    /// Tear down the session's workload explicitly. Teardown also does this,
    /// so calling it is only needed when a scenario asserts on its output.
    pub fn down(&self) -> Result<CommandResult> {
        self.run(&["down"])
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.cancel.cancel();
        debug!(project = %self.project, "tearing down session");

        match self.run(&["down"]) {
            Ok(result) if !result.success() => {
                warn!(project = %self.project, exit_code = result.exit_code, "down exited non-zero during teardown");
            }
            Err(err) => {
                warn!(project = %self.project, %err, "down failed during teardown");
            }
            _ => {}
        }

        for (pid, done) in self.spawned.lock().drain(..) {
            if done.load(Ordering::SeqCst) {
                continue;
            }
            warn!(project = %self.project, pid, "reaping leaked background process");
            let pid = Pid::from_raw(pid as i32);
            let _ = kill(pid, Signal::SIGKILL);
            let _ = waitpid(pid, None);
        }
        // The exclusive-fixture guard, if any, is released when the session's
        // fields drop after this.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn project_names_are_sanitized_and_lowercase() {
        let dir = tempfile::Builder::new()
            .prefix("conductor-e2e-")
            .tempdir()
            .unwrap();
        let name = project_name("Up::CheckHealth (smoke)", dir.path());
        assert!(name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-'));
        assert!(name.starts_with("up--checkhealth"), "got {name}");
    }

    #[test]
    fn project_names_differ_across_sessions_with_the_same_test_name() {
        let a = Session::parallel("same-test").unwrap();
        let b = Session::parallel("same-test").unwrap();
        assert_ne!(a.project_name(), b.project_name());
    }

    #[test]
    fn fixture_lock_is_shared_by_name() {
        let a = fixture_lock("port-90");
        let b = fixture_lock("port-90");
        let c = fixture_lock("port-91");
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
