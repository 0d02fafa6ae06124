//! Conductor E2E Convergence Harness
//!
//! Drives the `conductor` orchestration CLI from the outside and waits for
//! the container runtime behind it to converge on expected observable state.
//! Scenarios run on the ordinary parallel test runner; the harness supplies
//! the pieces that make that safe against one shared runtime:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  SessionFactory                                              │
//! │    ├── exclusive(test)  ── holds fixture lock for lifetime   │
//! │    └── parallel(test)   ── unique project name, overlaps ok  │
//! │          │                                                   │
//! │  Session (project scope, temp config home, teardown on Drop) │
//! │    ├── run(args)    -> CommandResult       (blocking)        │
//! │    ├── start(args)  -> ProcessHandle       (live output)     │
//! │    └── run_until / wait_for                (convergence)     │
//! │          │                                                   │
//! │  Poller: predicate × timeout × interval -> elapsed | last    │
//! │          diagnostic; HttpProber specializes it for GETs      │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Commands report their exit code as data so scenarios can assert on
//! expected failures; only spawn failures and convergence timeouts are
//! errors. Teardown is `Drop`-based and runs on panic unwind, so a failed
//! assertion mid-scenario still brings the workload down and reaps any
//! background processes.

pub mod command;
pub mod error;
pub mod http;
pub mod poll;
pub mod session;

pub use command::{CommandResult, Invocation, ProcessHandle};
pub use error::{Error, Result};
pub use http::{get_until, HttpProber, ProbePolicy};
pub use poll::{wait_for, CancelToken, Clock, Poller, Step, SystemClock};
pub use session::{Concurrency, Session, SessionConfig, SessionFactory};

use std::sync::Once;

use tracing_subscriber::EnvFilter;

static TRACING_INIT: Once = Once::new();

/// Install the tracing subscriber once for the whole test process. Safe to
/// call from every test; later calls are no-ops.
pub fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            )
            .with_test_writer()
            .init();
    });
}
