// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Helpers shared by the integration tests.

#![allow(dead_code)]

use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Once;
use std::thread;
use std::time::{Duration, Instant};

/// Environment variable carrying the role of a re-executed test binary.
pub const ROLE_ENV: &str = "SHMSYNC_TEST_ROLE";
/// Environment variable carrying the shared object name for a child role.
pub const NAME_ENV: &str = "SHMSYNC_TEST_NAME";

static COUNTER: AtomicUsize = AtomicUsize::new(0);
static LOGGING: Once = Once::new();

/// Route library logs to the test harness output.
pub fn init_test_logging() {
    LOGGING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_test_writer()
            .try_init();
    });
}

/// A name unique to this test process and call.
pub fn unique_name(prefix: &str) -> String {
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{prefix}_{}_{n}", std::process::id())
}

/// The role this binary was re-executed with, if any.
pub fn child_role() -> Option<String> {
    std::env::var(ROLE_ENV).ok()
}

pub fn child_name() -> String {
    std::env::var(NAME_ENV).unwrap_or_default()
}

/// Re-execute the current test binary running only `test`, with `role` and
/// `name` in the environment. The child's output is discarded.
pub fn spawn_child(test: &str, role: &str, name: &str) -> Child {
    let exe = std::env::current_exe().expect("current_exe");
    Command::new(exe)
        .arg("--exact")
        .arg(test)
        .arg("--nocapture")
        .arg("--test-threads=1")
        .env(ROLE_ENV, role)
        .env(NAME_ENV, name)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("spawn child test process")
}

/// Wait for `child` to exit, killing it once `timeout` elapses.
/// Returns `None` on timeout.
pub fn wait_child(child: &mut Child, timeout: Duration) -> Option<ExitStatus> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait().expect("try_wait") {
            return Some(status);
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            let _ = child.wait();
            return None;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

/// Whether `status` is death by `SIGABRT`.
pub fn aborted(status: &ExitStatus) -> bool {
    use std::os::unix::process::ExitStatusExt;
    status.signal() == Some(libc::SIGABRT)
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
