// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Minimal joinable thread over std::thread.

use std::panic::{self, AssertUnwindSafe};
use std::thread::JoinHandle;

use crate::error::terminate;

/// A thread that must be joined.
///
/// A default-constructed `Thread` is not joinable. Starting it makes it
/// joinable until [`Thread::join`] returns. Starting a joinable thread,
/// joining one that is not joinable, or dropping one that is still joinable
/// terminates the process, as does a panic escaping the thread body.
#[derive(Default)]
pub struct Thread {
    handle: Option<JoinHandle<()>>,
}

impl Thread {
    pub fn new() -> Self {
        Self { handle: None }
    }

    /// Create and start a thread running `f`.
    pub fn spawn<F>(f: F) -> Self
    where
        F: FnOnce() + Send + 'static,
    {
        let mut thread = Self::new();
        thread.start(f);
        thread
    }

    pub fn start<F>(&mut self, f: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.handle.is_some() {
            terminate("Thread::start() on a joinable thread");
        }
        let spawned = std::thread::Builder::new().spawn(move || {
            if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
                terminate("unhandled panic in thread body");
            }
        });
        match spawned {
            Ok(handle) => self.handle = Some(handle),
            Err(e) => terminate(&format!("thread creation failed: {e}")),
        }
    }

    pub fn joinable(&self) -> bool {
        self.handle.is_some()
    }

    pub fn join(&mut self) {
        let Some(handle) = self.handle.take() else {
            terminate("Thread::join() on a thread that is not joinable");
        };
        // The body cannot unwind past catch_unwind.
        if handle.join().is_err() {
            terminate("thread join failed");
        }
    }
}

impl Drop for Thread {
    fn drop(&mut self) {
        if self.handle.is_some() {
            terminate("joinable Thread dropped");
        }
    }
}
