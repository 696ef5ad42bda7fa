//! Copyright (c) 2024-2025 Hyflux, Inc.
//!
//! This file is part of Hyflux
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU Affero General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU Affero General Public License for more details.
//!
//! You should have received a copy of the GNU Affero General Public License
//! along with this program.  If not, see <http://www.gnu.org/licenses/>.

use nix::sys::resource::{getrlimit, setrlimit, Resource};
use std::future::Future;
use std::io;
use tokio::runtime::{Builder, Handle};
use tokio::time::Duration;
use tracing::{info, warn};

/// open files limit used when the hard limit reports nothing
const FALLBACK_NOFILE: u64 = 100_000;

/// the multi threaded runtime the worker services run on
pub struct Runtime(tokio::runtime::Runtime);

impl Runtime {
    /// new runtime builder
    /// `None` keeps the tokio default of one worker per core
    pub fn new(thread_name: &str, alloc_threads: Option<usize>) -> io::Result<Self> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name(thread_name);
        if let Some(threads) = alloc_threads {
            builder.worker_threads(threads);
        }
        builder.build().map(Runtime)
    }

    /// runtime handle thread work
    pub fn handle_work(&self) -> &Handle {
        self.0.handle()
    }

    /// run the future to completion, blocking the current thread
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        self.0.block_on(future)
    }

    /// runtime shutdown timeout
    pub fn shutdown(self, timeout: Duration) {
        self.0.shutdown_timeout(timeout)
    }
}

/// raise the soft open files limit to the hard limit so the worker can
/// hold as many connections as the system allows
pub fn raise_open_files_limit() -> Option<u64> {
    let (soft, hard) = match getrlimit(Resource::RLIMIT_NOFILE) {
        Ok(limits) => limits,
        Err(e) => {
            warn!("get rlimit failed: {e}");
            return None;
        }
    };
    let target = if hard == 0 { FALLBACK_NOFILE } else { hard };
    if soft >= target {
        return Some(soft);
    }
    match setrlimit(Resource::RLIMIT_NOFILE, target, target.max(hard)) {
        Ok(()) => {
            info!(from = soft, to = target, "open files limit raised");
            Some(target)
        }
        Err(e) => {
            warn!("set rlimit failed: {e}");
            Some(soft)
        }
    }
}
