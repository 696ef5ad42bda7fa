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

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

/// live connection counter shared by every service adapter
///
/// increments & decrements must be paired per connection, prefer
/// [`ConnectionCounter::track`] which pairs them through a guard
#[derive(Clone, Debug, Default)]
pub struct ConnectionCounter {
    count: Arc<AtomicUsize>,
}

impl ConnectionCounter {
    pub fn new() -> Self {
        ConnectionCounter::default()
    }

    /// record one accepted connection
    pub fn inc(&self) -> usize {
        self.count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// record one closed connection
    /// a decrement at zero is a usage error and leaves the counter at zero
    pub fn dec(&self) -> usize {
        match self
            .count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        {
            Ok(previous) => previous - 1,
            Err(_) => {
                warn!("connection counter decremented below zero");
                0
            }
        }
    }

    /// current number of live connections
    pub fn current(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }

    /// count a connection for as long as the guard lives
    pub fn track(&self) -> ConnectionGuard {
        self.inc();
        ConnectionGuard {
            counter: self.clone(),
        }
    }
}

/// decrements the counter exactly once when dropped
#[derive(Debug)]
pub struct ConnectionGuard {
    counter: ConnectionCounter,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.counter.dec();
    }
}
