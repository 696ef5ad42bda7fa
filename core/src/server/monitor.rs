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

use nix::fcntl::{fcntl, FcntlArg, OFlag};
use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, OwnedFd, RawFd};
use std::time::{Duration, Instant};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::config::settings::Settings;
use crate::error::{Error, Result};
use crate::network::fd::open_control_channel;

use super::counter::ConnectionCounter;

/// interval between two connection count samples while draining
pub const DRAIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// how the drain phase waits for live connections
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DrainPolicy {
    /// stop right after the listeners are closed
    pub quick_abort: bool,
    /// give up waiting after this long, `None` waits forever
    pub wait_limit: Option<Duration>,
    pub poll_interval: Duration,
}

impl DrainPolicy {
    pub fn from_settings(settings: &Settings) -> Self {
        DrainPolicy {
            quick_abort: settings.quick_abort,
            wait_limit: settings.wait_limit(),
            poll_interval: DRAIN_POLL_INTERVAL,
        }
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}

/// how the drain phase ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopStatus {
    /// every connection closed
    Normal,
    /// connections were still open when the wait ended
    Forced,
}

impl StopStatus {
    pub fn is_normal(&self) -> bool {
        matches!(self, StopStatus::Normal)
    }
}

/// wait for the live connections to finish
///
/// the counter is sampled once per poll interval, so the result may lag
/// behind the last decrement by up to one interval
pub async fn drain(counter: &ConnectionCounter, policy: &DrainPolicy) -> StopStatus {
    if policy.quick_abort {
        let clients = counter.current();
        info!(clients, "quick abort, skip waiting for clients");
        return if clients == 0 {
            StopStatus::Normal
        } else {
            StopStatus::Forced
        };
    }
    let started = Instant::now();
    let mut polls: u64 = 0;
    loop {
        let clients = counter.current();
        if clients == 0 {
            return StopStatus::Normal;
        }
        sleep(policy.poll_interval).await;
        polls += 1;
        info!(clients, polls, "exiting, waiting for clients");
        if let Some(limit) = policy.wait_limit {
            if started.elapsed() >= limit {
                warn!(
                    clients = counter.current(),
                    waited_secs = started.elapsed().as_secs(),
                    "waiting too long, stop anyway"
                );
                return StopStatus::Forced;
            }
        }
    }
}

/// watches the control channel kept open by the supervisor
///
/// the supervisor never writes meaningful data: any readable event, an end of
/// stream, or a read error means it is gone and the worker must drain
#[derive(Debug)]
pub struct SupervisorMonitor {
    channel: AsyncFd<File>,
}

impl SupervisorMonitor {
    /// open the control channel at the given descriptor
    /// must be called from within a tokio runtime
    pub fn open(fd: RawFd) -> Result<Self> {
        let owned = open_control_channel(fd)?;
        Self::from_fd(owned).map_err(|source| Error::ControlChannel { fd, source })
    }

    /// watch an already owned channel descriptor
    pub fn from_fd(owned: OwnedFd) -> io::Result<Self> {
        set_nonblocking(owned.as_raw_fd())?;
        // SAFETY: the file owns the descriptor and is only released together
        // with the AsyncFd, so the registered fd stays open and unchanged
        let channel = unsafe { AsyncFd::register_with_interest(File::from(owned), Interest::READABLE) }?;
        Ok(SupervisorMonitor { channel })
    }

    /// resolves once the supervisor disconnects
    pub async fn wait_disconnect(self) {
        info!("waiting for supervisor exiting ...");
        let mut buf = [0u8; 1024];
        let result = loop {
            let mut guard = match self.channel.readable().await {
                Ok(guard) => guard,
                Err(e) => break Err(e),
            };
            match guard.try_io(|inner| {
                let mut file: &File = inner.get_ref();
                file.read(&mut buf)
            }) {
                Ok(result) => break result,
                Err(_would_block) => continue,
            }
        };
        match result {
            Ok(0) => info!("disconnected from supervisor"),
            Ok(n) => info!(bytes = n, "supervisor signaled shutdown"),
            Err(e) => info!("disconnected from supervisor: {e}"),
        }
    }
}

fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(io::Error::from)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(io::Error::from)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::net::UnixStream;

    fn policy(quick_abort: bool, wait_limit: Option<Duration>) -> DrainPolicy {
        DrainPolicy {
            quick_abort,
            wait_limit,
            poll_interval: Duration::from_millis(20),
        }
    }

    #[tokio::test]
    async fn drain_completes_when_connections_close() {
        let counter = ConnectionCounter::new();
        let guards: Vec<_> = (0..3).map(|_| counter.track()).collect();
        let limit = Duration::from_secs(5);
        let started = Instant::now();
        let closer = tokio::spawn(async move {
            for guard in guards {
                sleep(Duration::from_millis(30)).await;
                drop(guard);
            }
        });
        let status = drain(&counter, &policy(false, Some(limit))).await;
        assert_eq!(status, StopStatus::Normal);
        assert!(started.elapsed() < limit);
        closer.await.unwrap();
    }

    #[tokio::test]
    async fn drain_is_forced_after_wait_limit() {
        let counter = ConnectionCounter::new();
        let _stuck = counter.track();
        let limit = Duration::from_millis(100);
        let started = Instant::now();
        let status = drain(&counter, &policy(false, Some(limit))).await;
        assert_eq!(status, StopStatus::Forced);
        assert!(started.elapsed() >= limit);
    }

    #[tokio::test]
    async fn quick_abort_skips_waiting() {
        let counter = ConnectionCounter::new();
        let stuck = counter.track();
        let started = Instant::now();
        let status = drain(&counter, &policy(true, None)).await;
        assert_eq!(status, StopStatus::Forced);
        assert!(started.elapsed() < Duration::from_millis(20));
        drop(stuck);
        assert_eq!(drain(&counter, &policy(true, None)).await, StopStatus::Normal);
    }

    #[tokio::test]
    async fn idle_drain_is_immediate() {
        let counter = ConnectionCounter::new();
        let status = drain(&counter, &policy(false, None)).await;
        assert!(status.is_normal());
    }

    #[test]
    fn policy_follows_settings() {
        let settings = Settings::default();
        let policy = DrainPolicy::from_settings(&settings);
        assert!(!policy.quick_abort);
        assert_eq!(policy.wait_limit, Some(Duration::from_secs(10)));
        assert_eq!(policy.poll_interval, DRAIN_POLL_INTERVAL);
    }

    #[tokio::test]
    async fn monitor_returns_when_supervisor_closes() {
        let (worker_end, supervisor_end) = UnixStream::pair().unwrap();
        let monitor = SupervisorMonitor::from_fd(OwnedFd::from(worker_end)).unwrap();
        let waiter = tokio::spawn(monitor.wait_disconnect());
        sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        drop(supervisor_end);
        tokio::time::timeout(Duration::from_secs(5), waiter)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn monitor_returns_when_supervisor_writes() {
        let (worker_end, mut supervisor_end) = UnixStream::pair().unwrap();
        let monitor = SupervisorMonitor::from_fd(OwnedFd::from(worker_end)).unwrap();
        supervisor_end.write_all(b"x").unwrap();
        tokio::time::timeout(Duration::from_secs(5), monitor.wait_disconnect())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn regular_file_is_not_a_control_channel() {
        let file = tempfile::tempfile().unwrap();
        assert!(SupervisorMonitor::from_fd(OwnedFd::from(file)).is_err());
    }
}
