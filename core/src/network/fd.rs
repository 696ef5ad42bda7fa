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

use nix::fcntl::{fcntl, FcntlArg};
use nix::sys::resource::{getrlimit, Resource};
use std::io;
use std::ops::Range;
use std::os::unix::io::{FromRawFd, OwnedFd, RawFd};
use tracing::{error, info, warn};

use crate::error::{Error, Result};

use super::listener::Listener;
use super::socket::SocketAddress;
use super::sockopt::is_listening;

/// descriptor the supervisor keeps open as the control channel
pub const CONTROL_FD: RawFd = 5;

/// first inherited listening descriptor
pub const LISTEN_FD_START: RawFd = 6;

/// take ownership of an inherited descriptor
///
/// the descriptor is duplicated with close-on-exec and the original number
/// is released, so the well known slot is free again once wrapped
fn take_fd(fd: RawFd) -> io::Result<OwnedFd> {
    // make sure the descriptor is open before touching it
    fcntl(fd, FcntlArg::F_GETFD).map_err(io::Error::from)?;
    let dup = fcntl(fd, FcntlArg::F_DUPFD_CLOEXEC(0)).map_err(io::Error::from)?;
    // the duplicate is owned from here on
    let owned = unsafe { OwnedFd::from_raw_fd(dup) };
    if let Err(e) = nix::unistd::close(fd) {
        error!(fd, "failed to release inherited fd: {e}");
    }
    Ok(owned)
}

/// wrap one inherited listening socket into a listener
fn wrap_listener(fd: RawFd) -> io::Result<Listener> {
    let owned = take_fd(fd)?;
    let raw = std::os::unix::io::AsRawFd::as_raw_fd(&owned);
    if !is_listening(raw)? {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "not a listening socket",
        ));
    }
    match SocketAddress::from_raw_fd(raw) {
        Some(SocketAddress::Tcp(_)) => {
            let std_listener = std::net::TcpListener::from(owned);
            std_listener.set_nonblocking(true)?;
            tokio::net::TcpListener::from_std(std_listener).map(Listener::from)
        }
        Some(SocketAddress::Unix(_)) => {
            let std_listener = std::os::unix::net::UnixListener::from(owned);
            std_listener.set_nonblocking(true)?;
            tokio::net::UnixListener::from_std(std_listener).map(Listener::from)
        }
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "unsupported socket family",
        )),
    }
}

/// reconstruct listeners from a contiguous descriptor range
/// descriptors that fail to wrap are logged and skipped
pub fn inherit_listeners(start: RawFd, count: usize) -> Vec<Listener> {
    let range = inherit_range(start, count);
    if range.len() < count {
        warn!(start, count, usable = range.len(), "inherited fd count truncated");
    }
    let mut listeners = Vec::new();
    for fd in range {
        match wrap_listener(fd) {
            Ok(listener) => {
                info!(fd, "add fd ok");
                listeners.push(listener);
            }
            Err(e) => error!(fd, "create listener from fd failed: {e}"),
        }
    }
    info!(listeners = listeners.len(), "inherited listeners");
    listeners
}

/// descriptors `start..start + count`, bounded by the largest descriptor
/// the process may hold
fn inherit_range(start: RawFd, count: usize) -> Range<RawFd> {
    let limit = getrlimit(Resource::RLIMIT_NOFILE)
        .ok()
        .and_then(|(soft, _)| RawFd::try_from(soft).ok())
        .unwrap_or(RawFd::MAX);
    let end = RawFd::try_from(count)
        .ok()
        .and_then(|count| start.checked_add(count))
        .unwrap_or(RawFd::MAX)
        .min(limit);
    start..end.max(start)
}

/// open the supervisor control channel
pub fn open_control_channel(fd: RawFd) -> Result<OwnedFd> {
    take_fd(fd).map_err(|source| Error::ControlChannel { fd, source })
}
