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

use nix::sys::socket::{getsockname, SockaddrLike, SockaddrStorage};
use std::fmt;
use std::net::SocketAddr as StdSockAddr;
use std::os::unix::io::RawFd;
use std::path::{Path, PathBuf};

/// type used for socket address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SocketAddress {
    Tcp(StdSockAddr),
    /// unix socket path, `None` for unnamed sockets
    Unix(Option<PathBuf>),
}

impl SocketAddress {
    /// extract tcp socket address from the type
    pub fn as_tcp(&self) -> Option<&StdSockAddr> {
        if let SocketAddress::Tcp(address) = self {
            Some(address)
        } else {
            None
        }
    }

    /// extract unix socket path from the type
    pub fn as_unix(&self) -> Option<&Path> {
        if let SocketAddress::Unix(path) = self {
            path.as_deref()
        } else {
            None
        }
    }

    /// storages correspond to query for socket addresses
    fn from_storage(sock: &SockaddrStorage) -> Option<SocketAddress> {
        // check for ipv4 & ipv6
        if let Some(v4) = sock.as_sockaddr_in() {
            let address = SocketAddress::Tcp(StdSockAddr::V4((*v4).into()));
            return Some(address);
        } else if let Some(v6) = sock.as_sockaddr_in6() {
            let address = SocketAddress::Tcp(StdSockAddr::V6((*v6).into()));
            return Some(address);
        }
        // check for unix socket
        let unix = sock.as_unix_addr()?;
        Some(SocketAddress::Unix(unix.path().map(Path::to_path_buf)))
    }

    /// get the local socket address bound to the given fd
    pub fn from_raw_fd(fd: RawFd) -> Option<SocketAddress> {
        match getsockname::<SockaddrStorage>(fd) {
            Ok(storage) if storage.len() > 0 => Self::from_storage(&storage),
            _ => None,
        }
    }
}

impl From<StdSockAddr> for SocketAddress {
    fn from(address: StdSockAddr) -> Self {
        SocketAddress::Tcp(address)
    }
}

impl From<tokio::net::unix::SocketAddr> for SocketAddress {
    fn from(address: tokio::net::unix::SocketAddr) -> Self {
        SocketAddress::Unix(address.as_pathname().map(Path::to_path_buf))
    }
}

impl fmt::Display for SocketAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SocketAddress::Tcp(address) => write!(f, "{address}"),
            SocketAddress::Unix(Some(path)) => write!(f, "{}", path.display()),
            SocketAddress::Unix(None) => write!(f, "unix:unnamed"),
        }
    }
}
