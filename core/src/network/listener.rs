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

use std::fs::{self, Permissions};
use std::io;
use std::net::{SocketAddr as StdSocketAddr, ToSocketAddrs};
use std::os::unix::fs::{FileTypeExt, PermissionsExt};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpSocket, UnixListener};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::error::{Error, Result};

use super::fd::inherit_listeners;
use super::socket::SocketAddress;
use super::sockopt::{set_reuse_addr, set_reuse_port};
use super::stream::Stream;

const LISTENER_BACKLOG: u32 = 65535;

/// Listener address is the identity itself
/// address is a type of string, will be parsed to socket address
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ListenerAddress {
    Tcp(String),
    Unix(String),
}

impl ListenerAddress {
    /// addresses containing a path separator are unix socket paths
    pub fn parse(raw: &str) -> Self {
        if raw.contains('/') {
            Self::Unix(raw.to_string())
        } else {
            Self::Tcp(raw.to_string())
        }
    }

    /// the raw address string
    pub fn as_str(&self) -> &str {
        match self {
            Self::Tcp(address) | Self::Unix(address) => address,
        }
    }

    /// bind logic
    pub async fn bind(&self) -> io::Result<Listener> {
        match self {
            Self::Tcp(address) => {
                // create socket address from string
                let socket_address = address.to_socket_addrs()?.next().ok_or_else(|| {
                    io::Error::new(io::ErrorKind::InvalidInput, "could not resolve address")
                })?;
                // identify socket address as ip
                let tcp_socket = match socket_address {
                    StdSocketAddr::V4(_) => TcpSocket::new_v4(),
                    StdSocketAddr::V6(_) => TcpSocket::new_v6(),
                }?;
                // reuse address & port so a restarted worker can bind
                // while old sockets are still in TIME_WAIT
                set_reuse_addr(tcp_socket.as_raw_fd())?;
                set_reuse_port(tcp_socket.as_raw_fd())?;
                // bind tcp socket to the socket address
                tcp_socket.bind(socket_address)?;
                // listen to tcp socket
                tcp_socket.listen(LISTENER_BACKLOG).map(Listener::from)
            }
            Self::Unix(path) => {
                remove_stale_socket(Path::new(path))?;
                let std_listener = std::os::unix::net::UnixListener::bind(path)?;
                // read/write permissions for all users on the socket
                fs::set_permissions(path, Permissions::from_mode(0o666))?;
                // set listener backlog
                let socket: socket2::Socket = std_listener.into();
                socket.listen(LISTENER_BACKLOG as i32)?;
                socket.set_nonblocking(true)?;
                UnixListener::from_std(socket.into()).map(Listener::from)
            }
        }
    }
}

/// remove a socket file left by a previous run, anything else at the path
/// is left alone and fails the bind
fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }
    fs::remove_file(path)
}

/// split an address list, accepting comma, semicolon or whitespace separators
pub fn split_addresses(raw: &str) -> Vec<ListenerAddress> {
    raw.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|token| !token.is_empty())
        .map(ListenerAddress::parse)
        .collect()
}

/// the main listener type
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl From<TcpListener> for Listener {
    fn from(s: TcpListener) -> Self {
        Self::Tcp(s)
    }
}

impl From<UnixListener> for Listener {
    fn from(s: UnixListener) -> Self {
        Self::Unix(s)
    }
}

impl Listener {
    /// the address this listener is bound to
    pub fn local_address(&self) -> io::Result<SocketAddress> {
        match self {
            Self::Tcp(listener) => listener.local_addr().map(SocketAddress::from),
            Self::Unix(listener) => listener.local_addr().map(SocketAddress::from),
        }
    }

    pub fn as_raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Unix(listener) => listener.as_raw_fd(),
        }
    }

    async fn accept(&self) -> io::Result<(Stream, SocketAddress)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, address) = listener.accept().await?;
                let stream = Stream::from(stream);
                // set nodelay by default
                stream.set_no_delay();
                Ok((stream, SocketAddress::from(address)))
            }
            Self::Unix(listener) => {
                let (stream, address) = listener.accept().await?;
                Ok((Stream::from(stream), SocketAddress::from(address)))
            }
        }
    }
}

/// accept failure on a service endpoint
#[derive(Debug, thiserror::Error)]
pub enum AcceptError {
    /// the listener set was closed for draining
    #[error("listener closed")]
    Closed,
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// one bound listening socket handed to a service adapter
#[derive(Debug)]
pub struct ServiceEndpoint {
    address: SocketAddress,
    listener: Listener,
    closed: watch::Receiver<bool>,
}

impl ServiceEndpoint {
    /// the address this endpoint serves
    pub fn address(&self) -> &SocketAddress {
        &self.address
    }

    /// accept the next downstream connection
    ///
    /// fails with [`AcceptError::Closed`] once the owning listener set is closed,
    /// both for pending and for later calls
    pub async fn accept_stream(&self) -> std::result::Result<(Stream, SocketAddress), AcceptError> {
        let mut closed = self.closed.clone();
        tokio::select! {
            biased;
            _ = wait_closed(&mut closed) => Err(AcceptError::Closed),
            accepted = self.listener.accept() => accepted.map_err(AcceptError::from),
        }
    }
}

/// resolves when the close flag turns true, never if the handle is gone
async fn wait_closed(closed: &mut watch::Receiver<bool>) {
    if closed.wait_for(|closed| *closed).await.is_err() {
        futures::future::pending::<()>().await;
    }
}

/// the authority to close every endpoint of a listener set
#[derive(Clone, Debug)]
pub struct ListenerHandle {
    closer: Arc<watch::Sender<bool>>,
}

impl ListenerHandle {
    fn new() -> Self {
        let (closer, _) = watch::channel(false);
        ListenerHandle {
            closer: Arc::new(closer),
        }
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.closer.subscribe()
    }

    /// close every endpoint, returns false when already closed
    pub fn close_all(&self) -> bool {
        let was_closed = self.closer.send_replace(true);
        if !was_closed {
            info!("closing all listeners");
        }
        !was_closed
    }

    pub fn is_closed(&self) -> bool {
        *self.closer.borrow()
    }
}

/// ordered set of bound listening sockets
#[derive(Debug)]
pub struct ListenerSet {
    endpoints: Vec<ServiceEndpoint>,
    handle: ListenerHandle,
}

impl ListenerSet {
    /// bind every address of the list, skipping the ones that fail
    ///
    /// fails only when the list is empty or no listener could be bound
    pub async fn bind(addresses: &str) -> Result<Self> {
        let addresses = split_addresses(addresses);
        if addresses.is_empty() {
            warn!("no valid addresses for listening");
            return Err(Error::NoAddresses);
        }
        let mut listeners = Vec::with_capacity(addresses.len());
        for address in &addresses {
            match address.bind().await {
                Ok(listener) => {
                    info!(address = address.as_str(), "listen ok");
                    listeners.push(listener);
                }
                Err(e) => warn!(address = address.as_str(), "listen failed: {e}"),
            }
        }
        Self::from_listeners(listeners)
    }

    /// reconstruct listeners from `count` inherited descriptors starting at `start`
    pub fn inherit(start: RawFd, count: usize) -> Result<Self> {
        Self::from_listeners(inherit_listeners(start, count))
    }

    fn from_listeners(listeners: Vec<Listener>) -> Result<Self> {
        if listeners.is_empty() {
            warn!("no listener created");
            return Err(Error::NoListeners);
        }
        let handle = ListenerHandle::new();
        let mut endpoints = Vec::with_capacity(listeners.len());
        for listener in listeners {
            let address = listener.local_address()?;
            endpoints.push(ServiceEndpoint {
                address,
                listener,
                closed: handle.subscribe(),
            });
        }
        info!(listeners = endpoints.len(), "listeners ready");
        Ok(ListenerSet { endpoints, handle })
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// addresses in listener order
    pub fn addresses(&self) -> Vec<SocketAddress> {
        self.endpoints.iter().map(|e| e.address.clone()).collect()
    }

    /// the close handle shared by every endpoint of this set
    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    pub fn into_endpoints(self) -> Vec<ServiceEndpoint> {
        self.endpoints
    }
}
