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

use std::time::Duration;
use tokio::time::sleep;
use tracing::{error, info};

use crate::network::listener::{AcceptError, ServiceEndpoint};
use crate::network::socket::SocketAddress;
use crate::network::stream::Stream;
use crate::server::counter::{ConnectionCounter, ConnectionGuard};

/// pause after a failed accept, e.g. when running out of descriptors
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// accept connections on one endpoint until its listener set is closed
///
/// every accepted connection is counted before it is handed over, the guard
/// must live as long as the connection
pub(crate) async fn accept_loop<F>(endpoint: ServiceEndpoint, counter: ConnectionCounter, mut on_connection: F)
where
    F: FnMut(Stream, SocketAddress, ConnectionGuard),
{
    let address = endpoint.address().clone();
    info!(%address, "accepting connections");
    loop {
        match endpoint.accept_stream().await {
            Ok((stream, peer)) => {
                let guard = counter.track();
                on_connection(stream, peer, guard);
            }
            Err(AcceptError::Closed) => {
                info!(%address, "server stopping");
                break;
            }
            Err(AcceptError::Io(e)) => {
                error!(%address, "accept error: {e}");
                sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
