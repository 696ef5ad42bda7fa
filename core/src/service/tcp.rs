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

use async_trait::async_trait;
use futures::future;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::network::listener::ListenerSet;
use crate::network::socket::SocketAddress;
use crate::network::stream::Stream;
use crate::server::lifecycle::Lifecycle;
use crate::server::monitor::StopStatus;

use super::acceptor::accept_loop;

/// application logic of a raw stream service
#[async_trait]
pub trait TcpHandler: Send + Sync + 'static {
    /// called for every accepted connection, the stream is closed once it returns
    async fn on_accept(&self, stream: &mut Stream, peer: &SocketAddress);

    /// called after `on_accept`, before the stream is closed
    async fn on_close(&self, _peer: &SocketAddress) {}
}

/// raw stream service serving every listener of the worker
pub struct TcpService<H> {
    handler: Arc<H>,
}

impl<H: TcpHandler> TcpService<H> {
    pub fn new(handler: H) -> Self {
        TcpService {
            handler: Arc::new(handler),
        }
    }

    /// initialize the lifecycle and serve until the worker stops
    pub async fn start(self, lifecycle: &Lifecycle, addresses: &str) -> Result<StopStatus> {
        let listeners = lifecycle.initialize(addresses, None).await?;
        Ok(self.run(lifecycle, listeners).await)
    }

    /// serve the given listeners until the lifecycle completes
    pub async fn run(self, lifecycle: &Lifecycle, listeners: ListenerSet) -> StopStatus {
        let counter = lifecycle.counter();
        // spawn task handler for each listener
        let handlers: Vec<_> = listeners
            .into_endpoints()
            .into_iter()
            .map(|endpoint| {
                let handler = Arc::clone(&self.handler);
                tokio::spawn(accept_loop(endpoint, counter.clone(), move |stream, peer, guard| {
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        handle_connection(handler.as_ref(), stream, peer).await;
                        drop(guard);
                    });
                }))
            })
            .collect();
        info!("tcp service started");
        // waiting for the drain to finish
        let status = lifecycle.wait().await;
        future::join_all(handlers).await;
        status
    }
}

async fn handle_connection<H: TcpHandler>(handler: &H, mut stream: Stream, peer: SocketAddress) {
    handler.on_accept(&mut stream, &peer).await;
    handler.on_close(&peer).await;
    if let Err(e) = stream.shutdown().await {
        debug!(%peer, "close stream failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::Config;
    use crate::server::lifecycle::{Hooks, LifecycleOptions};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    struct Upper;

    #[async_trait]
    impl TcpHandler for Upper {
        async fn on_accept(&self, stream: &mut Stream, _peer: &SocketAddress) {
            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 {
                    break;
                }
                let upper = buf[..n].to_ascii_uppercase();
                if stream.write_all(&upper).await.is_err() {
                    break;
                }
            }
        }
    }

    fn lifecycle() -> Lifecycle {
        let options = LifecycleOptions {
            config: Some(Config::parse("app_wait_limit = 5")),
            handle_signals: false,
            drain_poll_interval: Duration::from_millis(20),
            ..LifecycleOptions::default()
        };
        Lifecycle::new(options, Hooks::new())
    }

    #[tokio::test]
    async fn serves_and_drains_live_connection() {
        let lifecycle = Arc::new(lifecycle());
        let listeners = lifecycle.initialize("127.0.0.1:0", None).await.unwrap();
        let address = *listeners.addresses()[0].as_tcp().unwrap();
        let runner = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { TcpService::new(Upper).run(&lifecycle, listeners).await })
        };

        let mut client = TcpStream::connect(address).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"HELLO");
        assert_eq!(lifecycle.counter().current(), 1);

        lifecycle.stop_handle().stop();
        tokio::time::sleep(Duration::from_millis(60)).await;
        // new connections are refused while the old one is still served
        assert!(TcpStream::connect(address).await.is_err());
        assert!(!runner.is_finished());
        client.write_all(b"bye").await.unwrap();
        let mut buf = [0u8; 3];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"BYE");

        drop(client);
        let status = runner.await.unwrap();
        assert_eq!(status, StopStatus::Normal);
        assert_eq!(lifecycle.counter().current(), 0);
    }
}
