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
use bytes::Bytes;
use futures::future;
use http::header::{HeaderValue, DATE};
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::SystemTime;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::error::Result;
use crate::network::listener::{ListenerHandle, ListenerSet};
use crate::network::socket::SocketAddress;
use crate::network::stream::Stream;
use crate::server::lifecycle::{Lifecycle, OnStop};
use crate::server::monitor::StopStatus;

use super::acceptor::accept_loop;

/// application logic of an http service
#[async_trait]
pub trait WebHandler: Send + Sync + 'static {
    async fn handle(&self, request: Request<Incoming>, peer: &SocketAddress) -> Response<Full<Bytes>>;
}

/// http/1 service, keep-alive connections are shut down gracefully on stop
pub struct WebService<H> {
    handler: Arc<H>,
    shutdown: Arc<watch::Sender<bool>>,
}

impl<H: WebHandler> WebService<H> {
    pub fn new(handler: H) -> Self {
        let (shutdown, _) = watch::channel(false);
        WebService {
            handler: Arc::new(handler),
            shutdown: Arc::new(shutdown),
        }
    }

    /// stop callback closing the listeners and asking every open connection
    /// to finish its in-flight request
    pub fn on_stop(&self) -> OnStop {
        let shutdown = Arc::clone(&self.shutdown);
        Box::new(move |handle: ListenerHandle| {
            handle.close_all();
            shutdown.send_replace(true);
        })
    }

    /// initialize the lifecycle and serve until the worker stops
    pub async fn start(self, lifecycle: &Lifecycle, addresses: &str) -> Result<StopStatus> {
        let listeners = lifecycle.initialize(addresses, Some(self.on_stop())).await?;
        Ok(self.run(lifecycle, listeners).await)
    }

    /// serve listeners acquired with `on_stop` registered
    pub async fn run(self, lifecycle: &Lifecycle, listeners: ListenerSet) -> StopStatus {
        let counter = lifecycle.counter();
        let handlers: Vec<_> = listeners
            .into_endpoints()
            .into_iter()
            .map(|endpoint| {
                let handler = Arc::clone(&self.handler);
                let shutdown = Arc::clone(&self.shutdown);
                tokio::spawn(accept_loop(endpoint, counter.clone(), move |stream, peer, guard| {
                    let handler = Arc::clone(&handler);
                    let shutdown = shutdown.subscribe();
                    tokio::spawn(async move {
                        serve_connection(handler, stream, peer, shutdown).await;
                        drop(guard);
                    });
                }))
            })
            .collect();
        info!("web service started");
        let status = lifecycle.wait().await;
        future::join_all(handlers).await;
        status
    }
}

async fn serve_connection<H: WebHandler>(
    handler: Arc<H>,
    stream: Stream,
    peer: SocketAddress,
    mut shutdown: watch::Receiver<bool>,
) {
    let remote = peer.clone();
    let service = service_fn(move |request: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        let peer = remote.clone();
        async move {
            let mut response = handler.handle(request, &peer).await;
            stamp_date(&mut response);
            Ok::<_, Infallible>(response)
        }
    });
    let connection = http1::Builder::new()
        .keep_alive(true)
        .serve_connection(TokioIo::new(stream), service);
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown_requested(&mut shutdown) => {
            connection.as_mut().graceful_shutdown();
            connection.as_mut().await
        }
    };
    if let Err(e) = result {
        debug!(%peer, "http connection error: {e}");
    }
}

/// resolves once a graceful shutdown was asked for, never if the service is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    // the borrowed value must not outlive this future
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        future::pending::<()>().await;
    }
}

fn stamp_date<B>(response: &mut Response<B>) {
    let headers = response.headers_mut();
    if headers.contains_key(DATE) {
        return;
    }
    if let Ok(value) = HeaderValue::from_str(&httpdate::fmt_http_date(SystemTime::now())) {
        headers.insert(DATE, value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::store::Config;
    use crate::server::lifecycle::{Hooks, LifecycleOptions};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;

    struct Pong;

    #[async_trait]
    impl WebHandler for Pong {
        async fn handle(&self, request: Request<Incoming>, _peer: &SocketAddress) -> Response<Full<Bytes>> {
            let body = format!("pong {}", request.uri().path());
            Response::new(Full::new(Bytes::from(body)))
        }
    }

    async fn read_until(stream: &mut TcpStream, needle: &str) -> String {
        let mut received = Vec::new();
        let mut buf = [0u8; 1024];
        while !String::from_utf8_lossy(&received).contains(needle) {
            let n = stream.read(&mut buf).await.unwrap();
            assert!(n > 0, "connection closed early");
            received.extend_from_slice(&buf[..n]);
        }
        String::from_utf8_lossy(&received).into_owned()
    }

    #[test]
    fn keeps_existing_date_header() {
        let mut response = Response::new(());
        response.headers_mut().insert(DATE, HeaderValue::from_static("yesterday"));
        stamp_date(&mut response);
        assert_eq!(response.headers()[DATE], "yesterday");

        let mut response = Response::new(());
        stamp_date(&mut response);
        assert!(response.headers().contains_key(DATE));
    }

    #[tokio::test]
    async fn spawned_connection_finishes_in_flight_request() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let (shutdown, receiver) = watch::channel(false);
        let server = tokio::spawn(async move {
            let (stream, peer) = listener.accept().await.unwrap();
            serve_connection(
                Arc::new(Pong),
                Stream::from(stream),
                SocketAddress::from(peer),
                receiver,
            )
            .await;
        });

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(b"GET /late HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_until(&mut client, "pong /late").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));

        shutdown.send_replace(true);
        tokio::time::timeout(Duration::from_secs(2), server)
            .await
            .unwrap()
            .unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }

    #[tokio::test]
    async fn idle_keep_alive_closed_on_stop() {
        let options = LifecycleOptions {
            config: Some(Config::parse("app_wait_limit = 5")),
            handle_signals: false,
            drain_poll_interval: Duration::from_millis(20),
            ..LifecycleOptions::default()
        };
        let lifecycle = Arc::new(Lifecycle::new(options, Hooks::new()));
        let service = WebService::new(Pong);
        let listeners = lifecycle
            .initialize("127.0.0.1:0", Some(service.on_stop()))
            .await
            .unwrap();
        let address = *listeners.addresses()[0].as_tcp().unwrap();
        let runner = {
            let lifecycle = Arc::clone(&lifecycle);
            tokio::spawn(async move { service.run(&lifecycle, listeners).await })
        };

        let mut client = TcpStream::connect(address).await.unwrap();
        client
            .write_all(b"GET /ping HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();
        let response = read_until(&mut client, "pong /ping").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.to_ascii_lowercase().contains("date:"));

        lifecycle.stop_handle().stop();
        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), client.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        let status = runner.await.unwrap();
        assert_eq!(status, StopStatus::Normal);
    }
}
