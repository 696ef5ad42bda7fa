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
use hyflux_worker::{
    Config, Hooks, Lifecycle, LifecycleOptions, LifecycleState, RunMode, ServiceArgs,
    SocketAddress, StopStatus, Stream, TcpHandler, TcpService,
};
use nix::unistd::dup2;
use parking_lot::Mutex;
use std::os::unix::io::AsRawFd;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UnixStream};

struct Echo;

#[async_trait]
impl TcpHandler for Echo {
    async fn on_accept(&self, stream: &mut Stream, _peer: &SocketAddress) {
        let mut buf = [0u8; 256];
        loop {
            match stream.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

fn options(config: &str) -> LifecycleOptions {
    LifecycleOptions {
        config: Some(Config::parse(config)),
        handle_signals: false,
        drain_poll_interval: Duration::from_millis(20),
        ..LifecycleOptions::default()
    }
}

async fn wait_state(lifecycle: &Lifecycle, state: LifecycleState) {
    let mut states = lifecycle.subscribe_state();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == state))
        .await
        .expect("state not reached")
        .unwrap();
}

#[tokio::test]
async fn standalone_echo_over_unix_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("echo.sock");
    let exits = Arc::new(Mutex::new(0));
    let hooks = {
        let exits = Arc::clone(&exits);
        Hooks::new().on_exit(move || *exits.lock() += 1)
    };
    let lifecycle = Arc::new(Lifecycle::new(options(""), hooks));
    let runner = {
        let lifecycle = Arc::clone(&lifecycle);
        let address = path.to_string_lossy().into_owned();
        tokio::spawn(async move { TcpService::new(Echo).start(&lifecycle, &address).await })
    };
    wait_state(&lifecycle, LifecycleState::Running).await;
    assert_eq!(lifecycle.run_mode(), Some(RunMode::Standalone));

    let mut client = UnixStream::connect(&path).await.unwrap();
    client.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    drop(client);

    lifecycle.stop_handle().stop();
    let status = runner.await.unwrap().unwrap();
    assert_eq!(status, StopStatus::Normal);
    assert_eq!(lifecycle.state(), LifecycleState::Stopped);
    assert_eq!(*exits.lock(), 1);
    assert_eq!(lifecycle.counter().current(), 0);
}

#[tokio::test]
async fn supervised_worker_stops_when_control_channel_closes() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let address = listener.local_addr().unwrap();
    dup2(listener.as_raw_fd(), 830).unwrap();
    drop(listener);
    let (control, supervisor) = std::os::unix::net::UnixStream::pair().unwrap();
    dup2(control.as_raw_fd(), 829).unwrap();
    drop(control);

    let options = LifecycleOptions {
        args: ServiceArgs {
            socket_count: 1,
            ..ServiceArgs::default()
        },
        control_fd: 829,
        listen_fd_start: 830,
        ..options("")
    };
    let lifecycle = Arc::new(Lifecycle::new(options, Hooks::new()));
    let runner = {
        let lifecycle = Arc::clone(&lifecycle);
        tokio::spawn(async move { TcpService::new(Echo).start(&lifecycle, "").await })
    };
    wait_state(&lifecycle, LifecycleState::Running).await;
    assert_eq!(lifecycle.run_mode(), Some(RunMode::Supervised));

    let mut client = TcpStream::connect(address).await.unwrap();
    client.write_all(b"inherited").await.unwrap();
    let mut buf = [0u8; 9];
    client.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"inherited");

    // the supervisor going away starts the drain, the open client keeps it alive
    drop(supervisor);
    wait_state(&lifecycle, LifecycleState::Draining).await;
    assert!(lifecycle.is_stopping());
    assert!(!runner.is_finished());

    drop(client);
    let status = runner.await.unwrap().unwrap();
    assert_eq!(status, StopStatus::Normal);
}

#[tokio::test]
async fn supervised_worker_without_control_channel_fails() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    dup2(listener.as_raw_fd(), 840).unwrap();
    drop(listener);

    let options = LifecycleOptions {
        control_fd: 839,
        listen_fd_start: 840,
        ..options("")
    };
    let lifecycle = Lifecycle::new(options, Hooks::new());
    let err = lifecycle.initialize("", None).await.unwrap_err();
    assert!(matches!(err, hyflux_worker::Error::ControlChannel { fd: 839, .. }));
}

#[tokio::test]
async fn stop_is_idempotent() {
    let lifecycle = Lifecycle::new(options(""), Hooks::new());
    let _listeners = lifecycle.initialize("127.0.0.1:0", None).await.unwrap();
    let stop = lifecycle.stop_handle();
    stop.stop();
    stop.stop();
    lifecycle.stop_handle().stop();
    assert_eq!(lifecycle.wait().await, StopStatus::Normal);
    // later waiters see the recorded outcome
    assert_eq!(lifecycle.wait().await, StopStatus::Normal);
}
