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

//! worker side process runtime for services launched by a master supervisor
//! or started standalone. it acquires listening sockets, drops privileges,
//! watches the supervisor control channel and drains live connections
//! before the process exits.

pub mod config;
pub mod error;
pub mod network;
pub mod observability;
pub mod server;
pub mod service;

pub use config::args::ServiceArgs;
pub use config::settings::Settings;
pub use config::store::Config;
pub use error::{Error, Result};
pub use network::listener::{ListenerHandle, ListenerSet, ServiceEndpoint};
pub use network::socket::SocketAddress;
pub use network::stream::Stream;
pub use server::counter::{ConnectionCounter, ConnectionGuard};
pub use server::lifecycle::{Hooks, Lifecycle, LifecycleOptions, LifecycleState, RunMode, StopHandle};
pub use server::monitor::StopStatus;
pub use server::runtime::Runtime;
pub use service::tcp::{TcpHandler, TcpService};
pub use service::web::{WebHandler, WebService};
