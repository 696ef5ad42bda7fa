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

use std::io;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// worker runtime result type
pub type Result<T> = std::result::Result<T, Error>;

/// fatal errors reported by the worker runtime
///
/// partial failures (a single address that can not be bound, a privilege
/// drop that is refused) are logged where they happen and never surface here
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// the configuration file was named but could not be read
    #[error("failed to read configuration {path}: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    /// standalone mode was requested with an empty address list
    #[error("no valid addresses for listening")]
    NoAddresses,
    /// every bind or every inherited descriptor failed
    #[error("no listeners were created")]
    NoListeners,
    /// the supervisor control descriptor is unusable
    #[error("control channel fd {fd} unavailable: {source}")]
    ControlChannel {
        fd: RawFd,
        #[source]
        source: io::Error,
    },
    /// the lifecycle was already initialized
    #[error("lifecycle already initialized")]
    AlreadyInitialized,
    #[error(transparent)]
    Io(#[from] io::Error),
}
