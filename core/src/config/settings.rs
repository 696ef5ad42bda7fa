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

use std::path::PathBuf;
use std::time::Duration;

use super::store::Config;

/// drain wait limit used when the configuration does not set one
pub const DEFAULT_WAIT_LIMIT: i64 = 10;

/// typed view over the worker configuration keys
#[derive(Clone, Debug)]
pub struct Settings {
    /// log file path
    pub master_log: String,
    /// service entry as declared to the supervisor
    pub master_service: String,
    /// unix user the worker drops to
    pub master_owner: String,
    /// non-empty when the process was launched by a supervisor
    pub master_args: String,
    /// root directory used for confinement
    pub root_dir: String,
    pub use_limit: i64,
    pub idle_limit: i64,
    /// skip waiting for live connections when draining
    pub quick_abort: bool,
    /// drain wait limit in seconds, 0 or negative waits forever
    pub wait_limit: i64,
    pub access_allow: String,
    /// worker thread hint, 0 keeps the runtime default
    pub threads: i64,
    pub tls_cert_file: String,
    pub tls_key_file: String,
}

impl Default for Settings {
    fn default() -> Self {
        Settings::from_config(&Config::new())
    }
}

impl Settings {
    /// read every known key from the configuration store
    pub fn from_config(config: &Config) -> Self {
        let access_allow = match config.get_string("app_access_allow") {
            value if value.is_empty() => String::from("all"),
            value => value,
        };
        Settings {
            master_log: config.get_string("master_log"),
            master_service: config.get_string("master_service"),
            master_owner: config.get_string("master_owner"),
            master_args: config.get_string("master_args"),
            root_dir: config.get_string("app_queue_dir"),
            use_limit: config.get_int("app_use_limit"),
            idle_limit: config.get_int("app_idle_limit"),
            quick_abort: config.get_bool("app_quick_abort"),
            wait_limit: config.get_int_or("app_wait_limit", DEFAULT_WAIT_LIMIT),
            access_allow,
            threads: config.get_int("app_threads"),
            tls_cert_file: config.get_string("tls_cert_file"),
            tls_key_file: config.get_string("tls_key_file"),
        }
    }

    /// drain wait limit, `None` when waiting is unbounded
    pub fn wait_limit(&self) -> Option<Duration> {
        u64::try_from(self.wait_limit)
            .ok()
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// check whether a supervisor started this process
    pub fn launched_by_supervisor(&self) -> bool {
        !self.master_args.is_empty()
    }

    /// worker thread count for the runtime
    pub fn worker_threads(&self) -> Option<usize> {
        usize::try_from(self.threads).ok().filter(|n| *n > 0)
    }

    /// log file destination if configured
    pub fn log_path(&self) -> Option<PathBuf> {
        (!self.master_log.is_empty()).then(|| PathBuf::from(&self.master_log))
    }
}
