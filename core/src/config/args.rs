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

use clap::Args;
use tracing::debug;

/// process arguments passed by the supervisor or the operator
///
/// can be flattened into a host `clap` parser, or scanned leniently from a raw
/// argument list with [`ServiceArgs::scan`] when unknown flags must be ignored
#[derive(Args, Clone, Debug, PartialEq, Eq)]
pub struct ServiceArgs {
    /// configuration file
    #[arg(short = 'f', value_name = "PATH", default_value = "")]
    pub conf_path: String,
    /// service name
    #[arg(short = 'n', value_name = "NAME", default_value = "")]
    pub service_name: String,
    /// service socket type
    #[arg(short = 't', value_name = "TYPE", default_value = "sock")]
    pub service_type: String,
    /// run standalone, binding the given addresses
    #[arg(long = "alone")]
    pub alone: bool,
    /// verbose logging
    #[arg(short = 'v')]
    pub verbose: bool,
    /// drop privileges to the configured owner
    #[arg(short = 'u')]
    pub privilege: bool,
    /// confine the process root to the configured directory
    #[arg(short = 'c')]
    pub chroot: bool,
    /// number of inherited listening descriptors
    #[arg(short = 's', value_name = "COUNT", default_value_t = 1, value_parser = parse_socket_count)]
    pub socket_count: usize,
}

impl Default for ServiceArgs {
    fn default() -> Self {
        ServiceArgs {
            conf_path: String::new(),
            service_name: String::new(),
            service_type: String::from("sock"),
            alone: false,
            verbose: false,
            privilege: false,
            chroot: false,
            socket_count: 1,
        }
    }
}

impl ServiceArgs {
    /// scan the current process arguments
    pub fn from_env() -> Self {
        Self::scan(std::env::args())
    }

    /// scan the known flags from an argument list, anything else is skipped
    pub fn scan<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut parsed = ServiceArgs::default();
        let mut args = args.into_iter();
        while let Some(arg) = args.next() {
            match arg.as_ref() {
                "-s" => {
                    if let Some(value) = args.next() {
                        parsed.socket_count = clamp_socket_count(value.as_ref());
                    }
                }
                "-f" => {
                    if let Some(value) = args.next() {
                        parsed.conf_path = value.as_ref().to_string();
                    }
                }
                "-t" => {
                    if let Some(value) = args.next() {
                        parsed.service_type = value.as_ref().to_string();
                    }
                }
                "-n" => {
                    if let Some(value) = args.next() {
                        parsed.service_name = value.as_ref().to_string();
                    }
                }
                "-u" => parsed.privilege = true,
                "-v" => parsed.verbose = true,
                "-c" => parsed.chroot = true,
                "-alone" | "--alone" => parsed.alone = true,
                other => debug!("ignored argument: {other}"),
            }
        }
        parsed
    }
}

/// rewrite the single dash `-alone` flag to the form `clap` understands
pub fn normalize<I, S>(args: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    args.into_iter()
        .map(Into::into)
        .map(|arg| {
            if arg == "-alone" {
                String::from("--alone")
            } else {
                arg
            }
        })
        .collect()
}

/// socket count below one is treated as one
fn clamp_socket_count(raw: &str) -> usize {
    match raw.parse::<i64>() {
        Ok(n) if n > 0 => n as usize,
        _ => 1,
    }
}

fn parse_socket_count(raw: &str) -> Result<usize, String> {
    Ok(clamp_socket_count(raw))
}
