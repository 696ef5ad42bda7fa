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

use libc::{self, c_int, c_void, socklen_t};
use std::{
    io::{self, Error},
    mem,
    os::unix::io::RawFd,
};

/// wrapper used to set socket options
fn set_socket_option<T: Copy>(
    fd: RawFd,
    level: c_int,
    optname: c_int,
    value: &T,
) -> io::Result<()> {
    let result = unsafe {
        libc::setsockopt(
            fd,
            level,
            optname,
            value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if result == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(())
    }
}

/// wrapper used to read integer socket options
fn get_socket_option(fd: RawFd, level: c_int, optname: c_int) -> io::Result<c_int> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let result = unsafe {
        libc::getsockopt(
            fd,
            level,
            optname,
            &mut value as *mut c_int as *mut c_void,
            &mut len,
        )
    };

    if result == -1 {
        Err(Error::last_os_error())
    } else {
        Ok(value)
    }
}

/// Enable port reuse on a socket.
/// This allows a restarted worker to bind the same port while the old
/// sockets linger in TIME-WAIT.
pub fn set_reuse_port(fd: RawFd) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEPORT, &(1 as c_int))
}

/// Enable address reuse on a socket.
pub fn set_reuse_addr(fd: RawFd) -> io::Result<()> {
    set_socket_option(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &(1 as c_int))
}

/// Check whether the socket is in the listening state (SO_ACCEPTCONN).
pub fn is_listening(fd: RawFd) -> io::Result<bool> {
    get_socket_option(fd, libc::SOL_SOCKET, libc::SO_ACCEPTCONN).map(|v| v != 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::io::AsRawFd;

    #[test]
    fn listening_socket_is_detected() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        assert!(is_listening(listener.as_raw_fd()).unwrap());
    }

    #[test]
    fn connected_socket_is_not_listening() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = std::net::TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        assert!(!is_listening(stream.as_raw_fd()).unwrap());
    }

    #[test]
    fn regular_file_is_rejected() {
        let file = tempfile::tempfile().unwrap();
        assert!(is_listening(file.as_raw_fd()).is_err());
    }

    #[test]
    fn reuse_options_apply() {
        let socket = socket2::Socket::new(socket2::Domain::IPV4, socket2::Type::STREAM, None).unwrap();
        set_reuse_addr(socket.as_raw_fd()).unwrap();
        set_reuse_port(socket.as_raw_fd()).unwrap();
        assert!(socket.reuse_address().unwrap());
        assert!(socket.reuse_port().unwrap());
    }
}
