// Callback-driven I/O event loop with a hierarchical timer wheel.
//
// SPDX-License-Identifier: Apache-2.0
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Thin safe wrappers over the raw OS surface the event objects are built
//! from: nonblocking stream sockets (Unix-domain and TCP/IPv4), eventfd and
//! timerfd wake sources, and EINTR-tolerant read/write primitives. All
//! `unsafe` of the crate lives here.

use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::Path;
use std::time::Duration;
use std::{fs, io};

/// Outcome of a single nonblocking read or write attempt.
pub(crate) enum IoStatus {
    /// The syscall transferred this many bytes (may be short).
    Done(usize),
    /// The operation would block; retry on the next readiness notification.
    WouldBlock,
    /// Orderly end of stream (read returned zero).
    Closed,
    /// A hard I/O error.
    Err(io::Error),
}

fn cvt(ret: libc::c_int) -> io::Result<libc::c_int> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Reads once from `fd`, retrying on EINTR.
pub(crate) fn read_fd(fd: RawFd, buf: &mut [u8]) -> IoStatus {
    loop {
        let ret = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
        if ret > 0 {
            return IoStatus::Done(ret as usize);
        }
        if ret == 0 {
            return IoStatus::Closed;
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return IoStatus::WouldBlock,
            _ => return IoStatus::Err(err),
        }
    }
}

/// Writes once to `fd`, retrying on EINTR.
pub(crate) fn write_fd(fd: RawFd, buf: &[u8]) -> IoStatus {
    loop {
        let ret = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, buf.len()) };
        if ret >= 0 {
            return IoStatus::Done(ret as usize);
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return IoStatus::WouldBlock,
            _ => return IoStatus::Err(err),
        }
    }
}

/// Creates a nonblocking eventfd wake source.
pub(crate) fn eventfd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe { libc::eventfd(0, libc::EFD_CLOEXEC | libc::EFD_NONBLOCK) })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Posts one wake-up to an eventfd.
pub(crate) fn notify_eventfd(fd: RawFd) -> io::Result<()> {
    let val = 1u64.to_ne_bytes();
    match write_fd(fd, &val) {
        // A full counter still counts as a delivered wake-up.
        IoStatus::Done(_) | IoStatus::WouldBlock => Ok(()),
        IoStatus::Closed => Err(io::ErrorKind::BrokenPipe.into()),
        IoStatus::Err(e) => Err(e),
    }
}

/// Consumes all pending wake-ups of an eventfd or timerfd counter.
pub(crate) fn drain_counter(fd: RawFd) {
    let mut buf = [0u8; 8];
    loop {
        match read_fd(fd, &mut buf) {
            IoStatus::Done(_) => continue,
            _ => break,
        }
    }
}

/// Creates a disarmed nonblocking monotonic timerfd.
pub(crate) fn timerfd() -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Arms a timerfd to fire periodically.
pub(crate) fn arm_timerfd(fd: RawFd, period: Duration) -> io::Result<()> {
    let spec = libc::itimerspec {
        it_interval: libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        },
        it_value: libc::timespec {
            tv_sec: period.as_secs() as libc::time_t,
            tv_nsec: period.subsec_nanos() as libc::c_long,
        },
    };
    cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) })?;
    Ok(())
}

/// Disarms a timerfd; no further expirations are generated.
pub(crate) fn disarm_timerfd(fd: RawFd) -> io::Result<()> {
    let spec: libc::itimerspec = unsafe { mem::zeroed() };
    cvt(unsafe { libc::timerfd_settime(fd, 0, &spec, std::ptr::null_mut()) })?;
    Ok(())
}

fn stream_socket(family: libc::c_int) -> io::Result<OwnedFd> {
    let fd = cvt(unsafe {
        libc::socket(
            family,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Creates a nonblocking Unix-domain stream socket.
pub(crate) fn unix_stream_socket() -> io::Result<OwnedFd> {
    stream_socket(libc::AF_UNIX)
}

/// Creates a nonblocking TCP/IPv4 stream socket.
pub(crate) fn tcp_stream_socket() -> io::Result<OwnedFd> {
    stream_socket(libc::AF_INET)
}

fn sockaddr_un(path: &Path) -> io::Result<(libc::sockaddr_un, libc::socklen_t)> {
    use std::os::unix::ffi::OsStrExt;

    let mut addr: libc::sockaddr_un = unsafe { mem::zeroed() };
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;

    let bytes = path.as_os_str().as_bytes();
    if bytes.is_empty() || bytes.len() >= addr.sun_path.len() {
        return Err(io::ErrorKind::InvalidInput.into());
    }
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
    Ok((addr, len as libc::socklen_t))
}

fn sockaddr_in(addr: SocketAddrV4) -> libc::sockaddr_in {
    libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from(*addr.ip()).to_be(),
        },
        sin_zero: [0; 8],
    }
}

/// Binds a Unix-domain socket to a filesystem path, unlinking a stale path
/// first.
pub(crate) fn bind_unix(fd: RawFd, path: &Path) -> io::Result<()> {
    let _ = fs::remove_file(path);
    let (addr, len) = sockaddr_un(path)?;
    cvt(unsafe { libc::bind(fd, &addr as *const _ as *const libc::sockaddr, len) })?;
    Ok(())
}

/// Binds a TCP/IPv4 socket to an address and port.
pub(crate) fn bind_tcp(fd: RawFd, ip: Ipv4Addr, port: u16) -> io::Result<()> {
    let addr = sockaddr_in(SocketAddrV4::new(ip, port));
    cvt(unsafe {
        libc::bind(
            fd,
            &addr as *const _ as *const libc::sockaddr,
            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
        )
    })?;
    Ok(())
}

/// Enables the listen backlog on a bound socket.
pub(crate) fn listen(fd: RawFd, backlog: u32) -> io::Result<()> {
    cvt(unsafe { libc::listen(fd, backlog as libc::c_int) })?;
    Ok(())
}

/// Accepts one pending connection; `None` when the accept would block.
/// The returned descriptor is nonblocking.
pub(crate) fn accept(fd: RawFd) -> io::Result<Option<OwnedFd>> {
    loop {
        let conn = unsafe {
            libc::accept4(
                fd,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            )
        };
        if conn >= 0 {
            return Ok(Some(unsafe { OwnedFd::from_raw_fd(conn) }));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock => return Ok(None),
            io::ErrorKind::Interrupted => continue,
            _ => return Err(err),
        }
    }
}

fn connect(fd: RawFd, addr: *const libc::sockaddr, len: libc::socklen_t) -> io::Result<()> {
    if unsafe { libc::connect(fd, addr, len) } == 0 {
        return Ok(());
    }
    let err = io::Error::last_os_error();
    // In-progress is the expected outcome of a nonblocking connect.
    if err.raw_os_error() == Some(libc::EINPROGRESS) {
        Ok(())
    } else {
        Err(err)
    }
}

/// Starts a nonblocking connect towards a Unix-domain server path.
pub(crate) fn connect_unix(fd: RawFd, path: &Path) -> io::Result<()> {
    let (addr, len) = sockaddr_un(path)?;
    connect(fd, &addr as *const _ as *const libc::sockaddr, len)
}

/// Starts a nonblocking connect towards a TCP/IPv4 address.
pub(crate) fn connect_tcp(fd: RawFd, addr: SocketAddrV4) -> io::Result<()> {
    let sin = sockaddr_in(addr);
    connect(
        fd,
        &sin as *const _ as *const libc::sockaddr,
        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
    )
}

/// Reads and clears the socket's pending error (`SO_ERROR`).
pub(crate) fn take_socket_error(fd: RawFd) -> io::Result<i32> {
    let mut err: libc::c_int = 0;
    let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
    cvt(unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    })?;
    Ok(err)
}

/// Local address of a bound TCP/IPv4 socket.
pub(crate) fn tcp_local_addr(fd: RawFd) -> io::Result<SocketAddrV4> {
    let mut addr: libc::sockaddr_in = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len) })?;
    Ok(SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr)),
        u16::from_be(addr.sin_port),
    ))
}
