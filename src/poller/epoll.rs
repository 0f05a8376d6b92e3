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

//! Edge-triggered epoll multiplexer backend, the reference engine of the
//! reactor.

use std::collections::VecDeque;
use std::io;
use std::mem;
use std::os::fd::{FromRawFd, OwnedFd};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use crate::poller::{IoFail, IoType, Poll};

/// Size of the per-wait event batch, matching the reactor's dispatch batch.
const MAX_EVENTS: usize = 16;

/// Manager for a set of descriptors polled by the reactor through the Linux
/// epoll facility in edge-triggered mode.
pub struct Epoll {
    epfd: OwnedFd,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Epoll {
    pub fn new() -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: empty!(),
        })
    }

    fn interest_bits(interest: IoType) -> u32 {
        let mut bits = (libc::EPOLLET | libc::EPOLLERR | libc::EPOLLHUP | libc::EPOLLRDHUP) as u32;
        if interest.read {
            bits |= libc::EPOLLIN as u32;
        }
        if interest.write {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, bits: u32) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: bits,
            u64: fd as u64,
        };
        let ep = if op == libc::EPOLL_CTL_DEL {
            std::ptr::null_mut()
        } else {
            &mut ev
        };
        if unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, ep) } < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

impl Poll for Epoll {
    fn register(&mut self, fd: RawFd, interest: IoType) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "epoll", "Registering {fd} with interest `{interest}`");

        self.ctl(libc::EPOLL_CTL_ADD, fd, Self::interest_bits(interest))
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "epoll", "Unregistering {fd}");

        match self.ctl(libc::EPOLL_CTL_DEL, fd, 0) {
            // Already gone, most likely closed before deregistration.
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            other => other,
        }
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) => t.as_millis().min(libc::c_int::MAX as u128) as libc::c_int,
        };

        let mut buf: [libc::epoll_event; MAX_EVENTS] = unsafe { mem::zeroed() };
        let count = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                buf.as_mut_ptr(),
                MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        if count < 0 {
            return Err(io::Error::last_os_error());
        }

        for ev in &buf[..count as usize] {
            let bits = ev.events;
            let fd = ev.u64 as RawFd;
            let res = if bits & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0 {
                Err(IoFail::Connectivity(bits))
            } else if bits & libc::EPOLLERR as u32 != 0 {
                Err(IoFail::Os(bits))
            } else {
                Ok(IoType {
                    read: bits & libc::EPOLLIN as u32 != 0,
                    write: bits & libc::EPOLLOUT as u32 != 0,
                })
            };

            #[cfg(feature = "log")]
            log::trace!(target: "epoll", "Got `{res:?}` for {fd}");

            self.events.push_back((fd, res));
        }

        Ok(count as usize)
    }

    fn next(&mut self) -> Option<(RawFd, Result<IoType, IoFail>)> { self.events.pop_front() }
}
