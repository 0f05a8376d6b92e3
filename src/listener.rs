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

use std::cell::RefCell;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use crate::event::{Dispatch, EventHandler};
use crate::reactor::{EventLoop, LoopBinding};
use crate::sys;

/// Accept backlog passed to `listen(2)`.
const BACKLOG: u32 = 16;

/// Decides the fate of inbound connections on a [`SocketListenerEvent`].
///
/// Returning an event object hands the connection over: the listener
/// attaches it to its own event loop. Returning `None` drops the
/// connection on the floor.
pub trait Acceptor {
    fn accept(&self, fd: OwnedFd, event_loop: &EventLoop) -> Option<Arc<dyn EventHandler>>;
}

/// A listening socket event object. Accepts until the kernel queue drains
/// on every input edge and forwards each connection to the [`Acceptor`].
pub struct SocketListenerEvent {
    fd: OwnedFd,
    binding: LoopBinding,
    acceptor: RefCell<Option<Arc<dyn Acceptor>>>,
}

impl SocketListenerEvent {
    /// Creates a unix-domain listener bound to `path`. A stale socket file
    /// at `path` is removed first.
    pub fn unix(path: impl AsRef<Path>) -> io::Result<Arc<Self>> {
        let fd = sys::unix_stream_socket()?;
        sys::bind_unix(fd.as_raw_fd(), path.as_ref())?;
        Ok(Arc::new(Self {
            fd,
            binding: LoopBinding::new(),
            acceptor: RefCell::new(None),
        }))
    }

    /// Creates a TCP listener bound to `addr:port`. Port 0 binds an
    /// ephemeral port, reported by [`Self::local_addr`].
    pub fn tcp(addr: Ipv4Addr, port: u16) -> io::Result<Arc<Self>> {
        let fd = sys::tcp_stream_socket()?;
        sys::bind_tcp(fd.as_raw_fd(), addr, port)?;
        Ok(Arc::new(Self {
            fd,
            binding: LoopBinding::new(),
            acceptor: RefCell::new(None),
        }))
    }

    /// Starts listening for connections.
    pub fn listen(&self) -> io::Result<()> { sys::listen(self.fd.as_raw_fd(), BACKLOG) }

    /// Installs the connection acceptor, returning the previous one.
    pub fn set_acceptor(&self, acceptor: Option<Arc<dyn Acceptor>>) -> Option<Arc<dyn Acceptor>> {
        mem::replace(&mut *self.acceptor.borrow_mut(), acceptor)
    }

    /// The bound address of a TCP listener.
    pub fn local_addr(&self) -> io::Result<SocketAddrV4> {
        sys::tcp_local_addr(self.fd.as_raw_fd())
    }
}

impl EventHandler for SocketListenerEvent {
    fn fd(&self) -> RawFd { self.fd.as_raw_fd() }

    fn binding(&self) -> &LoopBinding { &self.binding }

    fn on_input(&self) -> Dispatch {
        // Edge-triggered readiness: accept until the queue is drained.
        loop {
            let conn = match sys::accept(self.fd.as_raw_fd()) {
                Ok(Some(conn)) => conn,
                Ok(None) => break,
                Err(err) => {
                    #[cfg(feature = "log")]
                    log::warn!(target: "listener", "accept failed on {}: {err}", self.fd.as_raw_fd());
                    #[cfg(not(feature = "log"))]
                    drop(err);
                    break;
                }
            };
            let Some(event_loop) = self.binding.event_loop() else {
                break;
            };
            let acceptor = self.acceptor.borrow().clone();
            let Some(acceptor) = acceptor else {
                continue;
            };
            if let Some(event) = acceptor.accept(conn, &event_loop) {
                if let Err(_err) = event_loop.attach(event) {
                    #[cfg(feature = "log")]
                    log::warn!(target: "listener", "can't attach accepted connection: {_err}");
                }
            }
        }
        Dispatch::Handled
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::net::TcpStream;

    struct Counting {
        accepted: Cell<u32>,
    }

    impl Acceptor for Counting {
        fn accept(&self, fd: OwnedFd, _event_loop: &EventLoop) -> Option<Arc<dyn EventHandler>> {
            self.accepted.set(self.accepted.get() + 1);
            drop(fd);
            None
        }
    }

    #[test]
    fn tcp_listener_reports_ephemeral_port() {
        let listener = SocketListenerEvent::tcp(Ipv4Addr::LOCALHOST, 0).unwrap();
        listener.listen().unwrap();
        assert_ne!(listener.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn accept_loop_drains_the_backlog() {
        let listener = SocketListenerEvent::tcp(Ipv4Addr::LOCALHOST, 0).unwrap();
        listener.listen().unwrap();
        let addr = listener.local_addr().unwrap();

        let acceptor = Arc::new(Counting { accepted: Cell::new(0) });
        assert!(listener.set_acceptor(Some(acceptor.clone())).is_none());

        let event_loop = EventLoop::new().unwrap();
        event_loop.attach(listener.clone()).unwrap();

        let _conns: Vec<_> = (0..3).map(|_| TcpStream::connect(addr).unwrap()).collect();
        // Handshakes complete in the kernel; drain them directly.
        std::thread::sleep(std::time::Duration::from_millis(50));
        listener.on_input();
        assert_eq!(acceptor.accepted.get(), 3);

        event_loop.detach(listener.as_ref()).unwrap();
    }

    #[test]
    fn unix_listener_replaces_stale_socket_file() {
        let path = std::env::temp_dir().join(format!("evloop-listener-{}", std::process::id()));
        {
            let first = SocketListenerEvent::unix(&path).unwrap();
            first.listen().unwrap();
        }
        // Socket file is left behind; binding again must still succeed.
        let second = SocketListenerEvent::unix(&path).unwrap();
        second.listen().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
