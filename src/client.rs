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

use std::cell::{Cell, RefCell};
use std::net::{SocketAddrV4, ToSocketAddrs};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::Path;
use std::sync::Arc;

use crate::event::{Dispatch, EventHandler};
use crate::reactor::{Error, LoopBinding};
use crate::stream::{ClientError, ClientListener, StreamCore};
use crate::sys;
use crate::timer::Timer;

/// Connection attempts not finished within this window are timed out.
const CONNECT_TIMEOUT_MS: u32 = 5000;

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
enum SockDomain {
    Unix,
    Tcp,
}

/// An outbound, non-blocking stream connection.
///
/// The socket is created up front; the connect itself happens against an
/// attached event object, since connection progress is reported through
/// the event loop. The sequence is:
///
/// 1. [`AsyncClientEvent::unix`] or [`AsyncClientEvent::tcp`], then
///    [`crate::stream::StreamCore::set_listener`] via [`Self::set_listener`];
/// 2. attach to an [`crate::EventLoop`];
/// 3. [`Self::connect_unix`], [`Self::connect_tcp`] or
///    [`Self::connect_host`];
/// 4. the listener hears `on_connected`, or `on_error` with
///    [`ClientError::FailToConnect`] / [`ClientError::ConnectionTimeout`].
///
/// [`Self::disconnect`] is graceful: queued output is flushed first, the
/// object detaches itself once the backlog drains.
pub struct AsyncClientEvent {
    core: StreamCore,
    binding: LoopBinding,
    domain: SockDomain,
    connected: Cell<bool>,
    connect_failed: Cell<bool>,
    disconnecting: Cell<bool>,
    timed_out: Cell<bool>,
    timeout: RefCell<Option<Timer>>,
    timeout_ms: Cell<u32>,
}

impl AsyncClientEvent {
    /// Creates a unix-domain client whose own endpoint is bound to
    /// `client_path` (a stale socket file there is removed first).
    pub fn unix(client_path: impl AsRef<Path>) -> Result<Arc<Self>, Error> {
        let fd = sys::unix_stream_socket()?;
        sys::bind_unix(fd.as_raw_fd(), client_path.as_ref())?;
        Ok(Self::with(StreamCore::new(fd), SockDomain::Unix))
    }

    /// Creates a TCP client.
    pub fn tcp() -> Result<Arc<Self>, Error> {
        let fd = sys::tcp_stream_socket()?;
        Ok(Self::with(StreamCore::new(fd), SockDomain::Tcp))
    }

    fn with(core: StreamCore, domain: SockDomain) -> Arc<Self> {
        Arc::new(Self {
            core,
            binding: LoopBinding::new(),
            domain,
            connected: Cell::new(false),
            connect_failed: Cell::new(false),
            disconnecting: Cell::new(false),
            timed_out: Cell::new(false),
            timeout: RefCell::new(None),
            timeout_ms: Cell::new(CONNECT_TIMEOUT_MS),
        })
    }

    pub fn core(&self) -> &StreamCore { &self.core }

    pub fn set_listener(&self, lnr: Option<Arc<dyn ClientListener>>) {
        self.core.set_listener(lnr)
    }

    pub fn write(&self, data: &[u8]) -> usize { self.core.write(data) }

    /// Whether the connection is up.
    pub fn is_connected(&self) -> bool { self.connected.get() }

    /// Whether the last connection attempt hit the connect timeout.
    pub fn is_timed_out(&self) -> bool { self.timed_out.get() }

    /// Overrides the connect timeout. Takes effect on the next connect
    /// call.
    pub fn set_connect_timeout(&self, timeout_ms: u32) { self.timeout_ms.set(timeout_ms) }

    /// Begins connecting to the unix-domain server at `server_path`.
    pub fn connect_unix(self: &Arc<Self>, server_path: impl AsRef<Path>) -> Result<(), Error> {
        if self.domain != SockDomain::Unix {
            return Err(Error::InvalidArgument);
        }
        let fd = self.connectable_fd()?;
        sys::connect_unix(fd, server_path.as_ref())?;
        self.start_timeout_counter()
    }

    /// Begins connecting to a TCP endpoint.
    pub fn connect_tcp(self: &Arc<Self>, addr: SocketAddrV4) -> Result<(), Error> {
        if self.domain != SockDomain::Tcp {
            return Err(Error::InvalidArgument);
        }
        let fd = self.connectable_fd()?;
        sys::connect_tcp(fd, addr)?;
        self.start_timeout_counter()
    }

    /// Resolves `host` and begins connecting to its first IPv4 address.
    pub fn connect_host(self: &Arc<Self>, host: &str, port: u16) -> Result<(), Error> {
        if host.is_empty() {
            return Err(Error::InvalidArgument);
        }
        let addr = (host, port)
            .to_socket_addrs()?
            .find_map(|addr| match addr {
                std::net::SocketAddr::V4(v4) => Some(v4),
                std::net::SocketAddr::V6(_) => None,
            })
            .ok_or(Error::NotFound)?;
        self.connect_tcp(addr)
    }

    /// Tears the connection down, draining queued output first. Calling
    /// it again while the teardown is in progress is a no-op.
    pub fn disconnect(&self) {
        if self.disconnecting.replace(true) {
            return;
        }
        if !self.core.pending_output() && self.core.raw_fd().is_some() {
            self.finish_disconnect();
        }
        // Otherwise the drain completes in on_output.
    }

    fn connectable_fd(&self) -> Result<RawFd, Error> {
        // Connect progress arrives as readiness events, so the object must
        // already be attached.
        if self.binding.event_loop().is_none() {
            return Err(Error::NotAllowed);
        }
        self.core.raw_fd().ok_or(Error::NotAllowed)
    }

    fn start_timeout_counter(self: &Arc<Self>) -> Result<(), Error> {
        self.stop_timeout_counter();
        let event_loop = self.binding.event_loop().ok_or(Error::NotAllowed)?;
        let this = Arc::downgrade(self);
        let timer = Timer::new(event_loop.timers(), self.timeout_ms.get(), move || {
            let Some(client) = this.upgrade() else {
                return;
            };
            client.timed_out.set(true);
            if let Some(lnr) = client.core.listener() {
                lnr.on_error(ClientError::ConnectionTimeout);
            }
            client.disconnect();
        });
        timer.start();
        *self.timeout.borrow_mut() = Some(timer);
        Ok(())
    }

    fn stop_timeout_counter(&self) {
        // Dropping the timer cancels any pending expiry.
        self.timeout.borrow_mut().take();
    }

    fn finish_disconnect(&self) {
        self.disconnecting.set(true);
        self.connected.set(false);
        if let Some(lnr) = self.core.listener() {
            lnr.on_disconnected();
        }
        self.core.set_listener(None);
        if let Some(event_loop) = self.binding.event_loop() {
            let _ = event_loop.detach(self);
        }
        self.core.close();
    }
}

impl EventHandler for AsyncClientEvent {
    fn fd(&self) -> RawFd { self.core.raw_fd().unwrap_or(-1) }

    fn binding(&self) -> &LoopBinding { &self.binding }

    // Input drains unconditionally: under edge-triggered readiness data the
    // peer sent right at accept time coalesces with the connect completion
    // into a single report, and reads dispatch ahead of the writability
    // that flips the connected flag.
    fn on_input(&self) -> Dispatch { self.core.handle_input() }

    fn on_output(&self) -> Dispatch {
        if !self.connected.get() {
            if self.connect_failed.get() {
                return Dispatch::Handled;
            }
            // Still connecting: writability resolves the attempt.
            match self.core.raw_fd().map(sys::take_socket_error) {
                Some(Ok(0)) => {
                    self.connected.set(true);
                    self.stop_timeout_counter();
                    if let Some(lnr) = self.core.listener() {
                        lnr.on_connected();
                    }
                }
                // The failure surfaces as a hangup edge.
                _ => return Dispatch::Handled,
            }
        }
        // Output queued before the connect resolved flushes on the same
        // writability report, and so does a disconnect deferred behind it.
        let ret = self.core.handle_output();
        if self.disconnecting.get() && !self.core.pending_output() && self.core.raw_fd().is_some() {
            self.finish_disconnect();
        }
        ret
    }

    fn on_hungup(&self) {
        if !self.connected.get() {
            self.connect_failed.set(true);
            self.stop_timeout_counter();
            if let Some(lnr) = self.core.listener() {
                lnr.on_error(ClientError::FailToConnect);
            }
        }
        self.disconnecting.set(true);
        // A hangup can land while a graceful disconnect still drains; the
        // descriptor tells whether the teardown already completed.
        if self.core.raw_fd().is_some() {
            self.finish_disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listener::{Acceptor, SocketListenerEvent};
    use crate::reactor::EventLoop;
    use crate::stream::StreamEvent;
    use std::net::Ipv4Addr;
    use std::os::fd::OwnedFd;
    use std::rc::Rc;

    /// Accepts connections as echoing stream events. Listeners are weakly
    /// held by the events, so the acceptor keeps them alive.
    #[derive(Default)]
    struct Echo {
        _spawned: RefCell<Vec<Arc<EchoBack>>>,
    }

    struct EchoBack {
        event: RefCell<Option<Arc<StreamEvent>>>,
    }

    impl ClientListener for EchoBack {
        fn on_data(&self, data: &[u8]) {
            if let Some(event) = self.event.borrow().as_ref() {
                event.write(data);
            }
        }

        fn on_disconnected(&self) { self.event.borrow_mut().take(); }
    }

    impl Acceptor for Echo {
        fn accept(&self, fd: OwnedFd, _: &EventLoop) -> Option<Arc<dyn EventHandler>> {
            let event = StreamEvent::with(fd);
            let back = Arc::new(EchoBack {
                event: RefCell::new(Some(event.clone())),
            });
            event.set_listener(Some(back.clone()));
            self._spawned.borrow_mut().push(back);
            Some(event)
        }
    }

    fn echo_server(event_loop: &EventLoop) -> SocketAddrV4 {
        let listener = SocketListenerEvent::tcp(Ipv4Addr::LOCALHOST, 0).unwrap();
        listener.listen().unwrap();
        listener.set_acceptor(Some(Arc::new(Echo::default())));
        let addr = listener.local_addr().unwrap();
        event_loop.attach(listener).unwrap();
        addr
    }

    /// Watchdog stopping a wedged test loop.
    fn watchdog(event_loop: &EventLoop, ms: u32) -> Timer {
        let remote = event_loop.clone();
        let timer = Timer::new(event_loop.timers(), ms, move || {
            remote.terminate();
        });
        timer.start();
        timer
    }

    struct Script {
        sent: &'static [u8],
        received: RefCell<Vec<u8>>,
        errors: RefCell<Vec<ClientError>>,
        disconnects: Cell<u32>,
        client: RefCell<Option<Arc<AsyncClientEvent>>>,
        event_loop: EventLoop,
    }

    impl Script {
        fn with(event_loop: &EventLoop, sent: &'static [u8]) -> Arc<Self> {
            Arc::new(Self {
                sent,
                received: RefCell::new(vec![]),
                errors: RefCell::new(vec![]),
                disconnects: Cell::new(0),
                client: RefCell::new(None),
                event_loop: event_loop.clone(),
            })
        }
    }

    impl ClientListener for Script {
        fn on_connected(&self) {
            if let Some(client) = self.client.borrow().as_ref() {
                client.write(self.sent);
            }
        }

        fn on_data(&self, data: &[u8]) {
            self.received.borrow_mut().extend_from_slice(data);
            if self.received.borrow().len() >= self.sent.len() {
                if let Some(client) = self.client.borrow().as_ref() {
                    client.disconnect();
                }
            }
        }

        fn on_disconnected(&self) {
            self.disconnects.set(self.disconnects.get() + 1);
            self.event_loop.terminate();
        }

        fn on_error(&self, errcode: ClientError) {
            self.errors.borrow_mut().push(errcode);
            self.event_loop.terminate();
        }
    }

    #[test]
    fn echo_round_trip_on_a_single_loop() {
        let event_loop = EventLoop::new().unwrap();
        let addr = echo_server(&event_loop);

        let script = Script::with(&event_loop, b"ping over the loop");
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_listener(Some(script.clone()));
        *script.client.borrow_mut() = Some(client.clone());
        event_loop.attach(client.clone()).unwrap();
        client.connect_tcp(addr).unwrap();

        let _guard = watchdog(&event_loop, 5000);
        event_loop.run().unwrap();

        assert_eq!(*script.received.borrow(), b"ping over the loop");
        assert_eq!(script.disconnects.get(), 1);
        assert!(script.errors.borrow().is_empty());
        script.client.borrow_mut().take();
    }

    #[test]
    fn connect_requires_attachment() {
        let client = AsyncClientEvent::tcp().unwrap();
        let addr = SocketAddrV4::new(Ipv4Addr::LOCALHOST, 1);
        assert!(matches!(client.connect_tcp(addr), Err(Error::NotAllowed)));
    }

    #[test]
    fn domain_mismatch_is_refused() {
        let client = AsyncClientEvent::tcp().unwrap();
        assert!(matches!(
            client.connect_unix("/tmp/nonexistent.sock"),
            Err(Error::InvalidArgument)
        ));
    }

    #[test]
    fn refused_connect_reports_fail_to_connect() {
        let event_loop = EventLoop::new().unwrap();

        // Bind an ephemeral port and close it again: nothing listens there.
        let port = {
            let bound = std::net::TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            bound.local_addr().unwrap().port()
        };

        let script = Script::with(&event_loop, b"");
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_listener(Some(script.clone()));
        *script.client.borrow_mut() = Some(client.clone());
        event_loop.attach(client.clone()).unwrap();
        client.connect_tcp(SocketAddrV4::new(Ipv4Addr::LOCALHOST, port)).unwrap();

        let _guard = watchdog(&event_loop, 5000);
        event_loop.run().unwrap();

        assert_eq!(*script.errors.borrow(), vec![ClientError::FailToConnect]);
        script.client.borrow_mut().take();
    }

    #[test]
    fn stalled_connect_times_out() {
        let event_loop = EventLoop::new().unwrap();

        // A backlog-one listener that never accepts: once the kernel queue
        // overflows, further connects hang in the handshake.
        let server = sys::tcp_stream_socket().unwrap();
        sys::bind_tcp(server.as_raw_fd(), Ipv4Addr::LOCALHOST, 0).unwrap();
        sys::listen(server.as_raw_fd(), 1).unwrap();
        let addr = sys::tcp_local_addr(server.as_raw_fd()).unwrap();
        let mut fillers = vec![];
        for _ in 0..16 {
            let fd = sys::tcp_stream_socket().unwrap();
            sys::connect_tcp(fd.as_raw_fd(), addr).ok();
            fillers.push(fd);
        }

        let script = Script::with(&event_loop, b"");
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_connect_timeout(200);
        client.set_listener(Some(script.clone()));
        *script.client.borrow_mut() = Some(client.clone());
        event_loop.attach(client.clone()).unwrap();
        client.connect_tcp(addr).unwrap();

        let _guard = watchdog(&event_loop, 10_000);
        event_loop.run().unwrap();

        assert!(script
            .errors
            .borrow()
            .contains(&ClientError::ConnectionTimeout));
        assert!(client.is_timed_out());
        script.client.borrow_mut().take();
    }

    #[test]
    fn disconnect_is_idempotent() {
        let event_loop = EventLoop::new().unwrap();
        let script = Script::with(&event_loop, b"");
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_listener(Some(script.clone()));
        event_loop.attach(client.clone()).unwrap();

        client.disconnect();
        client.disconnect();
        assert_eq!(script.disconnects.get(), 1);
        assert!(client.core().raw_fd().is_none());
    }

    /// Accepts connections as collecting stream events and stops the loop
    /// once `full_at` bytes arrived. Listeners are weakly held by the
    /// events, so the acceptor keeps them alive.
    struct Collect {
        sink: Rc<RefCell<Vec<u8>>>,
        event_loop: EventLoop,
        full_at: usize,
    }

    impl ClientListener for Collect {
        fn on_data(&self, data: &[u8]) {
            self.sink.borrow_mut().extend_from_slice(data);
            if self.sink.borrow().len() >= self.full_at {
                self.event_loop.terminate();
            }
        }
    }

    struct CollectAcceptor {
        sink: Rc<RefCell<Vec<u8>>>,
        event_loop: EventLoop,
        full_at: usize,
        _spawned: RefCell<Vec<Arc<Collect>>>,
    }

    impl Acceptor for CollectAcceptor {
        fn accept(&self, fd: OwnedFd, _: &EventLoop) -> Option<Arc<dyn EventHandler>> {
            let event = StreamEvent::with(fd);
            let collect = Arc::new(Collect {
                sink: self.sink.clone(),
                event_loop: self.event_loop.clone(),
                full_at: self.full_at,
            });
            event.set_listener(Some(collect.clone()));
            self._spawned.borrow_mut().push(collect);
            Some(event)
        }
    }

    fn collect_server(
        event_loop: &EventLoop,
        full_at: usize,
    ) -> (SocketAddrV4, Rc<RefCell<Vec<u8>>>) {
        let sink = Rc::new(RefCell::new(Vec::new()));
        let listener = SocketListenerEvent::tcp(Ipv4Addr::LOCALHOST, 0).unwrap();
        listener.listen().unwrap();
        listener.set_acceptor(Some(Arc::new(CollectAcceptor {
            sink: sink.clone(),
            event_loop: event_loop.clone(),
            full_at,
            _spawned: RefCell::new(vec![]),
        })));
        let addr = listener.local_addr().unwrap();
        event_loop.attach(listener).unwrap();
        (addr, sink)
    }

    #[test]
    fn ordered_fragments_survive_backpressure() {
        struct Burst {
            chunks: Cell<u32>,
            base: Script,
        }

        impl ClientListener for Burst {
            fn on_connected(&self) {
                if let Some(client) = self.base.client.borrow().as_ref() {
                    for i in 0..10u8 {
                        client.write(&[i; 4096]);
                        self.chunks.set(self.chunks.get() + 1);
                    }
                    client.disconnect();
                }
            }

            fn on_data(&self, data: &[u8]) { self.base.on_data(data) }

            // The loop keeps running after the teardown: the exit belongs
            // to the collecting side, once the whole payload got through.
            fn on_disconnected(&self) {
                self.base.disconnects.set(self.base.disconnects.get() + 1);
            }

            fn on_error(&self, errcode: ClientError) { self.base.on_error(errcode) }
        }

        let event_loop = EventLoop::new().unwrap();
        let (addr, sink) = collect_server(&event_loop, 10 * 4096);

        let burst = Arc::new(Burst {
            chunks: Cell::new(0),
            base: Script {
                sent: b"",
                received: RefCell::new(vec![]),
                errors: RefCell::new(vec![]),
                disconnects: Cell::new(0),
                client: RefCell::new(None),
                event_loop: event_loop.clone(),
            },
        });
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_listener(Some(burst.clone()));
        *burst.base.client.borrow_mut() = Some(client.clone());
        event_loop.attach(client.clone()).unwrap();
        client.connect_tcp(addr).unwrap();

        let _guard = watchdog(&event_loop, 5000);
        event_loop.run().unwrap();

        assert_eq!(burst.base.disconnects.get(), 1);
        let collected = sink.borrow();
        assert_eq!(collected.len(), 10 * 4096);
        for (i, chunk) in collected.chunks(4096).enumerate() {
            assert!(chunk.iter().all(|&b| b == i as u8));
        }
        burst.base.client.borrow_mut().take();
    }

    #[test]
    fn disconnect_while_connecting_still_flushes_queued_output() {
        struct Quiet {
            disconnects: Cell<u32>,
        }

        impl ClientListener for Quiet {
            fn on_disconnected(&self) {
                self.disconnects.set(self.disconnects.get() + 1);
            }
        }

        // Larger than any kernel buffering along the loopback path, so a
        // backlog survives into the event loop no matter how fast the
        // handshake resolves.
        const PAYLOAD: usize = 32 << 20;

        let event_loop = EventLoop::new().unwrap();
        let (addr, sink) = collect_server(&event_loop, PAYLOAD);

        let quiet = Arc::new(Quiet { disconnects: Cell::new(0) });
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_listener(Some(quiet.clone()));
        event_loop.attach(client.clone()).unwrap();
        client.connect_tcp(addr).unwrap();

        // Queue output and request the teardown before the loop ever
        // dispatched the connect completion.
        client.write(&vec![0x5A; PAYLOAD]);
        client.disconnect();

        let _guard = watchdog(&event_loop, 10_000);
        event_loop.run().unwrap();

        assert_eq!(sink.borrow().len(), PAYLOAD);
        assert!(sink.borrow().iter().all(|&b| b == 0x5A));
        assert_eq!(quiet.disconnects.get(), 1);
        assert!(client.core().raw_fd().is_none());
    }

    /// Greets every connection with a banner straight from `accept`, so the
    /// bytes are already in flight when the peer's connect resolves.
    struct Greeter {
        banner: &'static [u8],
    }

    impl Acceptor for Greeter {
        fn accept(&self, fd: OwnedFd, _: &EventLoop) -> Option<Arc<dyn EventHandler>> {
            let event = StreamEvent::with(fd);
            event.write(self.banner);
            Some(event)
        }
    }

    #[test]
    fn data_sent_at_accept_time_is_delivered() {
        let event_loop = EventLoop::new().unwrap();

        let listener = SocketListenerEvent::tcp(Ipv4Addr::LOCALHOST, 0).unwrap();
        listener.listen().unwrap();
        listener.set_acceptor(Some(Arc::new(Greeter { banner: b"220 ready" })));
        let addr = listener.local_addr().unwrap();
        event_loop.attach(listener).unwrap();

        let script = Script::with(&event_loop, b"");
        let client = AsyncClientEvent::tcp().unwrap();
        client.set_listener(Some(script.clone()));
        *script.client.borrow_mut() = Some(client.clone());
        event_loop.attach(client.clone()).unwrap();
        client.connect_tcp(addr).unwrap();

        let _guard = watchdog(&event_loop, 5000);
        event_loop.run().unwrap();

        assert_eq!(*script.received.borrow(), b"220 ready");
        assert_eq!(script.disconnects.get(), 1);
        script.client.borrow_mut().take();
    }
}
