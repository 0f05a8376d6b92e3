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

//! Buffered stream events: partial reads accumulate into a byte stream,
//! partial writes queue into an ordered list of pending output fragments.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::mem;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::{Arc, Weak};

use crate::event::{Dispatch, EventHandler};
use crate::reactor::LoopBinding;
use crate::sys::{self, IoStatus};

/// Read chunk size of one drain-loop iteration.
const CHUNK_SIZE: usize = 256;

/// Error reason delivered through [`ClientListener::on_error`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Display)]
#[display(doc_comments)]
pub enum ClientError {
    /// no error
    NoError,
    /// connection timed out
    ConnectionTimeout,
    /// failed to connect
    FailToConnect,
}

/// Observer capability for buffered stream events. All hooks default to
/// no-ops so implementors subscribe only to what they consume.
pub trait ClientListener {
    /// The listener was installed on an event object.
    fn on_activated(&self) {}

    /// The listener was removed from an event object.
    fn on_deactivated(&self) {}

    /// The connection is established (async clients only).
    fn on_connected(&self) {}

    /// The connection is gone.
    fn on_disconnected(&self) {}

    /// Whole-stream delivery: everything accumulated during one input drain
    /// pass, delivered exactly once per pass.
    fn on_data(&self, _data: &[u8]) {}

    /// Fragment-level delivery, called before any buffering happens.
    ///
    /// Returning `true` consumes the fragment: the bytes never enter the
    /// accumulation buffer (zero-copy fast path for framed consumers). The
    /// first declined fragment switches the rest of the drain pass over to
    /// accumulation.
    fn on_data_fragment(&self, _fragment: &[u8]) -> bool { false }

    /// An error happened on the connection.
    fn on_error(&self, _errcode: ClientError) {}
}

/// One queued, partially-flushed output buffer.
struct OutputFragment {
    buffer: Vec<u8>,
    /// How much of `buffer` has already been flushed to the kernel.
    start_pos: usize,
}

impl OutputFragment {
    fn remaining(&self) -> usize { self.buffer.len() - self.start_pos }
}

/// Shared state of every buffered stream event: the descriptor, the input
/// accumulation buffer, the FIFO output fragment queue and the (weak)
/// listener reference.
///
/// Embedded by the concrete stream event objects ([`StreamEvent`],
/// [`AsyncClientEvent`]); not an event object by itself.
///
/// [`AsyncClientEvent`]: crate::AsyncClientEvent
pub struct StreamCore {
    fd: RefCell<Option<OwnedFd>>,
    inputs: RefCell<Vec<u8>>,
    outputs: RefCell<VecDeque<OutputFragment>>,
    listener: RefCell<Option<Weak<dyn ClientListener>>>,
}

impl StreamCore {
    pub(crate) fn new(fd: OwnedFd) -> Self {
        Self {
            fd: RefCell::new(Some(fd)),
            inputs: RefCell::new(vec![]),
            outputs: RefCell::new(empty!()),
            listener: RefCell::new(None),
        }
    }

    /// The underlying descriptor, if not yet closed.
    pub fn raw_fd(&self) -> Option<RawFd> { self.fd.borrow().as_ref().map(|fd| fd.as_raw_fd()) }

    /// Closes the descriptor. Further I/O on the core is a no-op.
    pub(crate) fn close(&self) { self.fd.borrow_mut().take(); }

    /// Installs (or removes, with `None`) the listener, notifying the
    /// deactivated and activated parties.
    pub fn set_listener(&self, lnr: Option<Arc<dyn ClientListener>>) {
        let prev = self.listener.borrow_mut().take();
        if let Some(prev) = prev.and_then(|weak| weak.upgrade()) {
            prev.on_deactivated();
        }
        if let Some(lnr) = lnr {
            *self.listener.borrow_mut() = Some(Arc::downgrade(&lnr));
            lnr.on_activated();
        }
    }

    /// The installed listener, if any is still alive.
    pub fn listener(&self) -> Option<Arc<dyn ClientListener>> {
        self.listener.borrow().as_ref().and_then(Weak::upgrade)
    }

    /// Drains the descriptor until the read would block.
    ///
    /// Each chunk is first offered to the listener's fragment hook; once a
    /// chunk is declined, that chunk and every later chunk of this pass are
    /// accumulated and delivered as one whole-stream callback at the end of
    /// the drain.
    pub(crate) fn handle_input(&self) -> Dispatch {
        let mut buf = [0u8; CHUNK_SIZE];
        let mut fragment = true;

        loop {
            let fd = match self.raw_fd() {
                Some(fd) => fd,
                None => return Dispatch::Handled,
            };
            match sys::read_fd(fd, &mut buf) {
                IoStatus::Done(len) => {
                    let chunk = &buf[..len];
                    if fragment {
                        fragment = self
                            .listener()
                            .map(|lnr| lnr.on_data_fragment(chunk))
                            .unwrap_or(false);
                    }
                    if !fragment {
                        self.inputs.borrow_mut().extend_from_slice(chunk);
                    }
                }
                IoStatus::WouldBlock | IoStatus::Closed | IoStatus::Err(_) => break,
            }
        }

        let data = mem::take(&mut *self.inputs.borrow_mut());
        if !data.is_empty() {
            if let Some(lnr) = self.listener() {
                lnr.on_data(&data);
            }
        }
        Dispatch::Handled
    }

    /// Flushes queued fragments head-first until the queue drains or the
    /// kernel buffer fills. A fragment is removed only once fully flushed.
    pub(crate) fn handle_output(&self) -> Dispatch {
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return Dispatch::Handled,
        };

        let mut outputs = self.outputs.borrow_mut();
        while let Some(front) = outputs.front_mut() {
            match sys::write_fd(fd, &front.buffer[front.start_pos..]) {
                IoStatus::Done(written) => {
                    front.start_pos += written;
                    if front.remaining() > 0 {
                        // Kernel write buffer is full.
                        break;
                    }
                    outputs.pop_front();
                }
                IoStatus::WouldBlock | IoStatus::Closed | IoStatus::Err(_) => break,
            }
        }
        Dispatch::Handled
    }

    /// Queues `data` for ordered delivery.
    ///
    /// With an empty queue the data is first written to the kernel directly
    /// and only the unwritten remainder is queued; under backpressure the
    /// data is appended to the tail fragment instead, which bounds the
    /// growth of the fragment list.
    ///
    /// # Returns
    ///
    /// Number of bytes accepted; always `data.len()` while the descriptor
    /// is open.
    pub fn write(&self, data: &[u8]) -> usize {
        if data.is_empty() {
            return 0;
        }
        let fd = match self.raw_fd() {
            Some(fd) => fd,
            None => return 0,
        };

        let mut outputs = self.outputs.borrow_mut();
        if let Some(tail) = outputs.back_mut() {
            tail.buffer.extend_from_slice(data);
            return data.len();
        }

        // No backlog: write through and queue only the remainder.
        let mut written = 0;
        while written < data.len() {
            match sys::write_fd(fd, &data[written..]) {
                IoStatus::Done(len) => written += len,
                IoStatus::WouldBlock | IoStatus::Closed | IoStatus::Err(_) => break,
            }
        }
        if written < data.len() {
            outputs.push_back(OutputFragment {
                buffer: data[written..].to_vec(),
                start_pos: 0,
            });
        }
        data.len()
    }

    /// Whether unflushed output is queued.
    pub fn pending_output(&self) -> bool { self.output_pending_datasize() > 0 }

    /// Total number of queued, not-yet-flushed bytes.
    pub fn output_pending_datasize(&self) -> usize {
        self.outputs.borrow().iter().map(OutputFragment::remaining).sum()
    }
}

/// A buffered stream event over an already-connected descriptor: what an
/// [`Acceptor`] typically wraps accepted connections in.
///
/// [`Acceptor`]: crate::Acceptor
pub struct StreamEvent {
    core: StreamCore,
    binding: LoopBinding,
}

impl StreamEvent {
    pub fn with(fd: impl Into<OwnedFd>) -> Arc<Self> {
        Arc::new(Self {
            core: StreamCore::new(fd.into()),
            binding: LoopBinding::new(),
        })
    }

    pub fn core(&self) -> &StreamCore { &self.core }

    pub fn set_listener(&self, lnr: Option<Arc<dyn ClientListener>>) {
        self.core.set_listener(lnr)
    }

    pub fn write(&self, data: &[u8]) -> usize { self.core.write(data) }
}

impl EventHandler for StreamEvent {
    fn fd(&self) -> RawFd { self.core.raw_fd().unwrap_or(-1) }

    fn binding(&self) -> &LoopBinding { &self.binding }

    fn on_input(&self) -> Dispatch { self.core.handle_input() }

    fn on_output(&self) -> Dispatch { self.core.handle_output() }

    fn on_hungup(&self) {
        if let Some(lnr) = self.core.listener() {
            lnr.on_disconnected();
        }
        self.core.set_listener(None);
        self.core.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::{Cell, RefCell};
    use std::io::{Read, Write};
    use std::os::unix::net::UnixStream;

    #[derive(Default)]
    struct Recorder {
        data: RefCell<Vec<u8>>,
        fragments: RefCell<Vec<Vec<u8>>>,
        consume_fragments: Cell<bool>,
        deliveries: Cell<u32>,
    }

    impl ClientListener for Recorder {
        fn on_data(&self, data: &[u8]) {
            self.data.borrow_mut().extend_from_slice(data);
            self.deliveries.set(self.deliveries.get() + 1);
        }

        fn on_data_fragment(&self, fragment: &[u8]) -> bool {
            if !self.consume_fragments.get() {
                return false;
            }
            self.fragments.borrow_mut().push(fragment.to_vec());
            true
        }
    }

    fn pair() -> (StreamCore, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (StreamCore::new(ours.into()), theirs)
    }

    #[test]
    fn accumulated_input_is_delivered_once_per_drain() {
        let (core, mut peer) = pair();
        let recorder = Arc::new(Recorder::default());
        core.set_listener(Some(recorder.clone()));

        // More than one chunk's worth, to exercise the drain loop.
        let payload: Vec<u8> = (0..4 * CHUNK_SIZE + 17).map(|i| i as u8).collect();
        peer.write_all(&payload).unwrap();

        core.handle_input();
        assert_eq!(*recorder.data.borrow(), payload);
        assert_eq!(recorder.deliveries.get(), 1);

        // A drain with no input delivers nothing.
        core.handle_input();
        assert_eq!(recorder.deliveries.get(), 1);
    }

    #[test]
    fn consumed_fragments_bypass_the_buffer() {
        let (core, mut peer) = pair();
        let recorder = Arc::new(Recorder::default());
        recorder.consume_fragments.set(true);
        core.set_listener(Some(recorder.clone()));

        peer.write_all(b"framed-payload").unwrap();
        core.handle_input();

        let total: usize = recorder.fragments.borrow().iter().map(Vec::len).sum();
        assert_eq!(total, b"framed-payload".len());
        assert!(recorder.data.borrow().is_empty());
        assert_eq!(recorder.deliveries.get(), 0);
    }

    #[test]
    fn writes_are_flushed_in_fifo_order() {
        let (core, mut peer) = pair();

        // Saturate the kernel buffer so a backlog builds up.
        let first = vec![0xAAu8; 1 << 20];
        core.write(&first);
        for i in 0..10u8 {
            core.write(&[i; 1000]);
        }
        let expected_len = first.len() + 10 * 1000;

        let mut received = Vec::new();
        let mut buf = [0u8; 65536];
        peer.set_nonblocking(true).unwrap();
        while received.len() < expected_len {
            match peer.read(&mut buf) {
                Ok(n) => received.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    core.handle_output();
                }
                Err(e) => panic!("peer read failed: {e}"),
            }
        }
        assert!(!core.pending_output());

        let mut expected = first;
        for i in 0..10u8 {
            expected.extend_from_slice(&[i; 1000]);
        }
        assert_eq!(received, expected);
    }

    #[test]
    fn backlogged_writes_coalesce_into_the_tail_fragment() {
        let (core, _peer) = pair();

        core.write(&vec![0u8; 4 << 20]);
        assert!(core.pending_output());
        let backlog = core.output_pending_datasize();

        core.write(b"abc");
        core.write(b"def");
        assert_eq!(core.output_pending_datasize(), backlog + 6);
        assert_eq!(core.outputs.borrow().len(), 1);
    }

    #[test]
    fn listener_activation_hooks_fire() {
        #[derive(Default)]
        struct Hooks {
            activated: Cell<u32>,
            deactivated: Cell<u32>,
        }
        impl ClientListener for Hooks {
            fn on_activated(&self) { self.activated.set(self.activated.get() + 1) }
            fn on_deactivated(&self) { self.deactivated.set(self.deactivated.get() + 1) }
        }

        let (core, _peer) = pair();
        let hooks = Arc::new(Hooks::default());
        core.set_listener(Some(hooks.clone()));
        assert_eq!((hooks.activated.get(), hooks.deactivated.get()), (1, 0));
        core.set_listener(None);
        assert_eq!((hooks.activated.get(), hooks.deactivated.get()), (1, 1));
    }
}
