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

use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::Arc;

use crate::reactor::LoopBinding;
use crate::sys;

/// Tri-state returned by the input and output callbacks: whether the
/// notification was consumed or should fall through to
/// [`EventHandler::on_default`].
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Dispatch {
    Handled,
    NotHandled,
}

/// The capability interface every event object exposes to its [`EventLoop`].
///
/// Objects are shared as `Arc<dyn EventHandler>`: the loop keeps one strong
/// reference per attached object and the dispatcher takes a locally-scoped
/// protective clone before running any callback of a wait batch, so an
/// object detaching itself from within its own callback stays alive until
/// the callback returns. Dropping the last reference is the single point of
/// teardown and closes the owned descriptor.
///
/// Callbacks run on the loop thread only and must not block; the input and
/// output callbacks of descriptor-backed objects must drain until the
/// operation would block, as required under edge-triggered readiness.
///
/// [`EventLoop`]: crate::EventLoop
pub trait EventHandler {
    /// The readiness source. Valid only while the object can be polled; a
    /// negative value means the descriptor is gone and the object can no
    /// longer be attached nor dispatched to.
    fn fd(&self) -> RawFd;

    /// Accessor for the object's owning-loop slot, set on attach and cleared
    /// on detach.
    fn binding(&self) -> &LoopBinding;

    /// Input readiness callback.
    fn on_input(&self) -> Dispatch { Dispatch::Handled }

    /// Output readiness callback.
    fn on_output(&self) -> Dispatch { Dispatch::Handled }

    /// Terminal notification: the peer hung up. The loop detaches the object
    /// before delivering it.
    fn on_hungup(&self) {}

    /// Terminal notification: the OS reported an error condition. The loop
    /// detaches the object before delivering it.
    fn on_error(&self) {}

    /// Catch-all invoked when neither [`Self::on_input`] nor
    /// [`Self::on_output`] reported [`Dispatch::Handled`]. To receive it,
    /// return [`Dispatch::NotHandled`] from the input/output overrides.
    fn on_default(&self, _io: crate::poller::IoType) {}
}

/// One-shot alarm event backed by an eventfd: the only wake primitive that
/// is safe to trigger from a foreign thread.
///
/// The callback runs on the loop thread on the next dispatch pass after a
/// trigger; multiple triggers before the pass coalesce into one callback.
pub struct AlarmEvent {
    efd: Arc<OwnedFd>,
    binding: LoopBinding,
    handler: Box<dyn Fn()>,
}

impl AlarmEvent {
    pub fn new(handler: impl Fn() + 'static) -> io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            efd: Arc::new(sys::eventfd()?),
            binding: LoopBinding::new(),
            handler: Box::new(handler),
        }))
    }

    /// Rings the alarm. Callable from any thread holding a reference.
    pub fn trigger(&self) -> io::Result<()> { sys::notify_eventfd(self.efd.as_raw_fd()) }

    /// A cheap clonable trigger handle for foreign threads.
    pub fn handle(&self) -> AlarmHandle {
        AlarmHandle {
            efd: self.efd.clone(),
        }
    }
}

impl EventHandler for AlarmEvent {
    fn fd(&self) -> RawFd { self.efd.as_raw_fd() }

    fn binding(&self) -> &LoopBinding { &self.binding }

    fn on_input(&self) -> Dispatch {
        sys::drain_counter(self.efd.as_raw_fd());
        (self.handler)();
        Dispatch::Handled
    }
}

/// Send + Sync trigger for an [`AlarmEvent`], detached from the event object
/// itself so it can outlive the loop thread's ownership graph.
#[derive(Clone)]
pub struct AlarmHandle {
    efd: Arc<OwnedFd>,
}

impl AlarmHandle {
    pub(crate) fn with(efd: Arc<OwnedFd>) -> Self { Self { efd } }

    /// Rings the alarm from any thread.
    pub fn trigger(&self) -> io::Result<()> { sys::notify_eventfd(self.efd.as_raw_fd()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_handle_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AlarmHandle>();
    }

    #[test]
    fn alarm_coalesces_triggers() {
        let fired = std::rc::Rc::new(std::cell::Cell::new(0u32));
        let seen = fired.clone();
        let alarm = AlarmEvent::new(move || seen.set(seen.get() + 1)).unwrap();

        alarm.trigger().unwrap();
        alarm.handle().trigger().unwrap();
        assert_eq!(alarm.on_input(), Dispatch::Handled);
        assert_eq!(fired.get(), 1);

        // A fresh trigger after the drain produces a fresh callback.
        alarm.trigger().unwrap();
        alarm.on_input();
        assert_eq!(fired.get(), 2);
    }
}
