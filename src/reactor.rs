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
use std::collections::HashMap;
use std::io;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_channel as chan;

use crate::event::{AlarmHandle, Dispatch, EventHandler};
use crate::poller::{epoll::Epoll, Io, IoFail, IoType, Poll};
use crate::sys;
use crate::timer::{TimerWheel, WheelEvent};

/// Errors returned by event loop operations.
#[derive(Debug, Display, Error, From)]
#[display(doc_comments)]
pub enum Error {
    /// invalid argument
    InvalidArgument,

    /// an event object with the same descriptor is already attached
    AlreadyExists,

    /// the event object is not attached to this loop
    NotFound,

    /// the operation is not allowed in the current state
    NotAllowed,

    /// OS-level error. {0}
    #[from]
    Io(io::Error),
}

/// The slot tying an event object to the loop it is attached to. Each event
/// object owns exactly one; the loop fills it on attach and clears it on
/// detach.
///
/// The reference is weak: a dead loop simply renders the binding empty.
#[derive(Default)]
pub struct LoopBinding(RefCell<Option<Weak<LoopInner>>>);

impl LoopBinding {
    pub fn new() -> Self { Self::default() }

    pub(crate) fn bind(&self, inner: &Rc<LoopInner>) {
        *self.0.borrow_mut() = Some(Rc::downgrade(inner));
    }

    pub(crate) fn clear(&self) { self.0.borrow_mut().take(); }

    /// The loop the object is attached to, if any.
    pub fn event_loop(&self) -> Option<EventLoop> {
        self.0
            .borrow()
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| EventLoop { inner })
    }
}

/// Cross-thread instructions, delivered through the control channel and
/// picked up on the next wake.
enum Ctl {
    Terminate,
    Exec(Box<dyn FnOnce(&EventLoop) + Send>),
}

/// Internal event object draining the control channel. Its eventfd doubles
/// as the loop's wake source.
struct ControlEvent {
    efd: Arc<OwnedFd>,
    ctl_recv: chan::Receiver<Ctl>,
    binding: LoopBinding,
}

impl EventHandler for ControlEvent {
    fn fd(&self) -> RawFd { self.efd.as_raw_fd() }

    fn binding(&self) -> &LoopBinding { &self.binding }

    fn on_input(&self) -> Dispatch {
        sys::drain_counter(self.efd.as_raw_fd());
        let Some(event_loop) = self.binding.event_loop() else {
            return Dispatch::Handled;
        };
        while let Ok(ctl) = self.ctl_recv.try_recv() {
            match ctl {
                Ctl::Terminate => event_loop.inner.exit_requested.set(true),
                Ctl::Exec(exec) => exec(&event_loop),
            }
        }
        Dispatch::Handled
    }
}

pub(crate) struct LoopInner {
    poller: RefCell<Box<dyn Poll>>,
    events: RefCell<HashMap<RawFd, Arc<dyn EventHandler>>>,
    running: Arc<AtomicBool>,
    exit_requested: Cell<bool>,
    ctl_send: chan::Sender<Ctl>,
    wake: AlarmHandle,
    wheel: Rc<TimerWheel>,
}

/// Single-threaded callback-driven I/O reactor.
///
/// The loop owns one strong reference to every attached event object and a
/// [`TimerWheel`] it drives through a dedicated timerfd-backed event. All
/// dispatch happens on the thread calling [`EventLoop::run`]; the only
/// entries usable from other threads are [`Remote`] and [`AlarmHandle`].
///
/// `EventLoop` itself is a cheap clonable handle; clones address the same
/// loop.
#[derive(Clone)]
pub struct EventLoop {
    inner: Rc<LoopInner>,
}

impl EventLoop {
    /// Creates a loop over the edge-triggered epoll backend, with the
    /// default timer granularity.
    pub fn new() -> Result<Self, Error> { Self::with_poller(Box::new(Epoll::new()?), 0) }

    /// Creates a loop over an explicit multiplexer backend, ticking timers
    /// every `min_interval_ms` milliseconds (0 selects the default).
    pub fn with_poller(poller: Box<dyn Poll>, min_interval_ms: u32) -> Result<Self, Error> {
        let (ctl_send, ctl_recv) = chan::unbounded::<Ctl>();
        let efd = Arc::new(sys::eventfd()?);
        let wheel = TimerWheel::new(min_interval_ms)?;

        let event_loop = EventLoop {
            inner: Rc::new(LoopInner {
                poller: RefCell::new(poller),
                events: RefCell::new(empty!()),
                running: Arc::new(AtomicBool::new(false)),
                exit_requested: Cell::new(false),
                ctl_send,
                wake: AlarmHandle::with(efd.clone()),
                wheel: wheel.clone(),
            }),
        };

        event_loop.attach_with(
            Arc::new(ControlEvent {
                efd,
                ctl_recv,
                binding: LoopBinding::new(),
            }),
            IoType::read_only(),
        )?;
        event_loop.attach_with(WheelEvent::with(wheel), IoType::read_only())?;
        Ok(event_loop)
    }

    /// The timer wheel driven by this loop.
    pub fn timers(&self) -> &Rc<TimerWheel> { &self.inner.wheel }

    /// Number of attached event objects, the loop's own internal ones
    /// included.
    pub fn attached(&self) -> usize { self.inner.events.borrow().len() }

    /// A `Send + Sync` handle for driving the loop from other threads.
    pub fn remote(&self) -> Remote {
        Remote {
            ctl_send: self.inner.ctl_send.clone(),
            wake: self.inner.wake.clone(),
            running: self.inner.running.clone(),
        }
    }

    /// Attaches an event object with both input and output interest.
    pub fn attach(&self, event: Arc<dyn EventHandler>) -> Result<(), Error> {
        self.attach_with(event, IoType::read_write())
    }

    /// Attaches an event object with explicit interest.
    ///
    /// The loop holds a strong reference until detach. Fails with
    /// [`Error::AlreadyExists`] when the object's descriptor is attached
    /// already and [`Error::InvalidArgument`] when the object carries no
    /// valid descriptor.
    pub fn attach_with(&self, event: Arc<dyn EventHandler>, interest: IoType) -> Result<(), Error> {
        let fd = event.fd();
        if fd < 0 {
            return Err(Error::InvalidArgument);
        }
        let mut events = self.inner.events.borrow_mut();
        if events.contains_key(&fd) {
            return Err(Error::AlreadyExists);
        }
        self.inner.poller.borrow_mut().register(fd, interest)?;
        event.binding().bind(&self.inner);
        events.insert(fd, event);
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "attached {fd} with {interest} interest");
        Ok(())
    }

    /// Detaches an event object, dropping the loop's reference to it. Safe
    /// to call from within the object's own callback.
    pub fn detach(&self, event: &dyn EventHandler) -> Result<(), Error> {
        let fd = event.fd();
        let removed = {
            let mut events = self.inner.events.borrow_mut();
            match events.get(&fd) {
                Some(held) if same_object(held.as_ref(), event) => events.remove(&fd),
                _ => None,
            }
        };
        let Some(removed) = removed else {
            return Err(Error::NotFound);
        };
        if let Err(_err) = self.inner.poller.borrow_mut().unregister(fd) {
            #[cfg(feature = "log")]
            log::warn!(target: "reactor", "can't unregister {fd}: {_err}");
        }
        removed.binding().clear();
        #[cfg(feature = "log")]
        log::debug!(target: "reactor", "detached {fd}");
        Ok(())
    }

    /// Runs wait-and-dispatch until terminated. Only one `run` can be in
    /// flight per loop.
    pub fn run(&self) -> Result<(), Error> {
        let inner = &self.inner;
        if inner.running.swap(true, Ordering::SeqCst) {
            return Err(Error::NotAllowed);
        }
        let result = self.run_inner();
        inner.exit_requested.set(false);
        inner.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_inner(&self) -> Result<(), Error> {
        let inner = &self.inner;
        // Dispatch order within a batch follows the multiplexer's report
        // order; each batch is collected in full before any callback runs.
        let mut batch = Vec::new();
        while !inner.exit_requested.get() {
            match inner.poller.borrow_mut().wait(None) {
                Ok(_) => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err.into()),
            }
            {
                let mut poller = inner.poller.borrow_mut();
                while let Some(fired) = poller.next() {
                    batch.push(fired);
                }
            }
            #[cfg(feature = "log")]
            log::trace!(target: "reactor", "dispatching {} readiness events", batch.len());

            for (fd, res) in batch.drain(..) {
                // Protective reference: the object stays alive through its
                // callbacks even if it detaches itself inside one.
                let event = inner.events.borrow().get(&fd).map(Arc::clone);
                let Some(event) = event else {
                    continue;
                };
                match res {
                    Ok(io) => self.dispatch_rw(&event, io),
                    Err(IoFail::Connectivity(_bits)) => {
                        #[cfg(feature = "log")]
                        log::trace!(target: "reactor", "{fd} hung up (events {_bits:#b})");
                        // Let the object drain what the peer sent before
                        // going away.
                        if event.on_input() == Dispatch::NotHandled {
                            event.on_default(IoType::read_only());
                        }
                        let _ = self.detach(event.as_ref());
                        event.on_hungup();
                    }
                    Err(IoFail::Os(_bits)) => {
                        #[cfg(feature = "log")]
                        log::trace!(target: "reactor", "{fd} failed (events {_bits:#b})");
                        let _ = self.detach(event.as_ref());
                        event.on_error();
                    }
                }
            }
        }
        Ok(())
    }

    fn dispatch_rw(&self, event: &Arc<dyn EventHandler>, io: IoType) {
        let mut handled = true;
        for dim in io {
            let dispatch = match dim {
                Io::Read => event.on_input(),
                Io::Write => event.on_output(),
            };
            if dispatch == Dispatch::NotHandled {
                handled = false;
            }
            // Our protective reference being the last one means the object
            // was released mid-callback: no further callbacks for it.
            if Arc::strong_count(event) == 1 {
                return;
            }
        }
        if !handled {
            event.on_default(io);
        }
    }

    /// Requests loop termination. Usable from callbacks as well as before
    /// the loop ever ran; a terminated loop can be `run` again.
    pub fn terminate(&self) {
        self.inner.exit_requested.set(true);
        let _ = self.inner.wake.trigger();
    }
}

fn same_object(a: &dyn EventHandler, b: &dyn EventHandler) -> bool {
    std::ptr::eq(
        a as *const dyn EventHandler as *const (),
        b as *const dyn EventHandler as *const (),
    )
}

/// Cross-thread handle to a running [`EventLoop`]. Instructions are queued
/// on the control channel and executed on the loop thread after a wake.
#[derive(Clone)]
pub struct Remote {
    ctl_send: chan::Sender<Ctl>,
    wake: AlarmHandle,
    running: Arc<AtomicBool>,
}

impl Remote {
    /// Asks the loop to stop. Queued if the loop is not currently running.
    pub fn terminate(&self) -> Result<(), Error> {
        self.ctl_send.send(Ctl::Terminate).map_err(|_| Error::NotFound)?;
        self.wake.trigger()?;
        Ok(())
    }

    /// Ships a closure to the loop thread; it runs there with access to the
    /// loop handle.
    pub fn exec(&self, exec: impl FnOnce(&EventLoop) + Send + 'static) -> Result<(), Error> {
        self.ctl_send
            .send(Ctl::Exec(Box::new(exec)))
            .map_err(|_| Error::NotFound)?;
        self.wake.trigger()?;
        Ok(())
    }

    /// Whether the loop thread is inside [`EventLoop::run`] right now.
    pub fn is_running(&self) -> bool { self.running.load(Ordering::SeqCst) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AlarmEvent;
    use std::thread;
    use std::time::Duration;

    // Every fresh loop carries its control event and the wheel event.
    const INTERNAL_EVENTS: usize = 2;

    #[test]
    fn attach_detach_accounting() {
        let event_loop = EventLoop::new().unwrap();
        assert_eq!(event_loop.attached(), INTERNAL_EVENTS);

        let alarm = AlarmEvent::new(|| {}).unwrap();
        event_loop.attach(alarm.clone()).unwrap();
        assert_eq!(event_loop.attached(), INTERNAL_EVENTS + 1);

        assert!(matches!(
            event_loop.attach(alarm.clone()),
            Err(Error::AlreadyExists)
        ));

        event_loop.detach(alarm.as_ref()).unwrap();
        assert_eq!(event_loop.attached(), INTERNAL_EVENTS);
        assert!(matches!(
            event_loop.detach(alarm.as_ref()),
            Err(Error::NotFound)
        ));
    }

    #[test]
    fn alarm_trigger_wakes_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let fired = Rc::new(Cell::new(false));

        let seen = fired.clone();
        let handle = event_loop.clone();
        let alarm = AlarmEvent::new(move || {
            seen.set(true);
            handle.terminate();
        })
        .unwrap();
        event_loop.attach_with(alarm.clone(), IoType::read_only()).unwrap();

        alarm.trigger().unwrap();
        event_loop.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn foreign_thread_terminates_the_loop() {
        let event_loop = EventLoop::new().unwrap();
        let remote = event_loop.remote();

        let waker = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.terminate().unwrap();
        });

        event_loop.run().unwrap();
        waker.join().unwrap();
        assert!(!event_loop.remote().is_running());
    }

    #[test]
    fn remote_exec_runs_on_the_loop_thread() {
        let event_loop = EventLoop::new().unwrap();
        let remote = event_loop.remote();
        let loop_thread = thread::current().id();

        let shipper = thread::spawn(move || {
            remote
                .exec(move |event_loop| {
                    assert_eq!(thread::current().id(), loop_thread);
                    event_loop.terminate();
                })
                .unwrap();
        });

        event_loop.run().unwrap();
        shipper.join().unwrap();
    }

    #[test]
    fn event_detaching_itself_from_its_own_callback() {
        let event_loop = EventLoop::new().unwrap();
        let slot: Rc<RefCell<Option<Arc<AlarmEvent>>>> = Rc::new(RefCell::new(None));

        let hook = slot.clone();
        let handle = event_loop.clone();
        let alarm = AlarmEvent::new(move || {
            if let Some(alarm) = hook.borrow_mut().take() {
                handle.detach(alarm.as_ref()).unwrap();
            }
            handle.terminate();
        })
        .unwrap();
        *slot.borrow_mut() = Some(alarm.clone());
        event_loop.attach_with(alarm.clone(), IoType::read_only()).unwrap();

        alarm.trigger().unwrap();
        event_loop.run().unwrap();
        assert_eq!(event_loop.attached(), INTERNAL_EVENTS);
    }

    #[test]
    fn timer_fires_while_the_loop_runs() {
        let event_loop = EventLoop::with_poller(Box::new(Epoll::new().unwrap()), 1).unwrap();
        let fired = Rc::new(Cell::new(false));

        let seen = fired.clone();
        let handle = event_loop.clone();
        let timer = crate::timer::Timer::new(event_loop.timers(), 20, move || {
            seen.set(true);
            handle.terminate();
        });
        assert!(timer.start());

        event_loop.run().unwrap();
        assert!(fired.get());
    }

    #[test]
    fn invalid_descriptor_is_refused() {
        struct Bogus(LoopBinding);
        impl EventHandler for Bogus {
            fn fd(&self) -> RawFd { -1 }
            fn binding(&self) -> &LoopBinding { &self.0 }
        }

        let event_loop = EventLoop::new().unwrap();
        let bogus = Arc::new(Bogus(LoopBinding::new()));
        assert!(matches!(
            event_loop.attach(bogus),
            Err(Error::InvalidArgument)
        ));
    }
}
