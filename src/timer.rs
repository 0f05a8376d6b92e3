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

//! Hierarchical timer wheel in the style of the classic kernel timer
//! cascade: five levels of slots, level 0 holding one slot per tick and
//! each higher level covering 64 times the span of the one below it.
//!
//! Scheduling, stopping and expiry of a timer within its current window
//! are all O(1); a timer living in a higher level is re-filed ("cascaded")
//! at most four times over its whole lifetime.

use std::cell::RefCell;
use std::io;
use std::mem;
use std::os::fd::OwnedFd;
use std::os::unix::io::{AsRawFd, RawFd};
use std::rc::Rc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::event::{Dispatch, EventHandler};
use crate::reactor::LoopBinding;
use crate::sys;

/// Level 0 resolves single ticks.
const LEVEL0_SLOTS: usize = 256;
/// Levels 1-4 each 64 slots wide.
const LEVELN_SLOTS: usize = 64;

const LEVEL0_BITS: u32 = 8;
const LEVELN_BITS: u32 = 6;

/// Default tick length when none is given, in milliseconds.
const DEFAULT_TICK_MS: u64 = 5;

/// A scheduled or parked timer. Lives for as long as its [`Timer`] handle.
struct Entry {
    /// Interval in ticks; zero renders the timer unstartable.
    interval: u64,
    /// Absolute tick of the next expiry, meaningful while scheduled.
    expire: u64,
    /// Distinguishes this occupant of the arena slot from earlier ones
    /// whose id it reuses.
    gen: u64,
    /// `(level, slot)` membership while scheduled, `None` when parked.
    pos: Option<(usize, usize)>,
    /// Taken out for the duration of the callback invocation.
    callback: Option<Box<dyn FnMut()>>,
}

/// Slots hold `(id, gen)` pairs; a pair whose generation no longer matches
/// its entry is stale and gets dropped instead of fired.
struct Level {
    slots: Vec<Vec<(usize, u64)>>,
    index: usize,
}

impl Level {
    fn new(width: usize) -> Self {
        Self {
            slots: (0..width).map(|_| vec![]).collect(),
            index: 0,
        }
    }
}

struct WheelInner {
    /// Entry arena; `free` holds the reusable holes.
    entries: Vec<Option<Entry>>,
    free: Vec<usize>,
    levels: [Level; 5],
    /// Ticks elapsed since wheel creation.
    jiffies: u64,
    /// Next tick to be processed; trails `jiffies` while expiries run.
    timer_jiffies: u64,
    /// Generation source for newly allocated entries.
    next_gen: u64,
    prev: Option<Instant>,
    /// Sub-tick nanosecond remainder carried between runner invocations.
    carry: u128,
}

impl WheelInner {
    /// Picks the wheel position for a timer expiring at tick `expire`.
    ///
    /// A timer set to go off in the past lands in the current level-0
    /// slot and fires on the next tick.
    fn bucket_for(&self, expire: u64) -> (usize, usize) {
        let delta = expire.wrapping_sub(self.timer_jiffies) as i64;
        if delta < 0 {
            (0, self.levels[0].index)
        } else if delta < 1 << LEVEL0_BITS {
            (0, (expire as usize) & (LEVEL0_SLOTS - 1))
        } else if delta < 1 << (LEVEL0_BITS + LEVELN_BITS) {
            (1, (expire >> LEVEL0_BITS) as usize & (LEVELN_SLOTS - 1))
        } else if delta < 1 << (LEVEL0_BITS + 2 * LEVELN_BITS) {
            (2, (expire >> (LEVEL0_BITS + LEVELN_BITS)) as usize & (LEVELN_SLOTS - 1))
        } else if delta < 1 << (LEVEL0_BITS + 3 * LEVELN_BITS) {
            (3, (expire >> (LEVEL0_BITS + 2 * LEVELN_BITS)) as usize & (LEVELN_SLOTS - 1))
        } else {
            (4, (expire >> (LEVEL0_BITS + 3 * LEVELN_BITS)) as usize & (LEVELN_SLOTS - 1))
        }
    }

    fn schedule(&mut self, id: usize, expire: u64) {
        let (level, slot) = self.bucket_for(expire);
        let Some(entry) = self.entries.get_mut(id).and_then(Option::as_mut) else {
            return;
        };
        entry.expire = expire;
        entry.pos = Some((level, slot));
        let gen = entry.gen;
        self.levels[level].slots[slot].push((id, gen));
    }

    /// Removes `id` from its slot. `false` if it was not scheduled.
    fn unschedule(&mut self, id: usize) -> bool {
        let Some(entry) = self.entries.get_mut(id).and_then(Option::as_mut) else {
            return false;
        };
        let Some((level, slot)) = entry.pos.take() else {
            return false;
        };
        let list = &mut self.levels[level].slots[slot];
        if let Some(at) = list.iter().position(|&(t, _)| t == id) {
            list.remove(at);
        }
        true
    }

    /// Empties the current slot of `level` into the levels below, then
    /// advances the level index. Returns the post-advance index.
    fn cascade(&mut self, level: usize) -> usize {
        let index = self.levels[level].index;
        let ids = mem::take(&mut self.levels[level].slots[index]);
        for (id, gen) in ids {
            let expire = match self.entries.get(id).and_then(Option::as_ref) {
                Some(entry) if entry.gen == gen && entry.pos == Some((level, index)) => {
                    entry.expire
                }
                _ => continue,
            };
            self.schedule(id, expire);
        }
        let next = (index + 1) & (LEVELN_SLOTS - 1);
        self.levels[level].index = next;
        next
    }
}

/// The timer multiplexer: one timerfd drives any number of [`Timer`]s,
/// all sharing the wheel's tick granularity.
///
/// The backing descriptor is armed only while at least one timer is
/// scheduled, so an idle wheel costs no wakeups.
pub struct TimerWheel {
    fd: OwnedFd,
    /// Milliseconds per tick.
    min_interval: u64,
    inner: RefCell<WheelInner>,
    /// Number of currently scheduled timers; arms and disarms `fd` on the
    /// 0 <-> 1 transitions.
    active: AtomicI64,
}

impl AsRawFd for TimerWheel {
    fn as_raw_fd(&self) -> RawFd { self.fd.as_raw_fd() }
}

impl TimerWheel {
    /// Creates a wheel ticking every `min_interval_ms` milliseconds
    /// (0 selects the 5ms default). The finest granularity any timer on
    /// this wheel can resolve is one tick.
    pub fn new(min_interval_ms: u32) -> io::Result<Rc<Self>> {
        let min_interval = match min_interval_ms {
            0 => DEFAULT_TICK_MS,
            ms => ms as u64,
        };
        Ok(Rc::new(Self {
            fd: sys::timerfd()?,
            min_interval,
            inner: RefCell::new(WheelInner {
                entries: vec![],
                free: vec![],
                levels: [
                    Level::new(LEVEL0_SLOTS),
                    Level::new(LEVELN_SLOTS),
                    Level::new(LEVELN_SLOTS),
                    Level::new(LEVELN_SLOTS),
                    Level::new(LEVELN_SLOTS),
                ],
                jiffies: 0,
                timer_jiffies: 0,
                next_gen: 0,
                prev: None,
                carry: 0,
            }),
            active: AtomicI64::new(0),
        }))
    }

    /// Tick length in milliseconds.
    pub fn min_interval(&self) -> u64 { self.min_interval }

    /// Rounds a millisecond interval up to whole ticks.
    fn ticks_for(&self, interval_ms: u32) -> u64 {
        (interval_ms as u64 + self.min_interval - 1) / self.min_interval
    }

    fn alloc(&self, interval: u64, callback: Box<dyn FnMut()>) -> usize {
        let mut inner = self.inner.borrow_mut();
        let gen = inner.next_gen;
        inner.next_gen += 1;
        let entry = Entry {
            interval,
            expire: 0,
            gen,
            pos: None,
            callback: Some(callback),
        };
        match inner.free.pop() {
            Some(id) => {
                inner.entries[id] = Some(entry);
                id
            }
            None => {
                inner.entries.push(Some(entry));
                inner.entries.len() - 1
            }
        }
    }

    fn release(&self, id: usize) {
        self.stop_timer(id);
        let mut inner = self.inner.borrow_mut();
        if inner.entries.get(id).map(Option::is_some) == Some(true) {
            inner.entries[id] = None;
            inner.free.push(id);
        }
    }

    fn start_timer(&self, id: usize) -> bool {
        {
            let mut inner = self.inner.borrow_mut();
            let jiffies = inner.jiffies;
            let expire = match inner.entries.get_mut(id).and_then(Option::as_mut) {
                Some(entry) if entry.interval > 0 && entry.pos.is_none() => {
                    jiffies + entry.interval
                }
                _ => return false,
            };
            inner.schedule(id, expire);
        }
        self.check_start();
        true
    }

    fn stop_timer(&self, id: usize) {
        if self.inner.borrow_mut().unschedule(id) {
            self.check_stop();
        }
    }

    fn set_timer_interval(&self, id: usize, interval_ms: u32) {
        self.stop_timer(id);
        let ticks = self.ticks_for(interval_ms);
        if let Some(entry) = self.inner.borrow_mut().entries.get_mut(id).and_then(Option::as_mut) {
            entry.interval = ticks;
        }
    }

    fn check_start(&self) {
        if self.active.fetch_add(1, Ordering::SeqCst) == 0 {
            let period = Duration::from_millis(self.min_interval);
            if let Err(_err) = sys::arm_timerfd(self.fd.as_raw_fd(), period) {
                #[cfg(feature = "log")]
                log::error!(target: "timer", "can't arm timerfd {}: {_err}", self.fd.as_raw_fd());
            }
        }
    }

    fn check_stop(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            if let Err(_err) = sys::disarm_timerfd(self.fd.as_raw_fd()) {
                #[cfg(feature = "log")]
                log::error!(target: "timer", "can't disarm timerfd {}: {_err}", self.fd.as_raw_fd());
            }
        }
    }

    /// Runs every slot whose tick has come, cascading higher levels each
    /// time level 0 wraps around.
    ///
    /// Callbacks run with no internal borrow held, so they are free to
    /// start, stop or drop timers on this wheel.
    fn run_timer_list(&self) {
        loop {
            let expired;
            {
                let mut inner = self.inner.borrow_mut();
                if inner.jiffies < inner.timer_jiffies {
                    break;
                }
                let index = inner.levels[0].index;
                if index == 0 {
                    let mut level = 1;
                    loop {
                        let next = inner.cascade(level);
                        level += 1;
                        if next != 1 || level >= 5 {
                            break;
                        }
                    }
                }
                expired = (mem::take(&mut inner.levels[0].slots[index]), index);
                inner.levels[0].index = (index + 1) & (LEVEL0_SLOTS - 1);
                inner.timer_jiffies += 1;
            }
            let (pairs, slot) = expired;
            for (id, gen) in pairs {
                self.expire_one(id, gen, slot);
            }
        }
    }

    /// Fires one expired pair taken from level 0's `slot`. A callback run
    /// earlier in the same pass may have dropped, restarted or id-reused
    /// this entry; any of those invalidates the pair and it fires nothing.
    fn expire_one(&self, id: usize, gen: u64, slot: usize) {
        let callback = {
            let mut inner = self.inner.borrow_mut();
            match inner.entries.get_mut(id).and_then(Option::as_mut) {
                Some(entry) if entry.gen == gen && entry.pos == Some((0, slot)) => {
                    entry.pos = None;
                    entry.callback.take()
                }
                _ => None,
            }
        };
        let Some(mut callback) = callback else {
            return;
        };
        callback();
        {
            // The callback may have dropped its own timer, freeing the id
            // for reuse; only an entry with a vacant callback slot gets the
            // callback back.
            let mut inner = self.inner.borrow_mut();
            if let Some(entry) = inner.entries.get_mut(id).and_then(Option::as_mut) {
                if entry.callback.is_none() {
                    entry.callback = Some(callback);
                }
            }
        }
        self.check_stop();
    }

    /// Converts wall time elapsed since the previous invocation into whole
    /// ticks and runs them, carrying the sub-tick remainder forward.
    pub(crate) fn periodic_runner(&self) {
        let interval_ns = self.min_interval as u128 * 1_000_000;
        let steps = {
            let mut inner = self.inner.borrow_mut();
            let now = Instant::now();
            let steps = match inner.prev.replace(now) {
                None => 1,
                Some(prev) => {
                    inner.carry += now.duration_since(prev).as_nanos();
                    let whole = inner.carry / interval_ns;
                    inner.carry -= whole * interval_ns;
                    whole as u64
                }
            };
            inner.jiffies += steps;
            steps
        };
        if steps > 0 {
            self.run_timer_list();
        }
    }

    #[cfg(test)]
    pub(crate) fn advance(&self, ticks: u64) {
        self.inner.borrow_mut().jiffies += ticks;
        self.run_timer_list();
    }
}

/// A single timer on a [`TimerWheel`]. Fires once per [`Timer::start`];
/// call [`Timer::restart`] (from the callback or elsewhere) to make it
/// periodic. Dropping the handle cancels any pending expiry.
pub struct Timer {
    wheel: Rc<TimerWheel>,
    id: usize,
}

impl Timer {
    /// Registers a callback firing `interval_ms` (rounded up to whole
    /// ticks) after each [`Timer::start`]. The timer starts out parked.
    pub fn new(wheel: &Rc<TimerWheel>, interval_ms: u32, callback: impl FnMut() + 'static) -> Self {
        let ticks = wheel.ticks_for(interval_ms);
        let id = wheel.alloc(ticks, Box::new(callback));
        Self {
            wheel: wheel.clone(),
            id,
        }
    }

    /// Schedules the next expiry a full interval from now.
    ///
    /// Returns `false` if the timer is already scheduled or its interval
    /// is zero.
    pub fn start(&self) -> bool { self.wheel.start_timer(self.id) }

    /// Cancels the pending expiry, if any. Idempotent.
    pub fn stop(&self) { self.wheel.stop_timer(self.id) }

    pub fn restart(&self) {
        self.stop();
        self.start();
    }

    /// Replaces the interval, stopping the timer; the caller restarts it
    /// when ready.
    pub fn set_interval(&self, interval_ms: u32) {
        self.wheel.set_timer_interval(self.id, interval_ms)
    }
}

impl Drop for Timer {
    fn drop(&mut self) { self.wheel.release(self.id) }
}

/// Event object wiring a [`TimerWheel`] into the event loop: each edge on
/// the backing timerfd drains the expiration counter and advances the
/// wheel by however much wall time has passed.
pub struct WheelEvent {
    wheel: Rc<TimerWheel>,
    binding: LoopBinding,
}

impl WheelEvent {
    pub(crate) fn with(wheel: Rc<TimerWheel>) -> Arc<Self> {
        Arc::new(Self {
            wheel,
            binding: LoopBinding::new(),
        })
    }
}

impl EventHandler for WheelEvent {
    fn fd(&self) -> RawFd { self.wheel.as_raw_fd() }

    fn binding(&self) -> &LoopBinding { &self.binding }

    fn on_input(&self) -> Dispatch {
        sys::drain_counter(self.wheel.as_raw_fd());
        self.wheel.periodic_runner();
        Dispatch::Handled
    }
}
