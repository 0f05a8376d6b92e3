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

//! poll(2)-based multiplexer backend built on the [`popol`] library, for
//! platforms without a native readiness facility. Level-triggered, which is
//! a behavioral superset of the edge-triggered contract since all event
//! objects drain their descriptors until the operation would block.

use std::collections::VecDeque;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use popol::Sources;

use crate::poller::{IoFail, IoType, Poll};

/// Manager for a set of descriptors polled by the reactor through the
/// [`popol`] library.
pub struct Poller {
    sources: Sources<RawFd>,
    fired: Vec<popol::Event<RawFd>>,
    events: VecDeque<(RawFd, Result<IoType, IoFail>)>,
}

impl Poller {
    pub fn new() -> Self {
        Self {
            sources: Sources::new(),
            fired: vec![],
            events: empty!(),
        }
    }
}

impl Default for Poller {
    fn default() -> Self { Self::new() }
}

impl Poll for Poller {
    fn register(&mut self, fd: RawFd, interest: IoType) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Registering {fd} with interest `{interest}`");

        // Sources must not hold the same key twice.
        self.sources.unregister(&fd);
        self.sources.register(fd, &fd, interest_for(interest));
        Ok(())
    }

    fn unregister(&mut self, fd: RawFd) -> io::Result<()> {
        #[cfg(feature = "log")]
        log::trace!(target: "popol", "Unregistering {fd}");

        self.sources.unregister(&fd);
        Ok(())
    }

    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize> {
        let len = self.events.len();

        #[cfg(feature = "log")]
        log::trace!(target: "popol",
            "Polling {} descriptors with timeout {timeout:?} (pending event queue is {len})",
            self.sources.len(),
        );

        // Blocking call
        self.fired.clear();
        match self.sources.poll(&mut self.fired, timeout) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                #[cfg(feature = "log")]
                log::trace!(target: "popol", "Poll timed out with zero events generated");
                return Ok(0);
            }
            Err(err) => return Err(err),
        }

        for event in self.fired.drain(..) {
            let raw = event.raw_events() as u16 as u32;
            let res = if event.is_hangup() || event.is_invalid() {
                Err(IoFail::Connectivity(raw))
            } else if event.is_error() {
                Err(IoFail::Os(raw))
            } else {
                Ok(IoType {
                    read: event.is_readable(),
                    write: event.is_writable(),
                })
            };

            #[cfg(feature = "log")]
            log::trace!(target: "popol", "Got `{res:?}` for {}", event.key);

            self.events.push_back((event.key, res));
        }

        Ok(self.events.len() - len)
    }

    fn next(&mut self) -> Option<(RawFd, Result<IoType, IoFail>)> { self.events.pop_front() }
}

fn interest_for(ev: IoType) -> popol::interest::Interest {
    let mut interest = popol::interest::NONE;
    if ev.read {
        interest |= popol::interest::READ;
    }
    if ev.write {
        interest |= popol::interest::WRITE;
    }
    interest
}
