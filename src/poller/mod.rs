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

//! Readiness multiplexer capability. The reactor core is written against the
//! object-safe [`Poll`] trait; two concrete backends implement it: the
//! edge-triggered [`epoll::Epoll`] engine (primary) and the poll(2)-based
//! [`popol::Poller`] (drop-in fallback for platforms without a native
//! multiplexer). Both must satisfy the same conformance suite.

pub mod epoll;
#[cfg(feature = "popol")]
pub mod popol;

use std::fmt::{self, Display, Formatter};
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{io, ops};

/// Information about I/O operations a descriptor is ready for (or is being
/// registered for).
#[derive(Copy, Clone, Ord, PartialOrd, Eq, PartialEq, Hash, Debug)]
pub struct IoType {
    /// Specifies whether the I/O source has data to read.
    pub read: bool,
    /// Specifies whether the I/O source is ready for write operations.
    pub write: bool,
}

impl IoType {
    pub fn none() -> Self {
        Self {
            read: false,
            write: false,
        }
    }

    pub fn read_only() -> Self {
        Self {
            read: true,
            write: false,
        }
    }

    pub fn write_only() -> Self {
        Self {
            read: false,
            write: true,
        }
    }

    pub fn read_write() -> Self {
        Self {
            read: true,
            write: true,
        }
    }

    pub fn is_none(self) -> bool { !self.read && !self.write }
}

/// A single dimension of I/O readiness.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Io {
    Read,
    Write,
}

impl Iterator for IoType {
    type Item = Io;

    /// Yields the pending dimensions in dispatch order, reads before
    /// writes, consuming the flags.
    fn next(&mut self) -> Option<Self::Item> {
        if self.read {
            self.read = false;
            Some(Io::Read)
        } else if self.write {
            self.write = false;
            Some(Io::Write)
        } else {
            None
        }
    }
}

impl ops::Not for IoType {
    type Output = Self;

    fn not(self) -> Self::Output {
        Self {
            read: !self.read,
            write: !self.write,
        }
    }
}

impl Display for IoType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match (self.read, self.write) {
            (false, false) => f.write_str("none"),
            (true, false) => f.write_str("read"),
            (false, true) => f.write_str("write"),
            (true, true) => f.write_str("read-write"),
        }
    }
}

/// Terminal readiness condition reported by a multiplexer instead of plain
/// I/O readiness. Carries the backend's raw event bits.
#[derive(Copy, Clone, Debug, Display, Error)]
#[display(doc_comments)]
pub enum IoFail {
    /// connection is absent (POSIX events {0:#b})
    Connectivity(u32),
    /// OS-level error (POSIX events {0:#b})
    Os(u32),
}

/// A readiness multiplexer engine.
///
/// Registered descriptors are always watched for error and hangup conditions
/// in addition to the requested [`IoType`] interest. Backends report
/// readiness once per transition where the OS supports edge-triggered
/// semantics; consumers must drain descriptors until the operation would
/// block either way, which makes a level-triggered backend a behavioral
/// superset and a valid drop-in substitute.
pub trait Poll {
    /// Starts watching a descriptor with the given interest.
    fn register(&mut self, fd: RawFd, interest: IoType) -> io::Result<()>;

    /// Stops watching a descriptor. Unregistering a descriptor that is not
    /// currently watched is not an error.
    fn unregister(&mut self, fd: RawFd) -> io::Result<()>;

    /// Blocks until readiness is available or the timeout elapses; fills the
    /// internal event queue and returns the number of events added.
    ///
    /// Interrupted waits surface as [`io::ErrorKind::Interrupted`]; the
    /// caller decides whether to retry.
    fn wait(&mut self, timeout: Option<Duration>) -> io::Result<usize>;

    /// Pops the next queued readiness event.
    fn next(&mut self) -> Option<(RawFd, Result<IoType, IoFail>)>;
}
