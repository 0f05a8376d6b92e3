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

#![deny(
    non_upper_case_globals,
    non_camel_case_types,
    non_snake_case,
    unused_mut,
    unused_imports,
    dead_code
)]
#![cfg_attr(docsrs, feature(doc_auto_cfg))]

//! Single-threaded, callback-driven I/O reactor: an [`EventLoop`] blocks on a
//! readiness multiplexer and dispatches readiness to attached event objects.
//! Event objects come in a small closed family: raw [`AlarmEvent`]s, buffered
//! [`StreamEvent`]s, [`SocketListenerEvent`]s turning read-readiness into
//! accepted connections, and [`AsyncClientEvent`]s with a connect/disconnect
//! state machine. A hierarchical [`TimerWheel`] is driven by the loop through
//! its own periodic wake source and fires [`Timer`]s with O(1) amortized
//! scheduling cost.
//!
//! Dispatch is strictly single-threaded: exactly one thread runs the
//! wait/dispatch loop and every callback. The only cross-thread entry points
//! are [`AlarmHandle`] and [`Remote`].
//!
//! All event objects under the loop must be representable as file
//! descriptors.

#[macro_use]
extern crate amplify;

pub mod poller;
mod client;
mod event;
mod listener;
mod reactor;
mod stream;
mod sys;
mod timer;

pub use client::AsyncClientEvent;
pub use event::{AlarmEvent, AlarmHandle, Dispatch, EventHandler};
pub use listener::{Acceptor, SocketListenerEvent};
pub use reactor::{Error, EventLoop, LoopBinding, Remote};
pub use stream::{ClientError, ClientListener, StreamCore, StreamEvent};
pub use timer::{Timer, TimerWheel, WheelEvent};
