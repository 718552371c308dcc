// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Quiescence barrier for a hypervisor's accelerator (ioctl) calls.
//!
//! See [`blocker::AccelBlocker`] for the protocol.  The building blocks, a
//! closable usage counter and a manual-reset event, live in [`lockcnt`] and
//! [`event`].

#![allow(clippy::style)]

pub extern crate usdt;

pub mod blocker;
pub mod event;
pub mod exclusive;
pub mod lockcnt;
pub mod worker;

pub use blocker::{AccelBlocker, BarrierStats, Scope};
pub use exclusive::{BigLock, ExclusiveContext};
pub use worker::{Registry, Worker, WorkerGuard, WorkerId, WorkerRegistry};
