// SPDX-FileCopyrightText: 2025 Stanislaw Grams <stanislawgrams@gmail.com>
//
// SPDX-License-Identifier: BSD-2-Clause

//! Session controller components: the per-device state machine and the
//! retry policies that drive it.

pub mod machine;
pub mod policies;

pub use machine::{SessionEvent, SessionState, SessionStateMachine};
pub use policies::{ExponentialBackoff, FixedDelay, RetryPolicy};
