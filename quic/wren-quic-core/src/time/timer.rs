// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use crate::time::{Timestamp, K_GRANULARITY};
use core::time::Duration;

/// A cancellable deadline, polled by the connection's event loop
///
/// Timers never fire on their own; the owner asks for the earliest armed
/// deadline, sleeps until it, and then calls the expired component. Setting
/// and cancelling are therefore always safe, including from inside the
/// handler that is currently firing.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct Timer {
    deadline: Option<Timestamp>,
    /// A permanently cancelled timer refuses to be armed again
    dead: bool,
}

impl Timer {
    /// Arms the timer at `deadline`, replacing any previous deadline
    #[inline]
    pub fn set(&mut self, deadline: Timestamp) {
        if self.dead {
            return;
        }
        self.deadline = Some(deadline);
    }

    /// Arms the timer at `deadline` unless it is already armed within
    /// `granularity` of it
    ///
    /// Avoids churning the owner's wakeup schedule for insignificant moves.
    #[inline]
    pub fn update(&mut self, deadline: Timestamp, granularity: Duration) {
        if let Some(current) = self.deadline {
            let delta = if current > deadline {
                current - deadline
            } else {
                deadline - current
            };
            if delta <= granularity.max(K_GRANULARITY) {
                return;
            }
        }
        self.set(deadline);
    }

    /// Disarms the timer
    #[inline]
    pub fn cancel(&mut self) {
        self.deadline = None;
    }

    /// Disarms the timer and prevents it from ever being armed again
    #[inline]
    pub fn permanent_cancel(&mut self) {
        self.cancel();
        self.dead = true;
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.deadline.is_some()
    }

    #[inline]
    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    /// Returns true and disarms the timer if the deadline has passed
    #[inline]
    pub fn poll_expiration(&mut self, now: Timestamp) -> bool {
        match self.deadline {
            Some(deadline) if deadline.has_elapsed(now) => {
                self.deadline = None;
                true
            }
            _ => false,
        }
    }

    /// Folds this timer's deadline into an earliest-deadline accumulator
    #[inline]
    pub fn earliest(&self, other: Option<Timestamp>) -> Option<Timestamp> {
        match (self.deadline, other) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (deadline, None) => deadline,
            (None, other) => other,
        }
    }
}
