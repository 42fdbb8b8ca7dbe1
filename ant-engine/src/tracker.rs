// Copyright 2023 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronous request handling.
//!
//! A caller registers what it expects *before* writing its command, the router offers every
//! response it reads, and the caller blocks until a match, a deadline or a cancel request.

use crate::message::{EventCode, Message};
use packed_struct::PrimitiveEnum;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::trace;

/// Set from any thread to abort blocked `*_with_timeout` calls
pub type CancelFlag = Arc<AtomicBool>;

/// Outcome codes of a synchronous operation
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ResponseStatus {
    Fail = 0,
    Pass = 1,
    Timeout = 2,
    Cancelled = 3,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("no response before the deadline")]
    Timeout,
    #[error("wait was cancelled")]
    Cancelled,
    #[error("engine shut down while waiting")]
    Closed,
}

impl From<WaitError> for ResponseStatus {
    fn from(err: WaitError) -> Self {
        match err {
            WaitError::Timeout => ResponseStatus::Timeout,
            WaitError::Cancelled => ResponseStatus::Cancelled,
            WaitError::Closed => ResponseStatus::Fail,
        }
    }
}

/// How a waiter gives up. A zero `timeout` never expires.
#[derive(Clone, Copy, Debug)]
pub struct WaitPolicy<'a> {
    pub timeout: Duration,
    pub cancel: Option<&'a AtomicBool>,
    pub cancel_poll: Duration,
}

impl WaitPolicy<'_> {
    fn deadline(&self) -> Option<Instant> {
        if self.timeout.is_zero() {
            None
        } else {
            Some(Instant::now() + self.timeout)
        }
    }

    /// What is left of this policy once the caller has spent time since `start`
    pub fn remaining(&self, start: Instant) -> Result<Self, WaitError> {
        if self.timeout.is_zero() {
            return Ok(*self);
        }
        match self.timeout.checked_sub(start.elapsed()) {
            Some(left) if !left.is_zero() => Ok(Self {
                timeout: left,
                ..*self
            }),
            _ => Err(WaitError::Timeout),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_some_and(|c| c.load(Ordering::Acquire))
    }

    /// Blocks on `cond` until `done` yields a value or the policy gives up
    fn block<'m, S, T>(
        &self,
        cond: &Condvar,
        mut guard: MutexGuard<'m, S>,
        mut done: impl FnMut(&mut S) -> Option<Result<T, WaitError>>,
    ) -> Result<T, WaitError> {
        let deadline = self.deadline();
        loop {
            if let Some(result) = done(&mut *guard) {
                return result;
            }
            if self.is_cancelled() {
                return Err(WaitError::Cancelled);
            }
            let slice = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(WaitError::Timeout);
                    }
                    let remaining = deadline - now;
                    if self.cancel.is_some() {
                        remaining.min(self.cancel_poll)
                    } else {
                        remaining
                    }
                }
                None if self.cancel.is_some() => self.cancel_poll,
                None => {
                    guard = cond.wait(guard).unwrap_or_else(PoisonError::into_inner);
                    continue;
                }
            };
            guard = cond
                .wait_timeout(guard, slice)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }
}

struct Waiter {
    token: u64,
    channel: Option<u8>,
    response: Option<Message>,
}

#[derive(Default)]
struct TrackerState {
    next_token: u64,
    waiters: HashMap<u8, Vec<Waiter>>,
    closed: bool,
}

/// Outstanding synchronous requests keyed on the message id that answers them
#[derive(Default)]
pub struct RequestTracker {
    state: Mutex<TrackerState>,
    cond: Condvar,
}

impl RequestTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TrackerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start expecting `message_id`, optionally only from `channel`.
    ///
    /// Must be called before the request is written so a fast device cannot answer first.
    pub fn register(&self, message_id: u8, channel: Option<u8>) -> PendingRequest<'_> {
        let mut state = self.lock();
        let token = state.next_token;
        state.next_token = state.next_token.wrapping_add(1);
        state.waiters.entry(message_id).or_default().push(Waiter {
            token,
            channel,
            response: None,
        });
        PendingRequest {
            tracker: self,
            message_id,
            token,
        }
    }

    /// Hand `msg` to the oldest matching waiter. Returns false if nobody wanted it.
    pub fn offer(&self, message_id: u8, channel: u8, msg: &Message) -> bool {
        let matched = {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            let waiter = state.waiters.get_mut(&message_id).and_then(|list| {
                list.iter_mut()
                    .find(|w| w.response.is_none() && w.channel.map_or(true, |c| c == channel))
            });
            match waiter {
                Some(w) => {
                    trace!(message_id, channel, token = w.token, "response matched");
                    w.response = Some(msg.clone());
                    true
                }
                None => false,
            }
        };
        if matched {
            self.cond.notify_all();
        }
        matched
    }

    /// Number of callers currently waiting
    pub fn pending(&self) -> usize {
        self.lock().waiters.values().map(Vec::len).sum()
    }

    /// Wake every waiter with [WaitError::Closed] and refuse to match anything further
    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }
}

/// Registration of one expected response, removed from the tracker on drop
pub struct PendingRequest<'a> {
    tracker: &'a RequestTracker,
    message_id: u8,
    token: u64,
}

impl PendingRequest<'_> {
    pub fn message_id(&self) -> u8 {
        self.message_id
    }

    fn take(&self, state: &mut TrackerState) -> Option<Message> {
        state
            .waiters
            .get_mut(&self.message_id)
            .and_then(|list| list.iter_mut().find(|w| w.token == self.token))
            .and_then(|w| w.response.take())
    }

    pub fn wait(self, policy: WaitPolicy<'_>) -> Result<Message, WaitError> {
        let tracker = self.tracker;
        policy.block(&tracker.cond, tracker.lock(), |state| match self.take(state) {
            Some(msg) => Some(Ok(msg)),
            None if state.closed => Some(Err(WaitError::Closed)),
            None => None,
        })
    }

    /// Wait for whichever of `self` and `other` is answered first. Both must come from the
    /// same tracker.
    pub fn wait_either(
        &self,
        other: &PendingRequest<'_>,
        policy: WaitPolicy<'_>,
    ) -> Result<Message, WaitError> {
        let tracker = self.tracker;
        debug_assert!(std::ptr::eq(tracker, other.tracker));
        policy.block(&tracker.cond, tracker.lock(), |state| {
            match self.take(state).or_else(|| other.take(state)) {
                Some(msg) => Some(Ok(msg)),
                None if state.closed => Some(Err(WaitError::Closed)),
                None => None,
            }
        })
    }
}

impl Drop for PendingRequest<'_> {
    fn drop(&mut self) {
        let mut state = self.tracker.lock();
        if let Some(list) = state.waiters.get_mut(&self.message_id) {
            list.retain(|w| w.token != self.token);
            if list.is_empty() {
                state.waiters.remove(&self.message_id);
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    /// Completes on the first `EVENT_TX` after the transfer began. On a master channel the
    /// device sends whatever data it holds at each period, so this confirms a transmission
    /// slot passed with the new data loaded, not that a peer received it. Events seen before
    /// [TransferMonitor::begin] returned never count.
    Broadcast,
    Acknowledged,
    Burst,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    Failed,
}

#[derive(Default)]
struct TransferState {
    busy: bool,
    channel: u8,
    kind: Option<TransferKind>,
    outstanding: usize,
    outcome: Option<TransferOutcome>,
    closed: bool,
}

/// Completion tracking for the single auto-managed data transfer an engine runs at a time
#[derive(Default)]
pub struct TransferMonitor {
    state: Mutex<TransferState>,
    cond: Condvar,
}

impl TransferMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Claim the monitor for a transfer of `packets` packets on `channel`. Waits under `policy`
    /// while another transfer is in flight.
    pub fn begin(
        &self,
        channel: u8,
        kind: TransferKind,
        packets: usize,
        policy: WaitPolicy<'_>,
    ) -> Result<ActiveTransfer<'_>, WaitError> {
        policy.block(&self.cond, self.lock(), |state| {
            if state.closed {
                return Some(Err(WaitError::Closed));
            }
            if state.busy {
                return None;
            }
            state.busy = true;
            state.channel = channel;
            state.kind = Some(kind);
            state.outstanding = packets;
            state.outcome = None;
            Some(Ok(()))
        })?;
        Ok(ActiveTransfer { monitor: self })
    }

    /// Feed a channel event seen by the router
    pub fn on_event(&self, channel: u8, code: u8) {
        let mut state = self.lock();
        let kind = match state.kind {
            Some(kind) if state.channel == channel && state.outcome.is_none() => kind,
            _ => return,
        };
        let outcome = match (kind, EventCode::from_primitive(code)) {
            (TransferKind::Broadcast, Some(EventCode::EventTx)) => TransferOutcome::Completed,
            (TransferKind::Broadcast, _) => return,
            (_, Some(EventCode::EventTransferTxCompleted)) => TransferOutcome::Completed,
            (_, Some(EventCode::EventTransferTxFailed)) => TransferOutcome::Failed,
            _ => return,
        };
        trace!(channel, ?kind, ?outcome, "transfer finished");
        state.outstanding = 0;
        state.outcome = Some(outcome);
        drop(state);
        self.cond.notify_all();
    }

    pub fn close(&self) {
        self.lock().closed = true;
        self.cond.notify_all();
    }
}

/// Exclusive handle on the transfer monitor, released on drop
pub struct ActiveTransfer<'a> {
    monitor: &'a TransferMonitor,
}

impl ActiveTransfer<'_> {
    /// Packets the caller still has to hand to the device
    pub fn outstanding(&self) -> usize {
        self.monitor.lock().outstanding
    }

    /// Record that one more packet went out
    pub fn packet_sent(&self) {
        let mut state = self.monitor.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
    }

    /// True once the device reported the transfer failed
    pub fn aborted(&self) -> bool {
        self.monitor.lock().outcome == Some(TransferOutcome::Failed)
    }

    pub fn wait(&self, policy: WaitPolicy<'_>) -> Result<TransferOutcome, WaitError> {
        policy.block(&self.monitor.cond, self.monitor.lock(), |state| {
            match state.outcome {
                Some(outcome) => Some(Ok(outcome)),
                None if state.closed => Some(Err(WaitError::Closed)),
                None => None,
            }
        })
    }
}

impl Drop for ActiveTransfer<'_> {
    fn drop(&mut self) {
        let mut state = self.monitor.lock();
        state.busy = false;
        state.kind = None;
        state.outstanding = 0;
        drop(state);
        self.monitor.cond.notify_all();
    }
}
