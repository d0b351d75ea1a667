//! Arbitration of the shared I²C line.
//!
//! One transaction holds the bus at a time. Contending channels queue in
//! FIFO order, and a holder that overstays the bounded hold time loses the
//! bus with a fault raised to its supervisor. The arbiter is poll-driven:
//! a queued channel simply re-requests on its next scheduler pass.

use heapless::Deque;

use crate::sample::{ChannelId, TimestampMicros, MAX_CHANNELS};

/// Default ceiling on a single bus hold, in microseconds.
pub const DEFAULT_HOLD_LIMIT_US: u64 = 20_000;

/// Outcome of a bus request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BusGrant {
    /// The caller now holds the bus.
    Granted,
    /// Another channel holds the bus or is ahead in line; try again later.
    Queued,
}

/// Raised to the supervisor whose transaction the arbiter abandoned.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BusFault {
    pub channel: ChannelId,
}

#[derive(Copy, Clone, Debug)]
struct Holder {
    channel: ChannelId,
    deadline: TimestampMicros,
}

/// Single-holder FIFO-fair lock over the I²C line.
pub struct BusArbiter {
    holder: Option<Holder>,
    waiters: Deque<ChannelId, MAX_CHANNELS>,
    hold_limit_us: u64,
}

impl BusArbiter {
    pub fn new(hold_limit_us: u64) -> Self {
        Self {
            holder: None,
            waiters: Deque::new(),
            hold_limit_us,
        }
    }

    /// Current bus holder, if any.
    pub fn holder(&self) -> Option<ChannelId> {
        self.holder.map(|h| h.channel)
    }

    /// Requests the bus for `channel`.
    ///
    /// Re-requesting while already holding is granted (and refreshes the
    /// hold deadline). Otherwise the bus goes to the head of the wait line.
    pub fn request(&mut self, channel: ChannelId, now: TimestampMicros) -> BusGrant {
        if let Some(holder) = self.holder {
            if holder.channel == channel {
                return BusGrant::Granted;
            }
            self.join_line(channel);
            return BusGrant::Queued;
        }

        match self.waiters.front() {
            None => self.grant(channel, now),
            Some(&front) if front == channel => {
                self.waiters.pop_front();
                self.grant(channel, now)
            }
            Some(_) => {
                self.join_line(channel);
                BusGrant::Queued
            }
        }
    }

    /// Releases the bus after a completed transaction.
    pub fn release(&mut self, channel: ChannelId) {
        if self.holder.map(|h| h.channel) == Some(channel) {
            self.holder = None;
        }
    }

    /// Abandons a transaction that exceeded the hold limit.
    ///
    /// Returns the fault to raise to the offending channel's supervisor.
    pub fn check_timeout(&mut self, now: TimestampMicros) -> Option<BusFault> {
        let holder = self.holder?;
        if now < holder.deadline {
            return None;
        }
        self.holder = None;
        Some(BusFault {
            channel: holder.channel,
        })
    }

    fn grant(&mut self, channel: ChannelId, now: TimestampMicros) -> BusGrant {
        self.holder = Some(Holder {
            channel,
            deadline: now + self.hold_limit_us,
        });
        BusGrant::Granted
    }

    fn join_line(&mut self, channel: ChannelId) {
        if !self.waiters.iter().any(|&waiting| waiting == channel) {
            let _ = self.waiters.push_back(channel);
        }
    }
}

impl Default for BusArbiter {
    fn default() -> Self {
        Self::new(DEFAULT_HOLD_LIMIT_US)
    }
}
