//! Telemetry records and the router that carries them off-channel.
//!
//! Records are strongly typed here and serialized by the external sink; the
//! engine does not mandate a wire encoding. Each channel gets a bounded
//! queue pair: sample records may be dropped oldest-first under
//! back-pressure, state transitions and run results ride in reserved slots
//! and are never discarded.

use heapless::{Deque, String, Vec};
use serde::Serialize;

use crate::config::MAX_CYCLES_LIMIT;
use crate::controller::{BcEvent, BcState};
use crate::sample::{ChannelId, TimestampMicros, MAX_CHANNELS};
use crate::soc::{CycleMetrics, SocOutcome, SocState, RUN_ID_LEN};

/// Maximum battery id length accepted from the operator.
pub const BATTERY_ID_LEN: usize = 32;

/// Droppable sample records buffered per channel.
pub const SAMPLE_QUEUE_DEPTH: usize = 32;
/// Reserved slots for records that must never be dropped.
pub const CRITICAL_QUEUE_DEPTH: usize = 16;

/// Fault classes reported through telemetry.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Repeated ADC read failure.
    Sampler,
    /// MOSFET driver failure.
    Switch,
    /// Bus transaction abandoned by the arbiter.
    Bus,
    /// Operator command rejected in the current state.
    Command,
    /// Sequencer observed the controller in an inconsistent state.
    Protocol,
}

/// Payload of one telemetry record. Serialized externally tagged, so each
/// wire object carries exactly one of the kind keys below.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Sample {
        v_mv: i32,
        i_ch_ma: i32,
        i_dch_ma: i32,
    },
    BcTransition {
        from: Option<BcState>,
        to: BcState,
        event: BcEvent,
        battery_id: Option<String<BATTERY_ID_LEN>>,
        mah_charge: i32,
        mah_discharge: i32,
    },
    SocTransition {
        from: SocState,
        to: SocState,
        num_cycles: u8,
        max_cycles: u8,
    },
    SocResult {
        run_id: String<RUN_ID_LEN>,
        battery_id: String<BATTERY_ID_LEN>,
        started_at_us: TimestampMicros,
        finished_at_us: TimestampMicros,
        outcome: SocOutcome,
        cycles: Vec<CycleMetrics, { MAX_CYCLES_LIMIT as usize }>,
    },
    Fault {
        fault: FaultKind,
        detail: &'static str,
    },
}

/// One telemetry record.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Record {
    pub channel: ChannelId,
    pub t_us: TimestampMicros,
    pub kind: RecordKind,
}

impl Record {
    pub fn new(channel: ChannelId, t_us: TimestampMicros, kind: RecordKind) -> Self {
        Self { channel, t_us, kind }
    }

    /// Returns `true` for record kinds that may be dropped under pressure.
    pub fn droppable(&self) -> bool {
        matches!(self.kind, RecordKind::Sample { .. })
    }
}

/// External record consumer. `try_send` returns `false` to reject.
pub trait TelemetrySink {
    fn try_send(&mut self, record: &Record) -> bool;
}

/// Outbound queue pair for one channel.
pub struct ChannelQueue {
    critical: Deque<Record, CRITICAL_QUEUE_DEPTH>,
    samples: Deque<Record, SAMPLE_QUEUE_DEPTH>,
    dropped_samples: u32,
    lost_critical: u32,
}

impl Default for ChannelQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ChannelQueue {
    pub const fn new() -> Self {
        Self {
            critical: Deque::new(),
            samples: Deque::new(),
            dropped_samples: 0,
            lost_critical: 0,
        }
    }

    /// Enqueues a record, applying the back-pressure policy for its class.
    pub fn push(&mut self, record: Record) {
        if record.droppable() {
            if self.samples.is_full() {
                self.samples.pop_front();
                self.dropped_samples += 1;
            }
            let _ = self.samples.push_back(record);
        } else {
            if self.critical.is_full() {
                // Sixteen unconsumed transitions means the sink has been gone
                // a long time; losing the oldest is the least bad option.
                self.critical.pop_front();
                self.lost_critical += 1;
            }
            let _ = self.critical.push_back(record);
        }
    }

    pub fn len(&self) -> usize {
        self.critical.len() + self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.critical.is_empty() && self.samples.is_empty()
    }

    /// Sample records discarded oldest-first because the queue was full.
    pub fn dropped_samples(&self) -> u32 {
        self.dropped_samples
    }

    /// Critical records lost; non-zero only after prolonged sink outage.
    pub fn lost_critical(&self) -> u32 {
        self.lost_critical
    }

    /// Offers queued records to the sink, critical class first, until the
    /// sink rejects one. Returns the number accepted.
    pub fn drain_into(&mut self, sink: &mut dyn TelemetrySink) -> usize {
        let mut accepted = 0;
        while let Some(record) = self.critical.front() {
            if !sink.try_send(record) {
                return accepted;
            }
            self.critical.pop_front();
            accepted += 1;
        }
        while let Some(record) = self.samples.front() {
            if !sink.try_send(record) {
                return accepted;
            }
            self.samples.pop_front();
            accepted += 1;
        }
        accepted
    }
}

/// Multiplexes the four channel queues into the external sink.
pub struct TelemetryRouter {
    queues: [ChannelQueue; MAX_CHANNELS],
}

impl Default for TelemetryRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetryRouter {
    pub const fn new() -> Self {
        Self {
            queues: [
                ChannelQueue::new(),
                ChannelQueue::new(),
                ChannelQueue::new(),
                ChannelQueue::new(),
            ],
        }
    }

    pub fn queue_mut(&mut self, channel: ChannelId) -> &mut ChannelQueue {
        &mut self.queues[channel.index()]
    }

    pub fn queue(&self, channel: ChannelId) -> &ChannelQueue {
        &self.queues[channel.index()]
    }

    /// Forwards as many queued records as the sink will take.
    pub fn pump(&mut self, sink: &mut dyn TelemetrySink) -> usize {
        self.queues
            .iter_mut()
            .map(|queue| queue.drain_into(sink))
            .sum()
    }
}
