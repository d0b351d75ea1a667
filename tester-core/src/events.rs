//! Edge derivation: turns the calibrated sample stream into the discrete
//! events the controller FSM consumes.
//!
//! The deriver keeps a short ring of recent samples and evaluates each new
//! sample against it. Every edge kind carries its own debounce window; a
//! fired edge suppresses re-firing of the same kind until the window has
//! passed. Within one sample tick, current edges are reported before voltage
//! edges so that a yank during active current flow surfaces as `ch_drop` /
//! `dch_drop` rather than `v_drop`.
//!
//! The deriver is stateless with respect to controller state except for the
//! two termination events, which only make sense while current is flowing;
//! controller state is a read-only input.

use heapless::{Deque, Vec};

use crate::config::ChannelConfig;
use crate::controller::{BcEvent, BcState};
use crate::sample::{Sample, TimestampMicros};

/// Ring depth. Sized for 1.6 s of history at the default 20 Hz cadence,
/// comfortably above the 600 ms the widest window needs.
pub const RING_CAPACITY: usize = 32;

/// How long the charge current must stay under the termination threshold.
pub const CH_DONE_HOLD_US: u64 = 30_000_000;
/// How long the terminal voltage must stay at or under the empty threshold.
pub const DCH_DONE_HOLD_US: u64 = 2_000_000;

/// Discrete edges derived from the sample stream.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Edge {
    VJump,
    VDrop,
    ChJump,
    ChDrop,
    DchJump,
    DchDrop,
    ChDone,
    DchDone,
}

impl Edge {
    /// The controller event this edge maps to.
    pub const fn bc_event(self) -> BcEvent {
        match self {
            Edge::VJump => BcEvent::VJump,
            Edge::VDrop => BcEvent::VDrop,
            Edge::ChJump => BcEvent::ChJump,
            Edge::ChDrop => BcEvent::ChDrop,
            Edge::DchJump => BcEvent::DchJump,
            Edge::DchDrop => BcEvent::DchDrop,
            Edge::ChDone => BcEvent::ChDone,
            Edge::DchDone => BcEvent::DchDone,
        }
    }
}

/// An edge together with the sample that produced it.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct EdgeEvent {
    pub edge: Edge,
    pub t_us: TimestampMicros,
    pub sample: Sample,
}

/// Threshold snapshot taken from the channel configuration.
#[derive(Copy, Clone, Debug, PartialEq)]
struct Thresholds {
    v_jump_mv: i32,
    v_drop_mv: i32,
    v_jump_window_us: u64,
    v_drop_window_us: u64,
    i_edge_ma: i32,
    i_edge_window_us: u64,
    i_term_ch_ma: i32,
    v_full_mv: i32,
    v_empty_mv: i32,
}

impl Thresholds {
    fn from_config(config: &ChannelConfig) -> Self {
        Self {
            v_jump_mv: config.v_jump_mv,
            v_drop_mv: config.v_drop_mv,
            v_jump_window_us: config.v_jump_window_ms as u64 * 1_000,
            v_drop_window_us: config.v_drop_window_ms as u64 * 1_000,
            i_edge_ma: config.i_edge_ma,
            i_edge_window_us: config.i_edge_window_ms as u64 * 1_000,
            i_term_ch_ma: config.i_term_ch_ma,
            v_full_mv: config.v_full_mv,
            v_empty_mv: config.v_empty_mv,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Point {
    t_us: TimestampMicros,
    v_mv: i32,
    i_ch_ma: i32,
    i_dch_ma: i32,
}

/// Per-channel edge deriver.
pub struct EdgeDeriver {
    thresholds: Thresholds,
    ring: Deque<Point, RING_CAPACITY>,
    v_jump_mute_until: TimestampMicros,
    v_drop_mute_until: TimestampMicros,
    ch_mute_until: TimestampMicros,
    dch_mute_until: TimestampMicros,
    ch_tail_since: Option<TimestampMicros>,
    dch_under_since: Option<TimestampMicros>,
}

impl EdgeDeriver {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            thresholds: Thresholds::from_config(config),
            ring: Deque::new(),
            v_jump_mute_until: 0,
            v_drop_mute_until: 0,
            ch_mute_until: 0,
            dch_mute_until: 0,
            ch_tail_since: None,
            dch_under_since: None,
        }
    }

    /// Drops all history, e.g. after a new battery is identified or the
    /// sampler paused long enough that old points would fake an edge.
    pub fn reset(&mut self) {
        while self.ring.pop_front().is_some() {}
        self.ch_tail_since = None;
        self.dch_under_since = None;
    }

    /// Re-reads thresholds after a configuration write and clears history.
    pub fn reconfigure(&mut self, config: &ChannelConfig) {
        self.thresholds = Thresholds::from_config(config);
        self.reset();
    }

    /// Evaluates one sample against the ring and returns the edges it fired,
    /// current edges first.
    pub fn process(&mut self, sample: &Sample, bc: Option<BcState>) -> Vec<EdgeEvent, 4> {
        let mut fired: Vec<EdgeEvent, 4> = Vec::new();
        let now = sample.t_us;
        let th = self.thresholds;

        // Current edges. If both directions of change show within the window
        // (a fast transient), report the drop: it is the yank indicator.
        if now >= self.ch_mute_until {
            let edge = current_edge(
                self.window(now, th.i_edge_window_us),
                sample.i_ch_ma,
                th.i_edge_ma,
                |p| p.i_ch_ma,
            );
            if let Some(edge) = edge {
                self.ch_mute_until = now + th.i_edge_window_us;
                push(&mut fired, edge_for_leg(edge, false), sample);
            }
        }
        if now >= self.dch_mute_until {
            let edge = current_edge(
                self.window(now, th.i_edge_window_us),
                sample.i_dch_ma,
                th.i_edge_ma,
                |p| p.i_dch_ma,
            );
            if let Some(edge) = edge {
                self.dch_mute_until = now + th.i_edge_window_us;
                push(&mut fired, edge_for_leg(edge, true), sample);
            }
        }

        // Termination events, gated on the controller actually running the
        // matching operation.
        if bc == Some(BcState::Charge) {
            if sample.i_ch_ma < th.i_term_ch_ma {
                let since = *self.ch_tail_since.get_or_insert(now);
                if now.saturating_sub(since) >= CH_DONE_HOLD_US && sample.v_batt_mv >= th.v_full_mv
                {
                    self.ch_tail_since = None;
                    push(&mut fired, Edge::ChDone, sample);
                }
            } else {
                self.ch_tail_since = None;
            }
        } else {
            self.ch_tail_since = None;
        }

        if bc == Some(BcState::Discharge) && sample.v_batt_mv <= th.v_empty_mv {
            let since = *self.dch_under_since.get_or_insert(now);
            if now.saturating_sub(since) >= DCH_DONE_HOLD_US {
                self.dch_under_since = None;
                push(&mut fired, Edge::DchDone, sample);
            }
        } else {
            self.dch_under_since = None;
        }

        // Voltage edges, evaluated last. Jump and drop use different windows
        // and debounce independently.
        if now >= self.v_jump_mute_until {
            let min = self
                .window(now, th.v_jump_window_us)
                .map(|p| p.v_mv)
                .min();
            if let Some(min) = min {
                if sample.v_batt_mv - min >= th.v_jump_mv {
                    self.v_jump_mute_until = now + th.v_jump_window_us;
                    push(&mut fired, Edge::VJump, sample);
                }
            }
        }
        if now >= self.v_drop_mute_until {
            let max = self
                .window(now, th.v_drop_window_us)
                .map(|p| p.v_mv)
                .max();
            if let Some(max) = max {
                if max - sample.v_batt_mv >= th.v_drop_mv {
                    self.v_drop_mute_until = now + th.v_drop_window_us;
                    push(&mut fired, Edge::VDrop, sample);
                }
            }
        }

        if self.ring.is_full() {
            self.ring.pop_front();
        }
        let _ = self.ring.push_back(Point {
            t_us: now,
            v_mv: sample.v_batt_mv,
            i_ch_ma: sample.i_ch_ma,
            i_dch_ma: sample.i_dch_ma,
        });

        fired
    }

    /// Ring points inside the trailing window, excluding the current sample.
    fn window(
        &self,
        now: TimestampMicros,
        span_us: u64,
    ) -> impl Iterator<Item = &Point> + '_ {
        let cutoff = now.saturating_sub(span_us);
        self.ring.iter().filter(move |p| p.t_us >= cutoff)
    }
}

enum CurrentEdge {
    Jump,
    Drop,
}

fn current_edge<'a>(
    window: impl Iterator<Item = &'a Point>,
    now_ma: i32,
    threshold_ma: i32,
    value: impl Fn(&Point) -> i32,
) -> Option<CurrentEdge> {
    let mut min = None;
    let mut max = None;
    for point in window {
        let v = value(point);
        min = Some(min.map_or(v, |m: i32| m.min(v)));
        max = Some(max.map_or(v, |m: i32| m.max(v)));
    }

    let dropped = max.is_some_and(|max| max - now_ma >= threshold_ma);
    let jumped = min.is_some_and(|min| now_ma - min >= threshold_ma);

    if dropped {
        Some(CurrentEdge::Drop)
    } else if jumped {
        Some(CurrentEdge::Jump)
    } else {
        None
    }
}

const fn edge_for_leg(edge: CurrentEdge, discharge: bool) -> Edge {
    match (edge, discharge) {
        (CurrentEdge::Jump, false) => Edge::ChJump,
        (CurrentEdge::Drop, false) => Edge::ChDrop,
        (CurrentEdge::Jump, true) => Edge::DchJump,
        (CurrentEdge::Drop, true) => Edge::DchDrop,
    }
}

fn push(fired: &mut Vec<EdgeEvent, 4>, edge: Edge, sample: &Sample) {
    let _ = fired.push(EdgeEvent {
        edge,
        t_us: sample.t_us,
        sample: *sample,
    });
}
