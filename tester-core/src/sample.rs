//! Sample acquisition: channel identity, the timestamped sample type, the
//! ADC abstraction, and the per-channel [`Sampler`].
//!
//! The sampler sweeps a channel's three measurement points (battery terminal
//! voltage, charge-leg shunt, discharge-leg shunt) through an [`AdcReader`],
//! converts raw counts to physical units with the channel calibration, and
//! stamps the result. Transient read failures are retried once; a second
//! failure is reported to the supervisor as a [`SamplerFault`], never to the
//! event deriver.

use serde::Serialize;

use crate::config::CalibrationSet;

/// Canonical timestamp units for the whole engine (monotonic microseconds).
pub type TimestampMicros = u64;

/// Number of independently measured channels on one device.
pub const MAX_CHANNELS: usize = 4;

/// Identifier for one of the four measurement channels.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Every channel, in index order.
    pub const ALL: [ChannelId; MAX_CHANNELS] =
        [ChannelId(0), ChannelId(1), ChannelId(2), ChannelId(3)];

    /// Attempts to construct a [`ChannelId`] from a raw index.
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < MAX_CHANNELS {
            Some(ChannelId(index as u8))
        } else {
            None
        }
    }

    /// Deterministic index for lookups into per-channel arrays.
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Raw channel number as printed on the board.
    pub const fn number(self) -> u8 {
        self.0
    }
}

impl core::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "BC{}", self.0)
    }
}

/// One calibrated measurement of a channel.
///
/// Currents are reported as measured; the two legs are mutually exclusive in
/// hardware, so at most one is meaningfully non-zero.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Sample {
    pub channel: ChannelId,
    pub t_us: TimestampMicros,
    pub v_batt_mv: i32,
    pub i_ch_ma: i32,
    pub i_dch_ma: i32,
}

/// Raw ADC counts from one sweep of a channel's three measurement points.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct RawSweep {
    pub v_batt: i32,
    pub i_ch: i32,
    pub i_dch: i32,
}

/// Failure reported by an [`AdcReader`] for a single sweep.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AdcError {
    /// The device did not acknowledge on the bus.
    Nak,
    /// The transaction did not complete in time.
    Timeout,
}

/// Source of raw ADC sweeps.
///
/// Implementations may multiplex one ADC across channels or use independent
/// converters; the engine does not care. A sweep must not suspend internally:
/// waiting for the bus happens before the call, at the arbiter.
pub trait AdcReader {
    fn sweep(&mut self, channel: ChannelId) -> Result<RawSweep, AdcError>;
}

/// Fault raised to the supervisor after the retry budget is exhausted.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SamplerFault {
    pub channel: ChannelId,
    pub error: AdcError,
}

/// Periodic sampler for one channel.
pub struct Sampler {
    channel: ChannelId,
    calibration: CalibrationSet,
    period_us: u64,
    next_due: TimestampMicros,
}

impl Sampler {
    pub fn new(channel: ChannelId, calibration: CalibrationSet, period_us: u64) -> Self {
        Self {
            channel,
            calibration,
            period_us,
            next_due: 0,
        }
    }

    /// Replaces the calibration and cadence after a configuration write.
    pub fn reconfigure(&mut self, calibration: CalibrationSet, period_us: u64) {
        self.calibration = calibration;
        self.period_us = period_us;
    }

    /// Returns `true` once the next period tick has been reached.
    pub fn due(&self, now: TimestampMicros) -> bool {
        now >= self.next_due
    }

    /// Sweeps the channel and converts the result, retrying once on failure.
    ///
    /// Advances the period tick regardless of outcome so a faulting channel
    /// does not spin.
    pub fn acquire(
        &mut self,
        adc: &mut dyn AdcReader,
        now: TimestampMicros,
    ) -> Result<Sample, SamplerFault> {
        self.next_due = now + self.period_us;

        let raw = match adc.sweep(self.channel) {
            Ok(raw) => raw,
            Err(_) => adc.sweep(self.channel).map_err(|error| SamplerFault {
                channel: self.channel,
                error,
            })?,
        };

        Ok(Sample {
            channel: self.channel,
            t_us: now,
            v_batt_mv: self.calibration.v_batt.apply(raw.v_batt),
            i_ch_ma: self.calibration.i_ch.apply(raw.i_ch),
            i_dch_ma: self.calibration.i_dch.apply(raw.i_dch),
        })
    }
}
