//! Battery Controller state machine: the single source of truth for one
//! channel's electrical state.
//!
//! The controller owns the charge and discharge MOSFETs through the
//! [`SwitchDriver`] trait and is the only component allowed to assert them.
//! Events not listed in the transition table are ignored without effect,
//! except that `disable` is always honoured. Switch settings for the target
//! state are re-applied on every entry, so a transition also repairs any
//! earlier entry whose driver call failed.

use serde::Serialize;

use crate::sample::TimestampMicros;

/// States of the battery controller FSM.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BcState {
    Disabled,
    NoBat,
    BatNoId,
    GetId,
    BatId,
    Charge,
    ChargePause,
    Charged,
    Discharge,
    DischargePause,
    Discharged,
    Yanked,
}

impl BcState {
    /// Human readable state name, as shown on the front panel.
    pub const fn name(self) -> &'static str {
        match self {
            BcState::Disabled => "Disabled",
            BcState::NoBat => "No Battery",
            BcState::BatNoId => "Battery, No ID",
            BcState::GetId => "Awaiting Bat ID",
            BcState::BatId => "Battery+ID",
            BcState::Charge => "Charging",
            BcState::ChargePause => "Charge Paused",
            BcState::Charged => "Charged",
            BcState::Discharge => "Discharging",
            BcState::DischargePause => "Discharge Paused",
            BcState::Discharged => "Discharged",
            BcState::Yanked => "Yanked",
        }
    }

    /// The leg that must be conducting in this state, if any.
    pub const fn active_leg(self) -> Option<Leg> {
        match self {
            BcState::Charge => Some(Leg::Charge),
            BcState::Discharge => Some(Leg::Discharge),
            _ => None,
        }
    }

    /// Returns `true` when a battery id must be bound in this state.
    pub const fn requires_battery_id(self) -> bool {
        matches!(
            self,
            BcState::BatId
                | BcState::Charge
                | BcState::ChargePause
                | BcState::Charged
                | BcState::Discharge
                | BcState::DischargePause
                | BcState::Discharged
        )
    }
}

impl core::fmt::Display for BcState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Events consumed by the controller FSM.
///
/// The first block arrives from the event deriver, the second from the
/// operator (directly or via the SoC sequencer).
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BcEvent {
    VJump,
    VDrop,
    ChJump,
    ChDrop,
    DchJump,
    DchDrop,
    ChDone,
    DchDone,
    Disable,
    Init,
    Charge,
    Discharge,
    Pause,
    Resume,
    Reset,
    GetId,
    SetId,
    ResetMetrics,
}

/// One of the two current paths through a channel.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Leg {
    Charge,
    Discharge,
}

/// Failure reported by a [`SwitchDriver`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum SwitchError {
    /// The switch did not reach the commanded state within its deadline.
    Timeout,
    /// The output driver reported a hardware fault.
    Gpio,
}

/// Abstraction over the channel's charge/discharge MOSFET pair.
///
/// `set` must be idempotent; implementations complete within 5 ms or report
/// [`SwitchError::Timeout`].
pub trait SwitchDriver {
    fn set(&mut self, leg: Leg, on: bool) -> Result<(), SwitchError>;
}

/// Switch driver that performs no hardware interaction.
#[derive(Copy, Clone, Debug, Default)]
pub struct NoopSwitchDriver;

impl SwitchDriver for NoopSwitchDriver {
    fn set(&mut self, _: Leg, _: bool) -> Result<(), SwitchError> {
        Ok(())
    }
}

/// Record of one accepted transition.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BcTransition {
    pub from: Option<BcState>,
    pub to: BcState,
    pub event: BcEvent,
    pub t_us: TimestampMicros,
}

/// Battery controller FSM for one channel.
///
/// Starts in an unknown state and must receive `init` (or `disable`) before
/// anything else happens on the channel.
pub struct BatteryController<D: SwitchDriver> {
    state: Option<BcState>,
    driver: D,
}

impl<D: SwitchDriver> BatteryController<D> {
    pub fn new(driver: D) -> Self {
        Self {
            state: None,
            driver,
        }
    }

    /// Current state, or `None` before the first `init`/`disable`.
    pub fn state(&self) -> Option<BcState> {
        self.state
    }

    /// Read access to the switch driver.
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Looks up the target state for `event` in the current state.
    fn target(&self, event: BcEvent) -> Option<BcState> {
        use BcEvent as E;
        use BcState as S;

        // A disable is honoured from every state.
        if event == E::Disable {
            return Some(S::Disabled);
        }

        match (self.state, event) {
            (None, E::Init) => Some(S::NoBat),
            (Some(S::NoBat), E::VJump) => Some(S::BatNoId),
            (Some(S::BatNoId), E::GetId) => Some(S::GetId),
            (Some(S::BatNoId), E::VDrop) => Some(S::Yanked),
            (Some(S::GetId), E::SetId) => Some(S::BatId),
            (Some(S::GetId), E::VDrop) => Some(S::Yanked),
            (Some(S::BatId), E::Charge) => Some(S::Charge),
            (Some(S::BatId), E::Discharge) => Some(S::Discharge),
            (Some(S::BatId), E::VDrop) => Some(S::Yanked),
            (Some(S::Charge), E::Pause) => Some(S::ChargePause),
            (Some(S::Charge), E::ChDrop) => Some(S::Yanked),
            (Some(S::Charge), E::ChDone) => Some(S::Charged),
            (Some(S::ChargePause), E::Resume) => Some(S::Charge),
            (Some(S::ChargePause), E::ResetMetrics) => Some(S::BatId),
            (Some(S::ChargePause), E::VDrop) => Some(S::Yanked),
            (Some(S::Charged), E::ResetMetrics) => Some(S::BatId),
            (Some(S::Charged), E::VDrop) => Some(S::Yanked),
            (Some(S::Discharge), E::Pause) => Some(S::DischargePause),
            (Some(S::Discharge), E::DchDrop) => Some(S::Yanked),
            (Some(S::Discharge), E::DchDone) => Some(S::Discharged),
            (Some(S::DischargePause), E::Resume) => Some(S::Discharge),
            (Some(S::DischargePause), E::ResetMetrics) => Some(S::BatId),
            (Some(S::DischargePause), E::VDrop) => Some(S::Yanked),
            (Some(S::Discharged), E::ResetMetrics) => Some(S::BatId),
            (Some(S::Discharged), E::VDrop) => Some(S::Yanked),
            (Some(S::Yanked), E::Reset) => Some(S::NoBat),
            (Some(S::Yanked), E::VJump) => Some(S::BatNoId),
            _ => None,
        }
    }

    /// Applies `event`, running the entry actions of the target state.
    ///
    /// Returns `Ok(None)` when the event is not valid in the current state
    /// (a no-op by design), `Ok(Some(..))` on an accepted transition, and
    /// `Err` when the switch driver failed while entering the new state. On
    /// `Err` the caller must take the channel out of service via
    /// [`force_disable`](Self::force_disable).
    pub fn handle(
        &mut self,
        event: BcEvent,
        now: TimestampMicros,
    ) -> Result<Option<BcTransition>, SwitchError> {
        let Some(to) = self.target(event) else {
            return Ok(None);
        };

        let from = self.state;
        self.apply_switches(to)?;
        self.state = Some(to);

        Ok(Some(BcTransition {
            from,
            to,
            event,
            t_us: now,
        }))
    }

    /// Takes the channel out of service after a hardware fault.
    ///
    /// Deasserts both legs on a best-effort basis; a failing driver cannot
    /// prevent the state change.
    pub fn force_disable(&mut self, now: TimestampMicros) -> BcTransition {
        let from = self.state;
        let _ = self.driver.set(Leg::Charge, false);
        let _ = self.driver.set(Leg::Discharge, false);
        self.state = Some(BcState::Disabled);
        BcTransition {
            from,
            to: BcState::Disabled,
            event: BcEvent::Disable,
            t_us: now,
        }
    }

    /// Drives both MOSFETs to the configuration `to` requires.
    ///
    /// Break-before-make: the leg that must be off is released before the
    /// other is asserted, so the two can never conduct together.
    fn apply_switches(&mut self, to: BcState) -> Result<(), SwitchError> {
        match to.active_leg() {
            Some(Leg::Charge) => {
                self.driver.set(Leg::Discharge, false)?;
                self.driver.set(Leg::Charge, true)
            }
            Some(Leg::Discharge) => {
                self.driver.set(Leg::Charge, false)?;
                self.driver.set(Leg::Discharge, true)
            }
            None => {
                self.driver.set(Leg::Charge, false)?;
                self.driver.set(Leg::Discharge, false)
            }
        }
    }
}
