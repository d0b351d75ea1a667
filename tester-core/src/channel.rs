//! Channel supervision: binds a sampler, edge deriver, battery controller,
//! coulomb counter, and SoC sequencer to one channel identity.
//!
//! The supervisor is the only component that touches more than one of the
//! above. It owns the battery record and the measurement accumulator,
//! dispatches operator commands to the right state machine, applies the
//! sequencer's controller commands, and turns everything observable into
//! telemetry records on the channel's outbound queue.

use core::fmt::Write as _;

use heapless::String;

use crate::bus::BusFault;
use crate::command::OperatorEvent;
use crate::config::{ChannelConfig, ConfigError};
use crate::controller::{
    BatteryController, BcEvent, BcState, BcTransition, Leg, SwitchDriver,
};
use crate::coulomb::CoulombCounter;
use crate::events::EdgeDeriver;
use crate::sample::{AdcReader, ChannelId, Sample, Sampler, TimestampMicros};
use crate::soc::{SocCommand, SocOutcome, SocRunner, SocStep};
use crate::telemetry::{ChannelQueue, FaultKind, Record, RecordKind, BATTERY_ID_LEN};

/// How a battery id came to be bound.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IdSource {
    /// Generated on insertion, before the operator supplied one.
    Generated,
    /// Supplied by the operator through `set_id`.
    Operator,
}

/// The battery currently in the holder.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BatteryRecord {
    pub id: String<BATTERY_ID_LEN>,
    pub source: IdSource,
    pub bound_at_us: TimestampMicros,
}

/// Where a controller event originated; decides whether an ignored event is
/// an operator misuse worth a fault record.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum Origin {
    Operator,
    Derived,
    Sequencer,
    Internal,
}

/// Supervisor for one measurement channel.
pub struct ChannelSupervisor<D: SwitchDriver> {
    channel: ChannelId,
    config: ChannelConfig,
    sampler: Sampler,
    deriver: EdgeDeriver,
    bc: BatteryController<D>,
    counter: CoulombCounter,
    soc: SocRunner,
    battery: Option<BatteryRecord>,
    pending_id: Option<String<BATTERY_ID_LEN>>,
    id_seq: u16,
    soc_armed: bool,
    decimation_left: u16,
    last_v_mv: i32,
}

impl<D: SwitchDriver> ChannelSupervisor<D> {
    pub fn new(channel: ChannelId, config: ChannelConfig, driver: D) -> Self {
        Self {
            channel,
            sampler: Sampler::new(channel, config.calibration, config.sample_period_us()),
            deriver: EdgeDeriver::new(&config),
            bc: BatteryController::new(driver),
            counter: CoulombCounter::new(config.max_sample_gap_us()),
            soc: SocRunner::new(channel),
            battery: None,
            pending_id: None,
            id_seq: 0,
            soc_armed: false,
            decimation_left: 0,
            last_v_mv: 0,
            config,
        }
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn bc_state(&self) -> Option<BcState> {
        self.bc.state()
    }

    pub fn soc(&self) -> &SocRunner {
        &self.soc
    }

    pub fn battery(&self) -> Option<&BatteryRecord> {
        self.battery.as_ref()
    }

    pub fn counter(&self) -> &CoulombCounter {
        &self.counter
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Read access to the switch driver, for rig introspection.
    pub fn driver(&self) -> &D {
        self.bc.driver()
    }

    /// Selects whether a `charge` command starts a capacity measurement run
    /// or a plain controller charge. Set by the measurement screen.
    pub fn arm_soc(&mut self, armed: bool) {
        self.soc_armed = armed;
    }

    pub fn soc_armed(&self) -> bool {
        self.soc_armed
    }

    /// Applies a configuration change.
    ///
    /// Writes are only permitted while the channel is electrically idle;
    /// anything else returns [`ConfigError::Busy`] without touching the
    /// configuration.
    pub fn update_config(
        &mut self,
        apply: impl FnOnce(&mut ChannelConfig) -> Result<(), ConfigError>,
    ) -> Result<(), ConfigError> {
        if !matches!(
            self.bc.state(),
            None | Some(BcState::Disabled) | Some(BcState::NoBat) | Some(BcState::BatId)
        ) {
            return Err(ConfigError::Busy);
        }

        let mut updated = self.config;
        apply(&mut updated)?;
        self.config = updated;

        self.sampler
            .reconfigure(updated.calibration, updated.sample_period_us());
        self.deriver.reconfigure(&updated);
        self.counter.set_max_gap_us(updated.max_sample_gap_us());
        Ok(())
    }

    /// One scheduler pass: acquire a sample if due, then poll the sequencer.
    ///
    /// The caller holds the bus for the duration of the call.
    pub fn service(
        &mut self,
        adc: &mut dyn AdcReader,
        now: TimestampMicros,
        queue: &mut ChannelQueue,
    ) {
        let sampling = !matches!(self.bc.state(), None | Some(BcState::Disabled));
        if sampling && self.sampler.due(now) {
            match self.sampler.acquire(adc, now) {
                Ok(sample) => self.ingest_sample(&sample, queue),
                Err(_) => {
                    // Already retried once at the source: treat as a
                    // hardware fault and take the channel out of service.
                    self.emit(
                        queue,
                        now,
                        RecordKind::Fault {
                            fault: FaultKind::Sampler,
                            detail: "repeated ADC read failure",
                        },
                    );
                    self.apply_bc_event(BcEvent::Disable, Origin::Internal, now, queue);
                }
            }
        }

        self.poll_soc(now, queue);
    }

    /// Feeds one calibrated sample through the deriver, controller, and
    /// integrator.
    pub fn ingest_sample(&mut self, sample: &Sample, queue: &mut ChannelQueue) {
        self.last_v_mv = sample.v_batt_mv;

        let edges = self.deriver.process(sample, self.bc.state());
        for edge in &edges {
            self.apply_bc_event(edge.edge.bc_event(), Origin::Derived, sample.t_us, queue);
        }

        if matches!(
            self.bc.state(),
            Some(BcState::Charge) | Some(BcState::Discharge)
        ) {
            self.counter.accumulate(sample);
        }

        if self.decimation_left == 0 {
            self.decimation_left = self.config.telemetry_decimation.saturating_sub(1);
            self.emit(
                queue,
                sample.t_us,
                RecordKind::Sample {
                    v_mv: sample.v_batt_mv,
                    i_ch_ma: sample.i_ch_ma,
                    i_dch_ma: sample.i_dch_ma,
                },
            );
        } else {
            self.decimation_left -= 1;
        }
    }

    /// Dispatches one operator command to the controller or the sequencer.
    pub fn handle_operator(
        &mut self,
        event: OperatorEvent,
        now: TimestampMicros,
        queue: &mut ChannelQueue,
    ) {
        match event {
            OperatorEvent::Disable => {
                self.apply_bc_event(BcEvent::Disable, Origin::Operator, now, queue);
            }
            OperatorEvent::Init => {
                self.apply_bc_event(BcEvent::Init, Origin::Operator, now, queue);
            }
            OperatorEvent::GetId => {
                self.apply_bc_event(BcEvent::GetId, Origin::Operator, now, queue);
            }
            OperatorEvent::SetId(id) => {
                if id.is_empty() || !id.chars().all(|c| c.is_ascii_graphic() || c == ' ') {
                    self.command_fault(queue, now, "battery id must be printable and non-empty");
                    return;
                }
                self.pending_id = Some(id);
                if !self.apply_bc_event(BcEvent::SetId, Origin::Operator, now, queue) {
                    self.pending_id = None;
                }
            }
            OperatorEvent::Charge => {
                if self.soc_armed {
                    if self.soc.in_progress() {
                        self.command_fault(queue, now, "measurement already in progress");
                        return;
                    }
                    let step = self.soc.start(self.bc.state(), &self.config, now);
                    self.process_soc_step(step, now, queue);
                } else {
                    self.apply_bc_event(BcEvent::Charge, Origin::Operator, now, queue);
                }
            }
            OperatorEvent::Discharge => {
                if self.soc_armed {
                    // The run sequences its own discharges.
                    self.command_fault(queue, now, "discharge not accepted while measurement armed");
                } else {
                    self.apply_bc_event(BcEvent::Discharge, Origin::Operator, now, queue);
                }
            }
            OperatorEvent::Pause => {
                self.apply_bc_event(BcEvent::Pause, Origin::Operator, now, queue);
            }
            OperatorEvent::Resume => {
                self.apply_bc_event(BcEvent::Resume, Origin::Operator, now, queue);
            }
            OperatorEvent::Reset => {
                self.apply_bc_event(BcEvent::Reset, Origin::Operator, now, queue);
            }
            OperatorEvent::ResetMetrics => {
                self.apply_bc_event(BcEvent::ResetMetrics, Origin::Operator, now, queue);
            }
            OperatorEvent::Cancel => {
                if !self.soc.in_progress() {
                    self.command_fault(queue, now, "no measurement to cancel");
                    return;
                }
                let step = self.soc.cancel(self.bc.state(), now);
                self.process_soc_step(step, now, queue);
            }
        }
    }

    /// Raises a bus fault from the arbiter on this channel's telemetry.
    pub fn handle_bus_fault(
        &mut self,
        fault: BusFault,
        now: TimestampMicros,
        queue: &mut ChannelQueue,
    ) {
        debug_assert_eq!(fault.channel, self.channel);
        self.emit(
            queue,
            now,
            RecordKind::Fault {
                fault: FaultKind::Bus,
                detail: "transaction abandoned after hold limit",
            },
        );
    }

    /// Polls the sequencer's timers outside a sample acquisition.
    ///
    /// Rest phases advance on wall clock alone, so the executor wakes the
    /// supervisor even when no sample is due.
    pub fn tick(&mut self, now: TimestampMicros, queue: &mut ChannelQueue) {
        self.poll_soc(now, queue);
    }

    fn poll_soc(&mut self, now: TimestampMicros, queue: &mut ChannelQueue) {
        if !self.soc.in_progress() {
            return;
        }
        let step = self
            .soc
            .tick(self.bc.state(), &self.counter, self.last_v_mv, now);
        self.process_soc_step(step, now, queue);
    }

    fn process_soc_step(&mut self, step: SocStep, now: TimestampMicros, queue: &mut ChannelQueue) {
        if let Some(transition) = step.transition {
            self.emit(
                queue,
                now,
                RecordKind::SocTransition {
                    from: transition.from,
                    to: transition.to,
                    num_cycles: transition.num_cycles,
                    max_cycles: transition.max_cycles,
                },
            );
        }

        for command in &step.commands {
            let event = match command {
                SocCommand::Charge => BcEvent::Charge,
                SocCommand::Discharge => BcEvent::Discharge,
                SocCommand::Pause => BcEvent::Pause,
                SocCommand::ResetMetrics => BcEvent::ResetMetrics,
            };
            self.apply_bc_event(event, Origin::Sequencer, now, queue);
        }

        if let Some(outcome) = step.finished {
            if outcome == SocOutcome::Error {
                self.emit(
                    queue,
                    now,
                    RecordKind::Fault {
                        fault: FaultKind::Protocol,
                        detail: "controller state inconsistent with measurement phase",
                    },
                );
            }

            let battery_id = self
                .battery
                .as_ref()
                .map(|record| record.id.clone())
                .unwrap_or_default();
            let mut cycles = heapless::Vec::new();
            for cycle in self.soc.cycles() {
                let _ = cycles.push(*cycle);
            }
            self.emit(
                queue,
                now,
                RecordKind::SocResult {
                    run_id: String::try_from(self.soc.run_id()).unwrap_or_default(),
                    battery_id,
                    started_at_us: self.soc.run_started_at(),
                    finished_at_us: now,
                    outcome,
                    cycles,
                },
            );
        }
    }

    /// Runs one controller event, then the supervisor-side bookkeeping the
    /// resulting transition calls for. Returns `true` when the controller
    /// accepted the event.
    fn apply_bc_event(
        &mut self,
        event: BcEvent,
        origin: Origin,
        now: TimestampMicros,
        queue: &mut ChannelQueue,
    ) -> bool {
        let transition = match self.bc.handle(event, now) {
            Ok(Some(transition)) => transition,
            Ok(None) => {
                if origin == Origin::Operator {
                    self.command_fault(queue, now, "command not valid in this state");
                }
                return false;
            }
            Err(_) => {
                // Switch sink failed: the channel goes out of service.
                self.emit(
                    queue,
                    now,
                    RecordKind::Fault {
                        fault: FaultKind::Switch,
                        detail: "switch sink failed to apply state",
                    },
                );
                let transition = self.bc.force_disable(now);
                self.counter.seal();
                self.emit_bc_transition(&transition, queue);
                return false;
            }
        };

        self.post_transition(&transition, now);
        self.emit_bc_transition(&transition, queue);
        true
    }

    /// Supervisor-owned entry actions: battery record and accumulator.
    fn post_transition(&mut self, transition: &BcTransition, now: TimestampMicros) {
        match transition.to {
            BcState::NoBat => {
                self.battery = None;
                self.counter.seal();
            }
            BcState::BatNoId => {
                let id = self.generate_battery_id();
                self.battery = Some(BatteryRecord {
                    id,
                    source: IdSource::Generated,
                    bound_at_us: now,
                });
            }
            BcState::BatId => match transition.event {
                BcEvent::SetId => {
                    if let Some(id) = self.pending_id.take() {
                        self.battery = Some(BatteryRecord {
                            id,
                            source: IdSource::Operator,
                            bound_at_us: now,
                        });
                    }
                    self.counter.reset();
                    self.deriver.reset();
                }
                BcEvent::ResetMetrics => {
                    self.counter.reset();
                }
                _ => {}
            },
            BcState::Charge => self.counter.arm(Leg::Charge, now),
            BcState::Discharge => self.counter.arm(Leg::Discharge, now),
            BcState::ChargePause
            | BcState::Charged
            | BcState::DischargePause
            | BcState::Discharged
            | BcState::Yanked
            | BcState::Disabled => self.counter.seal(),
            BcState::GetId => {}
        }
    }

    fn emit_bc_transition(&mut self, transition: &BcTransition, queue: &mut ChannelQueue) {
        let record = RecordKind::BcTransition {
            from: transition.from,
            to: transition.to,
            event: transition.event,
            battery_id: self.battery.as_ref().map(|b| b.id.clone()),
            mah_charge: self.counter.totals(Leg::Charge).mah_rounded(),
            mah_discharge: self.counter.totals(Leg::Discharge).mah_rounded(),
        };
        self.emit(queue, transition.t_us, record);
    }

    fn command_fault(&mut self, queue: &mut ChannelQueue, now: TimestampMicros, detail: &'static str) {
        self.emit(
            queue,
            now,
            RecordKind::Fault {
                fault: FaultKind::Command,
                detail,
            },
        );
    }

    fn emit(&mut self, queue: &mut ChannelQueue, t_us: TimestampMicros, kind: RecordKind) {
        queue.push(Record::new(self.channel, t_us, kind));
    }

    fn generate_battery_id(&mut self) -> String<BATTERY_ID_LEN> {
        self.id_seq = self.id_seq.wrapping_add(1);
        let mut id = String::new();
        let _ = write!(id, "B{}-{:04}", self.channel.number(), self.id_seq);
        id
    }
}
