mod rig;

use std::io::{self, BufRead, Write};

use heapless::String as HeaplessString;
use log::{info, warn};

use tester_core::bus::BusArbiter;
use tester_core::channel::ChannelSupervisor;
use tester_core::command::{CommandRouter, CommandTarget, OperatorCommand, OperatorEvent};
use tester_core::config::ChannelConfig;
use tester_core::sample::{ChannelId, TimestampMicros};
use tester_core::telemetry::{Record, TelemetryRouter, TelemetrySink};

use rig::SimRig;

const TICK_US: u64 = 50_000;

/// Telemetry sink that prints one JSON object per line.
struct JsonLineSink;

impl TelemetrySink for JsonLineSink {
    fn try_send(&mut self, record: &Record) -> bool {
        match serde_json::to_string(record) {
            Ok(line) => {
                println!("{line}");
                true
            }
            Err(err) => {
                warn!("telemetry: failed to encode record: {err}");
                true
            }
        }
    }
}

struct Session {
    rig: SimRig,
    supervisors: Vec<ChannelSupervisor<rig::SimSwitch>>,
    commands: CommandRouter,
    telemetry: TelemetryRouter,
    bus: BusArbiter,
    sink: JsonLineSink,
    now_us: TimestampMicros,
}

impl Session {
    fn new() -> Self {
        let rig = SimRig::new();
        let supervisors = ChannelId::ALL
            .iter()
            .map(|&channel| {
                ChannelSupervisor::new(channel, ChannelConfig::default(), rig.switch(channel))
            })
            .collect();

        let mut session = Self {
            rig,
            supervisors,
            commands: CommandRouter::new(),
            telemetry: TelemetryRouter::new(),
            bus: BusArbiter::default(),
            sink: JsonLineSink,
            now_us: 0,
        };

        // Bring every channel up, the way main() does on the real hardware.
        for channel in ChannelId::ALL {
            session.deliver(CommandTarget::Channel(channel), OperatorEvent::Init);
        }
        session.run(0.05);
        session
    }

    fn deliver(&mut self, target: CommandTarget, event: OperatorEvent) {
        if let Err(err) = self.commands.deliver(OperatorCommand { target, event }) {
            warn!("command queue overflow: {err:?}");
        }
    }

    /// Advances simulated time, running the per-channel service loops.
    fn run(&mut self, seconds: f64) {
        let ticks = (seconds / 0.05).round() as u64;
        let mut adc = self.rig.adc();

        for _ in 0..ticks {
            self.now_us += TICK_US;
            self.rig.step(TICK_US);
            let abandoned = self.bus.check_timeout(self.now_us);

            for (index, sup) in self.supervisors.iter_mut().enumerate() {
                let channel = ChannelId::ALL[index];
                let queue = self.telemetry.queue_mut(channel);

                while let Some(event) = self.commands.next(channel) {
                    sup.handle_operator(event, self.now_us, queue);
                }

                if let Some(fault) = abandoned {
                    if fault.channel == channel {
                        sup.handle_bus_fault(fault, self.now_us, queue);
                    }
                }

                match self.bus.request(channel, self.now_us) {
                    tester_core::bus::BusGrant::Granted => {
                        sup.service(&mut adc, self.now_us, queue);
                        self.bus.release(channel);
                    }
                    tester_core::bus::BusGrant::Queued => {
                        // Retry on the next tick; the sampler tolerates a
                        // one-tick slip.
                        sup.tick(self.now_us, queue);
                    }
                }
            }

            self.pump();
        }
    }

    fn pump(&mut self) {
        self.telemetry.pump(&mut self.sink);
    }

    fn status(&self) -> Vec<String> {
        self.supervisors
            .iter()
            .map(|sup| {
                let channel = sup.channel();
                let cell = self.rig.cell(channel);
                let bc = sup
                    .bc_state()
                    .map_or("(uninitialised)", |state| state.name());
                let battery = sup
                    .battery()
                    .map_or_else(|| "-".to_string(), |b| b.id.as_str().to_string());
                format!(
                    "{channel}: {bc:<16} bat={battery:<10} soc_fsm={:?} cell={:.1}/{:.1} mAh",
                    sup.soc().state(),
                    cell.soc_mah,
                    cell.capacity_mah,
                )
            })
            .collect()
    }

    fn handle_command(&mut self, line: &str) -> Vec<String> {
        let mut parts = line.split_whitespace();
        let Some(verb) = parts.next() else {
            return Vec::new();
        };

        match verb {
            "help" => return help_lines(),
            "status" => return self.status(),
            "run" => {
                let seconds: f64 = match parts.next().and_then(|s| s.parse().ok()) {
                    Some(seconds) => seconds,
                    None => return vec!["usage: run <seconds>".into()],
                };
                self.run(seconds);
                return vec![format!("t = {:.1} s", self.now_us as f64 / 1e6)];
            }
            "disable-all" => {
                self.deliver(CommandTarget::Broadcast, OperatorEvent::Disable);
                self.run(0.05);
                return vec!["all channels disabled".into()];
            }
            _ => {}
        }

        // Everything else addresses one channel: `<verb> <ch> [...]`.
        let Some(channel) = parts
            .next()
            .and_then(|s| s.parse::<usize>().ok())
            .and_then(ChannelId::from_index)
        else {
            return vec![format!("usage: {verb} <channel 0-3> [...]")];
        };

        match verb {
            "insert" => {
                let capacity: f64 = parts.next().and_then(|s| s.parse().ok()).unwrap_or(50.0);
                self.rig.insert(channel, capacity, 0.3);
                info!("{channel}: cell seated ({capacity} mAh)");
            }
            "remove" => {
                self.rig.remove(channel);
                info!("{channel}: cell pulled");
            }
            "id" => {
                let Some(id) = parts.next() else {
                    return vec!["usage: id <channel> <battery-id>".into()];
                };
                let Ok(id) = HeaplessString::try_from(id) else {
                    return vec!["battery id too long (max 32 chars)".into()];
                };
                self.deliver(CommandTarget::Channel(channel), OperatorEvent::GetId);
                self.deliver(CommandTarget::Channel(channel), OperatorEvent::SetId(id));
            }
            "soc" => match parts.next() {
                Some("on") => self.supervisors[channel.index()].arm_soc(true),
                Some("off") => self.supervisors[channel.index()].arm_soc(false),
                _ => return vec!["usage: soc <channel> on|off".into()],
            },
            "charge" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Charge),
            "discharge" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Discharge),
            "pause" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Pause),
            "resume" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Resume),
            "reset" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Reset),
            "reset-metrics" => {
                self.deliver(CommandTarget::Channel(channel), OperatorEvent::ResetMetrics)
            }
            "cancel" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Cancel),
            "disable" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Disable),
            "init" => self.deliver(CommandTarget::Channel(channel), OperatorEvent::Init),
            other => return vec![format!("unknown command `{other}`; try `help`")],
        }

        // Give the channels a tick so the command takes effect promptly.
        self.run(0.05);
        Vec::new()
    }
}

fn help_lines() -> Vec<String> {
    [
        "insert <ch> [mAh]   seat a simulated cell (default 50 mAh, 30% charged)",
        "remove <ch>         pull the cell (yank)",
        "id <ch> <name>      identify the inserted battery",
        "soc <ch> on|off     arm capacity measurement for the channel",
        "charge <ch>         start charging (or a measurement run when armed)",
        "discharge <ch>      start discharging",
        "pause|resume <ch>   hold / continue the active operation",
        "reset <ch>          clear a yanked channel",
        "reset-metrics <ch>  zero the accumulator after a finished operation",
        "cancel <ch>         cancel the measurement run",
        "disable <ch>        take the channel out of service",
        "disable-all         broadcast disable to every channel",
        "run <seconds>       advance simulated time",
        "status              one line per channel",
        "exit                quit",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn main() -> io::Result<()> {
    env_logger::init();

    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let stdout = io::stdout();
    let mut writer = stdout.lock();
    let mut session = Session::new();
    let mut line = String::new();

    writeln!(
        writer,
        "Capacity tester rig simulator ready. Type `help` for commands or `exit` to quit."
    )?;

    loop {
        line.clear();
        write!(writer, "> ")?;
        writer.flush()?;

        let bytes_read = reader.read_line(&mut line)?;
        if bytes_read == 0 {
            writeln!(writer)?;
            break;
        }

        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        if trimmed.eq_ignore_ascii_case("exit") || trimmed.eq_ignore_ascii_case("quit") {
            writeln!(writer, "Session closed.")?;
            break;
        }

        for response in session.handle_command(trimmed) {
            writeln!(writer, "{response}")?;
        }
    }

    Ok(())
}
