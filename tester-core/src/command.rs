//! Operator command taxonomy and per-channel delivery.
//!
//! The operator source (front-panel UI or a remote) produces events tagged
//! with a target channel or a broadcast marker. The router queues them for
//! the addressed supervisor; a broadcast `disable` jumps every queue so it
//! takes effect on the next scheduler pass of each channel.

use heapless::{Deque, String};

use crate::sample::{ChannelId, MAX_CHANNELS};
use crate::telemetry::BATTERY_ID_LEN;

/// Commands the operator can issue to a channel.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OperatorEvent {
    Disable,
    Init,
    GetId,
    SetId(String<BATTERY_ID_LEN>),
    Charge,
    Discharge,
    Pause,
    Resume,
    Reset,
    ResetMetrics,
    Cancel,
}

/// Addressing for an operator command.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandTarget {
    Channel(ChannelId),
    Broadcast,
}

/// An addressed operator command.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct OperatorCommand {
    pub target: CommandTarget,
    pub event: OperatorEvent,
}

/// Depth of each channel's inbound command queue.
pub const COMMAND_QUEUE_DEPTH: usize = 8;

/// Error surfaced when a command cannot be enqueued.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CommandEnqueueError {
    /// The addressed channel's queue has reached its capacity.
    QueueFull(ChannelId),
}

/// Delivers operator commands to the addressed channel's queue.
pub struct CommandRouter {
    queues: [Deque<OperatorEvent, COMMAND_QUEUE_DEPTH>; MAX_CHANNELS],
}

impl Default for CommandRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandRouter {
    pub const fn new() -> Self {
        Self {
            queues: [Deque::new(), Deque::new(), Deque::new(), Deque::new()],
        }
    }

    /// Routes one command. Broadcasts go to every channel; a broadcast
    /// `disable` is pushed to the front of each queue.
    pub fn deliver(&mut self, command: OperatorCommand) -> Result<(), CommandEnqueueError> {
        match command.target {
            CommandTarget::Channel(channel) => self.enqueue(channel, command.event),
            CommandTarget::Broadcast => {
                for channel in ChannelId::ALL {
                    if command.event == OperatorEvent::Disable {
                        self.enqueue_front(channel, OperatorEvent::Disable)?;
                    } else {
                        self.enqueue(channel, command.event.clone())?;
                    }
                }
                Ok(())
            }
        }
    }

    /// Takes the next pending command for `channel`.
    pub fn next(&mut self, channel: ChannelId) -> Option<OperatorEvent> {
        self.queues[channel.index()].pop_front()
    }

    /// Pending command count for `channel`.
    pub fn pending(&self, channel: ChannelId) -> usize {
        self.queues[channel.index()].len()
    }

    fn enqueue(
        &mut self,
        channel: ChannelId,
        event: OperatorEvent,
    ) -> Result<(), CommandEnqueueError> {
        self.queues[channel.index()]
            .push_back(event)
            .map_err(|_| CommandEnqueueError::QueueFull(channel))
    }

    fn enqueue_front(
        &mut self,
        channel: ChannelId,
        event: OperatorEvent,
    ) -> Result<(), CommandEnqueueError> {
        let queue = &mut self.queues[channel.index()];
        if queue.is_full() {
            // Disable outranks whatever arrived last.
            queue.pop_back();
        }
        queue
            .push_front(event)
            .map_err(|_| CommandEnqueueError::QueueFull(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addressed(channel: ChannelId, event: OperatorEvent) -> OperatorCommand {
        OperatorCommand {
            target: CommandTarget::Channel(channel),
            event,
        }
    }

    #[test]
    fn commands_reach_only_the_addressed_channel() {
        let mut router = CommandRouter::new();
        router
            .deliver(addressed(ChannelId::ALL[1], OperatorEvent::Charge))
            .unwrap();

        assert_eq!(router.next(ChannelId::ALL[0]), None);
        assert_eq!(router.next(ChannelId::ALL[1]), Some(OperatorEvent::Charge));
        assert_eq!(router.next(ChannelId::ALL[1]), None);
    }

    #[test]
    fn queue_preserves_order() {
        let mut router = CommandRouter::new();
        let channel = ChannelId::ALL[0];
        router.deliver(addressed(channel, OperatorEvent::GetId)).unwrap();
        router
            .deliver(addressed(
                channel,
                OperatorEvent::SetId(String::try_from("A1").unwrap()),
            ))
            .unwrap();

        assert_eq!(router.next(channel), Some(OperatorEvent::GetId));
        assert_eq!(
            router.next(channel),
            Some(OperatorEvent::SetId(String::try_from("A1").unwrap()))
        );
    }

    #[test]
    fn broadcast_disable_jumps_every_queue() {
        let mut router = CommandRouter::new();
        for channel in ChannelId::ALL {
            router.deliver(addressed(channel, OperatorEvent::Charge)).unwrap();
        }
        router
            .deliver(OperatorCommand {
                target: CommandTarget::Broadcast,
                event: OperatorEvent::Disable,
            })
            .unwrap();

        for channel in ChannelId::ALL {
            assert_eq!(router.next(channel), Some(OperatorEvent::Disable));
            assert_eq!(router.next(channel), Some(OperatorEvent::Charge));
        }
    }

    #[test]
    fn overflowing_a_queue_reports_the_channel() {
        let mut router = CommandRouter::new();
        let channel = ChannelId::ALL[2];
        for _ in 0..COMMAND_QUEUE_DEPTH {
            router.deliver(addressed(channel, OperatorEvent::Pause)).unwrap();
        }

        assert_eq!(
            router.deliver(addressed(channel, OperatorEvent::Resume)),
            Err(CommandEnqueueError::QueueFull(channel))
        );
    }
}
