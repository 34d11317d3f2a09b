//! Single-flight command scheduler
//!
//! Most BLE stacks misbehave when a second GATT operation is started before
//! the first completes, so at most one command is ever in flight. Two FIFOs
//! (network and MQTT) share the link; when both have work they take turns.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use crate::link::{Link, PendingCommand, Queue};
use crate::LinkError;

#[derive(Debug)]
struct InFlight {
    command: PendingCommand,
    deadline: Instant,
}

/// Result of one `drain_one` call
#[derive(Debug, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Both queues are empty
    Idle,
    /// A command is already in flight
    Busy,
    Dispatched,
    /// The link refused the command; it has been removed from its queue
    Rejected(PendingCommand, LinkError),
}

#[derive(Debug)]
pub struct LinkScheduler {
    network: VecDeque<PendingCommand>,
    mqtt: VecDeque<PendingCommand>,
    /// true: MQTT goes next when both queues have work
    round_robin: bool,
    in_flight: Option<InFlight>,
    timeout: Duration,
    retry_limit: u32,
}

impl LinkScheduler {
    pub fn new(timeout: Duration, retry_limit: u32) -> Self {
        Self {
            network: VecDeque::new(),
            mqtt: VecDeque::new(),
            round_robin: true,
            in_flight: None,
            timeout,
            retry_limit,
        }
    }

    pub fn enqueue(&mut self, command: PendingCommand) {
        match command.queue() {
            Queue::Network => self.network.push_back(command),
            Queue::Mqtt => self.mqtt.push_back(command),
        }
    }

    /// Put a failed command back at the head of its queue if it has retries
    /// left. Returns the command when it has used them all.
    pub fn retry(&mut self, command: PendingCommand) -> Option<PendingCommand> {
        if command.attempts > self.retry_limit {
            return Some(command);
        }
        log::debug!(
            "retrying {:?} on {} (attempt {})",
            command.operation,
            command.characteristic,
            command.attempts + 1
        );
        match command.queue() {
            Queue::Network => self.network.push_front(command),
            Queue::Mqtt => self.mqtt.push_front(command),
        }
        None
    }

    fn next(&mut self) -> Option<PendingCommand> {
        match (self.network.is_empty(), self.mqtt.is_empty()) {
            (true, true) => None,
            (false, true) => self.network.pop_front(),
            (true, false) => self.mqtt.pop_front(),
            (false, false) => {
                let take_mqtt = self.round_robin;
                self.round_robin = !self.round_robin;
                if take_mqtt {
                    self.mqtt.pop_front()
                } else {
                    self.network.pop_front()
                }
            }
        }
    }

    /// Dispatch the next command if nothing is in flight
    pub fn drain_one<L: Link>(&mut self, link: &mut L, now: Instant) -> DrainOutcome {
        if self.in_flight.is_some() {
            return DrainOutcome::Busy;
        }
        let Some(mut command) = self.next() else {
            return DrainOutcome::Idle;
        };

        command.attempts += 1;
        match link.dispatch(&command) {
            Ok(()) => {
                log::trace!("dispatched {:?} on {}", command.operation, command.characteristic);
                self.in_flight = Some(InFlight {
                    command,
                    deadline: now + self.timeout,
                });
                DrainOutcome::Dispatched
            }
            Err(error) => {
                log::warn!("link refused {:?} on {}: {error}", command.operation, command.characteristic);
                DrainOutcome::Rejected(command, error)
            }
        }
    }

    pub fn in_flight(&self) -> Option<&PendingCommand> {
        self.in_flight.as_ref().map(|f| &f.command)
    }

    /// Clear the in-flight slot, handing back the command that occupied it
    pub fn complete(&mut self) -> Option<PendingCommand> {
        self.in_flight.take().map(|f| f.command)
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.in_flight.as_ref().map(|f| f.deadline)
    }

    /// The in-flight command, if its deadline has passed
    pub fn expire(&mut self, now: Instant) -> Option<PendingCommand> {
        match self.deadline() {
            Some(deadline) if now >= deadline => {
                let command = self.complete()?;
                log::warn!("{:?} on {} timed out", command.operation, command.characteristic);
                Some(command)
            }
            _ => None,
        }
    }

    pub fn pending(&self) -> usize {
        self.network.len() + self.mqtt.len()
    }

    pub fn is_idle(&self) -> bool {
        self.in_flight.is_none() && self.pending() == 0
    }

    /// Drop everything, including the in-flight command
    pub fn clear(&mut self) {
        self.network.clear();
        self.mqtt.clear();
        self.in_flight = None;
        self.round_robin = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gatelink_proto::gatt;

    #[derive(Default)]
    struct Recorder {
        sent: Vec<PendingCommand>,
        refuse: bool,
    }

    impl Link for Recorder {
        fn dispatch(&mut self, command: &PendingCommand) -> Result<(), LinkError> {
            if self.refuse {
                return Err(LinkError::Disconnected);
            }
            self.sent.push(command.clone());
            Ok(())
        }
    }

    fn net(n: u8) -> PendingCommand {
        PendingCommand::write(gatt::NETWORK_SERVICE, gatt::NETWORK_RX, vec![n])
    }

    fn mqtt(n: u8) -> PendingCommand {
        PendingCommand::write(gatt::MQTT_PROXY_SERVICE, gatt::MQTT_PROXY_RX, vec![n])
    }

    #[test]
    fn one_in_flight_at_a_time() {
        let mut scheduler = LinkScheduler::new(Duration::from_secs(1), 0);
        let mut link = Recorder::default();
        let now = Instant::now();

        for n in 0..3 {
            scheduler.enqueue(net(n));
            scheduler.enqueue(mqtt(n));
        }

        assert_eq!(scheduler.drain_one(&mut link, now), DrainOutcome::Dispatched);
        for _ in 0..5 {
            assert_eq!(scheduler.drain_one(&mut link, now), DrainOutcome::Busy);
        }
        assert_eq!(link.sent.len(), 1);

        let mut dispatched = 1;
        while scheduler.complete().is_some() {
            if scheduler.drain_one(&mut link, now) == DrainOutcome::Dispatched {
                dispatched += 1;
                assert_eq!(link.sent.len(), dispatched);
            }
        }
        assert_eq!(dispatched, 6);
        assert!(scheduler.is_idle());
        assert_eq!(scheduler.drain_one(&mut link, now), DrainOutcome::Idle);
    }

    #[test]
    fn busy_queues_alternate() {
        let mut scheduler = LinkScheduler::new(Duration::from_secs(1), 0);
        let mut link = Recorder::default();
        let now = Instant::now();

        for n in 0..3 {
            scheduler.enqueue(net(n));
            scheduler.enqueue(mqtt(n));
        }
        scheduler.enqueue(net(3));
        scheduler.enqueue(net(4));

        loop {
            scheduler.drain_one(&mut link, now);
            if scheduler.complete().is_none() {
                break;
            }
        }

        let order: Vec<(Queue, u8)> = link
            .sent
            .iter()
            .map(|c| (c.queue(), c.payload.as_ref().unwrap()[0]))
            .collect();
        assert_eq!(
            order,
            vec![
                (Queue::Mqtt, 0),
                (Queue::Network, 0),
                (Queue::Mqtt, 1),
                (Queue::Network, 1),
                (Queue::Mqtt, 2),
                (Queue::Network, 2),
                (Queue::Network, 3),
                (Queue::Network, 4),
            ]
        );
    }

    #[test]
    fn timeout_frees_the_link() {
        let mut scheduler = LinkScheduler::new(Duration::from_millis(100), 0);
        let mut link = Recorder::default();
        let start = Instant::now();

        scheduler.enqueue(net(0));
        scheduler.enqueue(net(1));
        scheduler.drain_one(&mut link, start);

        assert!(scheduler.expire(start + Duration::from_millis(50)).is_none());
        let expired = scheduler.expire(start + Duration::from_millis(100)).unwrap();
        assert_eq!(expired.payload, Some(vec![0]));

        assert_eq!(
            scheduler.drain_one(&mut link, start + Duration::from_millis(100)),
            DrainOutcome::Dispatched
        );
        assert_eq!(link.sent.last().unwrap().payload, Some(vec![1]));
    }

    #[test]
    fn rejected_dispatch_leaves_link_free() {
        let mut scheduler = LinkScheduler::new(Duration::from_secs(1), 0);
        let mut link = Recorder {
            refuse: true,
            ..Recorder::default()
        };
        scheduler.enqueue(net(0));
        scheduler.enqueue(net(1));

        let now = Instant::now();
        assert!(matches!(
            scheduler.drain_one(&mut link, now),
            DrainOutcome::Rejected(_, LinkError::Disconnected)
        ));
        assert!(scheduler.in_flight().is_none());
        assert_eq!(scheduler.pending(), 1);
    }

    #[test]
    fn retries_are_bounded() {
        let mut scheduler = LinkScheduler::new(Duration::from_millis(10), 1);
        let mut link = Recorder::default();
        let now = Instant::now();

        scheduler.enqueue(net(7));
        scheduler.enqueue(net(8));
        scheduler.drain_one(&mut link, now);
        let first = scheduler.expire(now + Duration::from_millis(10)).unwrap();
        assert!(scheduler.retry(first).is_none());

        // retried command goes ahead of the rest
        scheduler.drain_one(&mut link, now);
        assert_eq!(link.sent.last().unwrap().payload, Some(vec![7]));

        let second = scheduler.expire(now + Duration::from_secs(1)).unwrap();
        let gave_up = scheduler.retry(second).unwrap();
        assert_eq!(gave_up.attempts, 2);
    }
}
