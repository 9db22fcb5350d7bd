//! Work done on every alarm interrupt.

use crate::blink::{Blinker, LedState};
use crate::hardware::traits::{Alarm, Led};
use crate::queue::{LedMessage, StateSender};

/// Result of one alarm firing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct AlarmOutcome {
    pub state: LedState,
    pub next_alarm: u64,
    /// `false` when the queue was full and the sample was dropped.
    pub queued: bool,
}

/// Everything the alarm interrupt needs, injected once at registration.
///
/// The handler is the only owner of the pin state; the rest of the program
/// only sees the copies it pushes into the queue.
pub struct AlarmHandler<'q, L, A> {
    blinker: Blinker,
    led: L,
    alarm: A,
    sender: StateSender<'q>,
}

impl<'q, L: Led, A: Alarm> AlarmHandler<'q, L, A> {
    pub fn new(blinker: Blinker, led: L, alarm: A, sender: StateSender<'q>) -> Self {
        Self {
            blinker,
            led,
            alarm,
            sender,
        }
    }

    /// Alarm count the handler expects to be woken at.
    pub fn pending_alarm(&self) -> u64 {
        self.blinker.pending_alarm()
    }

    /// Runs in interrupt context: never blocks.
    pub fn on_alarm(&mut self) -> AlarmOutcome {
        let (state, next_alarm) = self.blinker.fire();

        self.led.set(state);
        self.alarm.set_alarm(next_alarm);

        // A full queue drops the sample.
        let queued = self.sender.try_send(LedMessage { state }).is_ok();

        AlarmOutcome {
            state,
            next_alarm,
            queued,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{QUEUE_CAPACITY, TimerConfig};
    use crate::queue::StateQueue;

    #[derive(Default)]
    struct FakeLed {
        lit: bool,
        writes: usize,
    }

    impl Led for FakeLed {
        fn on(&mut self) {
            self.lit = true;
            self.writes += 1;
        }

        fn off(&mut self) {
            self.lit = false;
            self.writes += 1;
        }

        fn toggle(&mut self) {
            self.lit = !self.lit;
            self.writes += 1;
        }
    }

    #[derive(Default)]
    struct FakeAlarm {
        armed: Option<u64>,
    }

    impl Alarm for FakeAlarm {
        fn set_alarm(&mut self, count: u64) {
            self.armed = Some(count);
        }
    }

    const ONE_MHZ: TimerConfig = TimerConfig {
        resolution_hz: 1_000_000,
        initial_alarm_ms: 500,
        on_interval_ms: 500,
        off_interval_ms: 1000,
    };

    fn handler(queue: &StateQueue) -> AlarmHandler<'_, FakeLed, FakeAlarm> {
        AlarmHandler::new(
            Blinker::from_config(&ONE_MHZ),
            FakeLed::default(),
            FakeAlarm::default(),
            queue.sender(),
        )
    }

    #[test]
    fn firing_drives_pin_rearms_and_queues() {
        let queue = StateQueue::new();
        let mut handler = handler(&queue);

        let outcome = handler.on_alarm();
        assert_eq!(
            outcome,
            AlarmOutcome {
                state: LedState::On,
                next_alarm: 1_000_000,
                queued: true
            }
        );
        assert!(handler.led.lit);
        assert_eq!(handler.alarm.armed, Some(1_000_000));
        assert_eq!(queue.try_receive().ok(), Some(LedMessage { state: LedState::On }));

        let outcome = handler.on_alarm();
        assert_eq!(outcome.state, LedState::Off);
        assert_eq!(outcome.next_alarm, 2_000_000);
        assert!(!handler.led.lit);
        assert_eq!(handler.pending_alarm(), 2_000_000);
    }

    #[test]
    fn full_queue_drops_but_keeps_blinking() {
        let queue = StateQueue::new();
        let mut handler = handler(&queue);

        for _ in 0..QUEUE_CAPACITY {
            assert!(handler.on_alarm().queued);
        }
        let outcome = handler.on_alarm();
        assert!(!outcome.queued);
        assert_eq!(outcome.state, LedState::On);
        assert_eq!(handler.led.writes, QUEUE_CAPACITY + 1);
        assert_eq!(handler.alarm.armed, Some(outcome.next_alarm));
        assert_eq!(queue.len(), QUEUE_CAPACITY);
    }
}
