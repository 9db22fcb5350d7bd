//! Blink state machine.
//!
//! The LED alternates between [`LedState::On`] and [`LedState::Off`] on every
//! alarm. Each transition also decides when the next alarm fires, which is how
//! the asymmetric duty cycle comes about: the LED stays on for the ON interval
//! and off for the OFF interval.

use crate::config::TimerConfig;

/// Logic level of the blinking pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub enum LedState {
    On,
    #[default]
    Off,
}

impl LedState {
    pub fn toggled(self) -> Self {
        match self {
            LedState::On => LedState::Off,
            LedState::Off => LedState::On,
        }
    }

    /// 1 for ON, 0 for OFF.
    pub fn level(self) -> u8 {
        match self {
            LedState::On => 1,
            LedState::Off => 0,
        }
    }
}

/// Alarm intervals in timer ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct Schedule {
    pub on_ticks: u64,
    pub off_ticks: u64,
}

impl Schedule {
    pub const fn from_config(config: &TimerConfig) -> Self {
        Self {
            on_ticks: config.ticks_for_ms(config.on_interval_ms),
            off_ticks: config.ticks_for_ms(config.off_interval_ms),
        }
    }

    /// How long the pin stays in `state` once it has entered it.
    pub fn interval(&self, state: LedState) -> u64 {
        match state {
            LedState::On => self.on_ticks,
            LedState::Off => self.off_ticks,
        }
    }
}

/// One alarm firing: `(state, prior_alarm) -> (new_state, new_alarm)`.
pub fn step(state: LedState, prior_alarm: u64, schedule: &Schedule) -> (LedState, u64) {
    let next = state.toggled();
    (next, prior_alarm + schedule.interval(next))
}

/// Owner of the tracked pin state and the pending alarm count.
#[derive(Debug, Clone)]
pub struct Blinker {
    state: LedState,
    alarm: u64,
    schedule: Schedule,
}

impl Blinker {
    /// Starts in [`LedState::Off`] with `initial_alarm` pending.
    pub fn new(schedule: Schedule, initial_alarm: u64) -> Self {
        Self {
            state: LedState::Off,
            alarm: initial_alarm,
            schedule,
        }
    }

    pub fn from_config(config: &TimerConfig) -> Self {
        Self::new(Schedule::from_config(config), config.initial_alarm())
    }

    pub fn state(&self) -> LedState {
        self.state
    }

    /// Alarm count that is currently armed.
    pub fn pending_alarm(&self) -> u64 {
        self.alarm
    }

    /// Advances by one firing and returns the new state and the next alarm.
    pub fn fire(&mut self) -> (LedState, u64) {
        let (state, alarm) = step(self.state, self.alarm, &self.schedule);
        self.state = state;
        self.alarm = alarm;
        (state, alarm)
    }
}
