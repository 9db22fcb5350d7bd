use crate::blink::LedState;

pub trait Led {
    fn on(&mut self);
    fn off(&mut self);
    fn toggle(&mut self);

    fn set(&mut self, state: LedState) {
        match state {
            LedState::On => self.on(),
            LedState::Off => self.off(),
        }
    }
}

/// A one-shot compare alarm on a free-running counter.
pub trait Alarm {
    /// Arms the alarm at `count` ticks. Replaces any pending alarm.
    fn set_alarm(&mut self, count: u64);
}
