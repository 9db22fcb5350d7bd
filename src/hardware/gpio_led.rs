use super::traits::Led;
use crate::blink::LedState;
use embassy_stm32::Peripheral;
use embassy_stm32::gpio::{Level, Output, Pin, Speed};

/// LED wired from 3.3V into the pin, like PC13 on the Blue Pill: driving the
/// pin low lights it.
pub struct GpioLed<'d> {
    pin: Output<'d>,
}

impl<'d> GpioLed<'d> {
    /// Takes over `pin` as a push-pull output with the LED dark.
    pub fn new(pin: impl Peripheral<P = impl Pin> + 'd) -> Self {
        Self {
            pin: Output::new(pin, pin_level(LedState::Off), Speed::Low),
        }
    }
}

fn pin_level(state: LedState) -> Level {
    match state {
        LedState::On => Level::Low,
        LedState::Off => Level::High,
    }
}

impl<'d> Led for GpioLed<'d> {
    fn on(&mut self) {
        self.set(LedState::On);
    }

    fn off(&mut self) {
        self.set(LedState::Off);
    }

    fn toggle(&mut self) {
        self.pin.toggle();
    }

    fn set(&mut self, state: LedState) {
        self.pin.set_level(pin_level(state));
    }
}
