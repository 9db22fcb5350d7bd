//! TIM3 as a one-shot compare alarm on a free-running 16-bit counter.
//!
//! The counter runs at the configured resolution and wraps at 0xFFFF. The
//! alarm is kept as a logical `u64` count by the caller and only its low 16 bits
//! are written to CCR1; that is exact as long as every interval is shorter than
//! one counter period, which [`AlarmTimer::new`] checks.

use embassy_stm32::Peripheral;
use embassy_stm32::interrupt::{self, InterruptExt, Priority};
use embassy_stm32::pac;
use embassy_stm32::peripherals::TIM3;
use embassy_stm32::timer::low_level::Timer;

use super::traits::Alarm;
use crate::config::TimerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum TimerError {
    /// The timer clock cannot be divided down to the requested resolution.
    Resolution { clock_hz: u32, resolution_hz: u32 },
    /// An interval does not fit one period of the 16-bit counter.
    IntervalTooLong { ticks: u64 },
}

pub struct AlarmTimer<'d> {
    // Keeps the TIM3 clock enabled; dropping it gates the peripheral.
    _timer: Timer<'d, TIM3>,
}

impl<'d> AlarmTimer<'d> {
    /// Configures TIM3 as an up counter at `config.resolution_hz`, stopped,
    /// with no alarm armed.
    pub fn new(tim: impl Peripheral<P = TIM3> + 'd, config: &TimerConfig) -> Result<Self, TimerError> {
        let timer = Timer::new(tim);
        let clock_hz = timer.get_clock_frequency().0;

        let resolution_hz = config.resolution_hz;
        if resolution_hz == 0 || clock_hz % resolution_hz != 0 {
            return Err(TimerError::Resolution { clock_hz, resolution_hz });
        }
        let prescaler = clock_hz / resolution_hz - 1;
        if prescaler > u16::MAX as u32 {
            return Err(TimerError::Resolution { clock_hz, resolution_hz });
        }

        let ticks = config.longest_interval();
        if ticks > u16::MAX as u64 {
            return Err(TimerError::IntervalTooLong { ticks });
        }

        let regs = pac::TIM3;
        regs.cr1().modify(|w| w.set_cen(false));
        regs.psc().write_value(prescaler as u16);
        regs.arr().write(|w| w.set_arr(u16::MAX));
        // Update event loads the prescaler and zeroes the counter
        regs.egr().write(|w| w.set_ug(true));
        regs.sr().modify(|w| {
            w.set_uif(false);
            w.set_ccif(0, false);
        });

        Ok(Self { _timer: timer })
    }

    /// Compare channel handed to the interrupt handler.
    pub fn channel(&self) -> CompareChannel {
        CompareChannel { _private: () }
    }

    /// Arms `initial_alarm`, unmasks TIM3 in the NVIC and starts counting.
    pub fn start(&mut self, initial_alarm: u64) {
        let regs = pac::TIM3;
        self.channel().set_alarm(initial_alarm);
        regs.dier().modify(|w| w.set_ccie(0, true));

        interrupt::TIM3.unpend();
        interrupt::TIM3.set_priority(Priority::P1);
        unsafe { interrupt::TIM3.enable() };

        regs.cr1().modify(|w| w.set_cen(true));
    }

    /// Acknowledges a pending compare match. Called first thing in the TIM3 interrupt.
    pub fn take_compare_event() -> bool {
        let regs = pac::TIM3;
        if !regs.sr().read().ccif(0) {
            return false;
        }
        regs.sr().modify(|w| w.set_ccif(0, false));
        true
    }
}

/// CC1 of TIM3. Only obtainable from a configured [`AlarmTimer`].
pub struct CompareChannel {
    _private: (),
}

impl Alarm for CompareChannel {
    fn set_alarm(&mut self, count: u64) {
        pac::TIM3.ccr(0).write(|w| w.set_ccr(count as u16));
    }
}
