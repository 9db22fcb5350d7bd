//! Board and application constants.

use crate::storage::MountConfig;

/// Alarm timer configuration.
///
/// The alarm count is expressed in ticks of `resolution_hz`; the two
/// intervals are converted to ticks with [`TimerConfig::ticks_for_ms`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct TimerConfig {
    /// Counter ticks per second.
    pub resolution_hz: u32,
    /// First alarm, in milliseconds after the counter starts.
    pub initial_alarm_ms: u32,
    /// Time spent on after a transition to ON.
    pub on_interval_ms: u32,
    /// Time spent off after a transition to OFF.
    pub off_interval_ms: u32,
}

impl TimerConfig {
    pub const fn ticks_for_ms(&self, ms: u32) -> u64 {
        self.resolution_hz as u64 * ms as u64 / 1000
    }

    pub const fn initial_alarm(&self) -> u64 {
        self.ticks_for_ms(self.initial_alarm_ms)
    }

    /// The longest interval the alarm ever has to span, in ticks.
    pub const fn longest_interval(&self) -> u64 {
        let on = self.ticks_for_ms(self.on_interval_ms);
        let off = self.ticks_for_ms(self.off_interval_ms);
        let longest = if on > off { on } else { off };
        let initial = self.initial_alarm();
        if initial > longest { initial } else { longest }
    }
}

/// Log tag prepended to every line the firmware prints.
pub const TAG: &str = "FileSystem";

/// Capacity of the interrupt -> main task channel.
pub const QUEUE_CAPACITY: usize = 10;

/// TIM3 runs at 10 kHz: 72 MHz / 7200, and one second still fits the 16-bit counter.
pub const ALARM_TIMER: TimerConfig = TimerConfig {
    resolution_hz: 10_000,
    initial_alarm_ms: 500,
    on_interval_ms: 500,
    off_interval_ms: 1000,
};

/// How long the main loop waits for a message (10 ticks of a 100 Hz RTOS tick).
pub const RECEIVE_TIMEOUT_MS: u64 = 100;

/// Sleep between two main loop iterations.
pub const POLL_PERIOD_MS: u64 = 100;

pub const STORAGE_MOUNT: MountConfig = MountConfig {
    base_path: "/storage",
    partition_label: None,
    max_files: 5,
    format_if_mount_failed: true,
};

/// File read once at startup.
pub const STARTUP_FILE: &str = "/storage/myfile.txt";

/// SPI clock for the NOR flash.
pub const FLASH_SPI_HZ: u32 = 8_000_000;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_megahertz_intervals() {
        let timer = TimerConfig {
            resolution_hz: 1_000_000,
            ..ALARM_TIMER
        };
        assert_eq!(timer.initial_alarm(), 500_000);
        assert_eq!(timer.ticks_for_ms(timer.on_interval_ms), 500_000);
        assert_eq!(timer.ticks_for_ms(timer.off_interval_ms), 1_000_000);
    }

    #[test]
    fn board_intervals_fit_sixteen_bit_counter() {
        assert!(ALARM_TIMER.longest_interval() <= u16::MAX as u64);
    }
}
