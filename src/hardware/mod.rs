#[cfg(target_os = "none")]
pub mod alarm_timer;
#[cfg(target_os = "none")]
pub mod gpio_led;
pub mod spi_flash;
pub mod traits;
