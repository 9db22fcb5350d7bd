#![cfg_attr(not(test), no_std)]

//! Alarm-driven blinky for the STM32F103 "Blue Pill".
//!
//! A TIM3 compare interrupt toggles the onboard LED with an asymmetric duty
//! cycle (0.5 s on, 1 s off) and hands every new state to the main task through
//! a bounded channel. At startup a FAT16 volume on an external SPI NOR flash is
//! mounted and one line is read from a text file.
//!
//! Everything outside `hardware::{alarm_timer, gpio_led}` is target independent
//! and is unit tested on the host (`cargo test-host`).

pub mod blink;
pub mod config;
pub mod handler;
pub mod hardware;
pub mod queue;
pub mod storage;

// The host test build links embassy-executor through the mock time driver
// without running an executor, so nothing is ever pended.
#[cfg(test)]
#[unsafe(no_mangle)]
fn __pender(_context: *mut ()) {}
