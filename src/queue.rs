//! Interrupt -> main task mailbox.

use embassy_sync::blocking_mutex::raw::{CriticalSectionRawMutex, RawMutex};
use embassy_sync::channel::{Channel, Receiver, Sender};
use embassy_time::{Duration, with_timeout};

use crate::blink::LedState;
use crate::config::QUEUE_CAPACITY;

/// Pin state at the moment the alarm fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(target_os = "none", derive(defmt::Format))]
pub struct LedMessage {
    pub state: LedState,
}

// Shared with an interrupt handler, so a thread-mode mutex is not enough.
pub type StateQueue = Channel<CriticalSectionRawMutex, LedMessage, QUEUE_CAPACITY>;
pub type StateSender<'a> = Sender<'a, CriticalSectionRawMutex, LedMessage, QUEUE_CAPACITY>;
pub type StateReceiver<'a> = Receiver<'a, CriticalSectionRawMutex, LedMessage, QUEUE_CAPACITY>;

/// Waits up to `timeout` for the next message. `None` means nothing arrived,
/// which is the normal steady state between two alarms.
pub async fn receive_state<M: RawMutex, const N: usize>(
    receiver: &Receiver<'_, M, LedMessage, N>,
    timeout: Duration,
) -> Option<LedMessage> {
    with_timeout(timeout, receiver.receive()).await.ok()
}
