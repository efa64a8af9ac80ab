use std::collections::VecDeque;
use std::io::Write;

use parking_lot::Mutex;

/// Serial device backing the UART MMIO window.
///
/// Host input is queued through `push_input` (thread-safe, normally fed by an
/// input thread outside this crate). The status register exposes bit 0 as
/// RX-ready; reading the data register consumes one byte and the bit clears
/// on its own once the queue drains. TX bytes go straight to host stdout.
#[derive(Debug, Default)]
pub struct Uart {
    rx: Mutex<VecDeque<u8>>,
}

impl Uart {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue host input for the guest.
    pub fn push_input(&self, data: &[u8]) {
        let mut rx = self.rx.lock();
        rx.extend(data.iter().copied());
    }

    /// Status register: bit 0 set while RX data is available.
    pub fn status(&self) -> u8 {
        u8::from(!self.rx.lock().is_empty())
    }

    /// Consume one byte from the RX queue (zero when empty).
    pub fn read_data(&self) -> u8 {
        self.rx.lock().pop_front().unwrap_or(0)
    }

    /// Emit one byte on host stdout.
    pub fn write_tx(&self, byte: u8) {
        let mut out = std::io::stdout().lock();
        let _ = out.write_all(&[byte]);
        let _ = out.flush();
    }
}
