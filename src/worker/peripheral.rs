//! Emulated SHA peripheral
//!
//! A register-level model of a memory-mapped SHA-256 block: sixteen text
//! registers, a hidden state, and START / CONTINUE / LOAD commands. It lets
//! the accelerator engine run on hosts without the hardware and gives tests a
//! way to inject power loss and stalls.

use super::accelerator::{AcceleratorOp, HashAccelerator};
use crate::crypto::{compress_words, H_INIT};
use std::cell::Cell;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct PeripheralLines {
    powered: AtomicBool,
    stalled: AtomicBool,
    power_cycles: AtomicU64,
}

/// Shared handle for toggling the peripheral from outside the engine thread
#[derive(Debug, Clone)]
pub struct PeripheralHandle {
    lines: Arc<PeripheralLines>,
}

impl PeripheralHandle {
    fn new() -> Self {
        Self {
            lines: Arc::new(PeripheralLines {
                powered: AtomicBool::new(true),
                stalled: AtomicBool::new(false),
                power_cycles: AtomicU64::new(0),
            }),
        }
    }

    /// Gate the peripheral clock, as another subsystem sharing it might
    pub fn power_off(&self) {
        self.lines.powered.store(false, Ordering::SeqCst);
    }

    pub fn is_powered(&self) -> bool {
        self.lines.powered.load(Ordering::SeqCst)
    }

    /// Keep the busy line asserted until released
    pub fn set_stalled(&self, stalled: bool) {
        self.lines.stalled.store(stalled, Ordering::SeqCst);
    }

    /// Number of times the peripheral was re-initialised
    pub fn power_cycles(&self) -> u64 {
        self.lines.power_cycles.load(Ordering::SeqCst)
    }
}

/// Software model of the SHA peripheral
#[derive(Debug)]
pub struct EmulatedShaPeripheral {
    text: [u32; 16],
    state: [u32; 8],
    busy_polls: u32,
    pending: Cell<u32>,
    handle: PeripheralHandle,
}

impl Default for EmulatedShaPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatedShaPeripheral {
    pub fn new() -> Self {
        Self {
            text: [0; 16],
            state: [0; 8],
            busy_polls: 0,
            pending: Cell::new(0),
            handle: PeripheralHandle::new(),
        }
    }

    /// Report busy for `polls` reads after every command
    pub fn with_latency(mut self, polls: u32) -> Self {
        self.busy_polls = polls;
        self
    }

    pub fn handle(&self) -> PeripheralHandle {
        self.handle.clone()
    }
}

impl HashAccelerator for EmulatedShaPeripheral {
    fn reinitialize(&mut self) {
        self.text = [0; 16];
        self.state = [0; 8];
        self.pending.set(0);
        self.handle.lines.power_cycles.fetch_add(1, Ordering::SeqCst);
        self.handle.lines.stalled.store(false, Ordering::SeqCst);
        self.handle.lines.powered.store(true, Ordering::SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.handle.is_powered()
    }

    fn write_text(&mut self, offset: usize, words: &[u32]) {
        if !self.is_enabled() {
            return;
        }
        for (register, word) in self.text.iter_mut().skip(offset).zip(words) {
            *register = *word;
        }
    }

    fn read_text(&self, index: usize) -> u32 {
        if !self.is_enabled() {
            return 0;
        }
        self.text.get(index).copied().unwrap_or(0)
    }

    fn trigger(&mut self, op: AcceleratorOp) {
        if !self.is_enabled() {
            return;
        }
        match op {
            AcceleratorOp::Start => {
                self.state = H_INIT;
                compress_words(&mut self.state, &self.text);
            }
            AcceleratorOp::Continue => compress_words(&mut self.state, &self.text),
            AcceleratorOp::Load => self.text[..8].copy_from_slice(&self.state),
        }
        self.pending.set(self.busy_polls);
    }

    fn is_busy(&self) -> bool {
        if self.handle.lines.stalled.load(Ordering::SeqCst) {
            return true;
        }
        let pending = self.pending.get();
        if pending == 0 {
            return false;
        }
        self.pending.set(pending - 1);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sha256;

    fn padded_abc() -> [u32; 16] {
        let mut words = [0u32; 16];
        words[0] = 0x6162_6380;
        words[15] = 24;
        words
    }

    #[test]
    fn test_start_and_load_compute_sha256() {
        let mut peripheral = EmulatedShaPeripheral::new();
        peripheral.write_text(0, &padded_abc());
        peripheral.trigger(AcceleratorOp::Start);
        peripheral.trigger(AcceleratorOp::Load);

        let mut digest = Vec::new();
        for i in 0..8 {
            digest.extend_from_slice(&peripheral.read_text(i).to_be_bytes());
        }
        assert_eq!(digest, sha256(b"abc").to_vec());
    }

    #[test]
    fn test_latency_counts_down() {
        let mut peripheral = EmulatedShaPeripheral::new().with_latency(2);
        peripheral.trigger(AcceleratorOp::Start);
        assert!(peripheral.is_busy());
        assert!(peripheral.is_busy());
        assert!(!peripheral.is_busy());
    }

    #[test]
    fn test_power_off_ignores_commands() {
        let mut peripheral = EmulatedShaPeripheral::new();
        let handle = peripheral.handle();
        peripheral.write_text(0, &[7]);
        handle.power_off();

        assert!(!peripheral.is_enabled());
        peripheral.write_text(0, &[9]);
        peripheral.trigger(AcceleratorOp::Load);
        assert_eq!(peripheral.read_text(0), 0);

        peripheral.reinitialize();
        assert!(peripheral.is_enabled());
        assert_eq!(handle.power_cycles(), 1);
        assert_eq!(peripheral.read_text(0), 0);
    }

    #[test]
    fn test_stall_holds_busy_until_reinitialised() {
        let mut peripheral = EmulatedShaPeripheral::new();
        let handle = peripheral.handle();
        handle.set_stalled(true);
        assert!(peripheral.is_busy());
        assert!(peripheral.is_busy());
        peripheral.reinitialize();
        assert!(!peripheral.is_busy());
    }
}
