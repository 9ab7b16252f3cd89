//! Programmable interval timer.
//!
//! The PIT survives for exactly two jobs: calibrated busy-waits during
//! bring-up, and measuring the LAPIC timer frequency. Interrupts are
//! disabled around the countdown poll so the measurement window stays
//! honest.

use x86_64::instructions::{interrupts, port::Port};

/// PIT input clock in Hz.
pub const PIT_FREQUENCY: u32 = 1_193_182;

const PIT_CHANNEL0: u16 = 0x40;
const PIT_COMMAND: u16 = 0x43;

/// Busy-wait for `ms` milliseconds using PIT channel 0 in mode 0
/// (interrupt on terminal count, which we poll rather than take).
pub fn pit_wait(ms: u32) {
    let count = ((PIT_FREQUENCY * ms) / 1000).clamp(1, 0xFFFF) as u16;

    interrupts::without_interrupts(|| {
        let mut command: Port<u8> = Port::new(PIT_COMMAND);
        let mut channel0: Port<u8> = Port::new(PIT_CHANNEL0);

        // SAFETY: Standard PIT programming sequence on fixed ISA ports:
        // channel 0, lobyte/hibyte access, mode 0.
        unsafe {
            command.write(0x30u8);
            channel0.write((count & 0xFF) as u8);
            channel0.write((count >> 8) as u8);
        }

        loop {
            // SAFETY: Latch command followed by two data reads returns
            // the current countdown value.
            let current = unsafe {
                command.write(0x00u8);
                let lo = channel0.read() as u32;
                let hi = channel0.read() as u32;
                lo | (hi << 8)
            };
            let current = if current == 0 { 0x10000 } else { current };
            if current > count as u32 {
                break;
            }
        }
    });
}
