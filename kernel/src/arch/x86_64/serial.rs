//! COM1 serial output. Mirrors the console so logs survive without a
//! display attached (QEMU `-serial stdio`, real-hardware headers).

use lazy_static::lazy_static;
use spin::Mutex;
use uart_16550::SerialPort;

lazy_static! {
    static ref COM1: Mutex<SerialPort> = {
        // SAFETY: 0x3F8 is the standard COM1 base; no other code drives
        // these ports.
        let mut port = unsafe { SerialPort::new(0x3F8) };
        port.init();
        Mutex::new(port)
    };
}

#[doc(hidden)]
pub fn _print(args: core::fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        COM1.lock().write_fmt(args).expect("serial write failed");
    });
}
