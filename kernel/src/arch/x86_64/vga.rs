//! VGA text-mode console: the 80x25 buffer at 0xB8000.
//!
//! Output scrolls upward one line at a time; every write also lands on
//! the serial mirror so nothing is lost once a framebuffer takes over
//! the display.

use core::{fmt, ptr::write_volatile};

use lazy_static::lazy_static;
use spin::Mutex;

/// VGA text attribute: low nibble foreground, high nibble background.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
struct ColorCode(u8);

impl ColorCode {
    /// Light gray on black, the traditional boot palette.
    const DEFAULT: ColorCode = ColorCode(0x07);
}

#[derive(Debug, Clone, Copy)]
#[repr(C)]
struct ScreenChar {
    ascii_character: u8,
    color_code: ColorCode,
}

const BUFFER_HEIGHT: usize = 25;
const BUFFER_WIDTH: usize = 80;

#[repr(transparent)]
struct Buffer {
    chars: [[ScreenChar; BUFFER_WIDTH]; BUFFER_HEIGHT],
}

pub struct Writer {
    column: usize,
    buffer: &'static mut Buffer,
}

impl Writer {
    fn write_byte(&mut self, byte: u8) {
        match byte {
            b'\n' => self.new_line(),
            byte => {
                if self.column >= BUFFER_WIDTH {
                    self.new_line();
                }
                let row = BUFFER_HEIGHT - 1;
                let col = self.column;
                // SAFETY: The VGA buffer is memory-mapped I/O; volatile
                // keeps the store from being elided. Indices are bounded
                // by the dimensions above.
                unsafe {
                    write_volatile(
                        &mut self.buffer.chars[row][col],
                        ScreenChar {
                            ascii_character: byte,
                            color_code: ColorCode::DEFAULT,
                        },
                    );
                }
                self.column += 1;
            }
        }
    }

    fn new_line(&mut self) {
        for row in 1..BUFFER_HEIGHT {
            for col in 0..BUFFER_WIDTH {
                // SAFETY: Bounded volatile copy one row upward within
                // the buffer.
                unsafe {
                    let ch = core::ptr::read_volatile(&self.buffer.chars[row][col]);
                    write_volatile(&mut self.buffer.chars[row - 1][col], ch);
                }
            }
        }
        let blank = ScreenChar {
            ascii_character: b' ',
            color_code: ColorCode::DEFAULT,
        };
        for col in 0..BUFFER_WIDTH {
            // SAFETY: Bounded volatile clear of the bottom row.
            unsafe {
                write_volatile(&mut self.buffer.chars[BUFFER_HEIGHT - 1][col], blank);
            }
        }
        self.column = 0;
    }

    fn write_string(&mut self, s: &str) {
        for byte in s.bytes() {
            match byte {
                0x20..=0x7E | b'\n' => self.write_byte(byte),
                _ => self.write_byte(0xFE),
            }
        }
    }
}

impl fmt::Write for Writer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_string(s);
        Ok(())
    }
}

lazy_static! {
    static ref WRITER: Mutex<Writer> = Mutex::new(Writer {
        column: 0,
        // SAFETY: 0xB8000 is the VGA text buffer, identity-mapped during
        // early boot and aliased in the higher half afterwards; access is
        // serialized by the Mutex.
        buffer: unsafe { &mut *(0xB8000 as *mut Buffer) },
    });
}

#[doc(hidden)]
pub fn _print(args: fmt::Arguments) {
    use core::fmt::Write;

    use x86_64::instructions::interrupts;

    interrupts::without_interrupts(|| {
        WRITER.lock().write_fmt(args).expect("VGA write failed");
    });
    super::serial::_print(args);
}
