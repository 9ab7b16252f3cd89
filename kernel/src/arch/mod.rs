//! Architecture support. x86-64 long mode is the only target.

#[cfg(target_arch = "x86_64")]
pub mod x86_64;

/// Halt the machine forever with interrupts disabled. Terminal state for
/// panics and unrecoverable faults.
#[cfg(target_os = "none")]
pub fn halt() -> ! {
    loop {
        x86_64::halt_once();
    }
}
