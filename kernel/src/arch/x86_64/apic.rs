//! Local APIC and I/O APIC.
//!
//! The Local APIC register file is memory-mapped at the base the
//! IA32_APIC_BASE MSR reports (0xFEE0_0000 on anything built this
//! century) and reached through the higher-half direct map. When the
//! CPU is already in x2APIC mode, EOI goes through the MSR interface
//! instead of the MMIO window.
//!
//! The legacy 8259 pair is remapped onto vectors 32..48 and fully
//! masked before the APIC takes over, so a late spurious PIC interrupt
//! cannot land on an exception vector.

use core::sync::atomic::{AtomicBool, Ordering};

use pic8259::ChainedPics;
use spin::Mutex;

use super::{mmu, pit};
use crate::{
    error::{KernelError, KernelResult},
    mm::{phys_to_virt, PhysicalAddress},
};

/// IA32_APIC_BASE MSR.
const IA32_APIC_BASE_MSR: u32 = 0x1B;
/// Global enable bit in IA32_APIC_BASE.
const APIC_BASE_ENABLE: u64 = 1 << 11;
/// x2APIC mode bit in IA32_APIC_BASE.
const APIC_BASE_X2APIC: u64 = 1 << 10;

/// x2APIC EOI MSR.
const X2APIC_EOI_MSR: u32 = 0x80B;

// xAPIC register byte offsets.
const LAPIC_ID: u32 = 0x020;
const LAPIC_VERSION: u32 = 0x030;
const LAPIC_TPR: u32 = 0x080;
const LAPIC_EOI: u32 = 0x0B0;
const LAPIC_SVR: u32 = 0x0F0;
const LAPIC_LVT_TIMER: u32 = 0x320;
const LAPIC_LVT_LINT0: u32 = 0x350;
const LAPIC_LVT_LINT1: u32 = 0x360;
const LAPIC_LVT_ERROR: u32 = 0x370;
const LAPIC_TIMER_INIT_COUNT: u32 = 0x380;
const LAPIC_TIMER_CUR_COUNT: u32 = 0x390;
const LAPIC_TIMER_DIV: u32 = 0x3E0;

/// LVT mask bit.
const LVT_MASK: u32 = 1 << 16;
/// Periodic timer mode (LVT timer bits 18:17 = 01).
const TIMER_MODE_PERIODIC: u32 = 0b01 << 17;
/// SVR software-enable bit.
const SVR_ENABLE: u32 = 1 << 8;
/// Spurious vector number.
const SPURIOUS_VECTOR: u8 = 0xFF;
/// Divide-configuration encoding for divide-by-16.
const TIMER_DIV_16: u32 = 0x03;

/// I/O APIC defaults (overridden by the MADT when present).
const IOAPIC_DEFAULT_BASE: u64 = 0xFEC0_0000;
const IOREGSEL: u64 = 0x00;
const IOWIN: u64 = 0x10;
const IOAPIC_REG_VER: u32 = 0x01;
const IOAPIC_REDTBL_BASE: u32 = 0x10;

/// Per-CPU interrupt controller handle.
struct LocalApic {
    /// Virtual address of the MMIO window.
    base: u64,
    /// EOI and friends go through MSRs instead of MMIO.
    x2apic: bool,
    /// LAPIC timer ticks per millisecond, measured against the PIT.
    timer_ticks_per_ms: u32,
}

impl LocalApic {
    fn read(&self, offset: u32) -> u32 {
        // SAFETY: `base + offset` is a register of the LAPIC MMIO window,
        // mapped through the direct map; volatile prevents reordering.
        unsafe { core::ptr::read_volatile((self.base + offset as u64) as *const u32) }
    }

    fn write(&self, offset: u32, value: u32) {
        // SAFETY: As in `read`; volatile keeps the store visible to the
        // hardware in program order.
        unsafe { core::ptr::write_volatile((self.base + offset as u64) as *mut u32, value) }
    }

    fn id(&self) -> u8 {
        ((self.read(LAPIC_ID) >> 24) & 0xFF) as u8
    }

    /// Software-enable via the spurious vector register and open the
    /// task-priority gate.
    fn enable(&self) {
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_LVT_LINT0, LVT_MASK);
        self.write(LAPIC_LVT_LINT1, LVT_MASK);
        self.write(LAPIC_LVT_ERROR, LVT_MASK);
        self.write(LAPIC_SVR, SVR_ENABLE | SPURIOUS_VECTOR as u32);
        self.write(LAPIC_TPR, 0);
    }

    fn eoi(&self) {
        if self.x2apic {
            // SAFETY: Writing 0 to the x2APIC EOI MSR is the
            // architectural end-of-interrupt in x2APIC mode.
            unsafe { mmu::wrmsr(X2APIC_EOI_MSR, 0) };
        } else {
            self.write(LAPIC_EOI, 0);
        }
    }

    /// Measure the timer against the PIT: run the countdown free for
    /// 10 ms and see how far it got.
    fn calibrate_timer(&mut self) {
        self.write(LAPIC_TIMER_DIV, TIMER_DIV_16);
        self.write(LAPIC_LVT_TIMER, LVT_MASK);
        self.write(LAPIC_TIMER_INIT_COUNT, u32::MAX);

        pit::pit_wait(10);

        let elapsed = u32::MAX - self.read(LAPIC_TIMER_CUR_COUNT);
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.timer_ticks_per_ms = (elapsed / 10).max(1);
    }

    /// Arm the periodic timer to fire `vector` every `ms` milliseconds.
    fn start_periodic(&self, vector: u8, ms: u32) {
        let count = self.timer_ticks_per_ms.saturating_mul(ms).max(1);
        self.write(LAPIC_TIMER_INIT_COUNT, 0);
        self.write(LAPIC_TIMER_DIV, TIMER_DIV_16);
        self.write(LAPIC_LVT_TIMER, TIMER_MODE_PERIODIC | vector as u32);
        self.write(LAPIC_TIMER_INIT_COUNT, count);
    }
}

/// External interrupt router. Indirect register access: index into
/// IOREGSEL, data through IOWIN.
struct IoApic {
    base: u64,
}

impl IoApic {
    fn read(&self, reg: u32) -> u32 {
        // SAFETY: IOREGSEL/IOWIN indirect access on the I/O APIC MMIO
        // window, reached through the direct map.
        unsafe {
            core::ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            core::ptr::read_volatile((self.base + IOWIN) as *const u32)
        }
    }

    fn write(&self, reg: u32, value: u32) {
        // SAFETY: As in `read`.
        unsafe {
            core::ptr::write_volatile((self.base + IOREGSEL) as *mut u32, reg);
            core::ptr::write_volatile((self.base + IOWIN) as *mut u32, value);
        }
    }

    fn max_entries(&self) -> u8 {
        (((self.read(IOAPIC_REG_VER) >> 16) & 0xFF) + 1) as u8
    }

    /// Route `irq` to `vector` on the CPU with APIC id `dest`:
    /// edge-triggered, active-high, fixed delivery.
    fn route(&self, irq: u8, vector: u8, dest: u8) {
        let reg = IOAPIC_REDTBL_BASE + irq as u32 * 2;
        self.write(reg + 1, (dest as u32) << 24);
        self.write(reg, vector as u32);
    }

    fn set_masked(&self, irq: u8, masked: bool) {
        let reg = IOAPIC_REDTBL_BASE + irq as u32 * 2;
        let mut low = self.read(reg);
        if masked {
            low |= LVT_MASK;
        } else {
            low &= !LVT_MASK;
        }
        self.write(reg, low);
    }

    fn mask_all(&self) {
        for irq in 0..self.max_entries() {
            self.set_masked(irq, true);
        }
    }
}

struct ApicState {
    local: LocalApic,
    io: IoApic,
}

// SAFETY: The handles hold MMIO base addresses only; register access is
// serialized by the enclosing Mutex.
unsafe impl Send for ApicState {}

static APIC: Mutex<Option<ApicState>> = Mutex::new(None);
static APIC_READY: AtomicBool = AtomicBool::new(false);

/// Bring up the Local APIC and I/O APIC.
///
/// Remaps and masks the legacy 8259 pair, globally enables the APIC via
/// the IA32_APIC_BASE MSR, software-enables it through the SVR,
/// calibrates the timer against the PIT, and masks every I/O APIC
/// redirection entry until someone routes an IRQ.
pub fn init() -> KernelResult<()> {
    if APIC_READY.load(Ordering::Acquire) {
        return Err(KernelError::AlreadyExists {
            resource: "APIC",
            id: 0,
        });
    }

    // Remap the legacy PICs onto 32..48, then mask them entirely; the
    // I/O APIC owns those lines from here on.
    // SAFETY: Standard 8259 initialization sequence on the fixed ISA
    // ports; no other code drives the PICs.
    unsafe {
        let mut pics = ChainedPics::new(32, 40);
        pics.initialize();
        pics.disable();
    }

    let base_msr = mmu::rdmsr(IA32_APIC_BASE_MSR);
    if base_msr & APIC_BASE_ENABLE == 0 {
        // SAFETY: Setting the architectural global-enable bit of the
        // APIC base MSR, preserving the base address.
        unsafe { mmu::wrmsr(IA32_APIC_BASE_MSR, base_msr | APIC_BASE_ENABLE) };
    }
    let lapic_phys = PhysicalAddress::new(base_msr & 0xFFFF_F000);

    let mut local = LocalApic {
        base: phys_to_virt(lapic_phys).as_u64(),
        x2apic: base_msr & APIC_BASE_X2APIC != 0,
        timer_ticks_per_ms: 0,
    };
    local.enable();
    local.calibrate_timer();

    let ioapic_phys = super::acpi::ioapic_address().unwrap_or(IOAPIC_DEFAULT_BASE);
    let io = IoApic {
        base: phys_to_virt(PhysicalAddress::new(ioapic_phys)).as_u64(),
    };
    io.mask_all();

    println!(
        "[APIC] LAPIC id {} at {:#x} ({}), version {:#x}",
        local.id(),
        lapic_phys.as_u64(),
        if local.x2apic { "x2APIC" } else { "xAPIC" },
        local.read(LAPIC_VERSION) & 0xFF
    );
    println!(
        "[APIC] timer: {} ticks/ms; I/O APIC at {:#x} ({} lines)",
        local.timer_ticks_per_ms,
        ioapic_phys,
        io.max_entries()
    );

    *APIC.lock() = Some(ApicState { local, io });
    APIC_READY.store(true, Ordering::Release);
    Ok(())
}

/// Signal end-of-interrupt on the local APIC.
pub fn send_eoi() {
    if let Some(state) = APIC.lock().as_ref() {
        state.local.eoi();
    }
}

/// APIC id of the executing CPU, once the APIC is up.
pub fn read_id() -> Option<u8> {
    if !APIC_READY.load(Ordering::Acquire) {
        return None;
    }
    APIC.lock().as_ref().map(|s| s.local.id())
}

/// Start the periodic scheduler tick on `vector` every `ms`
/// milliseconds.
pub fn start_timer(vector: u8, ms: u32) -> KernelResult<()> {
    match APIC.lock().as_ref() {
        Some(state) => {
            state.local.start_periodic(vector, ms);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

/// Route a legacy IRQ to its vector (32 + irq) on the given CPU and
/// unmask it.
pub fn enable_irq(irq: u8, dest_apic_id: u8) -> KernelResult<()> {
    match APIC.lock().as_ref() {
        Some(state) => {
            state.io.route(irq, crate::irq::IRQ_VECTOR_BASE + irq, dest_apic_id);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}

/// Mask a legacy IRQ at the I/O APIC.
pub fn disable_irq(irq: u8) -> KernelResult<()> {
    match APIC.lock().as_ref() {
        Some(state) => {
            state.io.set_masked(irq, true);
            Ok(())
        }
        None => Err(KernelError::NotInitialized { subsystem: "APIC" }),
    }
}
