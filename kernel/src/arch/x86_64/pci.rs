//! PCI configuration-space enumeration.
//!
//! Mechanism #1 through ports 0xCF8/0xCFC: scan every bus/slot/function,
//! record vendor/device/class, the six BARs, the interrupt routing
//! bytes, and the MSI capability offset. Drivers get helpers to enable
//! bus mastering and MSI; everything else about devices is out of scope
//! here.

// Enumeration-side helpers are only reachable from bare-metal drivers
#![allow(dead_code)]

use alloc::vec::Vec;

use crate::sync::SpinLock;

/// One discovered PCI function.
#[derive(Debug, Clone, Copy)]
pub struct PciDevice {
    pub bus: u8,
    pub slot: u8,
    pub func: u8,
    pub vendor_id: u16,
    pub device_id: u16,
    /// class << 16 | subclass << 8 | prog_if
    pub class_code: u32,
    pub bars: [u32; 6],
    pub irq_line: u8,
    pub irq_pin: u8,
    /// Offset of the MSI capability in config space, 0 if absent.
    pub msi_offset: u8,
}

impl PciDevice {
    /// Whether this function matches a 24-bit class code
    /// (class/subclass/prog-if).
    pub fn matches_class(&self, class: u32) -> bool {
        self.class_code == class
    }
}

/// Build the 24-bit class code from the class-register dword.
pub fn class_code_of(class_reg: u32) -> u32 {
    class_reg >> 8
}

static DEVICES: SpinLock<Vec<PciDevice>> = SpinLock::new(Vec::new());

/// PCI command register bit: bus mastering.
const CMD_BUS_MASTER: u16 = 0x04;
/// Capability id for MSI.
const CAP_ID_MSI: u8 = 0x05;
/// Status register bit: capability list present.
const STATUS_CAP_LIST: u16 = 0x10;

#[cfg(target_os = "none")]
mod io {
    use x86_64::instructions::port::Port;

    const CONFIG_ADDRESS: u16 = 0xCF8;
    const CONFIG_DATA: u16 = 0xCFC;

    fn address(bus: u8, slot: u8, func: u8, offset: u8) -> u32 {
        0x8000_0000
            | ((bus as u32) << 16)
            | ((slot as u32) << 11)
            | ((func as u32) << 8)
            | (offset as u32 & 0xFC)
    }

    pub fn read_dword(bus: u8, slot: u8, func: u8, offset: u8) -> u32 {
        // SAFETY: Mechanism #1 config access on the fixed ports; the
        // address register selects the dword, the data port returns it.
        unsafe {
            Port::<u32>::new(CONFIG_ADDRESS).write(address(bus, slot, func, offset));
            Port::<u32>::new(CONFIG_DATA).read()
        }
    }

    pub fn write_dword(bus: u8, slot: u8, func: u8, offset: u8, value: u32) {
        // SAFETY: As in `read_dword`.
        unsafe {
            Port::<u32>::new(CONFIG_ADDRESS).write(address(bus, slot, func, offset));
            Port::<u32>::new(CONFIG_DATA).write(value);
        }
    }

    pub fn read_word(bus: u8, slot: u8, func: u8, offset: u8) -> u16 {
        (read_dword(bus, slot, func, offset) >> ((offset as u32 & 2) * 8)) as u16
    }

    pub fn write_word(bus: u8, slot: u8, func: u8, offset: u8, value: u16) {
        let dword = read_dword(bus, slot, func, offset);
        let shift = (offset as u32 & 2) * 8;
        let merged = (dword & !(0xFFFF << shift)) | ((value as u32) << shift);
        write_dword(bus, slot, func, offset, merged);
    }
}

/// Scan every bus/slot/function and record what answers.
#[cfg(target_os = "none")]
pub fn init() {
    let mut devices = DEVICES.lock();
    devices.clear();

    for bus in 0..=255u8 {
        for slot in 0..32u8 {
            for func in 0..8u8 {
                let id = io::read_dword(bus, slot, func, 0x00);
                let vendor_id = (id & 0xFFFF) as u16;
                if vendor_id == 0xFFFF {
                    if func == 0 {
                        break; // no device in this slot at all
                    }
                    continue;
                }

                let class_reg = io::read_dword(bus, slot, func, 0x08);
                let mut bars = [0u32; 6];
                for (i, bar) in bars.iter_mut().enumerate() {
                    *bar = io::read_dword(bus, slot, func, 0x10 + (i as u8) * 4);
                }
                let irq_reg = io::read_dword(bus, slot, func, 0x3C);

                devices.push(PciDevice {
                    bus,
                    slot,
                    func,
                    vendor_id,
                    device_id: (id >> 16) as u16,
                    class_code: class_code_of(class_reg),
                    bars,
                    irq_line: (irq_reg & 0xFF) as u8,
                    irq_pin: ((irq_reg >> 8) & 0xFF) as u8,
                    msi_offset: find_msi_capability(bus, slot, func),
                });

                // Single-function devices answer only on function 0.
                if func == 0 {
                    let header = (io::read_dword(bus, slot, func, 0x0C) >> 16) as u8;
                    if header & 0x80 == 0 {
                        break;
                    }
                }
            }
        }
    }

    println!("[PCI] {} functions discovered", devices.len());
}

#[cfg(target_os = "none")]
fn find_msi_capability(bus: u8, slot: u8, func: u8) -> u8 {
    let status = io::read_word(bus, slot, func, 0x06);
    if status & STATUS_CAP_LIST == 0 {
        return 0;
    }
    let mut offset = (io::read_dword(bus, slot, func, 0x34) & 0xFC) as u8;
    let mut hops = 0;
    while offset != 0 && hops < 48 {
        let header = io::read_dword(bus, slot, func, offset);
        if (header & 0xFF) as u8 == CAP_ID_MSI {
            return offset;
        }
        offset = ((header >> 8) & 0xFC) as u8;
        hops += 1;
    }
    0
}

/// First discovered function with the given 24-bit class code.
pub fn find_class(class: u32) -> Option<PciDevice> {
    DEVICES.lock().iter().find(|d| d.matches_class(class)).copied()
}

/// First discovered function with the given vendor/device pair.
pub fn find_device(vendor: u16, device: u16) -> Option<PciDevice> {
    DEVICES
        .lock()
        .iter()
        .find(|d| d.vendor_id == vendor && d.device_id == device)
        .copied()
}

/// Number of discovered functions.
pub fn device_count() -> usize {
    DEVICES.lock().len()
}

/// Set the bus-master bit in the device's command register.
#[cfg(target_os = "none")]
pub fn enable_bus_mastering(dev: &PciDevice) {
    let command = io::read_word(dev.bus, dev.slot, dev.func, 0x04);
    io::write_word(dev.bus, dev.slot, dev.func, 0x04, command | CMD_BUS_MASTER);
}

/// Program and enable MSI delivery to `vector` on the CPU with APIC id
/// `apic_id`. Returns false when the device has no MSI capability.
#[cfg(target_os = "none")]
pub fn enable_msi(dev: &PciDevice, apic_id: u8, vector: u8) -> bool {
    if dev.msi_offset == 0 {
        return false;
    }
    let cap = dev.msi_offset;
    // Message address: the LAPIC doorbell page with the destination id.
    let address: u32 = 0xFEE0_0000 | ((apic_id as u32) << 12);
    let control = io::read_word(dev.bus, dev.slot, dev.func, cap + 2);
    let is_64bit = control & 0x80 != 0;

    io::write_dword(dev.bus, dev.slot, dev.func, cap + 4, address);
    if is_64bit {
        io::write_dword(dev.bus, dev.slot, dev.func, cap + 8, 0);
        io::write_word(dev.bus, dev.slot, dev.func, cap + 12, vector as u16);
    } else {
        io::write_word(dev.bus, dev.slot, dev.func, cap + 8, vector as u16);
    }
    // Enable MSI, single message.
    io::write_word(dev.bus, dev.slot, dev.func, cap + 2, (control & !0x70) | 0x01);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_code_extraction() {
        // Class register dword for an AHCI controller: 01 06 01 <rev>.
        assert_eq!(class_code_of(0x0106_0102), 0x010601);
    }

    #[test]
    fn test_class_match() {
        let mut dev = PciDevice {
            bus: 0,
            slot: 2,
            func: 0,
            vendor_id: 0x8086,
            device_id: 0x10D3,
            class_code: 0x020000,
            bars: [0; 6],
            irq_line: 11,
            irq_pin: 1,
            msi_offset: 0x50,
        };
        assert!(dev.matches_class(0x020000)); // ethernet
        dev.class_code = 0x010802;
        assert!(dev.matches_class(0x010802)); // NVMe
        assert!(!dev.matches_class(0x020000));
    }
}
