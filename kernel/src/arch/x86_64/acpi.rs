//! ACPI table discovery: RSDP validation and the MADT walk that yields
//! CPU APIC ids and the I/O APIC address.
//!
//! Only the slice-level parsers know the wire layout; the bare-metal
//! `init` path feeds them table bytes read through the direct map, and
//! the host test suite feeds them synthetic buffers.

use crate::{
    error::{KernelError, KernelResult},
    sched::MAX_CPUS,
    sync::SpinLock,
};

/// MADT entry: processor local APIC.
const MADT_LOCAL_APIC: u8 = 0;
/// MADT entry: I/O APIC.
const MADT_IO_APIC: u8 = 1;
/// MADT entry: processor local x2APIC.
const MADT_LOCAL_X2APIC: u8 = 9;

/// Local-APIC flag: processor enabled.
const LAPIC_FLAG_ENABLED: u32 = 1;

/// Byte length of an ACPI system description table header.
pub const SDT_HEADER_LEN: usize = 36;

/// Parsed root system description pointer.
#[derive(Debug, Clone, Copy)]
pub struct Rsdp {
    pub revision: u8,
    pub rsdt_addr: u32,
    pub xsdt_addr: u64,
}

fn checksum_ok(bytes: &[u8]) -> bool {
    bytes.iter().fold(0u8, |sum, &b| sum.wrapping_add(b)) == 0
}

/// Validate and parse an RSDP blob (the bytewise copy from the
/// bootloader's ACPI tag).
pub fn parse_rsdp(bytes: &[u8]) -> KernelResult<Rsdp> {
    if bytes.len() < 20 || &bytes[0..8] != b"RSD PTR " {
        return Err(KernelError::InvalidArgument {
            name: "rsdp",
            value: "bad signature",
        });
    }
    if !checksum_ok(&bytes[0..20]) {
        return Err(KernelError::InvalidArgument {
            name: "rsdp",
            value: "bad checksum",
        });
    }
    let revision = bytes[15];
    let rsdt_addr = u32::from_le_bytes([bytes[16], bytes[17], bytes[18], bytes[19]]);
    let mut xsdt_addr = 0;
    if revision >= 2 && bytes.len() >= 36 && checksum_ok(&bytes[0..36]) {
        xsdt_addr = u64::from_le_bytes([
            bytes[24], bytes[25], bytes[26], bytes[27], bytes[28], bytes[29], bytes[30], bytes[31],
        ]);
    }
    Ok(Rsdp {
        revision,
        rsdt_addr,
        xsdt_addr,
    })
}

/// Everything the kernel wants from the MADT.
#[derive(Debug, Clone, Copy)]
pub struct MadtInfo {
    /// Local APIC MMIO base as the table reports it.
    pub lapic_addr: u32,
    /// APIC ids of enabled processors, boot order.
    pub cpu_apic_ids: [Option<u8>; MAX_CPUS],
    pub cpu_count: usize,
    /// First I/O APIC's MMIO base.
    pub ioapic_addr: Option<u64>,
    pub ioapic_gsi_base: u32,
}

impl MadtInfo {
    const fn empty() -> Self {
        Self {
            lapic_addr: 0,
            cpu_apic_ids: [None; MAX_CPUS],
            cpu_count: 0,
            ioapic_addr: None,
            ioapic_gsi_base: 0,
        }
    }
}

/// Walk a MADT (header included) collecting processors and the I/O
/// APIC. Processors beyond [`MAX_CPUS`] are counted but not recorded.
pub fn parse_madt(table: &[u8]) -> KernelResult<MadtInfo> {
    if table.len() < SDT_HEADER_LEN + 8 || &table[0..4] != b"APIC" {
        return Err(KernelError::InvalidArgument {
            name: "madt",
            value: "bad signature or truncated",
        });
    }

    let mut info = MadtInfo::empty();
    info.lapic_addr = u32::from_le_bytes([
        table[SDT_HEADER_LEN],
        table[SDT_HEADER_LEN + 1],
        table[SDT_HEADER_LEN + 2],
        table[SDT_HEADER_LEN + 3],
    ]);

    let mut offset = SDT_HEADER_LEN + 8;
    while offset + 2 <= table.len() {
        let kind = table[offset];
        let len = table[offset + 1] as usize;
        if len < 2 || offset + len > table.len() {
            break;
        }
        let entry = &table[offset..offset + len];
        match kind {
            MADT_LOCAL_APIC if len >= 8 => {
                let apic_id = entry[3];
                let flags = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
                if flags & LAPIC_FLAG_ENABLED != 0 {
                    if info.cpu_count < MAX_CPUS {
                        info.cpu_apic_ids[info.cpu_count] = Some(apic_id);
                    }
                    info.cpu_count += 1;
                }
            }
            MADT_LOCAL_X2APIC if len >= 16 => {
                let apic_id = u32::from_le_bytes([entry[4], entry[5], entry[6], entry[7]]);
                let flags = u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
                if flags & LAPIC_FLAG_ENABLED != 0 && apic_id <= u8::MAX as u32 {
                    if info.cpu_count < MAX_CPUS {
                        info.cpu_apic_ids[info.cpu_count] = Some(apic_id as u8);
                    }
                    info.cpu_count += 1;
                }
            }
            MADT_IO_APIC if len >= 12 && info.ioapic_addr.is_none() => {
                info.ioapic_addr = Some(u32::from_le_bytes([
                    entry[4], entry[5], entry[6], entry[7],
                ]) as u64);
                info.ioapic_gsi_base =
                    u32::from_le_bytes([entry[8], entry[9], entry[10], entry[11]]);
            }
            _ => {}
        }
        offset += len;
    }

    Ok(info)
}

/// Discovered topology, filled in by [`init`]. Empty (single implicit
/// CPU) until then.
static TOPOLOGY: SpinLock<MadtInfo> = SpinLock::new(MadtInfo::empty());

/// Map an APIC id to its logical CPU index.
pub fn logical_cpu_index(apic_id: u8) -> Option<usize> {
    let topo = TOPOLOGY.lock();
    topo.cpu_apic_ids[..topo.cpu_count.min(MAX_CPUS)]
        .iter()
        .position(|&id| id == Some(apic_id))
}

/// Number of processors the MADT reported (possibly above [`MAX_CPUS`]),
/// or 1 before discovery.
pub fn cpu_count() -> usize {
    TOPOLOGY.lock().cpu_count.max(1)
}

/// The I/O APIC MMIO base from the MADT, if discovery ran.
pub fn ioapic_address() -> Option<u64> {
    TOPOLOGY.lock().ioapic_addr
}

/// Walk the ACPI tables starting from the bootloader's RSDP copy and
/// record the MADT topology.
#[cfg(target_os = "none")]
pub fn init(rsdp_bytes: &[u8]) -> KernelResult<()> {
    use crate::mm::{phys_to_virt, PhysicalAddress};

    let rsdp = parse_rsdp(rsdp_bytes)?;

    // Borrow an SDT through the direct map, validating length first.
    let table_at = |phys: u64| -> Option<&'static [u8]> {
        if phys == 0 {
            return None;
        }
        let base = phys_to_virt(PhysicalAddress::new(phys)).as_ptr::<u8>();
        // SAFETY: ACPI tables live in firmware-reserved memory the PMM
        // never hands out; the header is SDT_HEADER_LEN bytes.
        let header = unsafe { core::slice::from_raw_parts(base, SDT_HEADER_LEN) };
        let len = u32::from_le_bytes([header[4], header[5], header[6], header[7]]) as usize;
        if len < SDT_HEADER_LEN {
            return None;
        }
        // SAFETY: `len` is the table's self-declared size within the
        // same reserved region.
        Some(unsafe { core::slice::from_raw_parts(base, len) })
    };

    let (root, wide) = if rsdp.xsdt_addr != 0 {
        (table_at(rsdp.xsdt_addr), true)
    } else {
        (table_at(rsdp.rsdt_addr as u64), false)
    };
    let root = root.ok_or(KernelError::NotFound {
        resource: "ACPI root table",
        id: 0,
    })?;

    let stride = if wide { 8 } else { 4 };
    let mut offset = SDT_HEADER_LEN;
    while offset + stride <= root.len() {
        let phys = if wide {
            u64::from_le_bytes(root[offset..offset + 8].try_into().unwrap())
        } else {
            u32::from_le_bytes(root[offset..offset + 4].try_into().unwrap()) as u64
        };
        if let Some(table) = table_at(phys) {
            if &table[0..4] == b"APIC" && checksum_ok(table) {
                let info = parse_madt(table)?;
                println!(
                    "[ACPI] revision {}, {} CPUs, I/O APIC at {:#x}",
                    rsdp.revision,
                    info.cpu_count,
                    info.ioapic_addr.unwrap_or(0)
                );
                *TOPOLOGY.lock() = info;
                return Ok(());
            }
        }
        offset += stride;
    }

    Err(KernelError::NotFound {
        resource: "MADT",
        id: 0,
    })
}

#[cfg(test)]
mod tests {
    use alloc::vec::Vec;

    use super::*;

    fn with_checksum(mut bytes: Vec<u8>, range: core::ops::Range<usize>, slot: usize) -> Vec<u8> {
        let sum = bytes[range].iter().fold(0u8, |s, &b| s.wrapping_add(b));
        bytes[slot] = 0u8.wrapping_sub(sum);
        bytes
    }

    fn synthetic_rsdp_v1() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"RSD PTR ");
        bytes.push(0); // checksum slot
        bytes.extend_from_slice(b"FERRIT"); // OEM id
        bytes.push(0); // revision 0 = ACPI 1.0
        bytes.extend_from_slice(&0x7FE0000u32.to_le_bytes()); // RSDT
        with_checksum(bytes, 0..20, 8)
    }

    #[test]
    fn test_rsdp_v1_parses() {
        let rsdp = parse_rsdp(&synthetic_rsdp_v1()).unwrap();
        assert_eq!(rsdp.revision, 0);
        assert_eq!(rsdp.rsdt_addr, 0x7FE0000);
        assert_eq!(rsdp.xsdt_addr, 0);
    }

    #[test]
    fn test_rsdp_bad_checksum_rejected() {
        let mut bytes = synthetic_rsdp_v1();
        bytes[9] ^= 0xFF;
        assert!(parse_rsdp(&bytes).is_err());
    }

    #[test]
    fn test_rsdp_bad_signature_rejected() {
        let mut bytes = synthetic_rsdp_v1();
        bytes[0] = b'X';
        assert!(parse_rsdp(&bytes).is_err());
    }

    fn synthetic_madt() -> Vec<u8> {
        let mut t = Vec::new();
        t.extend_from_slice(b"APIC"); // signature
        t.extend_from_slice(&0u32.to_le_bytes()); // length patched below
        t.push(3); // revision
        t.push(0); // checksum (unchecked by the parser)
        t.extend_from_slice(&[0; 26]); // rest of the SDT header
        t.extend_from_slice(&0xFEE0_0000u32.to_le_bytes()); // LAPIC addr
        t.extend_from_slice(&1u32.to_le_bytes()); // flags

        // Two enabled CPUs, one disabled.
        for (acpi_id, apic_id, flags) in [(0u8, 0u8, 1u32), (1, 2, 1), (2, 4, 0)] {
            t.extend_from_slice(&[MADT_LOCAL_APIC, 8, acpi_id, apic_id]);
            t.extend_from_slice(&flags.to_le_bytes());
        }

        // One I/O APIC at the canonical address.
        t.extend_from_slice(&[MADT_IO_APIC, 12, 0, 0]);
        t.extend_from_slice(&0xFEC0_0000u32.to_le_bytes());
        t.extend_from_slice(&0u32.to_le_bytes());

        let len = t.len() as u32;
        t[4..8].copy_from_slice(&len.to_le_bytes());
        t
    }

    #[test]
    fn test_madt_walk_finds_cpus_and_ioapic() {
        let info = parse_madt(&synthetic_madt()).unwrap();
        assert_eq!(info.lapic_addr, 0xFEE0_0000);
        assert_eq!(info.cpu_count, 2);
        assert_eq!(info.cpu_apic_ids[0], Some(0));
        assert_eq!(info.cpu_apic_ids[1], Some(2));
        assert_eq!(info.ioapic_addr, Some(0xFEC0_0000));
    }

    #[test]
    fn test_madt_bad_signature_rejected() {
        let mut t = synthetic_madt();
        t[0] = b'X';
        assert!(parse_madt(&t).is_err());
    }
}
