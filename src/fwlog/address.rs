// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Locate the firmware and microcode log buffers in device memory.
// Author: Lukas Bower

//! Log buffer addressing.
//!
//! The firmware publishes its buffer location in one control dword per CPU:
//! the low 29 bits are the buffer address in the CPU's linker space, the top
//! three bits select the buffer size. Linker addresses are translated to the
//! host-visible AHB space through the per-baseband remap table.

use log::debug;
use thiserror::Error;

use crate::device::{Baseband, CpuType, Device};
use crate::error::DeviceError;
use crate::fwlog::layout::HEADER_DWORDS;

/// Control dword describing the firmware CPU log buffer.
pub const FW_LOG_INFO_ADDRESS: u32 = 0x0088_0004;
/// Control dword describing the microcode CPU log buffer.
pub const UCODE_LOG_INFO_ADDRESS: u32 = 0x0088_0008;
/// Control dword value before the firmware set up its buffer.
pub const LOG_INFO_NOT_READY: u32 = 0xFFFF_FFFF;

const OFFSET_MASK: u32 = 0x1FFF_FFFF;
const SIZE_SHIFT: u32 = 29;
/// Buffer sizes in dwords selected by the size index; index 0 is CPU specific.
const SIZE_MULTIPLIERS: [u32; 8] = [0, 1024, 2048, 4096, 8192, 16384, 32768, 65536];

/// Errors raised while building the address mapping.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    /// The remap table has no region holding the CPU log buffer.
    #[error("no {region} region in the {baseband} remap table")]
    UnmappedRegion {
        /// Baseband whose table was searched.
        baseband: Baseband,
        /// Region looked up.
        region: &'static str,
    },
}

/// One linker-to-AHB window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemapRegion {
    /// Region label.
    pub name: &'static str,
    /// First linker address (inclusive).
    pub linker_start: u32,
    /// Last linker address (exclusive).
    pub linker_end: u32,
    /// AHB address `linker_start` maps to.
    pub ahb_start: u32,
}

const fn region(name: &'static str, linker_start: u32, linker_end: u32, ahb_start: u32) -> RemapRegion {
    RemapRegion {
        name,
        linker_start,
        linker_end,
        ahb_start,
    }
}

const SPARROW_REMAP: &[RemapRegion] = &[
    region("fw_code", 0x0000_0000, 0x0004_0000, 0x008c_0000),
    region("fw_data", 0x0080_0000, 0x0080_8000, 0x0090_0000),
    region("fw_peri", 0x0084_0000, 0x0086_0000, 0x0090_8000),
    region("rgf", 0x0088_0000, 0x0088_a000, 0x0088_0000),
    region("agc_tbl", 0x0088_a000, 0x0088_b000, 0x0088_a000),
    region("rgf_ext", 0x0088_b000, 0x0088_b100, 0x0088_b000),
    region("mac_rgf_ext", 0x0088_c000, 0x0088_c200, 0x0088_c000),
    region("uc_code", 0x0000_0000, 0x0002_0000, 0x0092_0000),
    region("uc_data", 0x0080_0000, 0x0080_8000, 0x0094_0000),
];

const TALYN_REMAP: &[RemapRegion] = &[
    region("fw_code", 0x0000_0000, 0x0010_0000, 0x0090_0000),
    region("fw_data", 0x0080_0000, 0x0082_0000, 0x00a0_0000),
    region("fw_peri", 0x0084_0000, 0x0087_8000, 0x00a2_0000),
    region("rgf", 0x0088_0000, 0x008b_0000, 0x0088_0000),
    region("agc_tbl", 0x008b_0000, 0x008b_1000, 0x008b_0000),
    region("uc_code", 0x0000_0000, 0x0004_0000, 0x00a5_8000),
    region("uc_data", 0x0080_0000, 0x0080_4000, 0x00a7_8000),
];

/// Linker-to-AHB translation for one baseband.
#[derive(Debug, Clone, Copy)]
pub struct AddressTranslator {
    baseband: Baseband,
    regions: &'static [RemapRegion],
}

impl AddressTranslator {
    /// Table for `baseband`.
    pub fn for_baseband(baseband: Baseband) -> Self {
        let regions = match baseband {
            Baseband::SparrowB0 | Baseband::SparrowD0 => SPARROW_REMAP,
            Baseband::TalynMa | Baseband::TalynMb => TALYN_REMAP,
        };
        Self { baseband, regions }
    }

    /// Region by label.
    pub fn region(&self, name: &str) -> Option<&RemapRegion> {
        self.regions.iter().find(|r| r.name == name)
    }

    /// Distance to add to a linker address of the CPU data region to obtain
    /// its AHB address. Wrapping arithmetic keeps downward remaps exact.
    pub fn log_region_delta(&self, cpu: CpuType) -> Result<u32, AddressError> {
        let name = data_region(cpu);
        self.region(name)
            .map(|r| r.ahb_start.wrapping_sub(r.linker_start))
            .ok_or(AddressError::UnmappedRegion {
                baseband: self.baseband,
                region: name,
            })
    }

    /// True when `linker` falls inside the CPU data region.
    pub fn in_log_region(&self, cpu: CpuType, linker: u32) -> bool {
        self.region(data_region(cpu))
            .map(|r| (r.linker_start..r.linker_end).contains(&linker))
            .unwrap_or(false)
    }
}

fn data_region(cpu: CpuType) -> &'static str {
    match cpu {
        CpuType::Fw => "fw_data",
        CpuType::Ucode => "uc_data",
    }
}

/// Control dword address for `cpu`.
pub fn log_info_address(cpu: CpuType) -> u32 {
    match cpu {
        CpuType::Fw => FW_LOG_INFO_ADDRESS,
        CpuType::Ucode => UCODE_LOG_INFO_ADDRESS,
    }
}

/// Buffer size used when the control word carries size index 0.
pub fn default_buffer_size(cpu: CpuType) -> u32 {
    match cpu {
        CpuType::Fw => 4096,
        CpuType::Ucode => 1024,
    }
}

/// Buffer size in dwords encoded in bits [29..31] of `control_word`.
pub fn decode_buffer_size(control_word: u32, cpu: CpuType) -> u32 {
    let index = (control_word >> SIZE_SHIFT) as usize;
    match SIZE_MULTIPLIERS[index & 0x7] {
        0 => default_buffer_size(cpu),
        size => size,
    }
}

/// Location and size of a CPU log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogBufferDescriptor {
    /// AHB address of the buffer header.
    pub base_address: u32,
    /// Payload size in dwords.
    pub size_in_dwords: u32,
}

impl LogBufferDescriptor {
    /// Header plus payload, in dwords.
    pub fn total_dwords(&self) -> u32 {
        HEADER_DWORDS + self.size_in_dwords
    }
}

/// Resolves [`LogBufferDescriptor`]s for one (device, CPU) pair.
#[derive(Debug)]
pub struct DeviceLogAddressResolver {
    cpu: CpuType,
    translator: AddressTranslator,
    ahb_delta: u32,
    last_offset: Option<u32>,
}

impl DeviceLogAddressResolver {
    /// Precompute the AHB delta for `baseband`/`cpu`.
    pub fn new(baseband: Baseband, cpu: CpuType) -> Result<Self, AddressError> {
        let translator = AddressTranslator::for_baseband(baseband);
        let ahb_delta = translator.log_region_delta(cpu)?;
        Ok(Self {
            cpu,
            translator,
            ahb_delta,
            last_offset: None,
        })
    }

    /// Read the control dword and decode it.
    ///
    /// `Ok(None)` means the firmware has not published its buffer yet.
    pub fn resolve(&mut self, device: &dyn Device) -> Result<Option<LogBufferDescriptor>, DeviceError> {
        let control_word = device.read(log_info_address(self.cpu))?;
        Ok(self.decode(control_word))
    }

    /// Decode an already read control dword.
    pub fn decode(&mut self, control_word: u32) -> Option<LogBufferDescriptor> {
        if control_word == LOG_INFO_NOT_READY {
            return None;
        }
        let offset = control_word & OFFSET_MASK;
        if self.last_offset != Some(offset) {
            debug!(
                "{} log buffer offset changed: {:?} -> {:#x}",
                self.cpu, self.last_offset, offset
            );
            if !self.translator.in_log_region(self.cpu, offset) {
                debug!("{} log buffer offset {:#x} outside the data region", self.cpu, offset);
            }
            self.last_offset = Some(offset);
        }
        Some(LogBufferDescriptor {
            base_address: offset.wrapping_add(self.ahb_delta),
            size_in_dwords: decode_buffer_size(control_word, self.cpu),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemoryImageDevice;

    #[test]
    fn size_index_selects_multiplier() {
        let word = 0b010 << 29;
        assert_eq!(decode_buffer_size(word, CpuType::Fw), 2048);
        assert_eq!(decode_buffer_size(word, CpuType::Ucode), 2048);
        assert_eq!(decode_buffer_size(0, CpuType::Fw), 4096);
        assert_eq!(decode_buffer_size(0, CpuType::Ucode), 1024);
        assert_eq!(decode_buffer_size(0b111 << 29, CpuType::Fw), 65536);
    }

    #[test]
    fn sentinel_is_not_ready() {
        let mut resolver = DeviceLogAddressResolver::new(Baseband::SparrowB0, CpuType::Fw).unwrap();
        assert_eq!(resolver.decode(LOG_INFO_NOT_READY), None);
    }

    #[test]
    fn linker_offset_maps_into_ahb() {
        let mut resolver = DeviceLogAddressResolver::new(Baseband::SparrowD0, CpuType::Fw).unwrap();
        let desc = resolver.decode((0b001 << 29) | 0x0080_1000).unwrap();
        assert_eq!(desc.base_address, 0x0090_1000);
        assert_eq!(desc.size_in_dwords, 1024);

        let mut ucode = DeviceLogAddressResolver::new(Baseband::TalynMb, CpuType::Ucode).unwrap();
        let desc = ucode.decode(0x0080_0200).unwrap();
        assert_eq!(desc.base_address, 0x00a7_8200);
        assert_eq!(desc.size_in_dwords, 1024);
    }

    #[test]
    fn resolve_reads_the_cpu_control_word() {
        let dev = MemoryImageDevice::new("wlan0", Baseband::TalynMa);
        dev.write_word(FW_LOG_INFO_ADDRESS, (0b011 << 29) | 0x0080_0000);
        dev.write_word(UCODE_LOG_INFO_ADDRESS, LOG_INFO_NOT_READY);
        let mut fw = DeviceLogAddressResolver::new(Baseband::TalynMa, CpuType::Fw).unwrap();
        let mut uc = DeviceLogAddressResolver::new(Baseband::TalynMa, CpuType::Ucode).unwrap();
        let desc = fw.resolve(&dev).unwrap().unwrap();
        assert_eq!(desc.base_address, 0x00a0_0000);
        assert_eq!(desc.size_in_dwords, 4096);
        assert_eq!(desc.total_dwords(), 4096 + HEADER_DWORDS);
        assert_eq!(uc.resolve(&dev).unwrap(), None);
    }
}
