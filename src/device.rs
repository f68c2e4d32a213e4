// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device collaborator contract and the memory-image device used for replay.
// Author: Lukas Bower

//! Device access contract.
//!
//! The transport itself (PCI, JTAG, netlink) lives outside this crate. The
//! collector only needs dword reads and writes plus the firmware identity
//! once the firmware reports itself initialized.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::DeviceError;

/// CPU owning a firmware log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CpuType {
    /// Firmware CPU.
    Fw,
    /// Microcode CPU.
    Ucode,
}

impl CpuType {
    /// Both CPU types, in polling order.
    pub const ALL: [CpuType; 2] = [CpuType::Fw, CpuType::Ucode];

    /// Short lowercase label used in file and task names.
    pub fn as_str(self) -> &'static str {
        match self {
            CpuType::Fw => "fw",
            CpuType::Ucode => "ucode",
        }
    }
}

impl fmt::Display for CpuType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CpuType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "fw" | "firmware" => Ok(CpuType::Fw),
            "ucode" | "microcode" | "uc" => Ok(CpuType::Ucode),
            other => Err(format!("unknown cpu type {other:?}")),
        }
    }
}

/// Baseband revision of the attached device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Baseband {
    /// Sparrow B0.
    SparrowB0,
    /// Sparrow D0.
    SparrowD0,
    /// Talyn MA.
    TalynMa,
    /// Talyn MB.
    TalynMb,
}

impl fmt::Display for Baseband {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Baseband::SparrowB0 => "SPARROW_B0",
            Baseband::SparrowD0 => "SPARROW_D0",
            Baseband::TalynMa => "TALYN_MA",
            Baseband::TalynMb => "TALYN_MB",
        };
        f.write_str(label)
    }
}

/// Firmware version quadruple.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwVersion {
    /// Major number.
    pub major: u32,
    /// Minor number.
    pub minor: u32,
    /// Sub-minor number.
    pub sub_minor: u32,
    /// Build number.
    pub build: u32,
}

impl fmt::Display for FwVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}.{}", self.major, self.minor, self.sub_minor, self.build)
    }
}

/// Compilation time stamped into a firmware image.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwTimestamp {
    /// Calendar year.
    pub year: u32,
    /// Month, 1-12.
    pub month: u32,
    /// Day of month.
    pub day: u32,
    /// Hour.
    pub hour: u32,
    /// Minute.
    pub min: u32,
    /// Second.
    pub sec: u32,
}

impl fmt::Display for FwTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02}/{:02}/{:04} {:02}:{:02}:{:02}",
            self.day, self.month, self.year, self.hour, self.min, self.sec
        )
    }
}

/// Identity of the running firmware, used to stamp recordings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FwIdentifier {
    /// Firmware version.
    pub version: FwVersion,
    /// Firmware image compilation time.
    pub fw_timestamp: FwTimestamp,
    /// Microcode image compilation time.
    pub ucode_timestamp: FwTimestamp,
}

/// Access to one attached device.
///
/// Implementations must be callable from several poll threads at once; every
/// method may block for up to the transport timeout.
pub trait Device: Send + Sync {
    /// Unique device name, e.g. `wlan0`.
    fn name(&self) -> &str;

    /// Baseband revision, used to map linker addresses.
    fn baseband(&self) -> Baseband;

    /// True while the device does not answer accesses (reset, power save).
    fn is_silent(&self) -> bool {
        false
    }

    /// Firmware identity, `None` until the firmware reports itself initialized.
    fn fw_identifier(&self) -> Option<FwIdentifier>;

    /// Read one dword.
    fn read(&self, address: u32) -> Result<u32, DeviceError>;

    /// Read `dwords` consecutive dwords as little-endian bytes.
    fn read_block(&self, address: u32, dwords: u32) -> Result<Vec<u8>, DeviceError>;

    /// Write consecutive dwords starting at `address`.
    fn write_block(&self, address: u32, words: &[u32]) -> Result<(), DeviceError>;
}

#[derive(Debug, Default)]
struct MemoryImage {
    words: HashMap<u32, u32>,
    silent: bool,
    failing: bool,
    fw: Option<FwIdentifier>,
}

/// Device backed by a sparse in-memory word store.
///
/// Used to replay captured memory dumps offline; unmapped addresses read as
/// zero.
#[derive(Debug)]
pub struct MemoryImageDevice {
    name: String,
    baseband: Baseband,
    image: Mutex<MemoryImage>,
}

impl MemoryImageDevice {
    /// Create an empty image.
    pub fn new(name: impl Into<String>, baseband: Baseband) -> Self {
        Self {
            name: name.into(),
            baseband,
            image: Mutex::new(MemoryImage::default()),
        }
    }

    /// Load a little-endian memory dump starting at `base_address`.
    pub fn from_dump_file(
        name: impl Into<String>,
        baseband: Baseband,
        path: &Path,
        base_address: u32,
    ) -> std::io::Result<Self> {
        let bytes = fs::read(path)?;
        let device = Self::new(name, baseband);
        let words: Vec<u32> = bytes
            .chunks(4)
            .map(|chunk| {
                let mut raw = [0u8; 4];
                raw[..chunk.len()].copy_from_slice(chunk);
                u32::from_le_bytes(raw)
            })
            .collect();
        device.load_words(base_address, &words);
        Ok(device)
    }

    /// Store `words` starting at `address`.
    pub fn load_words(&self, address: u32, words: &[u32]) {
        let mut image = self.lock();
        for (index, word) in words.iter().enumerate() {
            let addr = address.wrapping_add((index as u32) * 4);
            image.words.insert(addr, *word);
        }
    }

    /// Store one word.
    pub fn write_word(&self, address: u32, value: u32) {
        self.lock().words.insert(address, value);
    }

    /// Peek one word without going through the [`Device`] contract.
    pub fn word(&self, address: u32) -> u32 {
        self.lock().words.get(&address).copied().unwrap_or(0)
    }

    /// Toggle the silent state.
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Make every access fail with a transport error.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Publish or retract the firmware identity.
    pub fn set_fw_identifier(&self, fw: Option<FwIdentifier>) {
        self.lock().fw = fw;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryImage> {
        // A panic while holding the image lock leaves plain data behind.
        self.image.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self, image: &MemoryImage, address: u32) -> Result<(), DeviceError> {
        if address % 4 != 0 {
            return Err(DeviceError::Unaligned(address));
        }
        if image.silent {
            return Err(DeviceError::Silent(self.name.clone()));
        }
        if image.failing {
            return Err(DeviceError::Transport {
                address,
                reason: "injected failure".into(),
            });
        }
        Ok(())
    }
}

impl Device for MemoryImageDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn baseband(&self) -> Baseband {
        self.baseband
    }

    fn is_silent(&self) -> bool {
        self.lock().silent
    }

    fn fw_identifier(&self) -> Option<FwIdentifier> {
        self.lock().fw
    }

    fn read(&self, address: u32) -> Result<u32, DeviceError> {
        let image = self.lock();
        self.check(&image, address)?;
        Ok(image.words.get(&address).copied().unwrap_or(0))
    }

    fn read_block(&self, address: u32, dwords: u32) -> Result<Vec<u8>, DeviceError> {
        let image = self.lock();
        self.check(&image, address)?;
        let mut out = Vec::with_capacity(dwords as usize * 4);
        for index in 0..dwords {
            let addr = address.wrapping_add(index * 4);
            let word = image.words.get(&addr).copied().unwrap_or(0);
            out.extend_from_slice(&word.to_le_bytes());
        }
        Ok(out)
    }

    fn write_block(&self, address: u32, words: &[u32]) -> Result<(), DeviceError> {
        let mut image = self.lock();
        self.check(&image, address)?;
        for (index, word) in words.iter().enumerate() {
            image
                .words
                .insert(address.wrapping_add(index as u32 * 4), *word);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_reads_are_little_endian() {
        let dev = MemoryImageDevice::new("wlan0", Baseband::TalynMb);
        dev.load_words(0x1000, &[0x0403_0201, 0x0807_0605]);
        let bytes = dev.read_block(0x1000, 2).unwrap();
        assert_eq!(bytes, vec![1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn silent_device_rejects_access() {
        let dev = MemoryImageDevice::new("wlan0", Baseband::SparrowB0);
        dev.set_silent(true);
        assert!(matches!(dev.read(0x10), Err(DeviceError::Silent(_))));
        assert!(matches!(dev.read(0x11), Err(DeviceError::Unaligned(0x11))));
    }

    #[test]
    fn cpu_type_parses_aliases() {
        assert_eq!("firmware".parse::<CpuType>().unwrap(), CpuType::Fw);
        assert_eq!("UCODE".parse::<CpuType>().unwrap(), CpuType::Ucode);
        assert!("dsp".parse::<CpuType>().is_err());
    }
}
