// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Wire layout of the firmware log buffer shared with device firmware.
// Author: Lukas Bower

//! Firmware log buffer layout.
//!
//! ```text
//! base + 0x00  write_ptr            (dwords written since buffer init)
//! base + 0x04  module_level[16]     (one byte per module)
//! base + 0x14  payload[size]        (circular, indexed by ptr % size)
//! ```
//!
//! Each record is a header dword followed by `dword_num` parameter dwords.
//! Header bits, LSB first:
//!
//! ```text
//! [0..20)  string_offset
//! [20..24) module
//! [24..26) level
//! [26..28) dword_num_lsb
//! [28]     dword_num_msb
//! [29..32) signature (0b101)
//! ```

use std::fmt;

use bitflags::bitflags;

use crate::device::CpuType;

/// Modules per CPU sharing the verbosity table.
pub const NUM_MODULES: usize = 16;
/// Dwords taken by the buffer header (write pointer plus verbosity table).
pub const HEADER_DWORDS: u32 = 1 + (NUM_MODULES as u32) / 4;
/// Byte offset of the verbosity table from the buffer base.
pub const MODULE_LEVELS_OFFSET: u32 = 4;
/// Signature every valid record header carries.
pub const EVENT_SIGNATURE: u32 = 0b101;
/// Largest parameter count a header can describe.
pub const MAX_EVENT_PARAMS: usize = 7;

const STRING_OFFSET_MASK: u32 = 0x000F_FFFF;
const MODULE_SHIFT: u32 = 20;
const LEVEL_SHIFT: u32 = 24;
const LSB_SHIFT: u32 = 26;
const MSB_SHIFT: u32 = 28;
const SIGNATURE_SHIFT: u32 = 29;

const FW_MODULES: [&str; NUM_MODULES] = [
    "SYSTEM", "DRIVERS", "MAC_MON", "HOST_CMD", "PHY_MON", "INFRA", "CALIBS", "TXRX", "RAD_MGR",
    "SCAN", "MLME", "L2_MGR", "DISC", "MGMT_SRV", "SEC_PSM", "WBE_MNGR",
];

const UCODE_MODULES: [&str; NUM_MODULES] = [
    "UCODE_SYSTEM", "UCODE_INIT", "UCODE_TX", "UCODE_RX", "UCODE_BF", "UCODE_SCHED",
    "UCODE_PS", "UCODE_SEC", "UCODE_DMA", "UCODE_PHY", "UCODE_RF", "UCODE_TIMERS",
    "UCODE_MISC", "UCODE_DBG", "UCODE_STATS", "UCODE_RSVD",
];

/// Module names for the given CPU, indexed by module number.
pub fn module_names(cpu: CpuType) -> &'static [&'static str; NUM_MODULES] {
    match cpu {
        CpuType::Fw => &FW_MODULES,
        CpuType::Ucode => &UCODE_MODULES,
    }
}

/// Name of module `index`, `"UNKNOWN"` when out of range.
pub fn module_name(cpu: CpuType, index: u8) -> &'static str {
    module_names(cpu)
        .get(index as usize)
        .copied()
        .unwrap_or("UNKNOWN")
}

/// Case-insensitive module lookup.
pub fn module_index(cpu: CpuType, name: &str) -> Option<usize> {
    module_names(cpu)
        .iter()
        .position(|candidate| candidate.eq_ignore_ascii_case(name.trim()))
}

bitflags! {
    /// Per-module verbosity byte as stored in the buffer header.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ModuleLevel: u8 {
        /// Error traces enabled.
        const ERROR = 0x01;
        /// Warning traces enabled.
        const WARN = 0x02;
        /// Info traces enabled.
        const INFO = 0x04;
        /// Verbose traces enabled.
        const VERBOSE = 0x08;
        /// Module emits third-party formatted traces.
        const THIRD_PARTY = 0x10;
    }
}

impl ModuleLevel {
    /// Parse a level string made of `V`, `I`, `W`, `E` and `T` letters.
    ///
    /// Returns the first unrecognised character on failure. An empty string
    /// disables every level.
    pub fn parse_letters(letters: &str) -> Result<Self, char> {
        let mut level = ModuleLevel::empty();
        for ch in letters.trim().chars() {
            level |= match ch.to_ascii_uppercase() {
                'V' => ModuleLevel::VERBOSE,
                'I' => ModuleLevel::INFO,
                'W' => ModuleLevel::WARN,
                'E' => ModuleLevel::ERROR,
                'T' => ModuleLevel::THIRD_PARTY,
                other => return Err(other),
            };
        }
        Ok(level)
    }

    /// Inverse of [`ModuleLevel::parse_letters`].
    pub fn letters(self) -> String {
        let mut out = String::new();
        for (flag, ch) in [
            (ModuleLevel::VERBOSE, 'V'),
            (ModuleLevel::INFO, 'I'),
            (ModuleLevel::WARN, 'W'),
            (ModuleLevel::ERROR, 'E'),
            (ModuleLevel::THIRD_PARTY, 'T'),
        ] {
            if self.contains(flag) {
                out.push(ch);
            }
        }
        out
    }
}

/// Severity carried in a record header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogLevel {
    /// Error.
    Error,
    /// Warning.
    Warn,
    /// Info.
    Info,
    /// Verbose.
    Verbose,
}

impl LogLevel {
    /// Decode the two level bits.
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => LogLevel::Error,
            1 => LogLevel::Warn,
            2 => LogLevel::Info,
            _ => LogLevel::Verbose,
        }
    }

    /// Encode into the two level bits.
    pub fn bits(self) -> u32 {
        match self {
            LogLevel::Error => 0,
            LogLevel::Warn => 1,
            LogLevel::Info => 2,
            LogLevel::Verbose => 3,
        }
    }

    /// Upper-case label.
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Error => "ERROR",
            LogLevel::Warn => "WARN",
            LogLevel::Info => "INFO",
            LogLevel::Verbose => "VERBOSE",
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Record header decoded from a plain dword.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventHeader(u32);

impl EventHeader {
    /// Wrap a raw header dword.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    /// Build a header with a valid signature.
    pub fn encode(module: u8, level: LogLevel, string_offset: u32, dword_num: u8) -> Self {
        let dword_num = u32::from(dword_num.min(MAX_EVENT_PARAMS as u8));
        let raw = (string_offset & STRING_OFFSET_MASK)
            | (u32::from(module & 0xF) << MODULE_SHIFT)
            | (level.bits() << LEVEL_SHIFT)
            | ((dword_num & 0x3) << LSB_SHIFT)
            | ((dword_num >> 2) << MSB_SHIFT)
            | (EVENT_SIGNATURE << SIGNATURE_SHIFT);
        Self(raw)
    }

    /// Raw dword.
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Signature bits.
    pub const fn signature(self) -> u32 {
        self.0 >> SIGNATURE_SHIFT
    }

    /// True when the signature matches [`EVENT_SIGNATURE`].
    pub const fn is_valid(self) -> bool {
        self.signature() == EVENT_SIGNATURE
    }

    /// Offset of the format string in the offline string table.
    pub const fn string_offset(self) -> u32 {
        self.0 & STRING_OFFSET_MASK
    }

    /// Module number.
    pub const fn module(self) -> u8 {
        ((self.0 >> MODULE_SHIFT) & 0xF) as u8
    }

    /// Severity.
    pub fn level(self) -> LogLevel {
        LogLevel::from_bits(self.0 >> LEVEL_SHIFT)
    }

    /// Number of parameter dwords following the header.
    pub const fn dword_num(self) -> u32 {
        let lsb = (self.0 >> LSB_SHIFT) & 0x3;
        let msb = (self.0 >> MSB_SHIFT) & 0x1;
        4 * msb + lsb
    }
}

/// One decoded record, valid for the duration of a fan-out call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogEvent {
    /// Module number.
    pub module: u8,
    /// Severity.
    pub level: LogLevel,
    /// Format string offset.
    pub string_offset: u32,
    params: [u32; MAX_EVENT_PARAMS],
    param_count: u8,
}

impl LogEvent {
    /// Build an event; parameters beyond [`MAX_EVENT_PARAMS`] are dropped.
    pub fn new(module: u8, level: LogLevel, string_offset: u32, params: &[u32]) -> Self {
        let count = params.len().min(MAX_EVENT_PARAMS);
        let mut stored = [0u32; MAX_EVENT_PARAMS];
        stored[..count].copy_from_slice(&params[..count]);
        Self {
            module,
            level,
            string_offset,
            params: stored,
            param_count: count as u8,
        }
    }

    /// Parameter dwords in buffer order.
    pub fn params(&self) -> &[u32] {
        &self.params[..self.param_count as usize]
    }
}

/// Header at the start of the log buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferHeader {
    /// Firmware write cursor in dwords.
    pub write_ptr: u32,
    /// Verbosity table.
    pub module_levels: [ModuleLevel; NUM_MODULES],
}

impl BufferHeader {
    /// Parse the header from its leading dwords.
    pub fn parse(words: &[u32]) -> Option<Self> {
        if words.len() < HEADER_DWORDS as usize {
            return None;
        }
        let mut levels = [0u32; NUM_MODULES / 4];
        levels.copy_from_slice(&words[1..HEADER_DWORDS as usize]);
        Some(Self {
            write_ptr: words[0],
            module_levels: levels_from_words(&levels),
        })
    }
}

/// Unpack the verbosity table from its four little-endian dwords.
pub fn levels_from_words(words: &[u32; NUM_MODULES / 4]) -> [ModuleLevel; NUM_MODULES] {
    let mut levels = [ModuleLevel::empty(); NUM_MODULES];
    for (index, word) in words.iter().enumerate() {
        for (byte_index, byte) in word.to_le_bytes().iter().enumerate() {
            levels[index * 4 + byte_index] = ModuleLevel::from_bits_retain(*byte);
        }
    }
    levels
}

/// Pack the verbosity table into four little-endian dwords.
pub fn levels_to_words(levels: &[ModuleLevel; NUM_MODULES]) -> [u32; NUM_MODULES / 4] {
    let mut words = [0u32; NUM_MODULES / 4];
    for (index, word) in words.iter_mut().enumerate() {
        let mut bytes = [0u8; 4];
        for (byte_index, byte) in bytes.iter_mut().enumerate() {
            *byte = levels[index * 4 + byte_index].bits();
        }
        *word = u32::from_le_bytes(bytes);
    }
    words
}

/// Convert little-endian bytes to dwords; a trailing partial dword is dropped.
pub fn dwords_from_le_bytes(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks_exact(4)
        .map(|chunk| u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
