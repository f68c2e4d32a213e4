// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Offline format string table and printf-style message expansion.
// Author: Lukas Bower

//! Firmware records carry only an offset into a string table that is built
//! alongside the firmware image. The table is a flat blob of NUL terminated
//! format strings; `%s` arguments are themselves offsets into the same blob.

use std::fmt::Write as _;
use std::fs;
use std::io;
use std::iter::Peekable;
use std::path::Path;
use std::str::Chars;

use log::{debug, info, warn};

use crate::device::CpuType;

/// Format strings extracted from a firmware build.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StringTable {
    blob: Vec<u8>,
}

impl StringTable {
    /// Wrap a raw string blob.
    pub fn from_bytes(blob: Vec<u8>) -> Self {
        Self { blob }
    }

    /// Read a string blob from disk.
    pub fn load(path: &Path) -> io::Result<Self> {
        let blob = fs::read(path)?;
        info!("loaded {} bytes of format strings from {}", blob.len(), path.display());
        Ok(Self { blob })
    }

    /// File name of the table for `cpu` inside a string table directory.
    pub fn file_name(cpu: CpuType) -> &'static str {
        match cpu {
            CpuType::Fw => "fw_strings.bin",
            CpuType::Ucode => "ucode_strings.bin",
        }
    }

    /// Table for `cpu` from `dir`, or `None` when absent or unreadable.
    pub fn for_cpu(dir: &Path, cpu: CpuType) -> Option<Self> {
        let path = dir.join(Self::file_name(cpu));
        if !path.exists() {
            debug!("no string table at {}", path.display());
            return None;
        }
        match Self::load(&path) {
            Ok(table) if table.is_empty() => {
                warn!("string table {} is empty, ignoring it", path.display());
                None
            }
            Ok(table) => Some(table),
            Err(err) => {
                warn!("string table {} unreadable: {err}", path.display());
                None
            }
        }
    }

    /// True for an empty table.
    pub fn is_empty(&self) -> bool {
        self.blob.is_empty()
    }

    /// NUL terminated string at `offset`.
    pub fn get(&self, offset: u32) -> Option<&str> {
        let start = offset as usize;
        let tail = self.blob.get(start..)?;
        if tail.is_empty() {
            return None;
        }
        let end = tail.iter().position(|b| *b == 0).unwrap_or(tail.len());
        std::str::from_utf8(&tail[..end]).ok()
    }

    /// Expand the format string at `offset` with `params`.
    pub fn expand(&self, offset: u32, params: &[u32]) -> Option<String> {
        self.get(offset).map(|fmt| expand_format(fmt, params, self))
    }
}

/// Upper bound on field width and precision; both may come from device data.
const MAX_FIELD_WIDTH: usize = 256;

fn take_number(chars: &mut Peekable<Chars<'_>>) -> usize {
    let mut value = 0usize;
    while let Some(d) = chars.peek().and_then(|c| c.to_digit(10)) {
        value = value.saturating_mul(10).saturating_add(d as usize);
        chars.next();
    }
    value
}

#[derive(Debug, Default, Clone, Copy)]
struct Conversion {
    left: bool,
    plus: bool,
    space: bool,
    alt: bool,
    zero: bool,
    width: usize,
    precision: Option<usize>,
}

impl Conversion {
    fn pad(&self, prefix: &str, body: &str, numeric: bool) -> String {
        let len = prefix.len() + body.len();
        if len >= self.width {
            return format!("{prefix}{body}");
        }
        let fill = self.width - len;
        if self.left {
            format!("{prefix}{body}{}", " ".repeat(fill))
        } else if self.zero && numeric && self.precision.is_none() {
            format!("{prefix}{}{body}", "0".repeat(fill))
        } else {
            format!("{}{prefix}{body}", " ".repeat(fill))
        }
    }

    fn digits(&self, mut digits: String) -> String {
        if let Some(precision) = self.precision {
            if precision == 0 && digits == "0" {
                digits.clear();
            }
            if digits.len() < precision {
                digits = format!("{}{digits}", "0".repeat(precision - digits.len()));
            }
        }
        digits
    }
}

/// Expand a printf-style `fmt` with dword arguments.
///
/// Supported conversions are `d i u x X o c s p %` with the `- + space # 0`
/// flags, width, precision and the usual length modifiers (which are ignored,
/// every argument is one dword). Missing arguments render as `<?>`.
pub fn expand_format(fmt: &str, params: &[u32], strings: &StringTable) -> String {
    let mut out = String::with_capacity(fmt.len() + 16);
    let mut args = params.iter().copied();
    let mut chars = fmt.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        let mut conv = Conversion::default();
        while let Some(&flag) = chars.peek() {
            match flag {
                '-' => conv.left = true,
                '+' => conv.plus = true,
                ' ' => conv.space = true,
                '#' => conv.alt = true,
                '0' => conv.zero = true,
                _ => break,
            }
            chars.next();
        }
        if chars.peek() == Some(&'*') {
            chars.next();
            conv.width = args.next().unwrap_or(0) as usize;
        } else {
            conv.width = take_number(&mut chars);
        }
        conv.width = conv.width.min(MAX_FIELD_WIDTH);
        if chars.peek() == Some(&'.') {
            chars.next();
            let precision = if chars.peek() == Some(&'*') {
                chars.next();
                args.next().unwrap_or(0) as usize
            } else {
                take_number(&mut chars)
            };
            conv.precision = Some(precision.min(MAX_FIELD_WIDTH));
        }
        while matches!(chars.peek(), Some('h' | 'l' | 'z' | 'j' | 't' | 'L' | 'q')) {
            chars.next();
        }
        let Some(conversion) = chars.next() else {
            out.push('%');
            break;
        };
        if conversion == '%' {
            out.push('%');
            continue;
        }
        if !"diuxXocsp".contains(conversion) {
            out.push('%');
            out.push(conversion);
            continue;
        }
        let Some(arg) = args.next() else {
            out.push_str("<?>");
            continue;
        };
        let rendered = match conversion {
            'd' | 'i' => {
                let value = arg as i32;
                let sign = if value < 0 {
                    "-"
                } else if conv.plus {
                    "+"
                } else if conv.space {
                    " "
                } else {
                    ""
                };
                let digits = conv.digits(value.unsigned_abs().to_string());
                conv.pad(sign, &digits, true)
            }
            'u' => conv.pad("", &conv.digits(arg.to_string()), true),
            'x' | 'X' => {
                let mut digits = format!("{arg:x}");
                if conversion == 'X' {
                    digits.make_ascii_uppercase();
                }
                let prefix = match (conv.alt && arg != 0, conversion) {
                    (true, 'x') => "0x",
                    (true, _) => "0X",
                    _ => "",
                };
                conv.pad(prefix, &conv.digits(digits), true)
            }
            'o' => {
                let prefix = if conv.alt && arg != 0 { "0" } else { "" };
                conv.pad(prefix, &conv.digits(format!("{arg:o}")), true)
            }
            'c' => {
                let ch = char::from((arg & 0xff) as u8);
                conv.pad("", &ch.to_string(), false)
            }
            's' => {
                let text = match strings.get(arg) {
                    Some(text) => text.to_string(),
                    None => format!("<bad string {arg:#x}>"),
                };
                let text: String = match conv.precision {
                    Some(max) => text.chars().take(max).collect(),
                    None => text,
                };
                conv.pad("", &text, false)
            }
            _ => conv.pad("", &format!("0x{arg:08x}"), false),
        };
        out.push_str(&rendered);
    }
    out
}

/// Rendering used when no format string is available.
pub fn raw_message(string_offset: u32, params: &[u32]) -> String {
    let mut out = format!("string_offset={string_offset:#07x}");
    if !params.is_empty() {
        out.push_str(" params=[");
        for (index, param) in params.iter().enumerate() {
            if index > 0 {
                out.push_str(", ");
            }
            let _ = write!(out, "{param:#x}");
        }
        out.push(']');
    }
    out
}
