// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Human readable recording with messages expanded from the string table.
// Author: Lukas Bower

use chrono::{DateTime, Local};

use super::file::{Anomaly, FileSink, HeaderInfo, RecordFormat};
use super::strings::{raw_message, StringTable};
use super::SinkKind;
use crate::fwlog::layout::{module_name, LogEvent, ModuleLevel};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// One line per record, `<ts> [<MODULE>] <LEVEL>: <message>`.
///
/// Without a string table, or for modules running in third-party mode, the
/// message falls back to the raw offset and parameters.
#[derive(Debug, Default, Clone)]
pub struct TxtFormat {
    strings: Option<StringTable>,
}

/// File sink producing `.txt` recordings.
pub type TxtSink = FileSink<TxtFormat>;

impl TxtFormat {
    /// Format expanding messages from `strings` when present.
    pub fn new(strings: Option<StringTable>) -> Self {
        Self { strings }
    }

    fn message(&self, info: &HeaderInfo, event: &LogEvent) -> String {
        let third_party = info
            .levels
            .get(event.module as usize)
            .is_some_and(|l| l.contains(ModuleLevel::THIRD_PARTY));
        if third_party {
            return raw_message(event.string_offset, event.params());
        }
        self.strings
            .as_ref()
            .and_then(|t| t.expand(event.string_offset, event.params()))
            .unwrap_or_else(|| raw_message(event.string_offset, event.params()))
    }
}

impl RecordFormat for TxtFormat {
    const KIND: SinkKind = SinkKind::Txt;
    const EXTENSION: &'static str = "txt";

    fn header(&self, info: &HeaderInfo) -> String {
        let third_party: Vec<&str> = info
            .third_party_modules()
            .into_iter()
            .map(|m| module_name(info.cpu, m as u8))
            .collect();
        let third_party = if third_party.is_empty() {
            "none".to_string()
        } else {
            third_party.join(", ")
        };
        format!(
            "# Device: {}\n\
             # CPU: {}\n\
             # FW version: {}\n\
             # FW compilation time: {}\n\
             # uCode compilation time: {}\n\
             # Buffer size: {} dwords\n\
             # Third party modules: {}\n\
             #\n",
            info.device,
            info.cpu,
            info.fw.version,
            info.fw.fw_timestamp,
            info.fw.ucode_timestamp,
            info.buffer_size,
            third_party
        )
    }

    fn footer(&self) -> String {
        String::new()
    }

    fn chunk_start(&self, _ts: DateTime<Local>) -> Option<String> {
        None
    }

    fn chunk_end(&self) -> Option<String> {
        None
    }

    fn event(&self, info: &HeaderInfo, ts: DateTime<Local>, event: &LogEvent) -> String {
        format!(
            "{} [{}] {}: {}",
            ts.format(TS_FORMAT),
            module_name(info.cpu, event.module),
            event.level,
            self.message(info, event)
        )
    }

    fn anomaly(&self, ts: DateTime<Local>, anomaly: Anomaly) -> String {
        let text = match anomaly {
            Anomaly::Overrun(missed) => format!("buffer overrun, {missed} dwords lost"),
            Anomaly::Restart => "device restarted".to_string(),
            Anomaly::Corrupted(signature) => format!("corrupted entry {signature:#010x}"),
            Anomaly::Inconsistent(excess) => {
                format!("last entry runs {excess} dwords past the write pointer")
            }
            Anomaly::DeviceRemoved => "device removed".to_string(),
            Anomaly::DeviceDiscovered => "device discovered".to_string(),
        };
        format!("{} [FWLOG] {text}", ts.format(TS_FORMAT))
    }
}
