// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: XML recording of raw firmware log records.
// Author: Lukas Bower

use chrono::{DateTime, Local};

use super::file::{Anomaly, FileSink, HeaderInfo, RecordFormat};
use super::SinkKind;
use crate::fwlog::layout::{module_name, LogEvent};

/// Raw records as XML; decoding is left to offline tools.
#[derive(Debug, Default, Clone, Copy)]
pub struct XmlFormat;

/// File sink producing `.xml` recordings.
pub type XmlSink = FileSink<XmlFormat>;

const TS_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

impl RecordFormat for XmlFormat {
    const KIND: SinkKind = SinkKind::Xml;
    const EXTENSION: &'static str = "xml";

    fn header(&self, info: &HeaderInfo) -> String {
        let third_party = info
            .third_party_modules()
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "<LogFile>\n\
             <Device>{}</Device>\n\
             <Cpu>{}</Cpu>\n\
             <FW_Ver>{}</FW_Ver>\n\
             <FwCompilation_Time>{}</FwCompilation_Time>\n\
             <uCodeCompilation_Time>{}</uCodeCompilation_Time>\n\
             <Buffer_Size>{}</Buffer_Size>\n\
             <Third_Party_Flags>{}</Third_Party_Flags>\n\
             <Logs>\n",
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
        "</Logs>\n</LogFile>\n".to_string()
    }

    fn chunk_start(&self, ts: DateTime<Local>) -> Option<String> {
        Some(format!("<Content ts=\"{}\">", ts.format(TS_FORMAT)))
    }

    fn chunk_end(&self) -> Option<String> {
        Some("</Content>".to_string())
    }

    fn event(&self, info: &HeaderInfo, _ts: DateTime<Local>, event: &LogEvent) -> String {
        let params = event
            .params()
            .iter()
            .map(|p| format!("{p:#x}"))
            .collect::<Vec<_>>()
            .join(",");
        format!(
            "<Log_Content><Module>{}</Module><Level>{}</Level>\
             <String_Offset>{:#x}</String_Offset><Params>{}</Params></Log_Content>",
            module_name(info.cpu, event.module),
            event.level,
            event.string_offset,
            params
        )
    }

    fn anomaly(&self, ts: DateTime<Local>, anomaly: Anomaly) -> String {
        match anomaly {
            Anomaly::Overrun(missed) => format!("<Overrun missed=\"{missed}\"/>"),
            Anomaly::Restart => "<Device_Restarted/>".to_string(),
            Anomaly::Corrupted(signature) => {
                format!("<Corrupted_Entry signature=\"{signature:#010x}\"/>")
            }
            Anomaly::Inconsistent(excess) => {
                format!("<Inconsistent_Wptr excess=\"{excess}\"/>")
            }
            Anomaly::DeviceRemoved => {
                format!("<Device_Removed ts=\"{}\"/>", ts.format(TS_FORMAT))
            }
            Anomaly::DeviceDiscovered => {
                format!("<Device_Discovered ts=\"{}\"/>", ts.format(TS_FORMAT))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;
    use crate::device::{CpuType, FwIdentifier, FwVersion};
    use crate::fwlog::layout::{LogLevel, ModuleLevel, NUM_MODULES};
    use crate::recording::RecorderSettings;
    use crate::sinks::ChunkConsumer;

    fn fw(build: u32) -> FwIdentifier {
        FwIdentifier {
            version: FwVersion {
                major: 5,
                minor: 2,
                sub_minor: 0,
                build,
            },
            ..FwIdentifier::default()
        }
    }

    fn sink(dir: &std::path::Path) -> XmlSink {
        let settings = RecorderSettings {
            target_dir: dir.to_path_buf(),
            max_file_bytes: 0,
        };
        XmlSink::new(XmlFormat, "wlan0", CpuType::Fw, settings, None)
    }

    #[test]
    fn header_lists_third_party_modules() {
        let mut info = HeaderInfo::new("wlan0", CpuType::Fw);
        info.levels[1] = ModuleLevel::THIRD_PARTY;
        info.levels[9] = ModuleLevel::ERROR | ModuleLevel::THIRD_PARTY;
        info.fw = fw(18);
        let header = XmlFormat.header(&info);
        assert!(header.starts_with("<LogFile>\n"));
        assert!(header.contains("<FW_Ver>5.2.0.18</FW_Ver>"));
        assert!(header.contains("<Third_Party_Flags>1,9</Third_Party_Flags>"));
        assert!(header.ends_with("<Logs>\n"));
    }

    #[test]
    fn chunk_is_wrapped_in_content() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let levels = [ModuleLevel::ERROR; NUM_MODULES];
        sink.enable(&levels, &fw(1)).unwrap();
        sink.on_start_new_chunk(Local::now());
        sink.consume_event(&LogEvent::new(3, LogLevel::Info, 0x42, &[7, 8]));
        sink.report_overrun(26);
        sink.on_end_chunk();
        let path = sink.active_path().unwrap();
        sink.stop();
        let closed = dir.path().join(path.file_stem().unwrap());
        let body = fs::read_to_string(closed).unwrap();
        assert!(body.contains("<Content ts=\""));
        assert!(body.contains(
            "<Log_Content><Module>HOST_CMD</Module><Level>INFO</Level>\
             <String_Offset>0x42</String_Offset><Params>0x7,0x8</Params></Log_Content>"
        ));
        assert!(body.contains("<Overrun missed=\"26\"/>"));
        assert!(body.ends_with("</Content>\n</Logs>\n</LogFile>\n"));
    }

    #[test]
    fn reenable_writes_fresh_header_with_current_fw() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        let levels = [ModuleLevel::ERROR; NUM_MODULES];
        sink.enable(&levels, &fw(1)).unwrap();
        assert!(matches!(
            sink.enable(&levels, &fw(1)),
            Err(crate::sinks::SinkError::AlreadyEnabled(SinkKind::Xml))
        ));
        sink.on_start_new_chunk(Local::now());
        sink.consume_event(&LogEvent::new(0, LogLevel::Error, 1, &[]));
        sink.on_end_chunk();
        let first = sink.active_path().unwrap();
        sink.stop();
        assert!(!sink.is_active());

        sink.enable(&levels, &fw(2)).unwrap();
        let second = sink.active_path().unwrap();
        assert_ne!(first, second);
        sink.stop();

        let read = |p: &std::path::Path| {
            fs::read_to_string(dir.path().join(p.file_stem().unwrap())).unwrap()
        };
        assert!(read(&first).contains("<FW_Ver>5.2.0.1</FW_Ver>"));
        let second = read(&second);
        assert!(second.starts_with("<LogFile>\n"));
        assert!(second.contains("<FW_Ver>5.2.0.2</FW_Ver>"));
    }

    #[test]
    fn disabled_sink_ignores_records() {
        let dir = tempdir().unwrap();
        let sink = sink(dir.path());
        sink.consume_event(&LogEvent::new(0, LogLevel::Error, 1, &[]));
        assert!(matches!(
            sink.split(),
            Err(crate::sinks::SinkError::NotEnabled(SinkKind::Xml))
        ));
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }
}
