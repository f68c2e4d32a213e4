// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: End-to-end collection from a memory-image device through every sink.
// Author: Lukas Bower

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use fwlogd::collector::PublisherFactory;
use fwlogd::device::FwVersion;
use fwlogd::fwlog::address::FW_LOG_INFO_ADDRESS;
use fwlogd::fwlog::{EventHeader, LogLevel, ModuleLevel};
use fwlogd::recording::ToolRunner;
use fwlogd::sinks::{ChannelPublisher, EventPublisher, SinkError, SinkKind};
use fwlogd::{
    Baseband, CollectorError, Config, CpuType, Device, FwIdentifier, LogCollector,
    MemoryImageDevice,
};
use serial_test::serial;
use tempfile::{tempdir, TempDir};

const OFFSET: u32 = 0x0080_2000;
// Sparrow fw_data remaps linker 0x800000 to AHB 0x900000.
const BASE: u32 = OFFSET + 0x0010_0000;
const PAYLOAD: u32 = BASE + 20;
const SIZE: u32 = 1024;

struct NoTools;

impl ToolRunner for NoTools {
    fn tool_available(&self, _tool: &str) -> bool {
        false
    }

    fn run(&self, _program: &str, _args: &[&str]) -> io::Result<bool> {
        Ok(false)
    }
}

struct Harness {
    collector: LogCollector,
    device: Arc<MemoryImageDevice>,
    events: Receiver<String>,
    dir: TempDir,
}

fn harness(max_retained: usize) -> Harness {
    harness_with(|config| config.collection.max_retained_files = max_retained)
}

fn harness_with(tweak: impl FnOnce(&mut Config)) -> Harness {
    let _ = env_logger::builder().is_test(true).try_init();
    let dir = tempdir().unwrap();
    let mut config = Config::default();
    config.collection.target_dir = dir.path().join("logs");
    config.collection.polling_interval_ms = 5;
    tweak(&mut config);

    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(Mutex::new(tx));
    let publisher: PublisherFactory = Arc::new(
        move |_: &str, _: CpuType| -> Result<Box<dyn EventPublisher>, SinkError> {
            let sender = tx.lock().unwrap().clone();
            Ok(Box::new(ChannelPublisher::new(sender)) as Box<dyn EventPublisher>)
        },
    );
    let collector = LogCollector::with_parts(&config, Arc::new(NoTools), Some(publisher)).unwrap();

    let device = Arc::new(MemoryImageDevice::new("wlan0", Baseband::SparrowB0));
    device.write_word(FW_LOG_INFO_ADDRESS, (1 << 29) | OFFSET);
    device.set_fw_identifier(Some(FwIdentifier {
        version: FwVersion {
            major: 4,
            minor: 1,
            sub_minor: 2,
            build: 77,
        },
        ..FwIdentifier::default()
    }));
    Harness {
        collector,
        device,
        events: rx,
        dir,
    }
}

impl Harness {
    fn add(&self) {
        let device: Arc<dyn Device> = self.device.clone();
        self.collector.add_device(device).unwrap();
    }

    fn logs(&self) -> PathBuf {
        self.dir.path().join("logs")
    }

    /// Write `count` parameterless records starting at `slot`.
    fn write_records(&self, slot: u32, count: u32) {
        for i in 0..count {
            let header = EventHeader::encode(9, LogLevel::Warn, 0x40 + i, 0).raw();
            self.device.write_word(PAYLOAD + 4 * ((slot + i) % SIZE), header);
        }
    }

    fn publish_write_ptr(&self, write_ptr: u32) {
        self.device.write_word(BASE, write_ptr);
    }

    fn emit(&self, slot: u32, count: u32) {
        self.write_records(slot, count);
        self.publish_write_ptr(slot + count);
    }

    fn wait_for_cursor(&self, cursor: u32) {
        wait_until(|| {
            self.collector
                .reader("wlan0", CpuType::Fw)
                .map(|r| r.cursor() == cursor)
                .unwrap_or(false)
        });
    }

    fn closed_files(&self, ext: &str) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(self.logs())
            .map(|entries| entries.map(|e| e.unwrap().path()).collect())
            .unwrap_or_default();
        files.retain(|p| p.extension().map_or(false, |e| e == ext));
        files.sort();
        files
    }
}

fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "condition not met in time");
        thread::sleep(Duration::from_millis(5));
    }
}

fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap()
}

#[test]
#[serial]
fn records_reach_every_started_sink() {
    let h = harness(0);
    h.add();
    for kind in SinkKind::ALL {
        h.collector.start_recording("wlan0", CpuType::Fw, kind).unwrap();
    }
    h.emit(0, 3);
    h.wait_for_cursor(3);
    for kind in [SinkKind::Xml, SinkKind::Txt] {
        h.collector.stop_recording("wlan0", CpuType::Fw, kind).unwrap();
    }

    let xml = h.closed_files("xml");
    assert_eq!(xml.len(), 1);
    let xml = read(&xml[0]);
    assert!(xml.contains("<FW_Ver>4.1.2.77</FW_Ver>"));
    assert_eq!(xml.matches("<Log_Content>").count(), 3);
    assert!(xml.contains("<Module>SCAN</Module><Level>WARN</Level>"));
    assert!(xml.ends_with("</Logs>\n</LogFile>\n"));

    let txt = h.closed_files("txt");
    assert_eq!(txt.len(), 1);
    let txt = read(&txt[0]);
    assert!(txt.starts_with("# Device: wlan0\n# CPU: fw\n"));
    assert!(txt.contains("[SCAN] WARN: string_offset=0x00042"));

    let published: Vec<String> = h.events.try_iter().collect();
    assert_eq!(
        published.iter().filter(|m| m.contains("\"type\":\"event\"")).count(),
        3
    );
}

#[test]
#[serial]
fn overrun_is_recorded_once_with_exact_count() {
    let h = harness(0);
    h.add();
    h.collector
        .start_recording("wlan0", CpuType::Fw, SinkKind::Txt)
        .unwrap();
    h.emit(0, 10);
    h.wait_for_cursor(10);

    // every payload slot holds a valid record, so any resync point decodes
    h.write_records(10, SIZE);
    h.publish_write_ptr(10 + SIZE + 26);
    h.wait_for_cursor(10 + SIZE + 26);
    h.collector
        .stop_recording("wlan0", CpuType::Fw, SinkKind::Txt)
        .unwrap();

    let txt = read(&h.closed_files("txt")[0]);
    assert_eq!(txt.matches("buffer overrun").count(), 1);
    assert!(txt.contains("buffer overrun, 26 dwords lost"));
    assert!(!txt.contains("corrupted entry"));
}

#[test]
#[serial]
fn device_restart_is_reported() {
    let h = harness(0);
    h.add();
    h.collector
        .start_recording("wlan0", CpuType::Fw, SinkKind::Xml)
        .unwrap();
    h.emit(0, 8);
    h.wait_for_cursor(8);
    h.emit(0, 2);
    h.wait_for_cursor(2);
    h.collector
        .stop_recording("wlan0", CpuType::Fw, SinkKind::Xml)
        .unwrap();
    let xml = read(&h.closed_files("xml")[0]);
    assert_eq!(xml.matches("<Device_Restarted/>").count(), 1);
    assert_eq!(xml.matches("<Log_Content>").count(), 10);
}

#[test]
#[serial]
fn sink_state_errors_are_reported() {
    let h = harness(0);
    h.add();
    h.collector
        .start_recording("wlan0", CpuType::Ucode, SinkKind::Txt)
        .unwrap();
    let err = h
        .collector
        .start_recording("wlan0", CpuType::Ucode, SinkKind::Txt)
        .unwrap_err();
    assert_eq!(err.to_string(), "txt recording is already enabled");
    let err = h
        .collector
        .stop_recording("wlan0", CpuType::Ucode, SinkKind::Xml)
        .unwrap_err();
    assert_eq!(err.to_string(), "xml recording is not enabled");
    assert!(matches!(
        h.collector.split_recording("wlan1", CpuType::Fw, SinkKind::Xml),
        Err(CollectorError::UnknownDevice(_))
    ));
}

#[test]
#[serial]
fn removal_closes_files_and_stops_polling() {
    let h = harness(0);
    h.add();
    assert!(matches!(
        h.collector.add_device(h.device.clone()),
        Err(CollectorError::DeviceExists(_))
    ));
    assert_eq!(
        h.collector.scheduler().task_names(),
        vec!["wlan0_fw".to_string(), "wlan0_ucode".to_string()]
    );
    h.collector
        .start_recording("wlan0", CpuType::Fw, SinkKind::Xml)
        .unwrap();
    h.collector.remove_device("wlan0").unwrap();

    assert!(h.collector.devices().is_empty());
    assert!(h.collector.scheduler().task_names().is_empty());
    let xml = h.closed_files("xml");
    assert_eq!(xml.len(), 1);
    assert!(read(&xml[0]).contains("<Device_Removed ts="));
    assert!(h.closed_files("active").is_empty());
    assert!(matches!(
        h.collector.remove_device("wlan0"),
        Err(CollectorError::UnknownDevice(_))
    ));
}

#[test]
#[serial]
fn auto_started_recording_marks_discovery() {
    let h = harness_with(|config| config.collection.auto_start = vec![SinkKind::Xml]);
    h.add();
    h.emit(0, 1);
    h.wait_for_cursor(1);
    h.collector.remove_device("wlan0").unwrap();

    let xml = h.closed_files("xml");
    assert_eq!(xml.len(), 2);
    for path in &xml {
        assert!(read(path).contains("<Device_Discovered ts="));
    }
    let fw: Vec<&PathBuf> = xml
        .iter()
        .filter(|p| p.to_string_lossy().contains("wlan0_fw_"))
        .collect();
    assert_eq!(fw.len(), 1);
    let xml = read(fw[0]);
    assert!(xml.contains("<FW_Ver>4.1.2.77</FW_Ver>"));
    assert_eq!(xml.matches("<Device_Discovered ts=").count(), 1);
    assert!(xml.contains("<Device_Removed ts="));
    assert_eq!(xml.matches("<Log_Content>").count(), 1);
}

#[test]
#[serial]
fn verbosity_is_written_to_the_device() {
    let h = harness(0);
    h.add();
    wait_until(|| {
        h.collector
            .reader("wlan0", CpuType::Fw)
            .map(|r| r.is_valid())
            .unwrap_or(false)
    });
    h.collector
        .set_verbosity_assignments("wlan0", CpuType::Fw, "SCAN=VIWE,MLME=ET")
        .unwrap();
    h.collector
        .set_module_verbosity("wlan0", CpuType::Fw, "system", "e")
        .unwrap();
    let levels = h.collector.get_verbosity("wlan0", CpuType::Fw).unwrap();
    assert_eq!(levels[0], ModuleLevel::ERROR);
    assert_eq!(levels[9], ModuleLevel::all() - ModuleLevel::THIRD_PARTY);
    assert_eq!(levels[10], ModuleLevel::ERROR | ModuleLevel::THIRD_PARTY);
    // SCAN is byte 1 of the third verbosity dword
    assert_eq!(h.device.word(BASE + 12) & 0xff00, 0x0f00);

    let err = h
        .collector
        .set_verbosity_assignments("wlan0", CpuType::Fw, "SCAN=E,MLME=Q")
        .unwrap_err();
    assert!(matches!(err, CollectorError::InvalidVerbosity(_)));
    assert_eq!(h.collector.get_verbosity("wlan0", CpuType::Fw).unwrap(), levels);
}

#[test]
#[serial]
fn retention_prunes_oldest_recording() {
    let h = harness(3);
    h.add();
    h.collector
        .start_recording("wlan0", CpuType::Fw, SinkKind::Txt)
        .unwrap();
    for _ in 0..3 {
        h.collector
            .split_recording("wlan0", CpuType::Fw, SinkKind::Txt)
            .unwrap();
    }
    h.collector
        .stop_recording("wlan0", CpuType::Fw, SinkKind::Txt)
        .unwrap();
    h.collector.shutdown();

    let history = h.collector.post_collection().history();
    assert_eq!(history.len(), 3);
    assert_eq!(h.closed_files("txt"), history);
    assert!(history[0].to_string_lossy().ends_with("_002.txt"));
}

#[test]
#[serial]
fn polling_interval_applies_to_running_tasks() {
    let h = harness(0);
    h.add();
    assert!(matches!(
        h.collector.set_polling_interval(0),
        Err(CollectorError::InvalidInterval)
    ));
    h.collector.set_polling_interval(250).unwrap();
    assert_eq!(
        h.collector.scheduler().interval("wlan0_ucode"),
        Some(Duration::from_millis(250))
    );
}

#[test]
#[serial]
fn compression_without_tool_is_rejected() {
    let h = harness(0);
    let err = h.collector.set_compression(true).unwrap_err();
    assert_eq!(err.to_string(), "compression tool \"gzip\" not found");
    assert!(!h.collector.post_collection().compression_enabled());
}
