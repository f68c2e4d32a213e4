// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: File-backed sink shared by the XML and text recordings.
// Author: Lukas Bower

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Local};
use log::{error, info, warn};

use super::{ChunkConsumer, SinkError, SinkKind};
use crate::device::{CpuType, FwIdentifier};
use crate::fwlog::layout::{LogEvent, ModuleLevel, NUM_MODULES};
use crate::recording::{LogFileRecorder, PostCollectionPool, RecorderSettings};

/// Everything a recording header is rendered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderInfo {
    /// Device name.
    pub device: String,
    /// CPU owning the buffer.
    pub cpu: CpuType,
    /// Firmware identity at the time the header was produced.
    pub fw: FwIdentifier,
    /// Module verbosity table.
    pub levels: [ModuleLevel; NUM_MODULES],
    /// Buffer payload size in dwords, 0 until resolved.
    pub buffer_size: u32,
}

impl HeaderInfo {
    /// Header for a buffer that has not been resolved yet.
    pub fn new(device: impl Into<String>, cpu: CpuType) -> Self {
        Self {
            device: device.into(),
            cpu,
            fw: FwIdentifier::default(),
            levels: [ModuleLevel::empty(); NUM_MODULES],
            buffer_size: 0,
        }
    }

    /// Indices of the modules running in third-party mode.
    pub fn third_party_modules(&self) -> Vec<usize> {
        self.levels
            .iter()
            .enumerate()
            .filter(|(_, level)| level.contains(ModuleLevel::THIRD_PARTY))
            .map(|(index, _)| index)
            .collect()
    }
}

/// Out-of-band condition written into a recording.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Anomaly {
    /// Dwords lost to an overrun.
    Overrun(u32),
    /// Firmware restarted its buffer.
    Restart,
    /// Bad header signature.
    Corrupted(u32),
    /// Record extending past the write pointer by this many dwords.
    Inconsistent(u32),
    /// Device went away.
    DeviceRemoved,
    /// Device appeared.
    DeviceDiscovered,
}

/// Rendering of one recording flavour.
pub trait RecordFormat: Send + Sync {
    /// Sink kind reported in errors.
    const KIND: SinkKind;
    /// File extension without the dot.
    const EXTENSION: &'static str;

    /// Text at the top of every file.
    fn header(&self, info: &HeaderInfo) -> String;
    /// Text closing every file.
    fn footer(&self) -> String;
    /// Line opening a poll's worth of records.
    fn chunk_start(&self, ts: DateTime<Local>) -> Option<String>;
    /// Line closing a chunk.
    fn chunk_end(&self) -> Option<String>;
    /// One record.
    fn event(&self, info: &HeaderInfo, ts: DateTime<Local>, event: &LogEvent) -> String;
    /// One anomaly marker.
    fn anomaly(&self, ts: DateTime<Local>, anomaly: Anomaly) -> String;
}

struct FileSinkState {
    enabled: bool,
    recorder: LogFileRecorder,
    info: HeaderInfo,
    chunk_ts: DateTime<Local>,
}

/// Sink writing rendered records through a [`LogFileRecorder`].
pub struct FileSink<F: RecordFormat> {
    format: F,
    state: Mutex<FileSinkState>,
}

impl<F: RecordFormat> FileSink<F> {
    /// Disabled sink recording `<device>_<cpu>` files under `settings`.
    pub fn new(
        format: F,
        device: &str,
        cpu: CpuType,
        settings: RecorderSettings,
        post: Option<Arc<PostCollectionPool>>,
    ) -> Self {
        let info = HeaderInfo::new(device, cpu);
        let recorder = LogFileRecorder::new(
            settings,
            format!("{device}_{cpu}"),
            F::EXTENSION,
            format.header(&info),
            format.footer(),
            post,
        );
        Self {
            format,
            state: Mutex::new(FileSinkState {
                enabled: false,
                recorder,
                info,
                chunk_ts: Local::now(),
            }),
        }
    }

    /// Rendering used by this sink.
    pub fn format(&self) -> &F {
        &self.format
    }

    /// Header fields currently in effect.
    pub fn header_info(&self) -> Option<HeaderInfo> {
        self.lock().ok().map(|state| state.info.clone())
    }

    /// Path of the file being written.
    pub fn active_path(&self) -> Option<std::path::PathBuf> {
        let state = self.lock().ok()?;
        state.recorder.active_path().map(|p| p.to_path_buf())
    }

    fn lock(&self) -> Result<MutexGuard<'_, FileSinkState>, SinkError> {
        self.state
            .lock()
            .map_err(|_| SinkError::LockPoisoned(F::KIND))
    }

    fn with_enabled(&self, f: impl FnOnce(&F, &mut FileSinkState)) {
        match self.lock() {
            Ok(mut state) if state.enabled => f(&self.format, &mut *state),
            Ok(_) => {}
            Err(err) => warn!("{err}"),
        }
    }

    fn write_anomaly(&self, anomaly: Anomaly) {
        self.with_enabled(|format, state| {
            let line = format.anomaly(state.chunk_ts, anomaly);
            put(F::KIND, state, &line);
        });
    }

    fn write_marker(&self, anomaly: Anomaly) {
        self.with_enabled(|format, state| {
            let line = format.anomaly(Local::now(), anomaly);
            if !state.recorder.write_note(&line) {
                disable(F::KIND, state, &"marker write failed");
            }
        });
    }
}

fn put(kind: SinkKind, state: &mut FileSinkState, line: &str) {
    if !state.recorder.write(line) {
        disable(kind, state, &"write failed");
    }
}

fn disable(kind: SinkKind, state: &mut FileSinkState, err: &dyn std::fmt::Display) {
    error!(
        "{} {} {kind} recording disabled: {err}",
        state.info.device, state.info.cpu
    );
    state.recorder.close();
    state.enabled = false;
}

impl<F: RecordFormat> ChunkConsumer for FileSink<F> {
    fn on_start_new_chunk(&self, ts: DateTime<Local>) {
        self.with_enabled(|format, state| {
            state.chunk_ts = ts;
            if let Some(line) = format.chunk_start(ts) {
                put(F::KIND, state, &line);
            }
        });
    }

    fn report_overrun(&self, missed: u32) {
        self.write_anomaly(Anomaly::Overrun(missed));
    }

    fn report_restart(&self) {
        self.write_anomaly(Anomaly::Restart);
    }

    fn report_corrupted(&self, signature: u32) {
        self.write_anomaly(Anomaly::Corrupted(signature));
    }

    fn report_inconsistent(&self, excess: u32) {
        self.write_anomaly(Anomaly::Inconsistent(excess));
    }

    fn report_device_removed(&self) {
        self.write_marker(Anomaly::DeviceRemoved);
    }

    fn report_device_discovered(&self) {
        self.write_marker(Anomaly::DeviceDiscovered);
    }

    fn report_fw_updated(&self, fw: &FwIdentifier, levels: &[ModuleLevel; NUM_MODULES]) {
        self.with_enabled(|format, state| {
            state.info.fw = *fw;
            state.info.levels = *levels;
            let header = format.header(&state.info);
            if let Err(err) = state.recorder.update_header(header) {
                disable(F::KIND, state, &err);
            }
        });
    }

    fn consume_event(&self, event: &LogEvent) {
        self.with_enabled(|format, state| {
            let line = format.event(&state.info, state.chunk_ts, event);
            put(F::KIND, state, &line);
        });
    }

    fn on_end_chunk(&self) {
        self.with_enabled(|format, state| {
            if let Some(line) = format.chunk_end() {
                put(F::KIND, state, &line);
            }
            if state.enabled && state.recorder.should_rotate() {
                if let Err(err) = state.recorder.rotate() {
                    disable(F::KIND, state, &err);
                }
            }
        });
    }

    fn prepare(&self, buffer_size: u32) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        state.info.buffer_size = buffer_size;
        let header = self.format.header(&state.info);
        state.recorder.set_header(header);
        if state.enabled && !state.recorder.is_open() {
            state.recorder.open()?;
        }
        Ok(())
    }

    fn enable(
        &self,
        levels: &[ModuleLevel; NUM_MODULES],
        fw: &FwIdentifier,
    ) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        if state.enabled {
            return Err(SinkError::AlreadyEnabled(F::KIND));
        }
        state.info.levels = *levels;
        state.info.fw = *fw;
        let header = self.format.header(&state.info);
        state.recorder.set_header(header);
        state.recorder.open()?;
        state.enabled = true;
        info!(
            "{} {} {} recording enabled",
            state.info.device,
            state.info.cpu,
            F::KIND
        );
        Ok(())
    }

    fn stop(&self) {
        match self.lock() {
            Ok(mut state) => {
                if state.enabled {
                    state.recorder.close();
                    state.enabled = false;
                    info!(
                        "{} {} {} recording stopped",
                        state.info.device,
                        state.info.cpu,
                        F::KIND
                    );
                }
            }
            Err(err) => warn!("{err}"),
        }
    }

    fn split(&self) -> Result<(), SinkError> {
        let mut state = self.lock()?;
        if !state.enabled {
            return Err(SinkError::NotEnabled(F::KIND));
        }
        if let Err(err) = state.recorder.rotate() {
            disable(F::KIND, &mut *state, &err);
            return Err(err.into());
        }
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.lock().map(|state| state.enabled).unwrap_or(false)
    }
}
