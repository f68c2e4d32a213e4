// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Per (device, CPU) poller locating, reading and decoding the log ring.
// Author: Lukas Bower

use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, info, warn};

use super::address::{AddressError, DeviceLogAddressResolver, LogBufferDescriptor};
use super::consumer::{BufferConsumer, BufferSnapshot, ConsumeOutcome};
use super::layout::{
    dwords_from_le_bytes, levels_from_words, levels_to_words, ModuleLevel, MODULE_LEVELS_OFFSET,
    NUM_MODULES,
};
use crate::device::{CpuType, Device, FwIdentifier};
use crate::error::{CollectorError, DeviceError};
use crate::sinks::{ChunkConsumer, Sink, SinkKind};

/// What a single [`RingBufferReader::poll`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollResult {
    /// Device is silent; nothing was touched.
    Silent,
    /// Buffer location not published yet, or sinks could not be armed.
    NotReady,
    /// Buffer located but firmware not initialized.
    WaitingForFirmware,
    /// Snapshot consumed.
    Consumed(ConsumeOutcome),
    /// A device access failed; the tick was skipped.
    DeviceError(DeviceError),
}

#[derive(Debug)]
struct ReaderState {
    valid: bool,
    fw_initialized: bool,
    fw_update_pending: bool,
    descriptor: Option<LogBufferDescriptor>,
    cursor: u32,
    restart_requested: bool,
    levels: [ModuleLevel; NUM_MODULES],
    fw: FwIdentifier,
}

/// Polls one CPU log buffer of one device and feeds its sinks.
pub struct RingBufferReader {
    device: Arc<dyn Device>,
    cpu: CpuType,
    poll_before_fw_ready: bool,
    resolver: Mutex<DeviceLogAddressResolver>,
    sinks: Vec<Sink>,
    state: Mutex<ReaderState>,
}

impl RingBufferReader {
    /// Reader for `cpu` on `device` with its sinks, all disabled.
    pub fn new(
        device: Arc<dyn Device>,
        cpu: CpuType,
        sinks: Vec<Sink>,
        poll_before_fw_ready: bool,
    ) -> Result<Self, AddressError> {
        let resolver = DeviceLogAddressResolver::new(device.baseband(), cpu)?;
        Ok(Self {
            device,
            cpu,
            poll_before_fw_ready,
            resolver: Mutex::new(resolver),
            sinks,
            state: Mutex::new(ReaderState {
                valid: false,
                fw_initialized: false,
                fw_update_pending: false,
                descriptor: None,
                cursor: 0,
                restart_requested: false,
                levels: [ModuleLevel::empty(); NUM_MODULES],
                fw: FwIdentifier::default(),
            }),
        })
    }

    /// CPU whose buffer this reader drains.
    pub fn cpu(&self) -> CpuType {
        self.cpu
    }

    /// Name of the device.
    pub fn device_name(&self) -> &str {
        self.device.name()
    }

    /// Sinks in [`SinkKind::ALL`] order.
    pub fn sinks(&self) -> &[Sink] {
        &self.sinks
    }

    /// Sink of the given kind.
    pub fn sink(&self, kind: SinkKind) -> Option<&Sink> {
        self.sinks.iter().find(|sink| sink.kind() == kind)
    }

    /// Resolved buffer location.
    pub fn descriptor(&self) -> Option<LogBufferDescriptor> {
        self.lock().ok().and_then(|state| state.descriptor)
    }

    /// Read cursor persisted by the last poll.
    pub fn cursor(&self) -> u32 {
        self.lock().map(|state| state.cursor).unwrap_or(0)
    }

    /// True once the buffer location is resolved and the sinks are armed.
    pub fn is_valid(&self) -> bool {
        self.lock().map(|state| state.valid).unwrap_or(false)
    }

    fn lock(&self) -> Result<MutexGuard<'_, ReaderState>, CollectorError> {
        self.state.lock().map_err(|_| CollectorError::LockPoisoned)
    }

    fn active_sinks(&self) -> impl Iterator<Item = &Sink> {
        self.sinks.iter().filter(|sink| sink.is_active())
    }

    /// One tick of the poll task.
    pub fn poll(&self) -> PollResult {
        if self.device.is_silent() {
            debug!("{} {} silent, skipping poll", self.device.name(), self.cpu);
            return PollResult::Silent;
        }
        self.track_firmware_state();

        let (valid, fw_initialized) = match self.lock() {
            Ok(state) => (state.valid, state.fw_initialized),
            Err(err) => {
                warn!("{err}");
                return PollResult::NotReady;
            }
        };
        if !valid || !fw_initialized {
            match self.arm() {
                Ok(true) => {}
                Ok(false) => return PollResult::NotReady,
                Err(err) => return self.skip(err),
            }
        }
        if let Err(err) = self.push_fw_update() {
            return self.skip(err);
        }
        if !fw_initialized && !self.poll_before_fw_ready {
            return PollResult::WaitingForFirmware;
        }
        match self.drain() {
            Ok(Some(outcome)) => PollResult::Consumed(outcome),
            Ok(None) => PollResult::NotReady,
            Err(err) => self.skip(err),
        }
    }

    fn skip(&self, err: DeviceError) -> PollResult {
        match &err {
            DeviceError::Silent(_) => debug!("{} {}: {err}", self.device.name(), self.cpu),
            _ => warn!("{} {} poll skipped: {err}", self.device.name(), self.cpu),
        }
        PollResult::DeviceError(err)
    }

    fn track_firmware_state(&self) {
        let fw = self.device.fw_identifier();
        let Ok(mut state) = self.lock() else {
            return;
        };
        match (state.fw_initialized, fw) {
            (true, None) => {
                info!("{} {} firmware went down", self.device.name(), self.cpu);
                state.fw_initialized = false;
                state.valid = false;
            }
            (false, Some(fw)) => {
                info!(
                    "{} {} firmware {} initialized",
                    self.device.name(),
                    self.cpu,
                    fw.version
                );
                state.fw_initialized = true;
                state.fw_update_pending = true;
                state.valid = false;
                state.fw = fw;
            }
            _ => {}
        }
    }

    /// Resolve the buffer and re-arm active sinks. True once valid.
    fn arm(&self) -> Result<bool, DeviceError> {
        let resolved = match self.resolver.lock() {
            Ok(mut resolver) => resolver.resolve(self.device.as_ref())?,
            Err(_) => {
                warn!("{} {} resolver lock poisoned", self.device.name(), self.cpu);
                return Ok(false);
            }
        };
        let Some(descriptor) = resolved else {
            debug!("{} {} log buffer not published yet", self.device.name(), self.cpu);
            return Ok(false);
        };
        for sink in self.active_sinks() {
            if let Err(err) = sink.prepare(descriptor.size_in_dwords) {
                warn!(
                    "{} {} {} sink not ready: {err}",
                    self.device.name(),
                    self.cpu,
                    sink.kind()
                );
                return Ok(false);
            }
        }
        let Ok(mut state) = self.lock() else {
            return Ok(false);
        };
        if state.descriptor != Some(descriptor) {
            info!(
                "{} {} log buffer at {:#010x}, {} dwords",
                self.device.name(),
                self.cpu,
                descriptor.base_address,
                descriptor.size_in_dwords
            );
            state.descriptor = Some(descriptor);
            state.cursor = 0;
        }
        state.valid = true;
        Ok(true)
    }

    /// Read the verbosity table after a firmware start and announce it.
    fn push_fw_update(&self) -> Result<(), DeviceError> {
        let (descriptor, fw) = match self.lock() {
            Ok(state) if state.fw_update_pending && state.valid => {
                match state.descriptor {
                    Some(descriptor) => (descriptor, state.fw),
                    None => return Ok(()),
                }
            }
            _ => return Ok(()),
        };
        let levels = self.read_levels(&descriptor)?;
        if let Ok(mut state) = self.lock() {
            state.levels = levels;
            state.fw_update_pending = false;
        }
        for sink in self.active_sinks() {
            sink.report_fw_updated(&fw, &levels);
        }
        Ok(())
    }

    fn drain(&self) -> Result<Option<ConsumeOutcome>, DeviceError> {
        let (descriptor, cursor) = {
            let Ok(mut state) = self.lock() else {
                return Ok(None);
            };
            let Some(descriptor) = state.descriptor.filter(|_| state.valid) else {
                return Ok(None);
            };
            let cursor = if std::mem::take(&mut state.restart_requested) {
                0
            } else {
                state.cursor
            };
            (descriptor, cursor)
        };
        let bytes = self
            .device
            .read_block(descriptor.base_address, descriptor.total_dwords())?;
        let Some(snapshot) = BufferSnapshot::from_le_bytes(&bytes, descriptor.size_in_dwords)
        else {
            warn!(
                "{} {} short buffer read: {} bytes",
                self.device.name(),
                self.cpu,
                bytes.len()
            );
            return Ok(None);
        };
        let sinks: Vec<&dyn ChunkConsumer> = self
            .sinks
            .iter()
            .map(|sink| sink as &dyn ChunkConsumer)
            .collect();
        let outcome = BufferConsumer::consume(&snapshot, cursor, &sinks);
        if outcome.events > 0 {
            debug!(
                "{} {} decoded {} records, cursor {}",
                self.device.name(),
                self.cpu,
                outcome.events,
                outcome.cursor
            );
        }
        if let Ok(mut state) = self.lock() {
            state.cursor = outcome.cursor;
            state.levels = snapshot.header.module_levels;
        }
        Ok(Some(outcome))
    }

    /// Restart logging from the beginning of the buffer on the next poll.
    pub fn request_restart(&self) {
        if let Ok(mut state) = self.lock() {
            state.restart_requested = true;
        }
    }

    fn read_levels(&self, descriptor: &LogBufferDescriptor) -> Result<[ModuleLevel; NUM_MODULES], DeviceError> {
        let words = (NUM_MODULES / 4) as u32;
        let bytes = self
            .device
            .read_block(descriptor.base_address + MODULE_LEVELS_OFFSET, words)?;
        let dwords = dwords_from_le_bytes(&bytes);
        let mut table = [0u32; NUM_MODULES / 4];
        for (slot, word) in table.iter_mut().zip(dwords) {
            *slot = word;
        }
        Ok(levels_from_words(&table))
    }

    fn require_descriptor(&self) -> Result<LogBufferDescriptor, CollectorError> {
        self.lock()?
            .descriptor
            .ok_or_else(|| CollectorError::BufferNotReady {
                device: self.device.name().to_string(),
                cpu: self.cpu,
            })
    }

    /// Verbosity table as currently stored on the device.
    pub fn module_levels(&self) -> Result<[ModuleLevel; NUM_MODULES], CollectorError> {
        let descriptor = self.require_descriptor()?;
        let levels = self.read_levels(&descriptor)?;
        self.lock()?.levels = levels;
        Ok(levels)
    }

    /// Write the verbosity table to the device.
    pub fn set_module_levels(&self, levels: &[ModuleLevel; NUM_MODULES]) -> Result<(), CollectorError> {
        let descriptor = self.require_descriptor()?;
        self.device.write_block(
            descriptor.base_address + MODULE_LEVELS_OFFSET,
            &levels_to_words(levels),
        )?;
        self.lock()?.levels = *levels;
        info!("{} {} module verbosity updated", self.device.name(), self.cpu);
        Ok(())
    }

    /// Start the sink of `kind` with the cached identity and verbosity.
    ///
    /// When no other sink is recording, logging restarts from the beginning
    /// of the buffer so the new recording includes its current contents.
    pub fn start_sink(&self, kind: SinkKind) -> Result<(), CollectorError> {
        let sink = self.sink(kind).ok_or(crate::sinks::SinkError::NotEnabled(kind))?;
        let (levels, fw, descriptor) = {
            let state = self.lock()?;
            (state.levels, state.fw, state.descriptor.filter(|_| state.valid))
        };
        let sole = self.active_sinks().next().is_none();
        sink.enable(&levels, &fw)?;
        if let Some(descriptor) = descriptor {
            sink.prepare(descriptor.size_in_dwords)?;
        }
        if sole {
            self.request_restart();
        }
        Ok(())
    }

    /// Stop the sink of `kind`.
    pub fn stop_sink(&self, kind: SinkKind) -> Result<(), CollectorError> {
        let sink = self.sink(kind).ok_or(crate::sinks::SinkError::NotEnabled(kind))?;
        if !sink.is_active() {
            return Err(crate::sinks::SinkError::NotEnabled(kind).into());
        }
        sink.stop();
        Ok(())
    }

    /// Close the current recording of `kind` and start the next one.
    pub fn split_sink(&self, kind: SinkKind) -> Result<(), CollectorError> {
        let sink = self.sink(kind).ok_or(crate::sinks::SinkError::NotEnabled(kind))?;
        sink.split()?;
        if self.active_sinks().all(|s| s.kind() == kind) {
            self.request_restart();
        }
        Ok(())
    }

    /// Tell every active sink the device went away.
    pub fn report_device_removed(&self) {
        for sink in self.active_sinks() {
            sink.report_device_removed();
        }
    }

    /// Tell every active sink the device appeared.
    pub fn report_device_discovered(&self) {
        for sink in self.active_sinks() {
            sink.report_device_discovered();
        }
    }

    /// Stop every sink, closing their files.
    pub fn stop_all(&self) {
        for sink in &self.sinks {
            sink.stop();
        }
    }
}
