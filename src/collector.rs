// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Device registry, poll task wiring and the operational controls.
// Author: Lukas Bower

//! Collector service.
//!
//! [`LogCollector`] owns one [`RingBufferReader`] per (device, CPU) pair and
//! a scheduler task polling it. Control requests (start/stop/split a
//! recording, verbosity changes, post-collection settings) come in from
//! whatever front end embeds the collector and are answered with a
//! [`CollectorError`] whose `Display` is the message for the requester.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use log::{debug, info, warn};

use crate::config::Config;
use crate::device::{CpuType, Device};
use crate::error::CollectorError;
use crate::fwlog::layout::{module_index, module_names, ModuleLevel, NUM_MODULES};
use crate::fwlog::RingBufferReader;
use crate::recording::{
    PostCollectionFileHandler, PostCollectionPool, RecorderSettings, SystemTools, ToolRunner,
    UploadTarget,
};
use crate::scheduler::TaskScheduler;
use crate::sinks::{
    EventPublisher, RawPublishSink, Sink, SinkError, SinkKind, StringTable, TxtFormat, TxtSink,
    UnixDatagramPublisher, XmlFormat, XmlSink,
};

/// Builds the raw-publish transport for a (device, CPU) pair.
pub type PublisherFactory =
    Arc<dyn Fn(&str, CpuType) -> Result<Box<dyn EventPublisher>, SinkError> + Send + Sync>;

const POST_QUEUE_DEPTH: usize = 64;

struct DeviceEntry {
    readers: Vec<Arc<RingBufferReader>>,
}

fn task_name(device: &str, cpu: CpuType) -> String {
    format!("{device}_{cpu}")
}

/// Parse `MODULE=LEVELS,MODULE=LEVELS` for `cpu`.
///
/// Every entry is validated before anything is returned, so a bad entry
/// rejects the whole assignment.
pub fn parse_verbosity_assignments(
    cpu: CpuType,
    assignments: &str,
) -> Result<Vec<(usize, ModuleLevel)>, CollectorError> {
    if assignments.trim().is_empty() {
        return Err(CollectorError::InvalidVerbosity(assignments.to_string()));
    }
    assignments
        .split(',')
        .map(|entry| {
            let (module, levels) = entry
                .split_once('=')
                .ok_or_else(|| CollectorError::InvalidVerbosity(entry.to_string()))?;
            if module.trim().is_empty() || levels.contains('=') {
                return Err(CollectorError::InvalidVerbosity(entry.to_string()));
            }
            let index = module_index(cpu, module).ok_or_else(|| CollectorError::UnknownModule {
                cpu,
                module: module.trim().to_string(),
            })?;
            let level = ModuleLevel::parse_letters(levels)
                .map_err(|_| CollectorError::InvalidVerbosity(entry.to_string()))?;
            Ok((index, level))
        })
        .collect()
}

/// Render a verbosity table as `MODULE=LEVELS,...`.
pub fn format_verbosity(cpu: CpuType, levels: &[ModuleLevel; NUM_MODULES]) -> String {
    module_names(cpu)
        .iter()
        .zip(levels)
        .map(|(name, level)| format!("{name}={}", level.letters()))
        .collect::<Vec<_>>()
        .join(",")
}

/// Device registry and control surface of the daemon.
pub struct LogCollector {
    recorder: RecorderSettings,
    poll_before_fw_ready: bool,
    auto_start: Vec<SinkKind>,
    strings: HashMap<CpuType, StringTable>,
    publisher: Option<PublisherFactory>,
    interval_ms: AtomicU64,
    scheduler: TaskScheduler,
    devices: Mutex<HashMap<String, Arc<DeviceEntry>>>,
    post: Arc<PostCollectionPool>,
}

impl LogCollector {
    /// Collector running external tools from `PATH` and publishing raw
    /// events to the configured socket.
    pub fn new(config: &Config) -> Result<Self, CollectorError> {
        let publisher: Option<PublisherFactory> = config.publish.socket.clone().map(|socket| {
            let factory: PublisherFactory = Arc::new(
                move |_: &str, _: CpuType| -> Result<Box<dyn EventPublisher>, SinkError> {
                    let publisher = UnixDatagramPublisher::new(socket.clone())?;
                    Ok(Box::new(publisher) as Box<dyn EventPublisher>)
                },
            );
            factory
        });
        Self::with_parts(config, Arc::new(SystemTools), publisher)
    }

    /// Collector with explicit tool runner and raw-publish transport.
    pub fn with_parts(
        config: &Config,
        tools: Arc<dyn ToolRunner>,
        publisher: Option<PublisherFactory>,
    ) -> Result<Self, CollectorError> {
        if config.polling_interval().is_zero() {
            return Err(CollectorError::InvalidInterval);
        }
        let post_cfg = &config.post_collection;
        let handler = Arc::new(PostCollectionFileHandler::new(
            tools,
            post_cfg.compression_tool.clone(),
            post_cfg.compressed_extension.clone(),
            config.collection.max_retained_files,
        ));
        if post_cfg.compress {
            if let Err(err) = handler.set_compression(true) {
                warn!("compression stays disabled: {err}");
            }
        }
        if post_cfg.upload {
            if let Err(err) = handler.set_upload(true, post_cfg.upload_target()) {
                warn!("upload stays disabled: {err}");
            }
        }
        let mut strings = HashMap::new();
        if let Some(dir) = &config.collection.string_table_dir {
            for cpu in CpuType::ALL {
                if let Some(table) = StringTable::for_cpu(dir, cpu) {
                    strings.insert(cpu, table);
                }
            }
        }
        Ok(Self {
            recorder: RecorderSettings {
                target_dir: config.collection.target_dir.clone(),
                max_file_bytes: config.max_file_bytes(),
            },
            poll_before_fw_ready: config.collection.poll_before_fw_ready,
            auto_start: config.collection.auto_start.clone(),
            strings,
            publisher,
            interval_ms: AtomicU64::new(config.collection.polling_interval_ms),
            scheduler: TaskScheduler::new(),
            devices: Mutex::new(HashMap::new()),
            post: Arc::new(PostCollectionPool::start(handler, POST_QUEUE_DEPTH)),
        })
    }

    fn sinks_for(&self, device: &str, cpu: CpuType) -> Result<Vec<Sink>, CollectorError> {
        let post = Some(Arc::clone(&self.post));
        let mut sinks = vec![
            Sink::Xml(XmlSink::new(
                XmlFormat,
                device,
                cpu,
                self.recorder.clone(),
                post.clone(),
            )),
            Sink::Txt(TxtSink::new(
                TxtFormat::new(self.strings.get(&cpu).cloned()),
                device,
                cpu,
                self.recorder.clone(),
                post,
            )),
        ];
        if let Some(factory) = &self.publisher {
            sinks.push(Sink::RawPublish(RawPublishSink::new(
                device,
                cpu,
                factory(device, cpu)?,
            )));
        }
        Ok(sinks)
    }

    /// Register `device` and start polling both of its log buffers.
    pub fn add_device(&self, device: Arc<dyn Device>) -> Result<(), CollectorError> {
        let name = device.name().to_string();
        let mut readers = Vec::with_capacity(CpuType::ALL.len());
        for cpu in CpuType::ALL {
            let reader = RingBufferReader::new(
                Arc::clone(&device),
                cpu,
                self.sinks_for(&name, cpu)?,
                self.poll_before_fw_ready,
            )?;
            readers.push(Arc::new(reader));
        }
        let entry = Arc::new(DeviceEntry { readers });
        {
            let mut devices = self.devices.lock().map_err(|_| CollectorError::LockPoisoned)?;
            if devices.contains_key(&name) {
                return Err(CollectorError::DeviceExists(name));
            }
            devices.insert(name.clone(), Arc::clone(&entry));
        }

        for reader in &entry.readers {
            for kind in &self.auto_start {
                if let Err(err) = reader.start_sink(*kind) {
                    warn!("{name} {}: auto start of {kind} failed: {err}", reader.cpu());
                }
            }
            reader.report_device_discovered();
        }
        let interval = self.polling_interval();
        for reader in &entry.readers {
            let task = task_name(&name, reader.cpu());
            let poller = Arc::clone(reader);
            let registered = self.scheduler.register(
                &task,
                interval,
                Box::new(move || {
                    poller.poll();
                }),
            );
            if !registered {
                warn!("poll task {task} could not be registered, dropping {name}");
                self.remove_device(&name)?;
                return Err(CollectorError::TaskExists(task));
            }
        }
        info!("device {name} added");
        Ok(())
    }

    /// Stop polling `name`, close its recordings and forget it.
    pub fn remove_device(&self, name: &str) -> Result<(), CollectorError> {
        let entry = self
            .devices
            .lock()
            .map_err(|_| CollectorError::LockPoisoned)?
            .remove(name)
            .ok_or_else(|| CollectorError::UnknownDevice(name.to_string()))?;
        for reader in &entry.readers {
            reader.report_device_removed();
            self.scheduler.unregister_blocking(&task_name(name, reader.cpu()));
            reader.stop_all();
        }
        info!("device {name} removed");
        Ok(())
    }

    /// Names of the registered devices, sorted.
    pub fn devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .devices
            .lock()
            .map(|devices| devices.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// Reader draining `cpu` of `device`.
    pub fn reader(&self, device: &str, cpu: CpuType) -> Result<Arc<RingBufferReader>, CollectorError> {
        let entry = self
            .devices
            .lock()
            .map_err(|_| CollectorError::LockPoisoned)?
            .get(device)
            .cloned()
            .ok_or_else(|| CollectorError::UnknownDevice(device.to_string()))?;
        entry
            .readers
            .iter()
            .find(|reader| reader.cpu() == cpu)
            .cloned()
            .ok_or_else(|| CollectorError::UnknownDevice(device.to_string()))
    }

    /// Start recording `kind` for `cpu` of `device`.
    pub fn start_recording(
        &self,
        device: &str,
        cpu: CpuType,
        kind: SinkKind,
    ) -> Result<(), CollectorError> {
        self.reader(device, cpu)?.start_sink(kind)?;
        info!("{device} {cpu}: {kind} recording started");
        Ok(())
    }

    /// Stop recording `kind` for `cpu` of `device`.
    pub fn stop_recording(
        &self,
        device: &str,
        cpu: CpuType,
        kind: SinkKind,
    ) -> Result<(), CollectorError> {
        self.reader(device, cpu)?.stop_sink(kind)
    }

    /// Close the current `kind` recording and continue in a new file.
    pub fn split_recording(
        &self,
        device: &str,
        cpu: CpuType,
        kind: SinkKind,
    ) -> Result<(), CollectorError> {
        self.reader(device, cpu)?.split_sink(kind)?;
        debug!("{device} {cpu}: {kind} recording split");
        Ok(())
    }

    /// Set the verbosity of one module, e.g. `("SCAN", "VIWE")`.
    pub fn set_module_verbosity(
        &self,
        device: &str,
        cpu: CpuType,
        module: &str,
        levels: &str,
    ) -> Result<(), CollectorError> {
        self.set_verbosity_assignments(device, cpu, &format!("{module}={levels}"))
    }

    /// Apply a batch of `MODULE=LEVELS` assignments in one device write.
    pub fn set_verbosity_assignments(
        &self,
        device: &str,
        cpu: CpuType,
        assignments: &str,
    ) -> Result<(), CollectorError> {
        let parsed = parse_verbosity_assignments(cpu, assignments)?;
        let reader = self.reader(device, cpu)?;
        let mut levels = reader.module_levels()?;
        for (index, level) in parsed {
            levels[index] = level;
        }
        reader.set_module_levels(&levels)
    }

    /// Verbosity table of `cpu` as stored on the device.
    pub fn get_verbosity(
        &self,
        device: &str,
        cpu: CpuType,
    ) -> Result<[ModuleLevel; NUM_MODULES], CollectorError> {
        self.reader(device, cpu)?.module_levels()
    }

    /// Current poll period.
    pub fn polling_interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    /// Change the poll period of every task, present and future.
    pub fn set_polling_interval(&self, interval_ms: u64) -> Result<(), CollectorError> {
        if interval_ms == 0 {
            return Err(CollectorError::InvalidInterval);
        }
        self.interval_ms.store(interval_ms, Ordering::Release);
        let interval = Duration::from_millis(interval_ms);
        for task in self.scheduler.task_names() {
            self.scheduler.set_interval(&task, interval);
        }
        info!("polling interval set to {interval_ms} ms");
        Ok(())
    }

    /// Scheduler driving the poll tasks.
    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Enable or disable compression of closed recordings.
    pub fn set_compression(&self, enabled: bool) -> Result<(), CollectorError> {
        Ok(self.post.handler().set_compression(enabled)?)
    }

    /// Enable or disable upload of closed recordings.
    pub fn set_upload(
        &self,
        enabled: bool,
        target: Option<UploadTarget>,
    ) -> Result<(), CollectorError> {
        Ok(self.post.handler().set_upload(enabled, target)?)
    }

    /// Change how many closed recordings are kept; 0 keeps all.
    pub fn set_max_retained_files(&self, max: usize) -> Result<(), CollectorError> {
        Ok(self.post.handler().set_max_retained_files(max)?)
    }

    /// Post-collection handler shared by every sink.
    pub fn post_collection(&self) -> &Arc<PostCollectionFileHandler> {
        self.post.handler()
    }

    /// Remove every device and drain the post-collection queue.
    pub fn shutdown(&self) {
        for name in self.devices() {
            if let Err(err) = self.remove_device(&name) {
                debug!("shutdown: {err}");
            }
        }
        self.post.shutdown();
        info!("collector shut down");
    }
}

impl Drop for LogCollector {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assignments_parse_case_insensitively() {
        let parsed = parse_verbosity_assignments(CpuType::Fw, "scan=VIWE, MLME=e,SYSTEM=").unwrap();
        assert_eq!(
            parsed,
            vec![
                (9, ModuleLevel::all() - ModuleLevel::THIRD_PARTY),
                (10, ModuleLevel::ERROR),
                (0, ModuleLevel::empty()),
            ]
        );
    }

    #[test]
    fn malformed_assignments_are_rejected() {
        for bad in ["", "SCAN", "SCAN=VX", "=V", "SCAN=V=E", "SCAN=V,,MLME=E"] {
            assert!(
                matches!(
                    parse_verbosity_assignments(CpuType::Fw, bad),
                    Err(CollectorError::InvalidVerbosity(_))
                ),
                "{bad:?}"
            );
        }
        assert!(matches!(
            parse_verbosity_assignments(CpuType::Ucode, "SCAN=V"),
            Err(CollectorError::UnknownModule { cpu: CpuType::Ucode, .. })
        ));
    }

    #[test]
    fn verbosity_renders_every_module() {
        let mut levels = [ModuleLevel::empty(); NUM_MODULES];
        levels[0] = ModuleLevel::ERROR | ModuleLevel::WARN;
        let text = format_verbosity(CpuType::Fw, &levels);
        assert!(text.starts_with("SYSTEM=WE,DRIVERS=,"));
        assert!(text.ends_with("WBE_MNGR="));
    }
}
