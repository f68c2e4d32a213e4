// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Forward decoded records to a subscriber as JSON messages.
// Author: Lukas Bower

use std::os::unix::net::UnixDatagram;
use std::path::PathBuf;
use std::sync::mpsc::Sender;
use std::sync::Mutex;

use chrono::{DateTime, Local};
use log::{debug, info, warn};
use serde::Serialize;

use super::{ChunkConsumer, SinkError, SinkKind};
use crate::device::{CpuType, FwIdentifier};
use crate::fwlog::layout::{module_name, LogEvent, ModuleLevel, NUM_MODULES};

/// Transport delivering one encoded message.
pub trait EventPublisher: Send + Sync {
    /// Deliver `message`.
    fn publish(&self, message: &str) -> Result<(), SinkError>;
}

/// Sends each message as one datagram to a Unix socket.
#[derive(Debug)]
pub struct UnixDatagramPublisher {
    target: PathBuf,
    socket: UnixDatagram,
}

impl UnixDatagramPublisher {
    /// Publisher sending to `target` through one unbound socket.
    pub fn new(target: impl Into<PathBuf>) -> Result<Self, SinkError> {
        let socket = UnixDatagram::unbound().map_err(|e| SinkError::Publish(e.to_string()))?;
        Ok(Self {
            target: target.into(),
            socket,
        })
    }
}

impl EventPublisher for UnixDatagramPublisher {
    fn publish(&self, message: &str) -> Result<(), SinkError> {
        self.socket
            .send_to(message.as_bytes(), &self.target)
            .map_err(|e| SinkError::Publish(format!("{}: {e}", self.target.display())))?;
        Ok(())
    }
}

/// Hands messages to an in-process receiver.
#[derive(Debug)]
pub struct ChannelPublisher {
    sender: Mutex<Sender<String>>,
}

impl ChannelPublisher {
    /// Publisher feeding `sender`.
    pub fn new(sender: Sender<String>) -> Self {
        Self {
            sender: Mutex::new(sender),
        }
    }
}

impl EventPublisher for ChannelPublisher {
    fn publish(&self, message: &str) -> Result<(), SinkError> {
        let sender = self
            .sender
            .lock()
            .map_err(|_| SinkError::LockPoisoned(SinkKind::RawPublish))?;
        sender
            .send(message.to_string())
            .map_err(|_| SinkError::Publish("receiver dropped".into()))
    }
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Message<'a> {
    Event {
        device: &'a str,
        cpu: CpuType,
        ts: String,
        module: &'static str,
        level: &'static str,
        string_offset: u32,
        params: &'a [u32],
    },
    Overrun {
        device: &'a str,
        cpu: CpuType,
        missed: u32,
    },
    Restart {
        device: &'a str,
        cpu: CpuType,
    },
    Corrupted {
        device: &'a str,
        cpu: CpuType,
        signature: u32,
    },
    Inconsistent {
        device: &'a str,
        cpu: CpuType,
        excess: u32,
    },
    DeviceRemoved {
        device: &'a str,
        cpu: CpuType,
    },
    DeviceDiscovered {
        device: &'a str,
        cpu: CpuType,
    },
    FwUpdated {
        device: &'a str,
        cpu: CpuType,
        fw: &'a FwIdentifier,
        levels: Vec<String>,
    },
}

struct RawState {
    enabled: bool,
    chunk_ts: DateTime<Local>,
    failures: u64,
}

/// Sink publishing every callback as a JSON message; writes no file.
pub struct RawPublishSink {
    device: String,
    cpu: CpuType,
    publisher: Box<dyn EventPublisher>,
    state: Mutex<RawState>,
}

impl RawPublishSink {
    /// Disabled sink for `device`/`cpu` publishing through `publisher`.
    pub fn new(device: &str, cpu: CpuType, publisher: Box<dyn EventPublisher>) -> Self {
        Self {
            device: device.to_string(),
            cpu,
            publisher,
            state: Mutex::new(RawState {
                enabled: false,
                chunk_ts: Local::now(),
                failures: 0,
            }),
        }
    }

    /// Messages that could not be delivered since creation.
    pub fn failures(&self) -> u64 {
        self.state.lock().map(|s| s.failures).unwrap_or(0)
    }

    fn send<'a>(&'a self, build: impl FnOnce(&'a str, CpuType, DateTime<Local>) -> Message<'a>) {
        let Ok(mut state) = self.state.lock() else {
            warn!("{} {} raw sink lock poisoned", self.device, self.cpu);
            return;
        };
        if !state.enabled {
            return;
        }
        let message = build(&self.device, self.cpu, state.chunk_ts);
        let encoded = match serde_json::to_string(&message) {
            Ok(encoded) => encoded,
            Err(err) => {
                warn!("raw event encoding failed: {err}");
                return;
            }
        };
        if let Err(err) = self.publisher.publish(&encoded) {
            state.failures += 1;
            // first failure since enable is a warning, the rest are debug
            if state.failures == 1 {
                warn!("{} {} {err}", self.device, self.cpu);
            } else {
                debug!("{} {} {err}", self.device, self.cpu);
            }
        }
    }
}

impl ChunkConsumer for RawPublishSink {
    fn on_start_new_chunk(&self, ts: DateTime<Local>) {
        if let Ok(mut state) = self.state.lock() {
            state.chunk_ts = ts;
        }
    }

    fn report_overrun(&self, missed: u32) {
        self.send(|device, cpu, _| Message::Overrun {
            device,
            cpu,
            missed,
        });
    }

    fn report_restart(&self) {
        self.send(|device, cpu, _| Message::Restart { device, cpu });
    }

    fn report_corrupted(&self, signature: u32) {
        self.send(|device, cpu, _| Message::Corrupted {
            device,
            cpu,
            signature,
        });
    }

    fn report_inconsistent(&self, excess: u32) {
        self.send(|device, cpu, _| Message::Inconsistent {
            device,
            cpu,
            excess,
        });
    }

    fn report_device_removed(&self) {
        self.send(|device, cpu, _| Message::DeviceRemoved { device, cpu });
    }

    fn report_device_discovered(&self) {
        self.send(|device, cpu, _| Message::DeviceDiscovered { device, cpu });
    }

    fn report_fw_updated(&self, fw: &FwIdentifier, levels: &[ModuleLevel; NUM_MODULES]) {
        let levels = levels.iter().map(|l| l.letters()).collect::<Vec<_>>();
        self.send(move |device, cpu, _| Message::FwUpdated {
            device,
            cpu,
            fw,
            levels,
        });
    }

    fn consume_event(&self, event: &LogEvent) {
        self.send(|device, cpu, ts| Message::Event {
            device,
            cpu,
            ts: ts.to_rfc3339(),
            module: module_name(cpu, event.module),
            level: event.level.as_str(),
            string_offset: event.string_offset,
            params: event.params(),
        });
    }

    fn on_end_chunk(&self) {}

    fn prepare(&self, _buffer_size: u32) -> Result<(), SinkError> {
        Ok(())
    }

    fn enable(
        &self,
        _levels: &[ModuleLevel; NUM_MODULES],
        _fw: &FwIdentifier,
    ) -> Result<(), SinkError> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| SinkError::LockPoisoned(SinkKind::RawPublish))?;
        if state.enabled {
            return Err(SinkError::AlreadyEnabled(SinkKind::RawPublish));
        }
        state.enabled = true;
        state.failures = 0;
        info!("{} {} raw publishing enabled", self.device, self.cpu);
        Ok(())
    }

    fn stop(&self) {
        if let Ok(mut state) = self.state.lock() {
            if state.enabled {
                state.enabled = false;
                info!("{} {} raw publishing stopped", self.device, self.cpu);
            }
        }
    }

    fn split(&self) -> Result<(), SinkError> {
        Ok(())
    }

    fn is_active(&self) -> bool {
        self.state.lock().map(|s| s.enabled).unwrap_or(false)
    }
}
