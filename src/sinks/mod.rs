// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Output sinks fed by the buffer consumer.
// Author: Lukas Bower

//! Output sinks.
//!
//! Every reader owns one sink per [`SinkKind`]. Sinks are enabled and stopped
//! independently by the operational controls while the poll thread keeps
//! feeding them; each sink therefore guards its own state with a private
//! mutex and the consumer only asks [`ChunkConsumer::is_active`] before every
//! call.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::device::FwIdentifier;
use crate::fwlog::layout::{LogEvent, ModuleLevel, NUM_MODULES};
use crate::recording::RecorderError;

mod file;
pub mod raw;
pub mod strings;
pub mod txt;
pub mod xml;

pub use file::{Anomaly, FileSink, HeaderInfo, RecordFormat};
pub use raw::{ChannelPublisher, EventPublisher, RawPublishSink, UnixDatagramPublisher};
pub use strings::StringTable;
pub use txt::{TxtFormat, TxtSink};
pub use xml::{XmlFormat, XmlSink};

/// Output flavour of a sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// XML recording.
    Xml,
    /// Human readable text recording.
    Txt,
    /// Forward decoded events to a subscriber.
    RawPublish,
}

impl SinkKind {
    /// Every sink kind, in reader order.
    pub const ALL: [SinkKind; 3] = [SinkKind::Xml, SinkKind::Txt, SinkKind::RawPublish];
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            SinkKind::Xml => "xml",
            SinkKind::Txt => "txt",
            SinkKind::RawPublish => "raw_publish",
        })
    }
}

impl FromStr for SinkKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "xml" => Ok(SinkKind::Xml),
            "txt" | "text" => Ok(SinkKind::Txt),
            "raw" | "raw_publish" | "publish" => Ok(SinkKind::RawPublish),
            other => Err(format!("unknown sink kind {other:?}")),
        }
    }
}

/// Errors returned by sink configuration calls.
#[derive(Debug, Error)]
pub enum SinkError {
    /// `enable` on a running sink.
    #[error("{0} recording is already enabled")]
    AlreadyEnabled(SinkKind),
    /// Operation needs a running sink.
    #[error("{0} recording is not enabled")]
    NotEnabled(SinkKind),
    /// Output file could not be opened or rotated.
    #[error(transparent)]
    Recorder(#[from] RecorderError),
    /// Subscriber transport failed.
    #[error("publish failed: {0}")]
    Publish(String),
    /// Sink state lock poisoned.
    #[error("{0} sink lock poisoned")]
    LockPoisoned(SinkKind),
}

/// Capability set every sink offers to the consumer and the controls.
pub trait ChunkConsumer: Send + Sync {
    /// A poll found new data; `ts` stamps the chunk.
    fn on_start_new_chunk(&self, ts: DateTime<Local>);
    /// `missed` dwords were overwritten before they could be read.
    fn report_overrun(&self, missed: u32);
    /// The firmware restarted its buffer.
    fn report_restart(&self);
    /// A header with a bad signature was found.
    fn report_corrupted(&self, signature: u32);
    /// The last record claimed `excess` dwords beyond the write pointer.
    fn report_inconsistent(&self, excess: u32);
    /// The device is going away.
    fn report_device_removed(&self);
    /// The device was discovered.
    fn report_device_discovered(&self);
    /// Firmware became initialized with a (possibly new) identity.
    fn report_fw_updated(&self, fw: &FwIdentifier, levels: &[ModuleLevel; NUM_MODULES]);
    /// One decoded record.
    fn consume_event(&self, event: &LogEvent);
    /// The poll finished.
    fn on_end_chunk(&self);
    /// Re-arm for a (re)computed buffer of `buffer_size` dwords.
    fn prepare(&self, buffer_size: u32) -> Result<(), SinkError>;
    /// Start recording.
    fn enable(&self, levels: &[ModuleLevel; NUM_MODULES], fw: &FwIdentifier)
        -> Result<(), SinkError>;
    /// Stop recording; closes any open file.
    fn stop(&self);
    /// Close the current recording and start a new one.
    fn split(&self) -> Result<(), SinkError>;
    /// True while recording.
    fn is_active(&self) -> bool;
}

/// Closed set of sinks a reader fans out to.
pub enum Sink {
    /// XML recorder.
    Xml(XmlSink),
    /// Text recorder.
    Txt(TxtSink),
    /// Raw event publisher.
    RawPublish(RawPublishSink),
}

impl Sink {
    /// Kind of this sink.
    pub fn kind(&self) -> SinkKind {
        match self {
            Sink::Xml(_) => SinkKind::Xml,
            Sink::Txt(_) => SinkKind::Txt,
            Sink::RawPublish(_) => SinkKind::RawPublish,
        }
    }
}

macro_rules! dispatch {
    ($self:ident, $sink:ident => $call:expr) => {
        match $self {
            Sink::Xml($sink) => $call,
            Sink::Txt($sink) => $call,
            Sink::RawPublish($sink) => $call,
        }
    };
}

impl ChunkConsumer for Sink {
    fn on_start_new_chunk(&self, ts: DateTime<Local>) {
        dispatch!(self, s => s.on_start_new_chunk(ts))
    }

    fn report_overrun(&self, missed: u32) {
        dispatch!(self, s => s.report_overrun(missed))
    }

    fn report_restart(&self) {
        dispatch!(self, s => s.report_restart())
    }

    fn report_corrupted(&self, signature: u32) {
        dispatch!(self, s => s.report_corrupted(signature))
    }

    fn report_inconsistent(&self, excess: u32) {
        dispatch!(self, s => s.report_inconsistent(excess))
    }

    fn report_device_removed(&self) {
        dispatch!(self, s => s.report_device_removed())
    }

    fn report_device_discovered(&self) {
        dispatch!(self, s => s.report_device_discovered())
    }

    fn report_fw_updated(&self, fw: &FwIdentifier, levels: &[ModuleLevel; NUM_MODULES]) {
        dispatch!(self, s => s.report_fw_updated(fw, levels))
    }

    fn consume_event(&self, event: &LogEvent) {
        dispatch!(self, s => s.consume_event(event))
    }

    fn on_end_chunk(&self) {
        dispatch!(self, s => s.on_end_chunk())
    }

    fn prepare(&self, buffer_size: u32) -> Result<(), SinkError> {
        dispatch!(self, s => s.prepare(buffer_size))
    }

    fn enable(
        &self,
        levels: &[ModuleLevel; NUM_MODULES],
        fw: &FwIdentifier,
    ) -> Result<(), SinkError> {
        dispatch!(self, s => s.enable(levels, fw))
    }

    fn stop(&self) {
        dispatch!(self, s => s.stop())
    }

    fn split(&self) -> Result<(), SinkError> {
        dispatch!(self, s => s.split())
    }

    fn is_active(&self) -> bool {
        dispatch!(self, s => s.is_active())
    }
}
