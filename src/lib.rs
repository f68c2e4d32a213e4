// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Root library for the fwlogd firmware log collection daemon.
// Author: Lukas Bower
#![forbid(unsafe_code)]
#![warn(missing_docs)]

//! Firmware log collection for attached radio devices.
//!
//! Every attached device exposes two circular log buffers in its memory, one
//! written by the firmware CPU and one by the microcode CPU. A
//! [`fwlog::RingBufferReader`] per buffer is polled by the
//! [`scheduler::TaskScheduler`], decodes new records with the
//! [`fwlog::BufferConsumer`] and fans them out to the configured
//! [`sinks::Sink`]s. File-backed sinks rotate through
//! [`recording::LogFileRecorder`] and hand closed files to the
//! post-collection pipeline.

/// Device registry and operational controls.
pub mod collector;
/// Daemon configuration loaded from TOML.
pub mod config;
/// Device collaborator contract and the memory-image device.
pub mod device;
/// Error types shared across the crate.
pub mod error;
/// Firmware log buffer layout, addressing, reading and decoding.
pub mod fwlog;
/// Output file recording, rotation and post-collection handling.
pub mod recording;
/// Periodic task scheduler driving the buffer polls.
pub mod scheduler;
/// Output sinks consuming decoded log events.
pub mod sinks;

pub use collector::LogCollector;
pub use config::Config;
pub use device::{Baseband, CpuType, Device, FwIdentifier, FwVersion, MemoryImageDevice};
pub use error::{CollectorError, DeviceError};
