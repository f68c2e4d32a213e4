// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Error types shared between the device layer and the collector controls.
// Author: Lukas Bower

use thiserror::Error;

use crate::device::CpuType;
use crate::fwlog::AddressError;
use crate::recording::PostCollectionError;
use crate::sinks::SinkError;

/// Failures reported by a device transport.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// The transport rejected or failed the access.
    #[error("transport error at {address:#010x}: {reason}")]
    Transport {
        /// Device address of the failed access.
        address: u32,
        /// Transport supplied reason.
        reason: String,
    },
    /// Address not aligned to a dword boundary.
    #[error("unaligned access at {0:#010x}")]
    Unaligned(u32),
    /// The device does not answer register accesses right now.
    #[error("device {0} is silent")]
    Silent(String),
}

/// Errors returned to callers of the operational controls.
///
/// The `Display` form is the human readable message handed back to whoever
/// issued the control request.
#[derive(Debug, Error)]
pub enum CollectorError {
    /// No device registered under the supplied name.
    #[error("unknown device {0}")]
    UnknownDevice(String),
    /// A device with the same name is already registered.
    #[error("device {0} is already registered")]
    DeviceExists(String),
    /// The device baseband has no usable log buffer mapping.
    #[error(transparent)]
    Address(#[from] AddressError),
    /// The log buffer location has not been resolved yet.
    #[error("log buffer of {device} {cpu} is not initialized yet")]
    BufferNotReady {
        /// Device name.
        device: String,
        /// CPU owning the buffer.
        cpu: CpuType,
    },
    /// Malformed verbosity assignment.
    #[error("invalid verbosity assignment {0:?}")]
    InvalidVerbosity(String),
    /// Module name not known for the CPU type.
    #[error("unknown {cpu} module {module:?}")]
    UnknownModule {
        /// CPU the module was looked up for.
        cpu: CpuType,
        /// Offending module name.
        module: String,
    },
    /// Sink rejected the request.
    #[error(transparent)]
    Sink(#[from] SinkError),
    /// Device access failed.
    #[error(transparent)]
    Device(#[from] DeviceError),
    /// Post-collection configuration was rejected.
    #[error(transparent)]
    PostCollection(#[from] PostCollectionError),
    /// The scheduler refused to register the poll task.
    #[error("poll task {0} is already registered")]
    TaskExists(String),
    /// Interval must be non-zero.
    #[error("polling interval must be greater than zero")]
    InvalidInterval,
    /// Device registry lock poisoned.
    #[error("device registry lock poisoned")]
    LockPoisoned,
}
