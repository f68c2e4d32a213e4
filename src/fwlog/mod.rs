// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Firmware log buffer layout, addressing, reading and decoding.
// Author: Lukas Bower

pub mod address;
pub mod consumer;
pub mod layout;
pub mod reader;

pub use address::{
    decode_buffer_size, AddressError, AddressTranslator, DeviceLogAddressResolver,
    LogBufferDescriptor,
};
pub use consumer::{BufferConsumer, BufferSnapshot, ConsumeOutcome};
pub use layout::{EventHeader, LogEvent, LogLevel, ModuleLevel, NUM_MODULES};
pub use reader::{PollResult, RingBufferReader};
