// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Output file recording and post-collection handling.
// Author: Lukas Bower

//! File recording.
//!
//! [`LogFileRecorder`] owns one output file at a time and rotates it by size.
//! Closed files go through the [`PostCollectionPool`] which compresses,
//! uploads and prunes them off the poll thread.

pub mod post;
pub mod recorder;
pub mod tools;

pub use post::{
    PostCollectionError, PostCollectionFileHandler, PostCollectionPool, UploadTarget,
};
pub use recorder::{LogFileRecorder, RecorderError, RecorderSettings};
pub use tools::{SystemTools, ToolRunner};
