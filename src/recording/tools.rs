// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: External program capability used for compression and upload.
// Author: Lukas Bower

use std::io;
use std::process::{Command, Stdio};

use log::debug;

/// Runs external programs on behalf of the post-collection handler.
pub trait ToolRunner: Send + Sync {
    /// True when `tool` resolves to an executable.
    fn tool_available(&self, tool: &str) -> bool;

    /// Run `program` to completion; `Ok(true)` on a zero exit status.
    fn run(&self, program: &str, args: &[&str]) -> io::Result<bool>;
}

/// [`ToolRunner`] spawning real processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTools;

impl ToolRunner for SystemTools {
    fn tool_available(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }

    fn run(&self, program: &str, args: &[&str]) -> io::Result<bool> {
        debug!("running {program} {args:?}");
        let status = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()?;
        Ok(status.success())
    }
}
