// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Size-rotated output file with header injection and `.active` staging.
// Author: Lukas Bower

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Local;
use log::{debug, info, warn};
use thiserror::Error;

use super::post::PostCollectionPool;

const ACTIVE_SUFFIX: &str = "active";

/// Errors raised while opening or rotating output files.
#[derive(Debug, Error)]
pub enum RecorderError {
    /// Filesystem failure on `path`.
    #[error("{action} {path}: {source}")]
    Io {
        /// What was attempted.
        action: &'static str,
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
}

impl RecorderError {
    fn io(action: &'static str, path: &Path, source: io::Error) -> Self {
        RecorderError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Where and how large recordings may grow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecorderSettings {
    /// Directory receiving the recordings.
    pub target_dir: PathBuf,
    /// Size after which the file is rotated; 0 disables rotation.
    pub max_file_bytes: u64,
}

struct ActiveFile {
    writer: BufWriter<File>,
    active_path: PathBuf,
    final_path: PathBuf,
    bytes: u64,
    header_bytes: u64,
    record_bytes: u64,
}

/// One output file at a time, rotated by size.
///
/// Files are written as `<name>.<ext>.active` and renamed to `<name>.<ext>`
/// when closed, so collectors watching the directory never pick up a file
/// that is still growing.
pub struct LogFileRecorder {
    settings: RecorderSettings,
    base_name: String,
    extension: &'static str,
    header: String,
    footer: String,
    sequence: u32,
    current: Option<ActiveFile>,
    post: Option<Arc<PostCollectionPool>>,
}

impl LogFileRecorder {
    /// Create a closed recorder.
    pub fn new(
        settings: RecorderSettings,
        base_name: impl Into<String>,
        extension: &'static str,
        header: impl Into<String>,
        footer: impl Into<String>,
        post: Option<Arc<PostCollectionPool>>,
    ) -> Self {
        Self {
            settings,
            base_name: base_name.into(),
            extension,
            header: header.into(),
            footer: footer.into(),
            sequence: 0,
            current: None,
            post,
        }
    }

    /// True while a file is open.
    pub fn is_open(&self) -> bool {
        self.current.is_some()
    }

    /// Path of the open `.active` file.
    pub fn active_path(&self) -> Option<&Path> {
        self.current.as_ref().map(|f| f.active_path.as_path())
    }

    /// Bytes written to the open file, header included.
    pub fn bytes_written(&self) -> u64 {
        self.current.as_ref().map(|f| f.bytes).unwrap_or(0)
    }

    /// Header written at the top of every new file.
    pub fn header(&self) -> &str {
        &self.header
    }

    /// Replace the header used for the next file.
    pub fn set_header(&mut self, header: impl Into<String>) {
        self.header = header.into();
    }

    /// Open a new file unless one is already open.
    pub fn open(&mut self) -> Result<(), RecorderError> {
        if self.current.is_some() {
            return Ok(());
        }
        let dir = &self.settings.target_dir;
        fs::create_dir_all(dir).map_err(|e| RecorderError::io("create directory", dir, e))?;
        self.sequence = self.sequence.wrapping_add(1);
        let stamp = Local::now().format("%Y_%m_%d__%H_%M_%S");
        let file_name = format!(
            "{}_{}_{:03}.{}",
            self.base_name, stamp, self.sequence, self.extension
        );
        let final_path = dir.join(file_name);
        let active_path = PathBuf::from(format!("{}.{}", final_path.display(), ACTIVE_SUFFIX));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(&active_path)
            .map_err(|e| RecorderError::io("open", &active_path, e))?;
        let mut active = ActiveFile {
            writer: BufWriter::new(file),
            active_path,
            final_path,
            bytes: 0,
            header_bytes: 0,
            record_bytes: 0,
        };
        active
            .writer
            .write_all(self.header.as_bytes())
            .map_err(|e| RecorderError::io("write header", &active.active_path, e))?;
        active.bytes = self.header.len() as u64;
        active.header_bytes = active.bytes;
        info!("recording to {}", active.active_path.display());
        self.current = Some(active);
        Ok(())
    }

    /// Append a record `line` plus a newline. Returns false when nothing
    /// was written.
    pub fn write(&mut self, line: &str) -> bool {
        self.append(line, true)
    }

    /// Append a marker line that stays with the header when the header is
    /// swapped before the first record.
    pub fn write_note(&mut self, line: &str) -> bool {
        self.append(line, false)
    }

    fn append(&mut self, line: &str, record: bool) -> bool {
        let Some(active) = self.current.as_mut() else {
            debug!("{}: no open file, dropping line", self.base_name);
            return false;
        };
        let result = active
            .writer
            .write_all(line.as_bytes())
            .and_then(|_| active.writer.write_all(b"\n"));
        match result {
            Ok(()) => {
                let written = line.len() as u64 + 1;
                active.bytes += written;
                if record {
                    active.record_bytes += written;
                }
                true
            }
            Err(err) => {
                warn!("write to {} failed: {err}", active.active_path.display());
                false
            }
        }
    }

    /// True once the open file outgrew the configured maximum.
    pub fn should_rotate(&self) -> bool {
        self.settings.max_file_bytes > 0 && self.bytes_written() > self.settings.max_file_bytes
    }

    /// Close the current file and open a fresh one.
    pub fn rotate(&mut self) -> Result<(), RecorderError> {
        self.close();
        self.open()
    }

    /// Swap the header. An open file without records is rewritten in place,
    /// keeping its marker lines, otherwise it is rotated so the new header
    /// starts a new file.
    pub fn update_header(&mut self, header: impl Into<String>) -> Result<(), RecorderError> {
        self.header = header.into();
        let Some(active) = self.current.as_mut() else {
            return Ok(());
        };
        if active.record_bytes > 0 {
            return self.rotate();
        }
        rewrite_header(active, &self.header)
            .map_err(|e| RecorderError::io("rewrite header", &active.active_path, e))
    }

    /// Write the footer, drop the `.active` suffix and hand the file to the
    /// post-collection pool. Returns the final path.
    pub fn close(&mut self) -> Option<PathBuf> {
        let mut active = self.current.take()?;
        if !self.footer.is_empty() {
            if let Err(err) = active.writer.write_all(self.footer.as_bytes()) {
                warn!("footer for {} failed: {err}", active.active_path.display());
            }
        }
        if let Err(err) = active.writer.flush() {
            warn!("flush of {} failed: {err}", active.active_path.display());
        }
        drop(active.writer);
        let path = match fs::rename(&active.active_path, &active.final_path) {
            Ok(()) => active.final_path,
            Err(err) => {
                warn!(
                    "rename {} -> {} failed: {err}",
                    active.active_path.display(),
                    active.final_path.display()
                );
                active.active_path
            }
        };
        info!("closed recording {}", path.display());
        if let Some(pool) = &self.post {
            pool.submit(path.clone());
        }
        Some(path)
    }
}

fn rewrite_header(active: &mut ActiveFile, header: &str) -> io::Result<()> {
    active.writer.flush()?;
    let file = active.writer.get_mut();
    file.seek(SeekFrom::Start(active.header_bytes))?;
    let mut notes = Vec::new();
    file.read_to_end(&mut notes)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    active.writer.write_all(header.as_bytes())?;
    active.writer.write_all(&notes)?;
    active.header_bytes = header.len() as u64;
    active.bytes = active.header_bytes + notes.len() as u64;
    Ok(())
}

impl Drop for LogFileRecorder {
    fn drop(&mut self) {
        self.close();
    }
}
