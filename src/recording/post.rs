// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Best-effort compression, upload and retention of closed recordings.
// Author: Lukas Bower

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, SyncSender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::tools::ToolRunner;

/// Errors rejecting a post-collection configuration change.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PostCollectionError {
    /// Compression tool not found.
    #[error("compression tool {0:?} not found")]
    CompressorMissing(String),
    /// Upload enabled without a target.
    #[error("upload target is not configured")]
    MissingUploadTarget,
    /// Remote host did not answer.
    #[error("remote host {0} is unreachable")]
    HostUnreachable(String),
    /// Remote directory does not exist.
    #[error("remote path {path} does not exist on {host}")]
    RemotePathMissing {
        /// Remote host.
        host: String,
        /// Remote directory.
        path: String,
    },
    /// Handler state lock poisoned.
    #[error("post-collection state lock poisoned")]
    LockPoisoned,
}

/// Destination of uploaded recordings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadTarget {
    /// Remote host name or address.
    pub host: String,
    /// Remote user.
    pub user: String,
    /// Remote directory.
    pub remote_path: String,
}

impl UploadTarget {
    fn login(&self) -> String {
        if self.user.is_empty() {
            self.host.clone()
        } else {
            format!("{}@{}", self.user, self.host)
        }
    }
}

#[derive(Debug, Clone)]
struct HandlerSettings {
    compress: bool,
    compression_tool: String,
    compressed_extension: String,
    upload: Option<UploadTarget>,
    max_retained_files: usize,
}

/// Processes closed recordings: compress, upload, prune.
pub struct PostCollectionFileHandler {
    tools: Arc<dyn ToolRunner>,
    settings: Mutex<HandlerSettings>,
    history: Mutex<VecDeque<PathBuf>>,
}

impl PostCollectionFileHandler {
    /// Handler with compression and upload disabled.
    ///
    /// `max_retained_files` of 0 keeps every file.
    pub fn new(
        tools: Arc<dyn ToolRunner>,
        compression_tool: impl Into<String>,
        compressed_extension: impl Into<String>,
        max_retained_files: usize,
    ) -> Self {
        Self {
            tools,
            settings: Mutex::new(HandlerSettings {
                compress: false,
                compression_tool: compression_tool.into(),
                compressed_extension: compressed_extension.into(),
                upload: None,
                max_retained_files,
            }),
            history: Mutex::new(VecDeque::new()),
        }
    }

    fn settings(&self) -> Result<std::sync::MutexGuard<'_, HandlerSettings>, PostCollectionError> {
        self.settings
            .lock()
            .map_err(|_| PostCollectionError::LockPoisoned)
    }

    /// Turn compression on or off. Enabling requires the tool to be present.
    pub fn set_compression(&self, enabled: bool) -> Result<(), PostCollectionError> {
        let mut settings = self.settings()?;
        if enabled && !self.tools.tool_available(&settings.compression_tool) {
            return Err(PostCollectionError::CompressorMissing(
                settings.compression_tool.clone(),
            ));
        }
        settings.compress = enabled;
        info!("post-collection compression {}", if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Turn upload on (to `target`) or off. Enabling requires the host to
    /// answer and the remote directory to exist.
    pub fn set_upload(
        &self,
        enabled: bool,
        target: Option<UploadTarget>,
    ) -> Result<(), PostCollectionError> {
        if !enabled {
            self.settings()?.upload = None;
            info!("post-collection upload disabled");
            return Ok(());
        }
        let target = target.ok_or(PostCollectionError::MissingUploadTarget)?;
        if target.host.is_empty() || target.remote_path.is_empty() {
            return Err(PostCollectionError::MissingUploadTarget);
        }
        let reachable = self
            .tools
            .run("ping", &["-c", "1", "-W", "2", target.host.as_str()])
            .unwrap_or(false);
        if !reachable {
            return Err(PostCollectionError::HostUnreachable(target.host));
        }
        let login = target.login();
        let path_exists = self
            .tools
            .run(
                "ssh",
                &[
                    "-o",
                    "BatchMode=yes",
                    login.as_str(),
                    "test",
                    "-d",
                    target.remote_path.as_str(),
                ],
            )
            .unwrap_or(false);
        if !path_exists {
            return Err(PostCollectionError::RemotePathMissing {
                host: target.host,
                path: target.remote_path,
            });
        }
        info!("post-collection upload to {}:{}", login, target.remote_path);
        self.settings()?.upload = Some(target);
        Ok(())
    }

    /// Change the retention count; 0 keeps everything.
    pub fn set_max_retained_files(&self, max: usize) -> Result<(), PostCollectionError> {
        self.settings()?.max_retained_files = max;
        Ok(())
    }

    /// True while compression is enabled.
    pub fn compression_enabled(&self) -> bool {
        self.settings().map(|s| s.compress).unwrap_or(false)
    }

    /// Current upload target.
    pub fn upload_target(&self) -> Option<UploadTarget> {
        self.settings().ok().and_then(|s| s.upload.clone())
    }

    /// Retained files, oldest first.
    pub fn history(&self) -> Vec<PathBuf> {
        self.history
            .lock()
            .map(|h| h.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Process one closed file. Failures are logged and never abort the
    /// remaining steps. Returns the path that was retained.
    pub fn handle(&self, path: &Path) -> PathBuf {
        let settings = match self.settings() {
            Ok(settings) => settings.clone(),
            Err(err) => {
                warn!("{err}; skipping post-collection of {}", path.display());
                return path.to_path_buf();
            }
        };
        let mut retained = path.to_path_buf();
        if settings.compress {
            retained = self.compress(path, &settings);
        }
        if let Some(target) = &settings.upload {
            self.upload(&retained, target);
        }
        self.retain(retained.clone(), settings.max_retained_files);
        retained
    }

    fn compress(&self, path: &Path, settings: &HandlerSettings) -> PathBuf {
        let compressed = PathBuf::from(format!(
            "{}.{}",
            path.display(),
            settings.compressed_extension
        ));
        let source = path.to_string_lossy();
        match self.tools.run(&settings.compression_tool, &[source.as_ref()]) {
            Ok(true) if compressed.exists() => {
                if path.exists() {
                    if let Err(err) = fs::remove_file(path) {
                        debug!("keep uncompressed {}: {err}", path.display());
                    }
                }
                compressed
            }
            Ok(_) => {
                warn!("{} did not compress {}", settings.compression_tool, path.display());
                path.to_path_buf()
            }
            Err(err) => {
                warn!("{} failed on {}: {err}", settings.compression_tool, path.display());
                path.to_path_buf()
            }
        }
    }

    fn upload(&self, path: &Path, target: &UploadTarget) {
        let destination = format!("{}:{}", target.login(), target.remote_path);
        let source = path.to_string_lossy();
        match self
            .tools
            .run("scp", &["-o", "BatchMode=yes", source.as_ref(), destination.as_str()])
        {
            Ok(true) => info!("uploaded {} to {destination}", path.display()),
            Ok(false) => warn!("upload of {} to {destination} failed", path.display()),
            Err(err) => warn!("upload of {} failed: {err}", path.display()),
        }
    }

    fn retain(&self, path: PathBuf, max: usize) {
        let Ok(mut history) = self.history.lock() else {
            warn!("post-collection history lock poisoned");
            return;
        };
        history.push_back(path);
        while max > 0 && history.len() > max {
            if let Some(oldest) = history.pop_front() {
                match fs::remove_file(&oldest) {
                    Ok(()) => info!("pruned {}", oldest.display()),
                    Err(err) => warn!("prune of {} failed: {err}", oldest.display()),
                }
            }
        }
    }
}

/// Bounded queue feeding a post-collection worker thread.
pub struct PostCollectionPool {
    handler: Arc<PostCollectionFileHandler>,
    sender: Mutex<Option<SyncSender<PathBuf>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PostCollectionPool {
    /// Spawn the worker with room for `capacity` pending files.
    pub fn start(handler: Arc<PostCollectionFileHandler>, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::sync_channel::<PathBuf>(capacity.max(1));
        let worker_handler = Arc::clone(&handler);
        let worker = thread::Builder::new()
            .name("post-collection".into())
            .spawn(move || {
                for path in receiver {
                    worker_handler.handle(&path);
                }
                debug!("post-collection worker exiting");
            });
        let worker = match worker {
            Ok(handle) => Some(handle),
            Err(err) => {
                warn!("post-collection worker failed to start: {err}");
                None
            }
        };
        Self {
            handler,
            sender: Mutex::new(worker.as_ref().map(|_| sender)),
            worker: Mutex::new(worker),
        }
    }

    /// Handler shared with the worker.
    pub fn handler(&self) -> &Arc<PostCollectionFileHandler> {
        &self.handler
    }

    /// Queue a closed file, blocking while the queue is full. Runs the
    /// handler inline when the worker is gone.
    pub fn submit(&self, path: PathBuf) {
        let sender = self.sender.lock().ok().and_then(|s| s.clone());
        match sender {
            Some(sender) => {
                if let Err(mpsc::SendError(path)) = sender.send(path) {
                    self.handler.handle(&path);
                }
            }
            None => {
                self.handler.handle(&path);
            }
        }
    }

    /// Stop accepting files, drain the queue and join the worker.
    pub fn shutdown(&self) {
        if let Ok(mut sender) = self.sender.lock() {
            sender.take();
        }
        let worker = self.worker.lock().ok().and_then(|mut w| w.take());
        if let Some(worker) = worker {
            if worker.join().is_err() {
                warn!("post-collection worker panicked");
            }
        }
    }
}

impl Drop for PostCollectionPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::*;
    use tempfile::tempdir;

    #[derive(Default)]
    struct FakeTools {
        available: bool,
        reachable: bool,
        remote_dir: bool,
        calls: Mutex<Vec<String>>,
    }

    impl ToolRunner for FakeTools {
        fn tool_available(&self, _tool: &str) -> bool {
            self.available
        }

        fn run(&self, program: &str, args: &[&str]) -> io::Result<bool> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("{program} {}", args.join(" ")));
            Ok(match program {
                "ping" => self.reachable,
                "ssh" => self.remote_dir,
                "scp" => true,
                _ => {
                    // behave like gzip: replace file with file.gz
                    let src = PathBuf::from(args[0]);
                    let dst = PathBuf::from(format!("{}.gz", args[0]));
                    fs::rename(src, dst)?;
                    true
                }
            })
        }
    }

    fn handler(tools: FakeTools, max: usize) -> PostCollectionFileHandler {
        PostCollectionFileHandler::new(Arc::new(tools), "gzip", "gz", max)
    }

    #[test]
    fn retention_prunes_oldest_file() {
        let dir = tempdir().unwrap();
        let h = handler(FakeTools::default(), 3);
        let files: Vec<PathBuf> = (1..=4)
            .map(|i| {
                let p = dir.path().join(format!("F{i}.txt"));
                fs::write(&p, "x").unwrap();
                p
            })
            .collect();
        for f in &files {
            h.handle(f);
        }
        assert!(!files[0].exists());
        assert_eq!(h.history(), files[1..].to_vec());
    }

    #[test]
    fn zero_retention_keeps_everything() {
        let dir = tempdir().unwrap();
        let h = handler(FakeTools::default(), 0);
        for i in 0..5 {
            let p = dir.path().join(format!("{i}.xml"));
            fs::write(&p, "x").unwrap();
            h.handle(&p);
        }
        assert_eq!(h.history().len(), 5);
    }

    #[test]
    fn compression_requires_tool() {
        let h = handler(FakeTools::default(), 0);
        assert_eq!(
            h.set_compression(true),
            Err(PostCollectionError::CompressorMissing("gzip".into()))
        );
        assert!(!h.compression_enabled());
    }

    #[test]
    fn compressed_file_replaces_original() {
        let dir = tempdir().unwrap();
        let tools = FakeTools {
            available: true,
            ..FakeTools::default()
        };
        let h = handler(tools, 0);
        h.set_compression(true).unwrap();
        let p = dir.path().join("rec.txt");
        fs::write(&p, "data").unwrap();
        let kept = h.handle(&p);
        assert_eq!(kept, dir.path().join("rec.txt.gz"));
        assert!(kept.exists());
        assert!(!p.exists());
    }

    #[test]
    fn upload_validation_rejects_unreachable_host() {
        let target = UploadTarget {
            host: "10.0.0.9".into(),
            user: "logs".into(),
            remote_path: "/srv/fwlogs".into(),
        };
        let h = handler(FakeTools::default(), 0);
        assert_eq!(
            h.set_upload(true, Some(target.clone())),
            Err(PostCollectionError::HostUnreachable("10.0.0.9".into()))
        );
        let h = handler(
            FakeTools {
                reachable: true,
                ..FakeTools::default()
            },
            0,
        );
        assert!(matches!(
            h.set_upload(true, Some(target.clone())),
            Err(PostCollectionError::RemotePathMissing { .. })
        ));
        assert_eq!(h.upload_target(), None);
        assert_eq!(h.set_upload(true, None), Err(PostCollectionError::MissingUploadTarget));
    }

    #[test]
    fn upload_runs_after_validation() {
        let dir = tempdir().unwrap();
        let tools = Arc::new(FakeTools {
            reachable: true,
            remote_dir: true,
            ..FakeTools::default()
        });
        let h = PostCollectionFileHandler::new(tools.clone(), "gzip", "gz", 0);
        let target = UploadTarget {
            host: "collector".into(),
            user: "logs".into(),
            remote_path: "/srv/fwlogs".into(),
        };
        h.set_upload(true, Some(target.clone())).unwrap();
        assert_eq!(h.upload_target(), Some(target));
        let p = dir.path().join("a.xml");
        fs::write(&p, "x").unwrap();
        h.handle(&p);
        let calls = tools.calls.lock().unwrap().clone();
        assert!(calls
            .last()
            .unwrap()
            .ends_with("logs@collector:/srv/fwlogs"));
    }

    #[test]
    fn pool_drains_on_shutdown() {
        let dir = tempdir().unwrap();
        let h = Arc::new(handler(FakeTools::default(), 0));
        let pool = PostCollectionPool::start(Arc::clone(&h), 2);
        for i in 0..4 {
            let p = dir.path().join(format!("{i}.txt"));
            fs::write(&p, "x").unwrap();
            pool.submit(p);
        }
        pool.shutdown();
        assert_eq!(h.history().len(), 4);
    }
}
