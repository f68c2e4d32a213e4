// Copyright © 2025 Lukas Bower
// SPDX-License-Identifier: Apache-2.0
// Purpose: Named periodic tasks, one OS thread each, with blocking cancellation.
// Author: Lukas Bower

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

/// Work run on every tick.
pub type Job = Box<dyn FnMut() + Send + 'static>;

struct TaskControl {
    interval_ms: AtomicU64,
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl TaskControl {
    fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.load(Ordering::Acquire))
    }

    fn stop(&self) {
        match self.stopped.lock() {
            Ok(mut stopped) => *stopped = true,
            Err(poisoned) => *poisoned.into_inner() = true,
        }
        self.wake.notify_all();
    }

    fn is_stopped(&self) -> bool {
        self.stopped.lock().map(|s| *s).unwrap_or(true)
    }

    /// Sleep until `start + interval` or cancellation. True when cancelled.
    fn sleep_from(&self, name: &str, start: Instant) -> bool {
        let Ok(mut stopped) = self.stopped.lock() else {
            return true;
        };
        let due = start + self.interval();
        let now = Instant::now();
        if now >= due {
            debug!("{name}: tick overran its interval by {:?}", now - due);
            return *stopped;
        }
        while !*stopped {
            // re-read so a shortened interval applies to the current sleep
            let due = start + self.interval();
            let now = Instant::now();
            if now >= due {
                break;
            }
            stopped = match self.wake.wait_timeout(stopped, due - now) {
                Ok((guard, _)) => guard,
                Err(_) => return true,
            };
        }
        *stopped
    }
}

struct Task {
    control: Arc<TaskControl>,
    thread: JoinHandle<()>,
}

impl Task {
    fn thread_id(&self) -> ThreadId {
        self.thread.thread().id()
    }
}

/// Runs named jobs periodically.
///
/// Every task owns a thread; intervals are measured from the start of one run
/// to the start of the next. Dropping the scheduler cancels and joins every
/// task.
#[derive(Default)]
pub struct TaskScheduler {
    tasks: Mutex<HashMap<String, Task>>,
}

impl TaskScheduler {
    /// Empty scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Start `job` under `name`, first run immediately.
    ///
    /// Returns false when `name` is taken or the thread could not be spawned.
    pub fn register(&self, name: &str, interval: Duration, mut job: Job) -> bool {
        let Ok(mut tasks) = self.tasks.lock() else {
            warn!("scheduler lock poisoned, not registering {name}");
            return false;
        };
        if tasks.contains_key(name) {
            debug!("task {name} already registered");
            return false;
        }
        let control = Arc::new(TaskControl {
            interval_ms: AtomicU64::new(interval.as_millis() as u64),
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let task_control = Arc::clone(&control);
        let task_name = name.to_string();
        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            while !task_control.is_stopped() {
                let start = Instant::now();
                job();
                if task_control.sleep_from(&task_name, start) {
                    break;
                }
            }
            debug!("task {task_name} exited");
        });
        match spawned {
            Ok(thread) => {
                info!("task {name} registered every {interval:?}");
                tasks.insert(name.to_string(), Task { control, thread });
                true
            }
            Err(err) => {
                warn!("spawning task {name} failed: {err}");
                false
            }
        }
    }

    /// Cancel `name` and wait for its thread to exit.
    ///
    /// Unknown names are ignored. Called from the task itself the thread is
    /// detached instead and exits after the current run.
    pub fn unregister_blocking(&self, name: &str) -> bool {
        let task = match self.tasks.lock() {
            Ok(mut tasks) => tasks.remove(name),
            Err(_) => {
                warn!("scheduler lock poisoned, cannot unregister {name}");
                return false;
            }
        };
        let Some(task) = task else {
            return false;
        };
        finish(name, task);
        info!("task {name} unregistered");
        true
    }

    /// Change the interval of `name`; takes effect on the current sleep.
    pub fn set_interval(&self, name: &str, interval: Duration) -> bool {
        let Ok(tasks) = self.tasks.lock() else {
            return false;
        };
        match tasks.get(name) {
            Some(task) => {
                task.control
                    .interval_ms
                    .store(interval.as_millis() as u64, Ordering::Release);
                task.control.wake.notify_all();
                debug!("task {name} interval set to {interval:?}");
                true
            }
            None => false,
        }
    }

    /// Current interval of `name`.
    pub fn interval(&self, name: &str) -> Option<Duration> {
        let tasks = self.tasks.lock().ok()?;
        tasks.get(name).map(|task| task.control.interval())
    }

    /// True when `name` is registered.
    pub fn is_registered(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .map(|tasks| tasks.contains_key(name))
            .unwrap_or(false)
    }

    /// Registered task names, sorted.
    pub fn task_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .tasks
            .lock()
            .map(|tasks| tasks.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }
}

fn finish(name: &str, task: Task) {
    task.control.stop();
    if task.thread_id() == thread::current().id() {
        debug!("task {name} cancelled from its own thread, detaching");
        return;
    }
    if task.thread.join().is_err() {
        warn!("task {name} panicked");
    }
}

impl Drop for TaskScheduler {
    fn drop(&mut self) {
        let tasks: Vec<(String, Task)> = match self.tasks.get_mut() {
            Ok(tasks) => tasks.drain().collect(),
            Err(poisoned) => poisoned.into_inner().drain().collect(),
        };
        for (_, task) in &tasks {
            task.control.stop();
        }
        for (name, task) in tasks {
            finish(&name, task);
        }
    }
}
