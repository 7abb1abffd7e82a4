//! Tagging and flushing cadence for an enabled [`EventBuffer`].

use crate::buffer::{EventBuffer, WeakEventBuffer};
use anyhow::{Context, Result};
use crossbeam_channel::{bounded, never, select, tick, Receiver, Sender};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

pub(crate) struct Scheduler {
    stop_tx: Sender<()>,
    handle: Option<thread::JoinHandle<()>>,
}

impl Scheduler {
    /// Spawns the timer thread. The flush timer fires once right away;
    /// the tag timer first fires after one full interval. A zero interval
    /// leaves that timer off, and with both off no thread is spawned.
    pub(crate) fn start(
        buffer: WeakEventBuffer,
        tag_interval: Duration,
        flush_interval: Duration,
    ) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(1);
        if tag_interval.is_zero() && flush_interval.is_zero() {
            return Ok(Self { stop_tx, handle: None });
        }
        let handle = thread::Builder::new()
            .name("keylog-timers".to_string())
            .spawn(move || run_timers(buffer, stop_rx, tag_interval, flush_interval))
            .context("Failed to spawn keylog timer thread")?;
        Ok(Self {
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Stops future ticks. A tick already running completes first, unless
    /// this is called from the timer thread itself.
    pub(crate) fn stop(mut self) {
        self.stop_tx.try_send(()).ok();
        let Some(handle) = self.handle.take() else {
            return;
        };
        if handle.thread().id() == thread::current().id() {
            return;
        }
        handle.join().ok();
    }
}

fn timer(interval: Duration) -> Receiver<Instant> {
    if interval.is_zero() {
        never()
    } else {
        tick(interval)
    }
}

fn run_timers(
    buffer: WeakEventBuffer,
    stop_rx: Receiver<()>,
    tag_interval: Duration,
    flush_interval: Duration,
) {
    let tag_ticks = timer(tag_interval);
    let flush_ticks = timer(flush_interval);
    debug!(?tag_interval, ?flush_interval, "keylog timers started");

    if !flush_interval.is_zero() && !scheduled_flush(&buffer) {
        return;
    }
    loop {
        select! {
            recv(stop_rx) -> _ => break,
            recv(tag_ticks) -> _ => {
                let Some(buffer) = buffer.upgrade() else { break };
                buffer.tag_tick();
            }
            recv(flush_ticks) -> _ => {
                if !scheduled_flush(&buffer) {
                    break;
                }
            }
        }
    }
    debug!("keylog timers stopped");
}

// false once the buffer is gone
fn scheduled_flush(buffer: &WeakEventBuffer) -> bool {
    let Some(buffer) = buffer.upgrade() else {
        return false;
    };
    flush_logged(&buffer);
    true
}

fn flush_logged(buffer: &EventBuffer) {
    if let Err(err) = buffer.flush() {
        warn!(error = %format!("{err:#}"), "scheduled flush failed");
    }
}

#[cfg(test)]
mod tests {
    use crate::buffer::{ignore_events, BufferEvent, EventBuffer, EventSink};
    use crate::config::KeylogConfig;
    use crossbeam_channel::unbounded;
    use std::fs;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn enabling_flushes_immediately_and_then_periodically() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, rx) = unbounded();
        let sink: EventSink = Arc::new(move |event| {
            if event == BufferEvent::Flushed {
                tx.send(()).ok();
            }
        });
        let config = KeylogConfig {
            text_log_path: Some(dir.path().join("text.dat")),
            key_log_path: None,
            tag_interval_ms: 0,
            flush_interval_ms: 40,
            ..KeylogConfig::default()
        };
        let buffer = EventBuffer::starting_at(&config, sink, 3);
        buffer.set_enabled(true);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        buffer.destroy();

        let text = fs::read_to_string(dir.path().join("text.dat")).unwrap();
        assert!(text.starts_with("\u{1}3\u{2}"));
    }

    #[test]
    fn tag_timer_tags_grown_buffer() {
        let config = KeylogConfig {
            tag_interval_ms: 20,
            ..KeylogConfig::detached()
        };
        let buffer = EventBuffer::starting_at(&config, ignore_events(), 0);
        buffer.set_enabled(true);
        buffer.append_literal('g');
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while buffer.literal_text().matches('\u{1}').count() < 2 {
            assert!(std::time::Instant::now() < deadline, "tag timer never fired");
            std::thread::sleep(Duration::from_millis(5));
        }
        buffer.destroy();
        let tags = buffer.literal_text().matches('\u{1}').count();
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(buffer.literal_text().matches('\u{1}').count(), tags);
    }

    #[test]
    fn disable_from_flush_notification_does_not_deadlock() {
        let slot: Arc<std::sync::Mutex<Option<EventBuffer>>> = Arc::default();
        let (done_tx, done_rx) = unbounded();
        let sink: EventSink = {
            let slot = slot.clone();
            Arc::new(move |event| {
                if event != BufferEvent::Flushed {
                    return;
                }
                let buffer = slot.lock().unwrap().take();
                if let Some(buffer) = buffer {
                    buffer.set_enabled(false);
                    done_tx.send(()).ok();
                }
            })
        };
        let config = KeylogConfig {
            flush_interval_ms: 30,
            ..KeylogConfig::detached()
        };
        let buffer = EventBuffer::starting_at(&config, sink, 0);
        *slot.lock().unwrap() = Some(buffer.clone());
        buffer.set_enabled(true);
        done_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(!buffer.is_enabled());
    }
}
