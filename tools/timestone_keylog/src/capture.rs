use crate::buffer::{EventBuffer, WeakEventBuffer};
use anyhow::{bail, Context, Result};
use crossbeam_channel::{bounded, select, Receiver, Sender};
use std::thread;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureEvent {
    Typed(char),
    Pressed(String),
}

/// Something that delivers key events into an [`EventBuffer`] from a single
/// thread.
pub trait CaptureSource: Send {
    fn register(&mut self, buffer: EventBuffer) -> Result<()>;
    fn unregister(&mut self);
}

pub fn deliver(buffer: &EventBuffer, event: CaptureEvent) {
    match event {
        CaptureEvent::Typed(c) => buffer.append_literal(c),
        CaptureEvent::Pressed(name) => buffer.append_key_name(&name),
    }
}

/// Capture source fed through a bounded channel. Producers get a
/// [`Sender`] from [`ChannelSource::sender`]; one delivery thread forwards
/// events in order.
pub struct ChannelSource {
    tx: Sender<CaptureEvent>,
    rx: Receiver<CaptureEvent>,
    stop_tx: Option<Sender<()>>,
    handle: Option<thread::JoinHandle<()>>,
}

impl ChannelSource {
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            stop_tx: None,
            handle: None,
        }
    }

    pub fn sender(&self) -> Sender<CaptureEvent> {
        self.tx.clone()
    }
}

impl CaptureSource for ChannelSource {
    fn register(&mut self, buffer: EventBuffer) -> Result<()> {
        if self.handle.is_some() {
            bail!("capture source already registered");
        }
        let (stop_tx, stop_rx) = bounded::<()>(1);
        let rx = self.rx.clone();
        let buffer = buffer.downgrade();
        let handle = thread::Builder::new()
            .name("keylog-capture".to_string())
            .spawn(move || run_delivery(buffer, rx, stop_rx))
            .context("Failed to spawn capture delivery thread")?;
        self.stop_tx = Some(stop_tx);
        self.handle = Some(handle);
        Ok(())
    }

    /// Delivers whatever is already queued, then stops the thread.
    fn unregister(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            stop_tx.try_send(()).ok();
        }
        if let Some(handle) = self.handle.take() {
            handle.join().ok();
        }
    }
}

fn run_delivery(buffer: WeakEventBuffer, rx: Receiver<CaptureEvent>, stop_rx: Receiver<()>) {
    loop {
        select! {
            recv(rx) -> event => {
                let Ok(event) = event else { break };
                let Some(buffer) = buffer.upgrade() else { return };
                deliver(&buffer, event);
            }
            recv(stop_rx) -> _ => break,
        }
    }
    if let Some(buffer) = buffer.upgrade() {
        for event in rx.try_iter() {
            deliver(&buffer, event);
        }
    }
    debug!("capture delivery stopped");
}
