//! Keyword watch over the literal buffer.
//!
//! Registered words are matched case-insensitively against the typed text
//! after every [`BufferEvent::TextTyped`]. A hit is reported once, then the
//! buffers are flushed so the same text cannot match again.

use crate::buffer::{BufferEvent, EventBuffer, EventSink, WeakEventBuffer};
use crate::codec::{TAG_CLOSE, TAG_OPEN};
use anyhow::{anyhow, Context, Result};
use once_cell::sync::OnceCell;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyword {
    pub word: String,
    pub delay_ms: u32,
    pub count: u32,
}

impl Keyword {
    pub fn new(word: impl Into<String>, delay_ms: u32, count: u32) -> Self {
        Self {
            word: word.into(),
            delay_ms,
            count,
        }
    }
}

/// Called with the matched keyword, outside any lock.
pub type DetectionHandler = Arc<dyn Fn(&Keyword) + Send + Sync>;

pub struct KeywordWatch {
    keywords: Mutex<Vec<Keyword>>,
    default_delay_ms: u32,
    default_count: u32,
    on_detect: DetectionHandler,
    buffer: OnceCell<WeakEventBuffer>,
}

impl KeywordWatch {
    pub fn new(default_delay_ms: u32, default_count: u32, on_detect: DetectionHandler) -> Self {
        Self {
            keywords: Mutex::new(Vec::new()),
            default_delay_ms,
            default_count,
            on_detect,
            buffer: OnceCell::new(),
        }
    }

    /// Points the watch at the buffer whose text it scans. Only the first
    /// call takes effect.
    pub fn bind(&self, buffer: &EventBuffer) {
        if self.buffer.set(buffer.downgrade()).is_err() {
            warn!("keyword watch already bound to a buffer");
        }
    }

    /// Sink to hand to [`EventBuffer::new`].
    pub fn sink(self: &Arc<Self>) -> EventSink {
        let watch = Arc::clone(self);
        Arc::new(move |event| watch.on_event(event))
    }

    pub fn on_event(&self, event: BufferEvent) {
        if event != BufferEvent::TextTyped {
            return;
        }
        let Some(buffer) = self.buffer.get().and_then(WeakEventBuffer::upgrade) else {
            return;
        };
        let Some(keyword) = self.check(&buffer.literal_text()) else {
            return;
        };
        info!(keyword = %keyword.word, "keyword detected");
        (self.on_detect)(&keyword);
        if let Err(err) = buffer.flush() {
            warn!(error = %format!("{err:#}"), "flush after keyword detection failed");
        }
    }

    /// First registered keyword contained in `text`, ignoring case and tags.
    pub fn check(&self, text: &str) -> Option<Keyword> {
        let haystack = strip_tags(text).to_lowercase();
        self.lock()
            .iter()
            .find(|keyword| {
                !keyword.word.is_empty() && haystack.contains(&keyword.word.to_lowercase())
            })
            .cloned()
    }

    pub fn register(&self, word: &str) {
        self.register_with(word, self.default_delay_ms, self.default_count);
    }

    /// Adds `word`, or updates its settings when already registered.
    pub fn register_with(&self, word: &str, delay_ms: u32, count: u32) {
        let mut keywords = self.lock();
        match keywords.iter_mut().find(|keyword| keyword.word == word) {
            Some(existing) => {
                existing.delay_ms = delay_ms;
                existing.count = count;
            }
            None => keywords.push(Keyword::new(word, delay_ms, count)),
        }
    }

    pub fn delete(&self, word: &str) -> bool {
        let mut keywords = self.lock();
        let before = keywords.len();
        keywords.retain(|keyword| keyword.word != word);
        keywords.len() != before
    }

    pub fn get(&self, word: &str) -> Option<Keyword> {
        self.lock().iter().find(|keyword| keyword.word == word).cloned()
    }

    pub fn keywords(&self) -> Vec<Keyword> {
        self.lock().clone()
    }

    /// Reads `word delay count` lines, registering each. Returns how many
    /// lines were read.
    pub fn import(&self, path: &Path) -> Result<usize> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read keyword file {}", path.display()))?;
        let parsed = parse_keywords(&contents)
            .with_context(|| format!("Failed to parse keyword file {}", path.display()))?;
        let imported = parsed.len();
        for keyword in parsed {
            self.register_with(&keyword.word, keyword.delay_ms, keyword.count);
        }
        Ok(imported)
    }

    pub fn export(&self, path: &Path) -> Result<()> {
        let mut contents = String::new();
        for keyword in self.lock().iter() {
            contents.push_str(&format!(
                "{} {} {}\r\n",
                keyword.word, keyword.delay_ms, keyword.count
            ));
        }
        fs::write(path, contents)
            .with_context(|| format!("Failed to write keyword file {}", path.display()))
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Keyword>> {
        self.keywords.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn parse_keywords(contents: &str) -> Result<Vec<Keyword>> {
    let mut keywords = Vec::new();
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let mut fields = line.splitn(3, ' ');
        let word = fields.next().unwrap_or_default();
        let (Some(delay), Some(count)) = (fields.next(), fields.next()) else {
            return Err(anyhow!("line {}: expected `word delay count`", index + 1));
        };
        let delay_ms = delay
            .trim()
            .parse()
            .with_context(|| format!("line {}: bad delay {delay:?}", index + 1))?;
        let count = count
            .trim()
            .parse()
            .with_context(|| format!("line {}: bad count {count:?}", index + 1))?;
        keywords.push(Keyword::new(word, delay_ms, count));
    }
    Ok(keywords)
}

fn strip_tags(text: &str) -> String {
    let mut stripped = String::with_capacity(text.len());
    let mut in_tag = false;
    for c in text.chars() {
        match c {
            TAG_OPEN => in_tag = true,
            TAG_CLOSE => in_tag = false,
            c if !in_tag => stripped.push(c),
            _ => {}
        }
    }
    stripped
}
