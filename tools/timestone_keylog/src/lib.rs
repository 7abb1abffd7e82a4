pub mod buffer;
pub mod capture;
pub mod codec;
pub mod config;
pub mod error;
pub mod keywords;
pub mod logging;
pub mod parser;
mod schedule;

pub use buffer::{ignore_events, BufferEvent, EventBuffer, EventSink, WeakEventBuffer};
pub use capture::{CaptureEvent, CaptureSource, ChannelSource};
pub use codec::{decode, encode_tag, Decoder, LogEntry};
pub use config::KeylogConfig;
pub use error::{DecodeError, LoadError};
pub use keywords::{DetectionHandler, Keyword, KeywordWatch};
pub use parser::LogParser;
