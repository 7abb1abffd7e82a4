use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Local, TimeZone};
use crossbeam_channel::{bounded, Sender};
use std::env;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use timestone_keylog::buffer::BACKSPACE;
use timestone_keylog::config::{load_config, ConfigOverrides, APP_DIR};
use timestone_keylog::{
    logging, BufferEvent, CaptureEvent, ChannelSource, DetectionHandler, EventBuffer, EventSink,
    Keyword, KeylogConfig, KeywordWatch, LogParser,
};
use tracing::{debug, info, warn};

const CAPTURE_QUEUE: usize = 20_000;

#[derive(Default)]
struct QueryArgs {
    path: Option<PathBuf>,
    at_ms: Option<i64>,
    window_ms: Option<u64>,
    all: bool,
}

fn main() -> Result<()> {
    logging::init();
    let mut args = env::args().skip(1);
    match args.next().as_deref() {
        Some("record") => {
            let overrides = parse_record_args(args)?;
            run_record(overrides)?;
        }
        Some("view") => {
            let query = parse_query_args(args)?;
            if let Some(log) = load_log(&query)? {
                print!("{}", log.entire_log());
            }
        }
        Some("span") => {
            let query = parse_query_args(args)?;
            if let Some(log) = load_log(&query)? {
                print_span(&log);
            }
        }
        Some("window") => {
            let query = parse_query_args(args)?;
            if let Some(log) = load_log(&query)? {
                print_window(&log, &query)?;
            }
        }
        Some("range") => {
            let query = parse_query_args(args)?;
            if let Some(log) = load_log(&query)? {
                print_range(&log, &query)?;
            }
        }
        _ => {
            print_usage();
        }
    }
    Ok(())
}

fn print_usage() {
    println!("timestone_keylog");
    println!("Usage:");
    println!("  timestone_keylog record [--config PATH] [--text-log PATH] [--key-log PATH]");
    println!("                          [--tag-ms N] [--flush-ms N] [--keywords PATH]");
    println!("  timestone_keylog view PATH");
    println!("  timestone_keylog span PATH");
    println!("  timestone_keylog window PATH --at MS|RFC3339 [--window-ms N]");
    println!("  timestone_keylog range PATH --at MS|RFC3339 [--window-ms N] [--all]");
}

fn parse_record_args(mut args: impl Iterator<Item = String>) -> Result<ConfigOverrides> {
    let mut overrides = ConfigOverrides::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => overrides.config_path = Some(PathBuf::from(required(&arg, args.next())?)),
            "--text-log" => {
                overrides.text_log_path = Some(PathBuf::from(required(&arg, args.next())?))
            }
            "--key-log" => overrides.key_log_path = Some(PathBuf::from(required(&arg, args.next())?)),
            "--tag-ms" => overrides.tag_interval_ms = Some(parse_number(&arg, args.next())?),
            "--flush-ms" => overrides.flush_interval_ms = Some(parse_number(&arg, args.next())?),
            "--keywords" => {
                overrides.keywords_path = Some(PathBuf::from(required(&arg, args.next())?))
            }
            other => bail!("unknown record option {other}"),
        }
    }
    Ok(overrides)
}

fn parse_query_args(mut args: impl Iterator<Item = String>) -> Result<QueryArgs> {
    let mut query = QueryArgs::default();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--at" => query.at_ms = Some(parse_instant(&required(&arg, args.next())?)?),
            "--window-ms" => query.window_ms = Some(parse_number(&arg, args.next())?),
            "--all" => query.all = true,
            other if query.path.is_none() && !other.starts_with("--") => {
                query.path = Some(PathBuf::from(other));
            }
            other => bail!("unexpected argument {other}"),
        }
    }
    Ok(query)
}

fn required(flag: &str, value: Option<String>) -> Result<String> {
    value.ok_or_else(|| anyhow!("{flag} needs a value"))
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: Option<String>) -> Result<T> {
    let value = required(flag, value)?;
    value
        .parse::<T>()
        .map_err(|_| anyhow!("{flag} expects a number, got {value:?}"))
}

fn parse_instant(value: &str) -> Result<i64> {
    if let Ok(ms) = value.parse::<i64>() {
        return Ok(ms);
    }
    DateTime::parse_from_rfc3339(value)
        .map(|instant| instant.timestamp_millis())
        .with_context(|| format!("--at expects milliseconds or RFC 3339, got {value:?}"))
}

fn load_log(query: &QueryArgs) -> Result<Option<LogParser>> {
    let path = query
        .path
        .as_deref()
        .ok_or_else(|| anyhow!("missing log file path"))?;
    match LogParser::load(path) {
        Ok(log) => Ok(Some(log)),
        Err(err) if err.is_missing() => {
            println!("No log recorded yet at {}", path.display());
            Ok(None)
        }
        Err(err) => Err(err.into()),
    }
}

fn format_ms(ms: i64) -> String {
    match Local.timestamp_millis_opt(ms).single() {
        Some(instant) => format!("{ms} ({})", instant.to_rfc3339()),
        None => ms.to_string(),
    }
}

fn print_span(log: &LogParser) {
    match log.time_span() {
        Some((first, last)) => {
            println!("entries: {}", log.len());
            println!("first:   {}", format_ms(first));
            println!("last:    {}", format_ms(last));
        }
        None => println!("Log is empty"),
    }
}

fn window_of(query: &QueryArgs) -> Result<(i64, u64)> {
    let at_ms = query.at_ms.ok_or_else(|| anyhow!("--at is required"))?;
    let window_ms = query
        .window_ms
        .unwrap_or_else(|| KeylogConfig::default().window_ms);
    Ok((at_ms, window_ms))
}

fn print_window(log: &LogParser, query: &QueryArgs) -> Result<()> {
    let (at_ms, window_ms) = window_of(query)?;
    match log.relevant_text(at_ms, window_ms) {
        Some(text) => print!("{text}"),
        None => println!("No entries within {window_ms} ms of {}", format_ms(at_ms)),
    }
    Ok(())
}

fn print_range(log: &LogParser, query: &QueryArgs) -> Result<()> {
    let (at_ms, window_ms) = window_of(query)?;
    let ranges = if query.all {
        log.relevant_ranges(at_ms, window_ms)
    } else {
        log.relevant_range(at_ms, window_ms).into_iter().collect()
    };
    if ranges.is_empty() {
        println!("No entries within {window_ms} ms of {}", format_ms(at_ms));
        return Ok(());
    }
    let entire: Vec<char> = log.entire_log().chars().collect();
    for range in ranges {
        let text: String = entire[range.clone()].iter().collect();
        println!("{}..{}\t{text:?}", range.start, range.end);
    }
    Ok(())
}

fn ensure_app_dir() -> Result<PathBuf> {
    let base_dir = PathBuf::from(APP_DIR);
    fs::create_dir_all(&base_dir).context("Failed to create app data dir")?;
    Ok(base_dir)
}

fn ensure_parent(path: Option<&Path>) -> Result<()> {
    if let Some(parent) = path.and_then(Path::parent) {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create log directory {}", parent.display()))?;
        }
    }
    Ok(())
}

fn run_record(overrides: ConfigOverrides) -> Result<()> {
    let base_dir = ensure_app_dir()?;
    let config = load_config(&base_dir, &overrides)?;
    ensure_parent(config.text_log_path.as_deref())?;
    ensure_parent(config.key_log_path.as_deref())?;

    let watch = Arc::new(keyword_watch(&config));
    let sink: EventSink = {
        let watch_sink = watch.sink();
        Arc::new(move |event| {
            if event == BufferEvent::Flushed {
                debug!("keylog buffers flushed");
            }
            watch_sink(event);
        })
    };
    let keylog = EventBuffer::new(&config, sink);
    watch.bind(&keylog);
    let source = ChannelSource::new(CAPTURE_QUEUE);
    let capture_tx = source.sender();
    keylog.attach(Box::new(source))?;
    keylog.set_enabled(true);
    info!(
        text_log = ?config.text_log_path,
        key_log = ?config.key_log_path,
        "recording stdin; Ctrl+C or EOF stops"
    );

    let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
    ctrlc::set_handler({
        let shutdown_tx = shutdown_tx.clone();
        move || {
            shutdown_tx.try_send(()).ok();
        }
    })
    .context("Failed to set Ctrl+C handler")?;
    thread::Builder::new()
        .name("stdin-reader".to_string())
        .spawn(move || {
            read_stdin(&capture_tx);
            shutdown_tx.try_send(()).ok();
        })
        .context("Failed to spawn stdin reader")?;

    shutdown_rx.recv().ok();
    // Delivers queued input and stops the timers; the disable below does
    // the final flush.
    keylog.destroy();
    keylog.set_enabled(false);
    info!("recording stopped");
    Ok(())
}

fn keyword_watch(config: &KeylogConfig) -> KeywordWatch {
    let on_detect: DetectionHandler = Arc::new(|keyword: &Keyword| {
        println!(
            "keyword {:?} detected (delay {} ms, count {})",
            keyword.word, keyword.delay_ms, keyword.count
        );
    });
    let watch = KeywordWatch::new(config.keyword_delay_ms, config.keyword_count, on_detect);
    if let Some(path) = config.keywords_path.as_deref().filter(|path| path.exists()) {
        match watch.import(path) {
            Ok(count) => info!(count, path = %path.display(), "keywords loaded"),
            Err(err) => warn!(error = %format!("{err:#}"), "keyword file ignored"),
        }
    }
    watch
}

fn read_stdin(tx: &Sender<CaptureEvent>) {
    let stdin = io::stdin();
    let mut reader = stdin.lock();
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line) {
            Ok(0) => break,
            Ok(_) => {
                for c in line.chars().filter(|c| *c != '\r') {
                    if tx.send(CaptureEvent::Typed(c)).is_err()
                        || tx.send(CaptureEvent::Pressed(key_name(c))).is_err()
                    {
                        return;
                    }
                }
            }
            Err(err) => {
                debug!(error = %err, "stdin read failed");
                break;
            }
        }
    }
}

fn key_name(c: char) -> String {
    match c {
        BACKSPACE => "Backspace".to_string(),
        '\t' => "Tab".to_string(),
        '\n' => "Enter".to_string(),
        '\u{1b}' => "Esc".to_string(),
        ' ' => "Space".to_string(),
        c if c.is_alphanumeric() => c.to_uppercase().collect(),
        c => c.to_string(),
    }
}
