use std::io::{self, Read, Write};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::context::RunContext;
use crate::error::MirrorError;

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

impl ProgressEvent {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            elapsed: None,
        }
    }
}

pub trait ProgressSink: Send + Sync {
    fn event(&self, event: ProgressEvent);
}

/// Sink that forwards events to the tracing subscriber.
pub struct LogSink;

impl ProgressSink for LogSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => tracing::info!(elapsed_ms = elapsed.as_millis() as u64, "{}", event.message),
            None => tracing::info!("{}", event.message),
        }
    }
}

const SMALL_FILE: u64 = 10 * 1024 * 1024;
const SMALL_STEP: u64 = 25;
const LARGE_STEP: u64 = 5;
const MIN_REPORT_INTERVAL: Duration = Duration::from_secs(2);
const COPY_BUFFER: usize = 64 * 1024;

/// Byte counter for one transfer. Every call checks the run's abort flag and
/// fails with [`MirrorError::Interrupted`] once it is set.
pub struct TransferMeter<'a> {
    ctx: &'a RunContext,
    sink: &'a dyn ProgressSink,
    name: String,
    total: u64,
    start_offset: u64,
    position: u64,
    started: Instant,
    last_report: Option<Instant>,
    next_percent: u64,
    step: u64,
}

impl<'a> TransferMeter<'a> {
    pub fn new(
        ctx: &'a RunContext,
        sink: &'a dyn ProgressSink,
        name: impl Into<String>,
        total: u64,
        offset: u64,
    ) -> Self {
        let step = if total < SMALL_FILE { SMALL_STEP } else { LARGE_STEP };
        let mut meter = Self {
            ctx,
            sink,
            name: name.into(),
            total,
            start_offset: offset,
            position: offset,
            started: Instant::now(),
            last_report: None,
            next_percent: step,
            step,
        };
        meter.next_percent = meter.next_threshold(meter.percent());
        meter
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn transferred(&self) -> u64 {
        self.position - self.start_offset
    }

    /// Resets the counter when a resumed transfer has to start over.
    pub fn restart(&mut self) {
        self.start_offset = 0;
        self.position = 0;
        self.started = Instant::now();
        self.next_percent = self.step;
    }

    pub fn check(&self) -> Result<(), MirrorError> {
        if self.ctx.is_aborted() {
            return Err(MirrorError::Interrupted);
        }
        Ok(())
    }

    pub fn advance(&mut self, bytes: u64) -> Result<(), MirrorError> {
        let position = self.position + bytes;
        self.observe(position)
    }

    /// Records an absolute position, used when the byte stream is not ours
    /// and only the local file size can be watched.
    pub fn observe(&mut self, position: u64) -> Result<(), MirrorError> {
        self.check()?;
        self.position = position.max(self.position);
        let percent = self.percent();
        if percent < self.next_percent {
            return Ok(());
        }
        let due = self
            .last_report
            .is_none_or(|last| last.elapsed() >= MIN_REPORT_INTERVAL);
        if due || percent >= 100 {
            self.report(percent);
            self.last_report = Some(Instant::now());
            self.next_percent = self.next_threshold(percent);
        }
        Ok(())
    }

    /// Streams `reader` into `writer`, counting every chunk.
    pub fn copy<R, W>(&mut self, reader: &mut R, writer: &mut W) -> Result<u64, MirrorError>
    where
        R: Read + ?Sized,
        W: Write + ?Sized,
    {
        let mut buffer = vec![0u8; COPY_BUFFER];
        let mut copied = 0u64;
        loop {
            self.check()?;
            let read = match reader.read(&mut buffer) {
                Ok(0) => break,
                Ok(read) => read,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    return Err(MirrorError::Transfer {
                        name: self.name.clone(),
                        message: err.to_string(),
                    });
                }
            };
            writer
                .write_all(&buffer[..read])
                .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
            copied += read as u64;
            self.advance(read as u64)?;
        }
        writer
            .flush()
            .map_err(|err| MirrorError::Filesystem(err.to_string()))?;
        Ok(copied)
    }

    fn percent(&self) -> u64 {
        if self.total == 0 {
            return 100;
        }
        (self.position.min(self.total) * 100) / self.total
    }

    fn next_threshold(&self, percent: u64) -> u64 {
        (percent / self.step + 1) * self.step
    }

    fn remaining(&self) -> Option<Duration> {
        let elapsed = self.started.elapsed().as_secs_f64();
        let moved = self.transferred() as f64;
        if elapsed <= 0.0 || moved <= 0.0 {
            return None;
        }
        let rate = moved / elapsed;
        let left = self.total.saturating_sub(self.position) as f64;
        Some(Duration::from_secs_f64(left / rate))
    }

    fn report(&self, percent: u64) {
        let remaining = self.remaining().map(|left| left.as_secs());
        debug!(file = %self.name, percent, ?remaining, "transfer progress");
        let message = match remaining {
            Some(secs) => format!("transfer {} {percent}% remaining_s={secs}", self.name),
            None => format!("transfer {} {percent}%", self.name),
        };
        self.sink.event(ProgressEvent {
            message,
            elapsed: Some(self.started.elapsed()),
        });
    }
}
