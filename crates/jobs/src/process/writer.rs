//! Child-side envelope emission.
//!
//! Used by worker binaries to speak the protocol in
//! [`envelope`](crate::process::envelope): one JSON envelope per line,
//! flushed immediately so the parent sees messages as they happen, not when
//! the pipe buffer fills.

use std::io::Write;

use atelier_core::normalize_progress;

use super::envelope::IpcEnvelope;

/// Line-oriented envelope writer for the child side of the IPC channel.
pub struct EnvelopeWriter<W: Write> {
    out: W,
}

impl EnvelopeWriter<std::io::Stdout> {
    /// Writer over the process's stdout, the channel a parent runner reads.
    pub fn stdout() -> Self {
        Self::new(std::io::stdout())
    }
}

impl<W: Write> EnvelopeWriter<W> {
    pub fn new(out: W) -> Self {
        Self { out }
    }

    fn emit(&mut self, envelope: &IpcEnvelope) -> std::io::Result<()> {
        let line = serde_json::to_string(envelope)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        writeln!(self.out, "{line}")?;
        self.out.flush()
    }

    /// Post a progress update. Values are normalized before they hit the
    /// wire; non-finite values are reported as an error instead of sent.
    pub fn progress(&mut self, value: f64, message: Option<&str>) -> std::io::Result<()> {
        let value = normalize_progress(value)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string()))?;
        self.emit(&IpcEnvelope::Progress {
            value,
            message: message.map(str::to_string),
        })
    }

    /// Post one log line.
    pub fn log(&mut self, line: &str) -> std::io::Result<()> {
        self.emit(&IpcEnvelope::Log {
            line: line.to_string(),
        })
    }

    /// Post the terminal success payload.
    pub fn result(&mut self, value: serde_json::Value) -> std::io::Result<()> {
        self.emit(&IpcEnvelope::Result { value })
    }

    /// Post the terminal failure message.
    pub fn error(&mut self, message: &str) -> std::io::Result<()> {
        self.emit(&IpcEnvelope::Error {
            message: message.to_string(),
        })
    }
}
