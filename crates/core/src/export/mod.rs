use std::io::Write;

use serde::Serialize;

use crate::{
    snapshot::{ScopeMessage, Snapshot},
    Result,
};

/// Consumer-side export of snapshots. Only ever called on the delivery
/// worker thread, never from the real-time producer.
pub trait ExportSink {
    fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()>;

    fn export_message(&mut self, _message: &ScopeMessage) -> Result<()> {
        Ok(())
    }

    /// Called once when the worker stops.
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<T: ExportSink + ?Sized> ExportSink for Box<T> {
    fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        (**self).export_snapshot(snapshot)
    }

    fn export_message(&mut self, message: &ScopeMessage) -> Result<()> {
        (**self).export_message(message)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }
}

/// Keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    pub snapshots: Vec<Snapshot>,
    pub messages: Vec<ScopeMessage>,
}

impl ExportSink for MemorySink {
    fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.snapshots.push(snapshot.clone());
        Ok(())
    }

    fn export_message(&mut self, message: &ScopeMessage) -> Result<()> {
        self.messages.push(message.clone());
        Ok(())
    }
}

/// Writes snapshots in the binary wire form. Messages are not part of the
/// binary stream and are skipped.
#[derive(Debug)]
pub struct WireSink<W> {
    writer: W,
    buffer: Vec<u8>,
}

impl<W: Write> WireSink<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer,
            buffer: Vec::new(),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> ExportSink for WireSink<W> {
    fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.buffer.clear();
        snapshot.encode_into(&mut self.buffer);
        self.writer.write_all(&self.buffer)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Hands each encoded snapshot to a closure as a byte buffer.
pub struct BytesSink<F> {
    callback: F,
    buffer: Vec<u8>,
}

impl<F> BytesSink<F>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    pub fn new(callback: F) -> Self {
        Self {
            callback,
            buffer: Vec::new(),
        }
    }
}

impl<F> ExportSink for BytesSink<F>
where
    F: FnMut(&[u8]) -> Result<()>,
{
    fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.buffer.clear();
        snapshot.encode_into(&mut self.buffer);
        (self.callback)(&self.buffer)
    }
}

/// One JSON object per line: `{"snapshot": ...}` or `{"message": ...}`.
#[derive(Debug)]
pub struct JsonLinesSink<W> {
    writer: W,
}

#[derive(Serialize)]
#[serde(rename_all = "snake_case")]
enum Line<'a> {
    Snapshot(&'a Snapshot),
    Message(&'a ScopeMessage),
}

impl<W: Write> JsonLinesSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<()> {
        serde_json::to_writer(&mut self.writer, line)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl<W: Write> ExportSink for JsonLinesSink<W> {
    fn export_snapshot(&mut self, snapshot: &Snapshot) -> Result<()> {
        self.write_line(&Line::Snapshot(snapshot))
    }

    fn export_message(&mut self, message: &ScopeMessage) -> Result<()> {
        self.write_line(&Line::Message(message))
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
