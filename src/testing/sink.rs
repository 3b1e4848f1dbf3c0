//! In-memory sink with optional backpressure

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::errors::SinkError;
use crate::frame::EncodedChunk;
use crate::sink::{Sink, SinkStats};

#[derive(Debug, Default)]
struct MemoryOutput {
    data: Vec<u8>,
    chunks: Vec<EncodedChunk>,
    close_calls: u32,
    closed: bool,
}

/// Read side of a [`MemorySink`], usable after the sink moved into a session
#[derive(Debug, Clone, Default)]
pub struct MemorySinkHandle {
    output: Arc<Mutex<MemoryOutput>>,
}

impl MemorySinkHandle {
    pub fn bytes(&self) -> Vec<u8> {
        self.output.lock().expect("lock poisoned").data.clone()
    }

    pub fn chunks(&self) -> Vec<EncodedChunk> {
        self.output.lock().expect("lock poisoned").chunks.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.output.lock().expect("lock poisoned").closed
    }

    pub fn close_calls(&self) -> u32 {
        self.output.lock().expect("lock poisoned").close_calls
    }
}

pub struct MemorySink {
    handle: MemorySinkHandle,
    stats: SinkStats,
    writes: u64,
    stall: Option<(u64, Duration)>,
    fail_at: Option<u64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self {
            handle: MemorySinkHandle::default(),
            stats: SinkStats::default(),
            writes: 0,
            stall: None,
            fail_at: None,
        }
    }

    /// Write into an existing handle's buffer
    pub fn with_handle(mut self, handle: MemorySinkHandle) -> Self {
        self.handle = handle;
        self
    }

    pub fn handle(&self) -> MemorySinkHandle {
        self.handle.clone()
    }

    /// Block for `duration` inside the `write`-th write call (1-based)
    pub fn stall_on_write(mut self, write: u64, duration: Duration) -> Self {
        self.stall = Some((write, duration));
        self
    }

    /// Fail the `write`-th write call with an I/O error
    pub fn fail_on_write(mut self, write: u64) -> Self {
        self.fail_at = Some(write);
        self
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Sink for MemorySink {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<(), SinkError> {
        let mut out = self.handle.output.lock().expect("lock poisoned");
        if out.closed {
            return Err(SinkError::Closed);
        }
        self.writes += 1;
        if self.fail_at == Some(self.writes) {
            return Err(SinkError::Io("scripted write failure".to_string()));
        }
        if let Some((at, duration)) = self.stall {
            if at == self.writes {
                drop(out);
                std::thread::sleep(duration);
                out = self.handle.output.lock().expect("lock poisoned");
            }
        }
        if chunk.is_empty() {
            return Ok(());
        }
        out.data.extend_from_slice(&chunk.data);
        out.chunks.push(chunk.clone());
        self.stats.bytes_written += chunk.len() as u64;
        self.stats.chunks_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<SinkStats, SinkError> {
        let mut out = self.handle.output.lock().expect("lock poisoned");
        out.close_calls += 1;
        out.closed = true;
        Ok(self.stats)
    }
}
