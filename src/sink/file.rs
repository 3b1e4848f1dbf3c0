//! Elementary-stream file output

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crate::errors::SinkError;
use crate::frame::EncodedChunk;
use crate::sink::{Sink, SinkStats};

pub struct FileSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    stats: SinkStats,
    closed: Option<Result<SinkStats, SinkError>>,
}

impl FileSink {
    /// Create (or truncate) `path`, creating parent directories as needed.
    pub fn create(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(path)
            .map_err(|e| SinkError::Io(format!("failed to create {}: {e}", path.display())))?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            stats: SinkStats::default(),
            closed: None,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn finish(&mut self) -> Result<SinkStats, SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(self.stats);
        };
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(self.stats)
    }
}

impl Sink for FileSink {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<(), SinkError> {
        let writer = self.writer.as_mut().ok_or(SinkError::Closed)?;
        if chunk.is_empty() {
            return Ok(());
        }
        writer.write_all(&chunk.data)?;
        self.stats.bytes_written += chunk.len() as u64;
        self.stats.chunks_written += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<SinkStats, SinkError> {
        if let Some(result) = &self.closed {
            return result.clone();
        }
        let result = self.finish();
        self.closed = Some(result.clone());
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_write_then_close() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("out.h264");
        let mut sink = FileSink::create(&path).unwrap();
        sink.write(&EncodedChunk::new(vec![0, 0, 0, 1, 0x67])).unwrap();
        sink.write(&EncodedChunk::new(Vec::new())).unwrap();
        sink.write(&EncodedChunk::new(vec![0, 0, 0, 1, 0x65, 0xAA])).unwrap();

        let stats = sink.close().unwrap();
        assert_eq!(stats.bytes_written, 11);
        assert_eq!(stats.chunks_written, 2);
        assert_eq!(stats.container_frames, None);
        assert_eq!(std::fs::read(&path).unwrap().len(), 11);
    }

    #[test]
    fn test_close_is_idempotent() {
        let dir = tempdir().unwrap();
        let mut sink = FileSink::create(dir.path().join("a.h264")).unwrap();
        sink.write(&EncodedChunk::new(vec![1, 2, 3])).unwrap();
        let first = sink.close().unwrap();
        assert_eq!(sink.close().unwrap(), first);
        assert_eq!(sink.write(&EncodedChunk::new(vec![4])), Err(SinkError::Closed));
    }
}
