//! Muxing subprocess fed through stdin
//!
//! Writes block when the child stops reading, which is the backpressure the
//! acquisition loop absorbs.

use std::io::{ErrorKind as IoErrorKind, Write};
use std::path::Path;
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};

use crate::encoder::Codec;
use crate::errors::SinkError;
use crate::frame::EncodedChunk;
use crate::sink::{Sink, SinkStats};

#[derive(Debug)]
pub struct PipeSink {
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stats: SinkStats,
    closed: Option<Result<SinkStats, SinkError>>,
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by a signal: no code.
    status.code().unwrap_or(-1)
}

impl PipeSink {
    /// Start `cmd` with a piped stdin.
    pub fn spawn(mut cmd: Command) -> Result<Self, SinkError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());

        let mut child = cmd.spawn().map_err(|e| SinkError::Spawn {
            program: program.clone(),
            reason: e.to_string(),
        })?;
        let stdin = child.stdin.take();

        Ok(Self {
            program,
            child,
            stdin,
            stats: SinkStats::default(),
            closed: None,
        })
    }

    /// ffmpeg copying an Annex B stream into the container implied by `path`.
    pub fn ffmpeg_mux(codec: Codec, framerate_hz: u32, path: &Path) -> Result<Self, SinkError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut cmd = Command::new("ffmpeg");
        cmd.arg("-hide_banner")
            .arg("-loglevel")
            .arg("error")
            .arg("-y")
            .arg("-f")
            .arg(codec.elementary_format())
            .arg("-framerate")
            .arg(framerate_hz.to_string())
            .arg("-i")
            .arg("-")
            .arg("-c:v")
            .arg("copy")
            .arg(path);
        Self::spawn(cmd)
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn downstream_status(&mut self) -> SinkError {
        match self.child.wait() {
            Ok(status) if !status.success() => SinkError::DownstreamFailed(exit_code(status)),
            Ok(_) => SinkError::Io(format!("{} stopped reading", self.program)),
            Err(e) => e.into(),
        }
    }

    fn finish(&mut self) -> Result<SinkStats, SinkError> {
        if let Some(mut stdin) = self.stdin.take() {
            if let Err(e) = stdin.flush() {
                log::warn!("Flushing {} input failed: {}", self.program, e);
            }
            // Dropping stdin sends EOF.
        }
        let status = self.child.wait()?;
        if !status.success() {
            return Err(SinkError::DownstreamFailed(exit_code(status)));
        }
        Ok(self.stats)
    }
}

impl Sink for PipeSink {
    fn write(&mut self, chunk: &EncodedChunk) -> Result<(), SinkError> {
        let stdin = self.stdin.as_mut().ok_or(SinkError::Closed)?;
        if chunk.is_empty() {
            return Ok(());
        }
        if let Err(e) = stdin.write_all(&chunk.data) {
            self.stdin = None;
            if e.kind() == IoErrorKind::BrokenPipe {
                let err = self.downstream_status();
                self.closed = Some(Err(err.clone()));
                return Err(err);
            }
            return Err(e.into());
        }
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

impl Drop for PipeSink {
    fn drop(&mut self) {
        if self.closed.is_none() {
            drop(self.stdin.take());
            let _ = self.child.wait();
        }
    }
}
