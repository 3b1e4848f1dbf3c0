//! Subprocess encoder: raw frames in on stdin, Annex B bitstream out on stdout
//!
//! ffmpeg buffers lookahead internally, so output bytes do not line up with
//! input frames. A reader thread drains stdout into an unbounded channel so a
//! full stdout pipe can never stall the stdin writer.

use std::ffi::OsStr;
use std::io::{ErrorKind as IoErrorKind, Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};

use crate::encoder::{Codec, Drained, EncoderBackend, EncoderBackendKind, EncoderSettings};
use crate::errors::EncodeError;
use crate::frame::{EncodedChunk, Frame};

const READ_BUF_SIZE: usize = 64 * 1024;
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// ffmpeg `-c:v` name for a backend/codec pair
pub fn codec_name(kind: EncoderBackendKind, codec: Codec) -> &'static str {
    match (kind, codec) {
        (EncoderBackendKind::FfmpegNvenc, Codec::H264) => "h264_nvenc",
        (EncoderBackendKind::FfmpegNvenc, Codec::H265) => "hevc_nvenc",
        (_, Codec::H264) => "libx264",
        (_, Codec::H265) => "libx265",
    }
}

/// Build the ffmpeg invocation for `settings`.
pub fn ffmpeg_command(kind: EncoderBackendKind, settings: &EncoderSettings) -> Command {
    let mut cmd = Command::new("ffmpeg");
    cmd.arg("-hide_banner")
        .arg("-loglevel")
        .arg("error")
        .arg("-f")
        .arg("rawvideo")
        .arg("-pix_fmt")
        .arg(settings.input_format.ffmpeg_name())
        .arg("-s")
        .arg(format!("{}x{}", settings.width, settings.height))
        .arg("-r")
        .arg(settings.framerate_hz.to_string())
        .arg("-i")
        .arg("-")
        .arg("-an")
        .arg("-c:v")
        .arg(codec_name(kind, settings.codec));

    if !settings.preset.is_empty() {
        cmd.arg("-preset").arg(&settings.preset);
    }

    if settings.lossless {
        match (kind, settings.codec) {
            (EncoderBackendKind::FfmpegNvenc, _) => {
                cmd.arg("-rc").arg("constqp").arg("-qp").arg("0");
            }
            (_, Codec::H265) => {
                cmd.arg("-x265-params").arg("lossless=1");
            }
            (_, Codec::H264) => {
                cmd.arg("-qp").arg("0");
            }
        }
    } else {
        cmd.arg("-b:v").arg(settings.bitrate_bps.to_string());
    }

    cmd.arg("-flush_packets")
        .arg("1")
        .arg("-f")
        .arg(settings.codec.elementary_format())
        .arg("-");
    cmd
}

pub struct PipeEncoder {
    name: &'static str,
    program: String,
    child: Child,
    stdin: Option<ChildStdin>,
    output: Receiver<Result<Vec<u8>, String>>,
    reader: Option<JoinHandle<()>>,
}

impl PipeEncoder {
    /// Launch ffmpeg for `kind`.
    pub fn launch(kind: EncoderBackendKind, settings: &EncoderSettings) -> Result<Self, EncodeError> {
        Self::spawn(ffmpeg_command(kind, settings), codec_name(kind, settings.codec))
    }

    /// Run any filter that reads frames on stdin and writes a bitstream on stdout.
    pub fn spawn(mut cmd: Command, name: &'static str) -> Result<Self, EncodeError> {
        let program = cmd.get_program().to_string_lossy().into_owned();
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit());

        let mut child = cmd
            .spawn()
            .map_err(|e| EncodeError::DeviceError(format!("failed to launch {program}: {e}")))?;
        let stdin = child.stdin.take();
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| EncodeError::DeviceError(format!("{program} has no stdout")))?;

        let (tx, rx) = unbounded();
        let reader = thread::Builder::new()
            .name("acquire-video-encoder-reader".to_string())
            .spawn(move || read_loop(stdout, tx))
            .map_err(|e| EncodeError::DeviceError(format!("spawn failed: {e}")))?;

        log::debug!(
            "Started encoder process {} {:?}",
            program,
            cmd.get_args().collect::<Vec<&OsStr>>()
        );

        Ok(Self {
            name,
            program,
            child,
            stdin,
            output: rx,
            reader: Some(reader),
        })
    }

    fn exit_error(&mut self) -> EncodeError {
        match self.child.wait() {
            Ok(status) => EncodeError::DeviceError(format!("{} exited ({status})", self.program)),
            Err(e) => EncodeError::DeviceError(format!("{} lost: {e}", self.program)),
        }
    }

    fn drain_ready(&self) -> Result<Vec<EncodedChunk>, EncodeError> {
        let mut chunks = Vec::new();
        while let Ok(read) = self.output.try_recv() {
            chunks.push(EncodedChunk::new(read.map_err(EncodeError::DeviceError)?));
        }
        Ok(chunks)
    }
}

fn read_loop(mut stdout: impl Read, tx: Sender<Result<Vec<u8>, String>>) {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        match stdout.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                if tx.send(Ok(buf[..n].to_vec())).is_err() {
                    break;
                }
            }
            Err(e) if e.kind() == IoErrorKind::Interrupted => continue,
            Err(e) => {
                let _ = tx.send(Err(e.to_string()));
                break;
            }
        }
    }
}

impl EncoderBackend for PipeEncoder {
    fn name(&self) -> &'static str {
        self.name
    }

    fn frame_aligned(&self) -> bool {
        false
    }

    fn encode(&mut self, frame: &Frame) -> Result<Vec<EncodedChunk>, EncodeError> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(EncodeError::DeviceError("encoder input closed".to_string()));
        };
        if let Err(e) = stdin.write_all(frame.data()) {
            self.stdin = None;
            if e.kind() == IoErrorKind::BrokenPipe {
                return Err(self.exit_error());
            }
            return Err(EncodeError::DeviceError(e.to_string()));
        }
        self.drain_ready()
    }

    fn flush(&mut self) -> Drained {
        // EOF on stdin tells the encoder to emit everything it holds.
        drop(self.stdin.take());

        let mut chunks = Vec::new();
        loop {
            match self.output.recv_timeout(DRAIN_TIMEOUT) {
                Ok(Ok(data)) => chunks.push(EncodedChunk::new(data)),
                Ok(Err(e)) => return Drained::failed(chunks, EncodeError::DeviceError(e)),
                Err(RecvTimeoutError::Disconnected) => break,
                Err(RecvTimeoutError::Timeout) => {
                    let _ = self.child.kill();
                    let err = EncodeError::DeviceError(format!(
                        "{} did not finish within {DRAIN_TIMEOUT:?}",
                        self.program
                    ));
                    return Drained::failed(chunks, err);
                }
            }
        }
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }

        // The exit status is reported after the bytes already read.
        match self.child.wait() {
            Ok(status) if status.success() => Drained::complete(chunks),
            Ok(status) => Drained::failed(
                chunks,
                EncodeError::DeviceError(format!("{} exited ({status})", self.program)),
            ),
            Err(e) => Drained::failed(chunks, EncodeError::DeviceError(e.to_string())),
        }
    }
}

impl Drop for PipeEncoder {
    fn drop(&mut self) {
        if self.stdin.take().is_some() {
            // Never flushed: the session was torn down abnormally.
            let _ = self.child.kill();
        }
        let _ = self.child.wait();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::PixelFormat;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args().map(|a| a.to_string_lossy().into_owned()).collect()
    }

    #[test]
    fn test_command_shape() {
        let settings = EncoderSettings::new(640, 480, PixelFormat::Nv12)
            .with_codec(Codec::H265)
            .with_preset("p4");
        let cmd = ffmpeg_command(EncoderBackendKind::FfmpegNvenc, &settings);
        let args = args(&cmd).join(" ");
        assert!(args.contains("-pix_fmt nv12 -s 640x480 -r 30 -i -"));
        assert!(args.contains("-c:v hevc_nvenc -preset p4 -b:v 4000000"));
        assert!(args.ends_with("-f hevc -"));
    }

    #[test]
    fn test_lossless_uses_constant_qp() {
        let settings = EncoderSettings::new(64, 64, PixelFormat::Yuv420).with_lossless(true);
        let args = args(&ffmpeg_command(EncoderBackendKind::Ffmpeg, &settings)).join(" ");
        assert!(args.contains("-c:v libx264"));
        assert!(args.contains("-qp 0"));
        assert!(!args.contains("-b:v"));
    }

    #[cfg(unix)]
    #[test]
    fn test_cat_passthrough_preserves_bytes() {
        let mut enc = PipeEncoder::spawn(Command::new("cat"), "cat").unwrap();
        let mut out = Vec::new();
        for seq in 1..=5u8 {
            let frame = Frame::new(2, 2, PixelFormat::Gray8, vec![seq; 4], seq as u64);
            for c in enc.encode(&frame).unwrap() {
                out.extend_from_slice(&c.data);
            }
        }
        for c in enc.flush().into_result().unwrap() {
            out.extend_from_slice(&c.data);
        }
        let expected: Vec<u8> = (1..=5u8).flat_map(|s| [s; 4]).collect();
        assert_eq!(out, expected);
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_process_reports_device_error() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat >/dev/null; exit 3");
        let mut enc = PipeEncoder::spawn(cmd, "sh").unwrap();
        let drained = enc.flush();
        assert!(drained.chunks.is_empty());
        assert!(matches!(drained.error, Some(EncodeError::DeviceError(_))));
    }

    #[cfg(unix)]
    #[test]
    fn test_failing_process_keeps_emitted_tail() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat >/dev/null; printf ENCODED_TAIL; exit 3");
        let mut enc = PipeEncoder::spawn(cmd, "sh").unwrap();
        let frame = Frame::new(2, 2, PixelFormat::Gray8, vec![7; 4], 1);
        let mut out: Vec<u8> = enc
            .encode(&frame)
            .unwrap()
            .iter()
            .flat_map(|c| c.data.to_vec())
            .collect();

        let drained = enc.flush();
        for c in &drained.chunks {
            out.extend_from_slice(&c.data);
        }
        assert_eq!(out, b"ENCODED_TAIL");
        match drained.error {
            Some(EncodeError::DeviceError(msg)) => assert!(msg.contains("exit status: 3"), "{msg}"),
            other => panic!("expected exit error, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_program() {
        let result = PipeEncoder::spawn(Command::new("acquire-video-no-such-encoder"), "none");
        assert!(matches!(result, Err(EncodeError::DeviceError(_))));
    }
}
