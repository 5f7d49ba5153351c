//! Transcoder adapter (C3): produces audio and/or video artifacts from a
//! fetched source file via an external subprocess (e.g. an `ffmpeg`-style
//! tool). Mirrors the [`crate::fetcher`] adapter shape: a trait for the
//! contract, a process-backed implementation, and an in-memory fake for
//! tests.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::{TranscodeConfig, VideoCodec};
use crate::errors::AppError;

#[derive(Debug, Clone)]
pub struct TranscodeResult {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub duration_elapsed: Duration,
    pub output_path: PathBuf,
    pub output_file_size: u64,
}

#[derive(Debug, Clone)]
pub struct MediaInfo {
    pub duration_seconds: Option<f64>,
    pub has_audio: bool,
    pub has_video: bool,
}

#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn transcode_audio(
        &self,
        input: &Path,
        output: &Path,
        config: &TranscodeConfig,
        cancel: &CancellationToken,
    ) -> Result<TranscodeResult, AppError>;

    async fn transcode_video(
        &self,
        input: &Path,
        output: &Path,
        config: &TranscodeConfig,
        cancel: &CancellationToken,
    ) -> Result<TranscodeResult, AppError>;

    async fn probe_media_info(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, AppError>;
}

pub struct ProcessTranscoder {
    binary: String,
    probe_binary: String,
    transcode_timeout: Duration,
    probe_timeout: Duration,
    kill_grace: Duration,
}

impl ProcessTranscoder {
    pub fn new(
        binary: impl Into<String>,
        probe_binary: impl Into<String>,
        transcode_timeout: Duration,
        probe_timeout: Duration,
    ) -> Self {
        Self {
            binary: binary.into(),
            probe_binary: probe_binary.into(),
            transcode_timeout,
            probe_timeout,
            kill_grace: Duration::from_secs(5),
        }
    }

    async fn run(
        &self,
        binary: &str,
        args: &[String],
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<(bool, Option<i32>, Duration), AppError> {
        let started = Instant::now();
        let mut child = Command::new(binary)
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::TranscodeError(format!("spawn {binary} failed: {e}")))?;

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill_with_grace(&mut child, self.kill_grace).await;
                return Err(AppError::Cancelled);
            }
            result = tokio::time::timeout(timeout, child.wait()) => {
                match result {
                    Err(_) => {
                        kill_with_grace(&mut child, self.kill_grace).await;
                        return Err(AppError::TranscodeTimeout(timeout));
                    }
                    Ok(Ok(status)) => {
                        return Ok((status.success(), status.code(), started.elapsed()));
                    }
                    Ok(Err(e)) => return Err(AppError::TranscodeError(e.to_string())),
                }
            }
        }
    }
}

async fn kill_with_grace(child: &mut tokio::process::Child, grace: Duration) {
    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        let _ = child.kill().await;
    }
}

fn video_codec_flag(codec: VideoCodec) -> &'static str {
    match codec {
        VideoCodec::H264 => "libx264",
        VideoCodec::H265 => "libx265",
        VideoCodec::Vp9 => "libvpx-vp9",
        VideoCodec::Av1 => "libaom-av1",
    }
}

#[async_trait]
impl Transcoder for ProcessTranscoder {
    async fn transcode_audio(
        &self,
        input: &Path,
        output: &Path,
        config: &TranscodeConfig,
        cancel: &CancellationToken,
    ) -> Result<TranscodeResult, AppError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-ac".to_string(),
            "2".to_string(),
            "-ar".to_string(),
            config.audio_sample_rate_hz.to_string(),
            "-b:a".to_string(),
            format!("{}k", config.audio_bitrate_kbps),
            output.to_string_lossy().to_string(),
        ];
        let (success, exit_code, elapsed) = self
            .run(&self.binary, &args, self.transcode_timeout, cancel)
            .await?;
        finish(success, exit_code, elapsed, output).await
    }

    async fn transcode_video(
        &self,
        input: &Path,
        output: &Path,
        config: &TranscodeConfig,
        cancel: &CancellationToken,
    ) -> Result<TranscodeResult, AppError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let args = vec![
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-c:v".to_string(),
            video_codec_flag(config.video_codec).to_string(),
            "-preset".to_string(),
            "medium".to_string(),
            "-crf".to_string(),
            config.video_quality.to_string(),
            output.to_string_lossy().to_string(),
        ];
        let (success, exit_code, elapsed) = self
            .run(&self.binary, &args, self.transcode_timeout, cancel)
            .await?;
        finish(success, exit_code, elapsed, output).await
    }

    async fn probe_media_info(
        &self,
        input: &Path,
        cancel: &CancellationToken,
    ) -> Result<MediaInfo, AppError> {
        let args = vec![
            "-v".to_string(),
            "quiet".to_string(),
            "-print_format".to_string(),
            "json".to_string(),
            "-show_streams".to_string(),
            input.to_string_lossy().to_string(),
        ];
        let mut child = Command::new(&self.probe_binary)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| AppError::TranscodeError(format!("spawn {} failed: {e}", self.probe_binary)))?;

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                kill_with_grace(&mut child, self.kill_grace).await;
                return Err(AppError::Cancelled);
            }
            result = tokio::time::timeout(self.probe_timeout, child.wait_with_output()) => {
                match result {
                    Err(_) => return Err(AppError::FetchTimeout(self.probe_timeout)),
                    Ok(Ok(output)) => output,
                    Ok(Err(e)) => return Err(AppError::TranscodeError(e.to_string())),
                }
            }
        };

        if !output.status.success() {
            return Err(AppError::TranscodeError(format!(
                "{} exited with {}",
                self.probe_binary, output.status
            )));
        }

        let parsed: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| AppError::ParseError(e.to_string()))?;
        let streams = parsed
            .get("streams")
            .and_then(|s| s.as_array())
            .cloned()
            .unwrap_or_default();
        let has_audio = streams
            .iter()
            .any(|s| s.get("codec_type").and_then(|t| t.as_str()) == Some("audio"));
        let has_video = streams
            .iter()
            .any(|s| s.get("codec_type").and_then(|t| t.as_str()) == Some("video"));
        let duration_seconds = streams
            .iter()
            .find_map(|s| s.get("duration").and_then(|d| d.as_str()))
            .and_then(|d| d.parse::<f64>().ok());

        Ok(MediaInfo {
            duration_seconds,
            has_audio,
            has_video,
        })
    }
}

async fn finish(
    success: bool,
    exit_code: Option<i32>,
    elapsed: Duration,
    output: &Path,
) -> Result<TranscodeResult, AppError> {
    if !success {
        return Err(AppError::TranscodeError(format!(
            "transcoder exited with {exit_code:?}"
        )));
    }
    let metadata = tokio::fs::metadata(output).await?;
    Ok(TranscodeResult {
        success,
        exit_code,
        duration_elapsed: elapsed,
        output_path: output.to_path_buf(),
        output_file_size: metadata.len(),
    })
}

/// An in-process fake that writes a fixed byte payload instead of invoking
/// `ffmpeg`, so pipeline tests never touch a real media toolchain.
#[cfg(any(test, feature = "test-fakes"))]
pub mod fake {
    use super::*;
    use tokio::sync::Mutex;

    pub struct FakeTranscoder {
        pub fail_audio: Mutex<bool>,
        pub fail_video: Mutex<bool>,
    }

    impl Default for FakeTranscoder {
        fn default() -> Self {
            Self {
                fail_audio: Mutex::new(false),
                fail_video: Mutex::new(false),
            }
        }
    }

    impl FakeTranscoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn fail_next_audio(&self) {
            *self.fail_audio.lock().await = true;
        }
    }

    async fn write_fake(output: &Path) -> Result<TranscodeResult, AppError> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = b"fake-transcoded-bytes";
        tokio::fs::write(output, payload).await?;
        Ok(TranscodeResult {
            success: true,
            exit_code: Some(0),
            duration_elapsed: Duration::from_millis(1),
            output_path: output.to_path_buf(),
            output_file_size: payload.len() as u64,
        })
    }

    #[async_trait]
    impl Transcoder for FakeTranscoder {
        async fn transcode_audio(
            &self,
            _input: &Path,
            output: &Path,
            _config: &TranscodeConfig,
            _cancel: &CancellationToken,
        ) -> Result<TranscodeResult, AppError> {
            if std::mem::take(&mut *self.fail_audio.lock().await) {
                return Err(AppError::TranscodeError("scripted failure".to_string()));
            }
            write_fake(output).await
        }

        async fn transcode_video(
            &self,
            _input: &Path,
            output: &Path,
            _config: &TranscodeConfig,
            _cancel: &CancellationToken,
        ) -> Result<TranscodeResult, AppError> {
            if std::mem::take(&mut *self.fail_video.lock().await) {
                return Err(AppError::TranscodeError("scripted failure".to_string()));
            }
            write_fake(output).await
        }

        async fn probe_media_info(
            &self,
            _input: &Path,
            _cancel: &CancellationToken,
        ) -> Result<MediaInfo, AppError> {
            Ok(MediaInfo {
                duration_seconds: Some(120.0),
                has_audio: true,
                has_video: true,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::FakeTranscoder;
    use super::*;
    use crate::config::TranscodeConfig;
    use tempfile::tempdir;

    #[tokio::test]
    async fn fake_transcoder_writes_output_file() {
        let transcoder = FakeTranscoder::new();
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.raw");
        let output = dir.path().join("out.mp3");
        tokio::fs::write(&input, b"x").await.unwrap();

        let cancel = CancellationToken::new();
        let result = transcoder
            .transcode_audio(&input, &output, &TranscodeConfig::default(), &cancel)
            .await
            .unwrap();
        assert!(result.success);
        assert!(output.exists());
        assert_eq!(result.output_file_size, output.metadata().unwrap().len());
    }

    #[tokio::test]
    async fn fake_transcoder_honours_scripted_failure() {
        let transcoder = FakeTranscoder::new();
        let dir = tempdir().unwrap();
        let input = dir.path().join("in.raw");
        let output = dir.path().join("out.mp3");
        tokio::fs::write(&input, b"x").await.unwrap();
        transcoder.fail_next_audio().await;

        let cancel = CancellationToken::new();
        let err = transcoder
            .transcode_audio(&input, &output, &TranscodeConfig::default(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::TranscodeError(_)));
    }
}
