//! Collaborators driven by the scheduler: camera, captioning/training engine,
//! status renderer, display link and the "alive" LED.
//!
//! The command-backed implementations run `sh -c <command>`, pass binary
//! input on stdin and text parameters through `LIESMESH_*` environment
//! variables, and read their result from stdout.

use crate::config::{CameraConfig, DevicesConfig, DisplayConfig};
use async_trait::async_trait;
use bytes::Bytes;
use std::io;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum DeviceError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("`{command}` exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: ExitStatus,
        stderr: String,
    },
    #[error("Invalid output from {what}: {reason}")]
    InvalidOutput { what: String, reason: String },
}

/// A rendered status image, ready for the display link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap(pub Bytes);

impl Bitmap {
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

#[async_trait]
pub trait Camera: Send + Sync {
    /// Grabs one encoded frame, or `None` if the sensor produced nothing.
    async fn capture(&self) -> Result<Option<Bytes>, DeviceError>;
}

#[async_trait]
pub trait Engine: Send + Sync {
    async fn infer(&self, image: &[u8], prompt: &str) -> Result<String, DeviceError>;
    /// Fine-tunes on one (image, description) pair and returns the final loss.
    async fn train(&self, image: &[u8], description: &str, steps: u32)
        -> Result<f32, DeviceError>;
    async fn persist(&self) -> Result<(), DeviceError>;
}

#[async_trait]
pub trait Renderer: Send + Sync {
    async fn render(&self, text: &str) -> Result<Bitmap, DeviceError>;
}

#[async_trait]
pub trait Display: Send + Sync {
    async fn transmit(&self, bitmap: &Bitmap) -> Result<(), DeviceError>;
}

#[async_trait]
pub trait Indicator: Send + Sync {
    /// Blocks for `duration`, signalling liveness while it waits.
    async fn pulse(&self, duration: Duration) -> Result<(), DeviceError>;
}

/// Every collaborator the scheduler needs for one tick.
pub struct Devices {
    pub camera: Box<dyn Camera>,
    pub engine: Box<dyn Engine>,
    pub renderer: Box<dyn Renderer>,
    pub display: Box<dyn Display>,
    pub indicator: Box<dyn Indicator>,
}

impl Devices {
    pub fn from_config(config: &DevicesConfig) -> Self {
        let camera: Box<dyn Camera> = match &config.camera {
            CameraConfig::File { path } => Box::new(FileCamera { path: path.clone() }),
            CameraConfig::Command { command } => Box::new(CommandCamera {
                command: command.clone(),
            }),
        };
        let display: Box<dyn Display> = match &config.display {
            DisplayConfig::Serial { path } => Box::new(SerialDisplay { path: path.clone() }),
            DisplayConfig::Log => Box::new(LogDisplay),
        };
        let indicator: Box<dyn Indicator> = match &config.led {
            Some(led) => Box::new(LedIndicator {
                path: led.path.clone(),
            }),
            None => Box::new(SleepIndicator),
        };

        Self {
            camera,
            engine: Box::new(CommandEngine {
                infer_command: config.engine.infer_command.clone(),
                train_command: config.engine.train_command.clone(),
                persist_command: config.engine.persist_command.clone(),
            }),
            renderer: Box::new(CommandRenderer {
                command: config.render_command.clone(),
            }),
            display,
            indicator,
        }
    }
}

struct CommandOutput {
    status: ExitStatus,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn into_success(self, command: &str) -> Result<Vec<u8>, DeviceError> {
        if !self.status.success() {
            return Err(DeviceError::CommandFailed {
                command: command.to_string(),
                status: self.status,
                stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
            });
        }
        Ok(self.stdout)
    }
}

async fn run_command(
    command: &str,
    input: Option<&[u8]>,
    env: &[(&str, String)],
) -> Result<CommandOutput, DeviceError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;
    let stdin = child.stdin.take();

    let write = async move {
        if let (Some(mut stdin), Some(data)) = (stdin, input) {
            match stdin.write_all(data).await {
                // The program may exit without reading its input.
                Err(e) if e.kind() != io::ErrorKind::BrokenPipe => return Err(e),
                _ => {}
            }
        }
        Ok(())
    };
    let (written, output) = tokio::join!(write, child.wait_with_output());
    let output = output?;
    written?;

    Ok(CommandOutput {
        status: output.status,
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Reads a still image from disk on every capture.
pub struct FileCamera {
    pub path: PathBuf,
}

#[async_trait]
impl Camera for FileCamera {
    async fn capture(&self) -> Result<Option<Bytes>, DeviceError> {
        match tokio::fs::read(&self.path).await {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                warn!("Capture file {} not found", self.path.display());
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

/// Runs a capture program; its stdout is the frame.
pub struct CommandCamera {
    pub command: String,
}

#[async_trait]
impl Camera for CommandCamera {
    async fn capture(&self) -> Result<Option<Bytes>, DeviceError> {
        let output = run_command(&self.command, None, &[]).await?;
        if !output.status.success() {
            warn!(
                "Capture command exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
            return Ok(None);
        }
        if output.stdout.is_empty() {
            return Ok(None);
        }
        Ok(Some(Bytes::from(output.stdout)))
    }
}

pub struct CommandEngine {
    pub infer_command: String,
    pub train_command: String,
    pub persist_command: String,
}

#[async_trait]
impl Engine for CommandEngine {
    async fn infer(&self, image: &[u8], prompt: &str) -> Result<String, DeviceError> {
        let env = [("LIESMESH_PROMPT", prompt.to_string())];
        let stdout = run_command(&self.infer_command, Some(image), &env)
            .await?
            .into_success(&self.infer_command)?;
        let caption = String::from_utf8(stdout).map_err(|e| DeviceError::InvalidOutput {
            what: self.infer_command.clone(),
            reason: e.to_string(),
        })?;
        Ok(caption.trim().to_string())
    }

    async fn train(
        &self,
        image: &[u8],
        description: &str,
        steps: u32,
    ) -> Result<f32, DeviceError> {
        let env = [
            ("LIESMESH_DESCRIPTION", description.to_string()),
            ("LIESMESH_STEPS", steps.to_string()),
        ];
        let stdout = run_command(&self.train_command, Some(image), &env)
            .await?
            .into_success(&self.train_command)?;

        let text = String::from_utf8_lossy(&stdout);
        let last = text.lines().rev().find(|l| !l.trim().is_empty()).unwrap_or("");
        last.trim()
            .parse::<f32>()
            .map_err(|e| DeviceError::InvalidOutput {
                what: self.train_command.clone(),
                reason: format!("expected a loss value, got {:?}: {}", last, e),
            })
    }

    async fn persist(&self) -> Result<(), DeviceError> {
        run_command(&self.persist_command, None, &[])
            .await?
            .into_success(&self.persist_command)?;
        Ok(())
    }
}

/// Runs a render program with the text in `LIESMESH_TEXT`; stdout is the bitmap.
pub struct CommandRenderer {
    pub command: String,
}

#[async_trait]
impl Renderer for CommandRenderer {
    async fn render(&self, text: &str) -> Result<Bitmap, DeviceError> {
        let env = [("LIESMESH_TEXT", text.to_string())];
        let stdout = run_command(&self.command, None, &env)
            .await?
            .into_success(&self.command)?;
        let bitmap = Bitmap(Bytes::from(stdout));
        if bitmap.is_empty() {
            return Err(DeviceError::InvalidOutput {
                what: self.command.clone(),
                reason: "empty bitmap".to_string(),
            });
        }
        Ok(bitmap)
    }
}

/// Pushes bitmaps down a serial link as `[u32 BE length][bytes]`.
pub struct SerialDisplay {
    pub path: PathBuf,
}

#[async_trait]
impl Display for SerialDisplay {
    async fn transmit(&self, bitmap: &Bitmap) -> Result<(), DeviceError> {
        let len = u32::try_from(bitmap.len()).map_err(|_| DeviceError::InvalidOutput {
            what: self.path.display().to_string(),
            reason: format!("bitmap of {} bytes does not fit a u32 length", bitmap.len()),
        })?;

        let mut port = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&self.path)
            .await?;
        port.write_all(&len.to_be_bytes()).await?;
        port.write_all(&bitmap.0).await?;
        port.flush().await?;
        debug!("Sent {} byte bitmap to {}", len, self.path.display());
        Ok(())
    }
}

/// Stand-in display for devices without a panel.
pub struct LogDisplay;

#[async_trait]
impl Display for LogDisplay {
    async fn transmit(&self, bitmap: &Bitmap) -> Result<(), DeviceError> {
        info!("Display frame: {} bytes", bitmap.len());
        Ok(())
    }
}

/// Blinks an LED through a sysfs value file, faster as the wait runs out.
pub struct LedIndicator {
    pub path: PathBuf,
}

/// Half-period of the blink when `remaining` of `total` is left.
fn blink_delay(remaining: Duration, total: Duration) -> Duration {
    if total.is_zero() {
        return Duration::ZERO;
    }
    let ratio = remaining.as_secs_f64() / total.as_secs_f64();
    Duration::from_secs_f64(0.5 * ratio).max(Duration::from_millis(50))
}

#[async_trait]
impl Indicator for LedIndicator {
    async fn pulse(&self, duration: Duration) -> Result<(), DeviceError> {
        let end = Instant::now() + duration;
        loop {
            let now = Instant::now();
            if now >= end {
                break;
            }
            let delay = blink_delay(end - now, duration);

            tokio::fs::write(&self.path, b"1").await?;
            tokio::time::sleep_until((now + delay).min(end)).await;
            tokio::fs::write(&self.path, b"0").await?;
            tokio::time::sleep_until((now + 2 * delay).min(end)).await;
        }
        Ok(())
    }
}

pub struct SleepIndicator;

#[async_trait]
impl Indicator for SleepIndicator {
    async fn pulse(&self, duration: Duration) -> Result<(), DeviceError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(infer: &str, train: &str, persist: &str) -> CommandEngine {
        CommandEngine {
            infer_command: infer.to_string(),
            train_command: train.to_string(),
            persist_command: persist.to_string(),
        }
    }

    #[tokio::test]
    async fn test_infer_reads_prompt_and_image() {
        let e = engine(
            r#"n=$(wc -c); printf '  %s (%s bytes)\n' "$LIESMESH_PROMPT" $n"#,
            "true",
            "true",
        );
        let caption = e.infer(&[0u8; 300], "describe").await.unwrap();
        assert_eq!(caption, "describe (300 bytes)");
    }

    #[tokio::test]
    async fn test_train_parses_last_line() {
        let e = engine(
            "true",
            r#"cat >/dev/null; echo "steps=$LIESMESH_STEPS"; echo "$LIESMESH_DESCRIPTION" >&2; echo 0.25; echo"#,
            "true",
        );
        let loss = e.train(b"img", "a dog", 3).await.unwrap();
        assert!((loss - 0.25).abs() < f32::EPSILON);
    }

    #[tokio::test]
    async fn test_train_garbage_output() {
        let e = engine("true", "echo not-a-number", "true");
        let err = e.train(b"img", "x", 1).await.unwrap_err();
        assert!(matches!(err, DeviceError::InvalidOutput { .. }));
    }

    #[tokio::test]
    async fn test_failing_command() {
        let e = engine("echo broken >&2; exit 3", "true", "exit 1");
        match e.infer(b"img", "p").await.unwrap_err() {
            DeviceError::CommandFailed { status, stderr, .. } => {
                assert_eq!(status.code(), Some(3));
                assert_eq!(stderr, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(e.persist().await.is_err());
    }

    #[tokio::test]
    async fn test_large_input_to_non_reader() {
        // A program that ignores stdin must not wedge the writer.
        let e = engine("echo ignored", "true", "true");
        let caption = e.infer(&vec![1u8; 4 * 1024 * 1024], "p").await.unwrap();
        assert_eq!(caption, "ignored");
    }

    #[tokio::test]
    async fn test_command_camera() {
        let cam = CommandCamera {
            command: "printf frame".to_string(),
        };
        assert_eq!(cam.capture().await.unwrap().unwrap().as_ref(), b"frame");

        let cam = CommandCamera {
            command: "exit 1".to_string(),
        };
        assert!(cam.capture().await.unwrap().is_none());

        let cam = CommandCamera {
            command: "true".to_string(),
        };
        assert!(cam.capture().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_camera() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.jpg");

        let cam = FileCamera { path: path.clone() };
        assert!(cam.capture().await.unwrap().is_none());

        std::fs::write(&path, b"\xff\xd8jpeg").unwrap();
        assert_eq!(cam.capture().await.unwrap().unwrap().as_ref(), b"\xff\xd8jpeg");
    }

    #[tokio::test]
    async fn test_renderer() {
        let r = CommandRenderer {
            command: r#"printf '%s' "$LIESMESH_TEXT""#.to_string(),
        };
        assert_eq!(r.render("hello").await.unwrap().0.as_ref(), b"hello");

        let r = CommandRenderer {
            command: "true".to_string(),
        };
        assert!(r.render("hello").await.is_err());
    }

    #[tokio::test]
    async fn test_serial_display_framing() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let display = SerialDisplay {
            path: file.path().to_path_buf(),
        };
        display
            .transmit(&Bitmap(Bytes::from_static(&[0xAA; 12480])))
            .await
            .unwrap();

        let written = std::fs::read(file.path()).unwrap();
        assert_eq!(&written[..4], &12480u32.to_be_bytes());
        assert_eq!(written.len(), 4 + 12480);
    }

    #[tokio::test]
    async fn test_serial_display_missing_device() {
        let display = SerialDisplay {
            path: PathBuf::from("/nonexistent/ttyUSB0"),
        };
        let err = display
            .transmit(&Bitmap(Bytes::from_static(b"x")))
            .await
            .unwrap_err();
        assert!(matches!(err, DeviceError::Io(_)));
    }

    #[test]
    fn test_blink_delay() {
        let total = Duration::from_secs(10);
        assert_eq!(blink_delay(total, total), Duration::from_millis(500));
        assert_eq!(
            blink_delay(Duration::from_secs(5), total),
            Duration::from_millis(250)
        );
        assert_eq!(
            blink_delay(Duration::from_millis(100), total),
            Duration::from_millis(50)
        );
        assert_eq!(blink_delay(Duration::ZERO, Duration::ZERO), Duration::ZERO);
    }

    #[tokio::test]
    async fn test_led_ends_off() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let led = LedIndicator {
            path: file.path().to_path_buf(),
        };
        let started = std::time::Instant::now();
        led.pulse(Duration::from_millis(300)).await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(300));
        assert_eq!(std::fs::read(file.path()).unwrap(), b"0");
    }

    #[tokio::test]
    async fn test_sleep_indicator() {
        let started = std::time::Instant::now();
        SleepIndicator
            .pulse(Duration::from_millis(50))
            .await
            .unwrap();
        assert!(started.elapsed() >= Duration::from_millis(50));
    }
}
