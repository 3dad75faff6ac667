//! Step and evaluation reporting through the `log` facade, mirrored into
//! TensorBoard event files when a directory is configured.

use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{
    config::LoggingConfig,
    metrics::{EvaluationSummary, StepSnapshot},
    TrainingError,
};

const LOG_TARGET: &str = "training";

#[derive(Clone, Debug)]
pub struct LoggingSettings {
    pub enable_stdout: bool,
    pub tensorboard_dir: Option<PathBuf>,
    pub tensorboard_flush_every_n: usize,
}

impl From<&LoggingConfig> for LoggingSettings {
    fn from(config: &LoggingConfig) -> Self {
        Self {
            enable_stdout: config.enable_stdout,
            tensorboard_dir: config.tensorboard.clone(),
            tensorboard_flush_every_n: config.tensorboard_flush_every_n.max(1),
        }
    }
}

pub struct Logger {
    settings: LoggingSettings,
    tensorboard: Option<TensorBoardWriter>,
}

impl Logger {
    pub fn new(settings: LoggingSettings) -> Result<Self, TrainingError> {
        let tensorboard = settings
            .tensorboard_dir
            .as_deref()
            .map(|dir| TensorBoardWriter::create(dir, settings.tensorboard_flush_every_n))
            .transpose()?;
        Ok(Self {
            settings,
            tensorboard,
        })
    }

    pub fn event_file(&self) -> Option<&Path> {
        self.tensorboard.as_ref().map(|writer| writer.path.as_path())
    }

    pub fn log_training_step(&mut self, step: usize, lr: f64, loss_scale: f32, snapshot: &StepSnapshot) {
        if self.settings.enable_stdout {
            log::info!(
                target: LOG_TARGET,
                "step {step:>6} | loss {:.4} (ema {:.4}) | tokens {} | tok/s {:.1} | grad {:.3} | lr {lr:.3e}",
                snapshot.step_loss,
                snapshot.loss,
                snapshot.tokens,
                snapshot.step_tokens_per_sec,
                snapshot.raw_grad_norm,
            );
        }

        self.write_scalars(
            step,
            &[
                ("train/loss", snapshot.step_loss),
                ("train/loss_ema", snapshot.loss),
                ("train/tokens_per_sec", snapshot.tokens_per_sec),
                ("train/grad_norm", snapshot.raw_grad_norm),
                ("train/learning_rate", lr),
                ("train/loss_scale", loss_scale as f64),
            ],
        );
    }

    pub fn log_evaluation(&mut self, step: usize, summary: &EvaluationSummary) {
        if self.settings.enable_stdout {
            log::info!(
                target: LOG_TARGET,
                "eval step {step} | loss {:.4} | ppl {:.4} | acc {:.2}% | tokens {}",
                summary.average_loss,
                summary.perplexity,
                summary.accuracy * 100.0,
                summary.tokens
            );
        }

        self.write_scalars(
            step,
            &[
                ("eval/loss", summary.average_loss),
                ("eval/perplexity", summary.perplexity),
                ("eval/accuracy", summary.accuracy),
                ("eval/tokens", summary.tokens as f64),
            ],
        );
    }

    pub fn log_sample(&mut self, step: usize, prompt: &str, completion: &str) {
        if self.settings.enable_stdout {
            log::info!(target: LOG_TARGET, "sample at step {step}\n{prompt}\n{}\n{completion}", "*".repeat(32));
        }
    }

    fn write_scalars(&mut self, step: usize, scalars: &[(&str, f64)]) {
        let Some(writer) = self.tensorboard.as_mut() else {
            return;
        };
        for (tag, value) in scalars {
            if let Err(err) = writer.write_scalar(tag, step as i64, *value) {
                log::warn!(target: LOG_TARGET, "dropping tensorboard scalar {tag}: {err}");
            }
        }
    }

    pub fn flush(&mut self) {
        if let Some(writer) = self.tensorboard.as_mut() {
            if let Err(err) = writer.flush() {
                log::warn!(target: LOG_TARGET, "{err}");
            }
        }
    }
}

/// Appends TFRecord-framed `Event` protos:
/// `len (u64 le) | masked crc(len) | payload | masked crc(payload)`.
struct TensorBoardWriter {
    path: PathBuf,
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!("events.out.tfevents.{}.{}", unix_seconds(), hostname());
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        let mut writer = Self {
            path,
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        };
        writer.write_event(&Event {
            wall_time: wall_time(),
            step: 0,
            file_version: Some("brain.Event:2".to_string()),
            summary: None,
        })?;
        Ok(writer)
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        self.write_event(&Event {
            wall_time: wall_time(),
            step,
            file_version: None,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        })
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(event.encoded_len());
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;
        let payload = buffer.freeze();
        let len_bytes = (payload.len() as u64).to_le_bytes();

        self.writer.write_all(&len_bytes)?;
        self.writer.write_all(&masked_crc32(&len_bytes).to_le_bytes())?;
        self.writer.write_all(&payload)?;
        self.writer.write_all(&masked_crc32(&payload).to_le_bytes())?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!(
                "failed to flush tensorboard file {}: {err}",
                self.path.display()
            ))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn unix_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(string, optional, tag = "3")]
    file_version: Option<String>,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_records(path: &Path) -> Vec<Event> {
        let data = fs::read(path).unwrap();
        let mut events = Vec::new();
        let mut offset = 0;
        while offset < data.len() {
            let len_bytes: [u8; 8] = data[offset..offset + 8].try_into().unwrap();
            let len = u64::from_le_bytes(len_bytes) as usize;
            let len_crc = u32::from_le_bytes(data[offset + 8..offset + 12].try_into().unwrap());
            assert_eq!(len_crc, masked_crc32(&len_bytes));
            let payload = &data[offset + 12..offset + 12 + len];
            let data_crc = u32::from_le_bytes(
                data[offset + 12 + len..offset + 16 + len].try_into().unwrap(),
            );
            assert_eq!(data_crc, masked_crc32(payload));
            events.push(Event::decode(payload).unwrap());
            offset += 16 + len;
        }
        events
    }

    #[test]
    fn masked_crc_matches_reference_value() {
        let crc = crc32fast::hash(b"");
        assert_eq!(crc, 0);
        assert_eq!(masked_crc32(b""), 0xa282_ead8);
    }

    #[test]
    fn writes_framed_scalar_events() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = Logger::new(LoggingSettings {
            enable_stdout: false,
            tensorboard_dir: Some(dir.path().to_path_buf()),
            tensorboard_flush_every_n: 100,
        })
        .unwrap();
        let summary = EvaluationSummary {
            average_loss: 2.0,
            perplexity: 2f64.exp(),
            accuracy: 0.5,
            tokens: 10,
            batches: 1,
        };
        logger.log_evaluation(7, &summary);
        logger.flush();

        let path = logger.event_file().unwrap().to_path_buf();
        let events = read_records(&path);
        assert_eq!(events.len(), 5);
        assert_eq!(events[0].file_version.as_deref(), Some("brain.Event:2"));
        let first = &events[1];
        assert_eq!(first.step, 7);
        let value = &first.summary.as_ref().unwrap().value[0];
        assert_eq!(value.tag, "eval/loss");
        assert_eq!(value.simple_value, Some(2.0));
    }
}
