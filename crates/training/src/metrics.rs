use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::Path,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use serde_json::{json, Map, Value};
use tracing::{info, warn};

use crate::errors::{Result, TrainingError};

/// Flat metrics record keyed by metric name.
pub type MetricsRecord = BTreeMap<String, f64>;

/// Destination for metrics records. Only the main rank owns a sink.
pub trait MetricsSink: Send {
    /// Called once the launch knows its run id, before the first record.
    fn set_run_id(&mut self, _run_id: &str) -> Result<()> {
        Ok(())
    }
    fn log(&mut self, record: &MetricsRecord, step: usize) -> Result<()>;
    fn alert(&mut self, title: &str, text: &str) -> Result<()>;
    fn flush(&mut self) -> Result<()>;
}

/// Emits records as structured `tracing` events.
#[derive(Debug, Default)]
pub struct TracingSink;

impl MetricsSink for TracingSink {
    fn log(&mut self, record: &MetricsRecord, step: usize) -> Result<()> {
        let fields = record
            .iter()
            .map(|(key, value)| format!("{key}={value:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(target: "metrics", step, "{fields}");
        Ok(())
    }

    fn alert(&mut self, title: &str, text: &str) -> Result<()> {
        warn!(target: "metrics", title, "{text}");
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line, `{"step": .., <metrics>}`; alerts are lines
/// with an `alert` key.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
    run_id: Option<String>,
}

impl JsonLinesSink {
    pub fn create(path: &Path, run_id: Option<String>) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|err| {
                TrainingError::initialization(format!(
                    "failed to open metrics file {}: {err}",
                    path.display()
                ))
            })?;
        Ok(Self {
            writer: BufWriter::new(file),
            run_id,
        })
    }

    fn write_line(&mut self, mut object: Map<String, Value>) -> Result<()> {
        if let Some(run_id) = &self.run_id {
            object.insert("run_id".into(), Value::String(run_id.clone()));
        }
        serde_json::to_writer(&mut self.writer, &Value::Object(object))
            .map_err(|err| TrainingError::runtime(format!("failed to encode metrics: {err}")))?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }
}

impl MetricsSink for JsonLinesSink {
    fn set_run_id(&mut self, run_id: &str) -> Result<()> {
        self.run_id = Some(run_id.to_string());
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord, step: usize) -> Result<()> {
        let mut object = Map::new();
        object.insert("step".into(), json!(step));
        for (key, value) in record {
            object.insert(key.clone(), json!(value));
        }
        self.write_line(object)
    }

    fn alert(&mut self, title: &str, text: &str) -> Result<()> {
        let mut object = Map::new();
        object.insert("alert".into(), json!(title));
        object.insert("text".into(), json!(text));
        self.write_line(object)
    }

    fn flush(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

#[derive(Debug, Default, Clone)]
pub struct Recorded {
    pub run_id: Option<String>,
    pub logs: Vec<(usize, MetricsRecord)>,
    pub alerts: Vec<(String, String)>,
    pub flushes: usize,
}

/// In-memory sink; clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    inner: Arc<Mutex<Recorded>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Recorded {
        self.lock().clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Recorded> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl MetricsSink for RecordingSink {
    fn set_run_id(&mut self, run_id: &str) -> Result<()> {
        self.lock().run_id = Some(run_id.to_string());
        Ok(())
    }

    fn log(&mut self, record: &MetricsRecord, step: usize) -> Result<()> {
        self.lock().logs.push((step, record.clone()));
        Ok(())
    }

    fn alert(&mut self, title: &str, text: &str) -> Result<()> {
        self.lock().alerts.push((title.to_string(), text.to_string()));
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.lock().flushes += 1;
        Ok(())
    }
}

/// Wall-clock throughput between consecutive updates.
#[derive(Debug)]
pub struct ThroughputMeter {
    last_update: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Throughput {
    pub update_time: Duration,
    pub tokens_per_sec: f64,
    pub examples_per_sec: f64,
    pub batches_per_sec: f64,
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

impl ThroughputMeter {
    pub fn new() -> Self {
        Self {
            last_update: Instant::now(),
        }
    }

    /// Restarts the clock, e.g. after an evaluation or checkpoint pause.
    pub fn restart(&mut self) {
        self.last_update = Instant::now();
    }

    pub fn record(&mut self, tokens: u64, examples: u64, batches: u64) -> Throughput {
        let now = Instant::now();
        let update_time = now.duration_since(self.last_update);
        self.last_update = now;
        let seconds = update_time.as_secs_f64();
        let rate = |count: u64| {
            if seconds > 0.0 {
                count as f64 / seconds
            } else {
                0.0
            }
        };
        Throughput {
            update_time,
            tokens_per_sec: rate(tokens),
            examples_per_sec: rate(examples),
            batches_per_sec: rate(batches),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record() -> MetricsRecord {
        MetricsRecord::from([("loss".to_string(), 2.5), ("lr".to_string(), 1e-3)])
    }

    #[test]
    fn json_lines_sink_writes_one_object_per_call() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs/metrics.jsonl");
        let mut sink = JsonLinesSink::create(&path, Some("run-1".into())).unwrap();
        sink.log(&record(), 7).unwrap();
        sink.alert("LR too high", "lr=1").unwrap();
        sink.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], 7);
        assert_eq!(lines[0]["loss"], 2.5);
        assert_eq!(lines[0]["run_id"], "run-1");
        assert_eq!(lines[1]["alert"], "LR too high");
    }

    #[test]
    fn json_lines_sink_tags_lines_after_run_id_is_set() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("metrics.jsonl");
        let mut sink = JsonLinesSink::create(&path, None).unwrap();
        sink.log(&record(), 1).unwrap();
        sink.set_run_id("run-2").unwrap();
        sink.log(&record(), 2).unwrap();
        sink.flush().unwrap();

        let contents = fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert!(lines[0].get("run_id").is_none());
        assert_eq!(lines[1]["run_id"], "run-2");
    }

    #[test]
    fn recording_sink_clones_share_buffer() {
        let sink = RecordingSink::new();
        let mut writer = sink.clone();
        writer.log(&record(), 1).unwrap();
        writer.flush().unwrap();
        let recorded = sink.snapshot();
        assert_eq!(recorded.logs.len(), 1);
        assert_eq!(recorded.flushes, 1);
    }

    #[test]
    fn throughput_is_non_negative() {
        let mut meter = ThroughputMeter::new();
        std::thread::sleep(Duration::from_millis(2));
        let throughput = meter.record(100, 4, 2);
        assert!(throughput.update_time >= Duration::from_millis(2));
        assert!(throughput.tokens_per_sec > 0.0);
        assert!(throughput.tokens_per_sec <= 100.0 / 0.002);
    }
}
