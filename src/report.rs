//! Metric sinks selected with `--report_to`.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::{json, Map, Value};
use tracing::info;

use crate::config::ReportTo;

/// Metric name to value, e.g. `loss`, `rewards/margins`, `eval_loss`.
pub type Metrics = BTreeMap<String, f64>;

pub trait Reporter {
    fn name(&self) -> &'static str;

    fn log(&mut self, step: usize, epoch: f64, metrics: &Metrics) -> Result<()>;

    fn finish(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Appends one JSON object per call to `<output_dir>/metrics.jsonl`.
pub struct JsonlReporter {
    path: PathBuf,
    run_name: String,
    writer: BufWriter<File>,
}

impl JsonlReporter {
    pub const FILE_NAME: &'static str = "metrics.jsonl";

    pub fn create(output_dir: &Path, run_name: &str) -> Result<Self> {
        std::fs::create_dir_all(output_dir)
            .with_context(|| format!("failed to create {}", output_dir.display()))?;
        let path = output_dir.join(Self::FILE_NAME);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        Ok(Self {
            path,
            run_name: run_name.to_string(),
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Reporter for JsonlReporter {
    fn name(&self) -> &'static str {
        ReportTo::Jsonl.as_str()
    }

    fn log(&mut self, step: usize, epoch: f64, metrics: &Metrics) -> Result<()> {
        let mut record = Map::new();
        record.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        record.insert("run_name".into(), json!(self.run_name));
        record.insert("step".into(), json!(step));
        record.insert("epoch".into(), json!(epoch));
        for (key, value) in metrics {
            // NaN and infinities have no JSON representation.
            let value = if value.is_finite() { json!(value) } else { Value::Null };
            record.insert(key.clone(), value);
        }
        serde_json::to_writer(&mut self.writer, &Value::Object(record))?;
        self.writer.write_all(b"\n")?;
        self.writer
            .flush()
            .with_context(|| format!("failed to write {}", self.path.display()))
    }
}

/// Emits every logged step as an `info!` event.
pub struct TracingReporter {
    run_name: String,
}

impl TracingReporter {
    pub fn new(run_name: &str) -> Self {
        Self {
            run_name: run_name.to_string(),
        }
    }
}

impl Reporter for TracingReporter {
    fn name(&self) -> &'static str {
        ReportTo::Tracing.as_str()
    }

    fn log(&mut self, step: usize, epoch: f64, metrics: &Metrics) -> Result<()> {
        let rendered = metrics
            .iter()
            .map(|(k, v)| format!("{k}={v:.6}"))
            .collect::<Vec<_>>()
            .join(" ");
        info!(run = %self.run_name, step, epoch = format!("{epoch:.2}"), "{rendered}");
        Ok(())
    }
}

/// Build the sinks named in an already-expanded `report_to` list.
pub fn build_reporters(
    sinks: &[ReportTo],
    output_dir: &Path,
    run_name: &str,
) -> Result<Vec<Box<dyn Reporter>>> {
    let mut reporters: Vec<Box<dyn Reporter>> = Vec::with_capacity(sinks.len());
    for sink in sinks {
        match sink {
            ReportTo::Jsonl => reporters.push(Box::new(JsonlReporter::create(output_dir, run_name)?)),
            ReportTo::Tracing => reporters.push(Box::new(TracingReporter::new(run_name))),
            // Expanded away during config resolution.
            ReportTo::None | ReportTo::All => {}
        }
    }
    Ok(reporters)
}
