use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use csv::Writer;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Appends summaries to `metrics.jsonl` and `metrics.csv` in one directory.
pub struct Logger {
    json: File,
    csv: Writer<File>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricRecord {
    pub step: u64,
    pub loss: f32,
    pub kl_loss: f32,
    pub ml_loss: f32,
    pub learning_rate: f32,
}

impl Logger {
    pub fn new(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let json = OpenOptions::new()
            .create(true)
            .append(true)
            .open(dir.join("metrics.jsonl"))?;
        let csv_path = dir.join("metrics.csv");
        let fresh = std::fs::metadata(&csv_path).map(|m| m.len() == 0).unwrap_or(true);
        let csv_file = OpenOptions::new().create(true).append(true).open(csv_path)?;
        let csv = csv::WriterBuilder::new()
            .has_headers(fresh)
            .from_writer(csv_file);
        Ok(Logger { json, csv })
    }

    pub fn log(&mut self, record: &MetricRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.json, "{}", line)?;
        self.json.flush()?;
        self.csv.serialize(record)?;
        self.csv.flush()?;
        Ok(())
    }
}

/// Read back every record of a `metrics.jsonl` file, skipping blank lines.
pub fn read_metrics(path: &Path) -> Result<Vec<MetricRecord>> {
    let txt = std::fs::read_to_string(path)?;
    let mut records = Vec::new();
    for line in txt.lines().filter(|l| !l.trim().is_empty()) {
        records.push(serde_json::from_str(line)?);
    }
    Ok(records)
}
