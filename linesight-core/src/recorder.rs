//! Append-only results store
//!
//! Rows go to `<results_dir>/results.csv`. Every row is written with one
//! append followed by `sync_data`, so a returned `record` is durable and a
//! concurrent reader sees either the whole row or none of it. Readers only
//! trust newline-terminated rows and never take the writer lock. A failed
//! append is cut back off the file, so a retry never follows a torn row.

use crate::error::{InspectionError, Result};
use crate::types::{CapturedFrame, ClassificationResult, RecordMode, RecordOutcome, ResultRecord};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

pub const RESULTS_FILE: &str = "results.csv";
pub const CSV_HEADER: &str = "record_id,timestamp,mode,image,label,confidence,outcome";
const FIELD_COUNT: usize = 7;

fn storage_err(action: &str, path: &Path, e: impl std::fmt::Display) -> InspectionError {
    InspectionError::Storage(format!("{} {}: {}", action, path.display(), e))
}

/// Append-only file the store writes rows to
#[async_trait]
pub trait StoreFile: Send {
    /// Bytes currently in the file
    async fn committed_len(&mut self) -> std::io::Result<u64>;

    /// Write `bytes` at the end of the file and flush them
    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    async fn sync(&mut self) -> std::io::Result<()>;

    /// Cut the file back to `len` bytes
    async fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

#[async_trait]
impl StoreFile for File {
    async fn committed_len(&mut self) -> std::io::Result<u64> {
        Ok(self.metadata().await?.len())
    }

    async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.write_all(bytes).await?;
        self.flush().await
    }

    async fn sync(&mut self) -> std::io::Result<()> {
        self.sync_data().await
    }

    async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len).await
    }
}

/// Opens the files of a results store
#[async_trait]
pub trait StoreOpener: Send + Sync {
    async fn open_append(&self, path: &Path) -> std::io::Result<Box<dyn StoreFile>>;
}

/// Plain files on the local filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct FileStore;

#[async_trait]
impl StoreOpener for FileStore {
    async fn open_append(&self, path: &Path) -> std::io::Result<Box<dyn StoreFile>> {
        let file = OpenOptions::new().create(true).append(true).open(path).await?;
        Ok(Box::new(file))
    }
}

/// Durable, append-only record store
pub struct ResultRecorder {
    dir: PathBuf,
    path: PathBuf,
    opener: Arc<dyn StoreOpener>,
    file: Mutex<Box<dyn StoreFile>>,
    next_id: AtomicU64,
}

impl ResultRecorder {
    /// Open (or create) the store in `results_dir`, resuming record ids
    /// after the highest id already present.
    pub async fn open(results_dir: impl AsRef<Path>) -> Result<Self> {
        Self::open_with(results_dir, Arc::new(FileStore)).await
    }

    /// Like [`ResultRecorder::open`], writing through `opener`
    pub async fn open_with(results_dir: impl AsRef<Path>, opener: Arc<dyn StoreOpener>) -> Result<Self> {
        let dir = results_dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| storage_err("Cannot create results directory", &dir, e))?;

        let path = dir.join(RESULTS_FILE);
        let existing = match tokio::fs::read_to_string(&path).await {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(storage_err("Cannot read", &path, e)),
        };

        let mut file = opener
            .open_append(&path)
            .await
            .map_err(|e| storage_err("Cannot open", &path, e))?;
        let current_max = match &existing {
            Some(content) if !content.is_empty() => {
                if !content.ends_with('\n') {
                    // torn final row from an interrupted write; terminate it so
                    // the next row starts on its own line
                    warn!("{} ends with a partial row; it will be ignored", path.display());
                    append_durably(&mut *file, &path, "\n").await?;
                }
                parse_records(content).iter().map(|r| r.record_id).max().unwrap_or(0)
            }
            _ => {
                append_durably(&mut *file, &path, &format!("{}\n", CSV_HEADER)).await?;
                0
            }
        };
        let next_id = current_max.max(highest_rotated_id(&dir).await) + 1;

        info!("Results store {} opened, next record id {}", path.display(), next_id);
        Ok(Self {
            dir,
            path,
            opener,
            file: Mutex::new(file),
            next_id: AtomicU64::new(next_id),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Reserve the next record id
    pub fn next_record_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Append one record and flush it to disk before returning
    pub async fn record(&self, record: &ResultRecord) -> Result<()> {
        let line = format_row(record);
        let mut file = self.file.lock().await;
        append_durably(&mut **file, &self.path, &line).await?;
        debug!(record_id = record.record_id, mode = record.mode.as_str(), "Record written");
        Ok(())
    }

    /// Copy a captured frame next to the results as
    /// `images/<record_id>_<label>_<timestamp>.<ext>`
    pub async fn archive_image(&self, frame: &CapturedFrame, record_id: u64, label: &str) -> Result<PathBuf> {
        let images = self.dir.join("images");
        tokio::fs::create_dir_all(&images)
            .await
            .map_err(|e| storage_err("Cannot create", &images, e))?;

        let name = format!(
            "{:08}_{}_{}.{}",
            record_id,
            sanitize(label),
            frame.captured_at().format("%Y%m%d_%H%M%S_%3f"),
            frame.format().extension()
        );
        let target = images.join(name);
        tokio::fs::copy(frame.path(), &target)
            .await
            .map_err(|e| storage_err("Cannot archive image to", &target, e))?;
        Ok(target)
    }

    /// Move the current store aside as `results-<timestamp>.csv` and start
    /// a new one. Record ids keep counting. Returns `None`, leaving the
    /// store in place, when it holds no rows.
    pub async fn rotate(&self) -> Result<Option<PathBuf>> {
        let mut file = self.file.lock().await;
        let content = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|e| storage_err("Cannot read", &self.path, e))?;
        if parse_records(&content).is_empty() {
            debug!("{} has no rows; nothing to rotate", self.path.display());
            return Ok(None);
        }
        file.sync()
            .await
            .map_err(|e| storage_err("Cannot sync", &self.path, e))?;

        let stamp = Utc::now().format("%Y%m%d_%H%M%S");
        let mut archived = self.dir.join(format!("results-{}.csv", stamp));
        let mut n = 1;
        while tokio::fs::try_exists(&archived).await.unwrap_or(false) {
            archived = self.dir.join(format!("results-{}-{}.csv", stamp, n));
            n += 1;
        }

        tokio::fs::rename(&self.path, &archived)
            .await
            .map_err(|e| storage_err("Cannot rotate", &self.path, e))?;
        let mut fresh = self
            .opener
            .open_append(&self.path)
            .await
            .map_err(|e| storage_err("Cannot open", &self.path, e))?;
        append_durably(&mut *fresh, &self.path, &format!("{}\n", CSV_HEADER)).await?;
        *file = fresh;

        info!("Rotated results store to {}", archived.display());
        Ok(Some(archived))
    }

    /// Summary of the current store
    pub async fn summarize(&self) -> Result<ResultSummary> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(storage_err("Cannot read", &self.path, e)),
        };
        Ok(ResultSummary::from_records(&parse_records(&content)))
    }

    /// Read every complete record from a store file. Never takes the writer lock.
    pub fn read_records(path: impl AsRef<Path>) -> Result<Vec<ResultRecord>> {
        let path = path.as_ref();
        match std::fs::read_to_string(path) {
            Ok(content) => Ok(parse_records(&content)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(storage_err("Cannot read", path, e)),
        }
    }
}

/// Highest record id in the rotated `results-*.csv` stores of `dir`
async fn highest_rotated_id(dir: &Path) -> u64 {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(_) => return 0,
    };
    let mut highest = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !(name.starts_with("results-") && name.ends_with(".csv")) {
            continue;
        }
        match tokio::fs::read_to_string(entry.path()).await {
            Ok(content) => {
                let max = parse_records(&content).iter().map(|r| r.record_id).max().unwrap_or(0);
                highest = highest.max(max);
            }
            Err(e) => warn!("Skipping rotated store {}: {}", entry.path().display(), e),
        }
    }
    highest
}

/// Append `text` and sync it. On failure the file is cut back to its
/// previous length, so the uncommitted tail never reaches a reader.
async fn append_durably(file: &mut dyn StoreFile, path: &Path, text: &str) -> Result<()> {
    let committed = file
        .committed_len()
        .await
        .map_err(|e| storage_err("Cannot stat", path, e))?;
    let written = match file.append(text.as_bytes()).await {
        Ok(()) => file.sync().await.map_err(|e| storage_err("Cannot sync", path, e)),
        Err(e) => Err(storage_err("Cannot append to", path, e)),
    };
    if written.is_err() {
        if let Err(e) = file.truncate(committed).await {
            error!("Cannot roll {} back to {} bytes: {}", path.display(), committed, e);
        }
    }
    written
}

fn sanitize(label: &str) -> String {
    let cleaned: String = label
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if cleaned.is_empty() {
        "unlabeled".to_string()
    } else {
        cleaned
    }
}

fn escape_csv(s: &str) -> String {
    // rows are line-delimited; embedded line breaks become spaces
    let s = s.replace(['\r', '\n'], " ");
    if s.contains(',') || s.contains('"') {
        format!("\"{}\"", s.replace('"', "\"\""))
    } else {
        s
    }
}

fn split_csv_line(line: &str) -> Option<Vec<String>> {
    let mut fields = Vec::with_capacity(FIELD_COUNT);
    let mut current = String::new();
    let mut chars = line.chars().peekable();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match (quoted, c) {
            (true, '"') if chars.peek() == Some(&'"') => {
                current.push('"');
                chars.next();
            }
            (true, '"') => quoted = false,
            (true, c) => current.push(c),
            (false, '"') if current.is_empty() => quoted = true,
            (false, ',') => fields.push(std::mem::take(&mut current)),
            (false, c) => current.push(c),
        }
    }
    if quoted {
        return None;
    }
    fields.push(current);
    Some(fields)
}

fn format_row(record: &ResultRecord) -> String {
    let label = record.label().unwrap_or("");
    let confidence = record.confidence().map(|c| c.to_string()).unwrap_or_default();
    format!(
        "{},{},{},{},{},{},{}\n",
        record.record_id,
        record.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        record.mode.as_str(),
        escape_csv(&record.image_reference().to_string_lossy()),
        escape_csv(label),
        confidence,
        escape_csv(&record.outcome.to_field()),
    )
}

fn parse_row(line: &str) -> Option<ResultRecord> {
    let fields = split_csv_line(line)?;
    if fields.len() != FIELD_COUNT {
        return None;
    }

    let record_id = fields[0].parse().ok()?;
    let timestamp = DateTime::parse_from_rfc3339(&fields[1]).ok()?.with_timezone(&Utc);
    let mode = RecordMode::parse(&fields[2])?;
    let confidence: Option<f32> = match fields[5].as_str() {
        "" => None,
        text => Some(text.parse().ok()?),
    };
    let outcome = RecordOutcome::parse(&fields[6])?;
    let result = (!fields[4].is_empty()).then(|| ClassificationResult {
        label: fields[4].clone(),
        confidence: confidence.unwrap_or(0.0),
        inference_latency: Duration::ZERO,
    });

    Some(ResultRecord {
        record_id,
        timestamp,
        mode,
        frame_reference: PathBuf::from(&fields[3]),
        archived_image: None,
        result,
        outcome,
    })
}

/// Parse the complete rows of a store; a trailing row without its newline
/// is still being written and is ignored.
pub fn parse_records(content: &str) -> Vec<ResultRecord> {
    let complete = match content.rfind('\n') {
        Some(end) => &content[..end],
        None => return Vec::new(),
    };

    complete
        .lines()
        .filter(|line| !line.is_empty() && *line != CSV_HEADER)
        .filter_map(|line| {
            let parsed = parse_row(line);
            if parsed.is_none() {
                warn!("Skipping malformed results row: {}", line);
            }
            parsed
        })
        .collect()
}

/// Aggregate view of a results store
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultSummary {
    pub total: u64,
    pub collected: u64,
    pub classified: u64,
    pub per_label: BTreeMap<String, u64>,
    pub low_confidence: u64,
    pub errors: u64,
    pub mean_confidence: Option<f32>,
    pub first: Option<DateTime<Utc>>,
    pub last: Option<DateTime<Utc>>,
}

impl ResultSummary {
    pub fn from_records(records: &[ResultRecord]) -> Self {
        let mut summary = ResultSummary::default();
        let mut confidence_sum = 0.0f64;
        let mut confidence_count = 0u64;

        for record in records {
            summary.total += 1;
            match record.mode {
                RecordMode::Collect => summary.collected += 1,
                RecordMode::Classify => summary.classified += 1,
            }
            match &record.outcome {
                RecordOutcome::LowConfidence => summary.low_confidence += 1,
                RecordOutcome::InferenceError(_) => summary.errors += 1,
                RecordOutcome::Ok => {}
            }
            if let Some(result) = &record.result {
                *summary.per_label.entry(result.label.clone()).or_default() += 1;
                confidence_sum += result.confidence as f64;
                confidence_count += 1;
            }
            summary.first = Some(summary.first.map_or(record.timestamp, |t| t.min(record.timestamp)));
            summary.last = Some(summary.last.map_or(record.timestamp, |t| t.max(record.timestamp)));
        }

        if confidence_count > 0 {
            summary.mean_confidence = Some((confidence_sum / confidence_count as f64) as f32);
        }
        summary
    }
}

impl std::fmt::Display for ResultSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} records ({} collected, {} classified)",
            self.total, self.collected, self.classified
        )?;
        if !self.per_label.is_empty() {
            let labels: Vec<String> = self
                .per_label
                .iter()
                .map(|(label, count)| format!("{}={}", label, count))
                .collect();
            write!(f, "; labels: {}", labels.join(", "))?;
        }
        if let Some(mean) = self.mean_confidence {
            write!(f, "; mean confidence {:.1}%", mean * 100.0)?;
        }
        if self.low_confidence > 0 || self.errors > 0 {
            write!(f, "; {} low confidence, {} errors", self.low_confidence, self.errors)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CaptureFormat;
    use image::RgbImage;

    fn classified(id: u64, label: &str, confidence: f32, outcome: RecordOutcome) -> ResultRecord {
        ResultRecord {
            record_id: id,
            timestamp: Utc::now(),
            mode: RecordMode::Classify,
            frame_reference: PathBuf::from(format!("data/captured_images/{}.jpg", id)),
            archived_image: None,
            result: Some(ClassificationResult {
                label: label.to_string(),
                confidence,
                inference_latency: Duration::from_millis(12),
            }),
            outcome,
        }
    }

    #[test]
    fn test_csv_escaping() {
        assert_eq!(escape_csv("plain"), "plain");
        assert_eq!(escape_csv("a,b"), "\"a,b\"");
        assert_eq!(escape_csv("say \"hi\""), "\"say \"\"hi\"\"\"");
        assert_eq!(escape_csv("two\nlines"), "two lines");
        assert_eq!(
            split_csv_line("1,\"a,b\",\"say \"\"hi\"\"\",").unwrap(),
            vec!["1", "a,b", "say \"hi\"", ""]
        );
        assert!(split_csv_line("\"unterminated").is_none());
    }

    #[test]
    fn test_partial_trailing_row_is_ignored() {
        let row = format_row(&classified(1, "good", 0.9, RecordOutcome::Ok));
        let content = format!("{}\n{}{}", CSV_HEADER, row, &row[..row.len() / 2]);
        let records = parse_records(&content);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].record_id, 1);
    }

    #[tokio::test]
    async fn test_record_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultRecorder::open(dir.path()).await.unwrap();

        let mut written = classified(recorder.next_record_id(), "scratch, deep", 0.8125, RecordOutcome::Ok);
        written.outcome = RecordOutcome::InferenceError("timed out, retry".to_string());
        recorder.record(&written).await.unwrap();

        let collected = ResultRecord {
            record_id: recorder.next_record_id(),
            timestamp: Utc::now(),
            mode: RecordMode::Collect,
            frame_reference: PathBuf::from("data/captured_images/x.png"),
            archived_image: None,
            result: None,
            outcome: RecordOutcome::Ok,
        };
        recorder.record(&collected).await.unwrap();

        let read = ResultRecorder::read_records(recorder.path()).unwrap();
        assert_eq!(read.len(), 2);
        assert_eq!(read[0].record_id, written.record_id);
        assert_eq!(read[0].timestamp, written.timestamp);
        assert_eq!(read[0].mode, RecordMode::Classify);
        assert_eq!(read[0].label(), Some("scratch, deep"));
        assert_eq!(read[0].confidence(), Some(0.8125));
        assert_eq!(read[0].outcome, written.outcome);

        assert_eq!(read[1].mode, RecordMode::Collect);
        assert_eq!(read[1].label(), None);
        assert_eq!(read[1].confidence(), None);
        assert_eq!(read[1].frame_reference, PathBuf::from("data/captured_images/x.png"));

        let text = std::fs::read_to_string(recorder.path()).unwrap();
        assert!(text.starts_with(CSV_HEADER));
    }

    #[tokio::test]
    async fn test_archive_image_names_do_not_collide() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultRecorder::open(dir.path().join("results")).await.unwrap();

        let source = dir.path().join("frame.png");
        std::fs::write(&source, b"png-bytes").unwrap();
        let at = Utc::now();
        let frame = CapturedFrame::new(source, CaptureFormat::Png, RgbImage::new(1, 1), at);

        let a = recorder.archive_image(&frame, 7, "good").await.unwrap();
        let b = recorder.archive_image(&frame, 8, "good").await.unwrap();
        assert_ne!(a, b);
        assert!(a.file_name().unwrap().to_string_lossy().starts_with("00000007_good_"));
        assert_eq!(std::fs::read(&b).unwrap(), b"png-bytes");

        let odd = recorder.archive_image(&frame, 9, "bad/label").await.unwrap();
        assert!(odd.file_name().unwrap().to_string_lossy().starts_with("00000009_bad_label_"));
    }

    #[tokio::test]
    async fn test_ids_continue_after_rotation_and_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultRecorder::open(dir.path()).await.unwrap();
        for _ in 0..2 {
            let id = recorder.next_record_id();
            recorder.record(&classified(id, "good", 0.9, RecordOutcome::Ok)).await.unwrap();
        }

        let archived = recorder.rotate().await.unwrap().expect("rows to rotate");
        assert_eq!(ResultRecorder::read_records(&archived).unwrap().len(), 2);
        assert!(ResultRecorder::read_records(recorder.path()).unwrap().is_empty());
        drop(recorder);

        let reopened = ResultRecorder::open(dir.path()).await.unwrap();
        assert_eq!(reopened.next_record_id(), 3);
    }

    #[tokio::test]
    async fn test_torn_row_is_terminated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        let row = format_row(&classified(4, "good", 0.9, RecordOutcome::Ok));
        std::fs::write(
            dir.path().join(RESULTS_FILE),
            format!("{}\n{}4,2024-01-01T00:0", CSV_HEADER, row),
        )
        .unwrap();

        let recorder = ResultRecorder::open(dir.path()).await.unwrap();
        let id = recorder.next_record_id();
        assert_eq!(id, 5);
        recorder.record(&classified(id, "defective", 0.75, RecordOutcome::Ok)).await.unwrap();

        let ids: Vec<u64> = ResultRecorder::read_records(recorder.path())
            .unwrap()
            .iter()
            .map(|r| r.record_id)
            .collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[tokio::test]
    async fn test_rotate_without_rows_keeps_store() {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultRecorder::open(dir.path()).await.unwrap();
        assert!(recorder.rotate().await.unwrap().is_none());

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec![RESULTS_FILE.to_string()]);
    }

    enum Failure {
        MidAppend,
        Sync,
    }

    /// Store file that fails once, the way a full or failing disk does
    struct FlakyFile {
        inner: File,
        failure: Option<Failure>,
    }

    #[async_trait]
    impl StoreFile for FlakyFile {
        async fn committed_len(&mut self) -> std::io::Result<u64> {
            self.inner.committed_len().await
        }

        async fn append(&mut self, bytes: &[u8]) -> std::io::Result<()> {
            if matches!(self.failure, Some(Failure::MidAppend)) {
                self.failure = None;
                self.inner.append(&bytes[..bytes.len() / 2]).await?;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "no space left on device"));
            }
            self.inner.append(bytes).await
        }

        async fn sync(&mut self) -> std::io::Result<()> {
            if matches!(self.failure, Some(Failure::Sync)) {
                self.failure = None;
                return Err(std::io::Error::new(std::io::ErrorKind::Other, "input/output error"));
            }
            self.inner.sync().await
        }

        async fn truncate(&mut self, len: u64) -> std::io::Result<()> {
            self.inner.truncate(len).await
        }
    }

    /// Fail one append of record 2, retry it, and return the ids read back
    async fn ids_after_retried_append(failure: Failure) -> Vec<u64> {
        let dir = tempfile::tempdir().unwrap();
        let recorder = ResultRecorder::open(dir.path()).await.unwrap();
        let first = classified(recorder.next_record_id(), "good", 0.9, RecordOutcome::Ok);
        recorder.record(&first).await.unwrap();

        let raw = OpenOptions::new().append(true).open(recorder.path()).await.unwrap();
        let mut file = FlakyFile {
            inner: raw,
            failure: Some(failure),
        };
        let row = format_row(&classified(2, "defective", 0.75, RecordOutcome::Ok));
        let err = append_durably(&mut file, recorder.path(), &row).await.unwrap_err();
        assert!(matches!(err, InspectionError::Storage(_)));
        append_durably(&mut file, recorder.path(), &row).await.unwrap();

        ResultRecorder::read_records(recorder.path())
            .unwrap()
            .iter()
            .map(|r| r.record_id)
            .collect()
    }

    #[tokio::test]
    async fn test_torn_append_is_rolled_back_before_retry() {
        assert_eq!(ids_after_retried_append(Failure::MidAppend).await, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_unsynced_row_is_not_written_twice() {
        assert_eq!(ids_after_retried_append(Failure::Sync).await, vec![1, 2]);
    }

    #[test]
    fn test_summary() {
        let records = vec![
            classified(1, "good", 0.9, RecordOutcome::Ok),
            classified(2, "good", 0.5, RecordOutcome::LowConfidence),
            classified(3, "defective", 1.0, RecordOutcome::Ok),
        ];
        let summary = ResultSummary::from_records(&records);
        assert_eq!(summary.total, 3);
        assert_eq!(summary.classified, 3);
        assert_eq!(summary.per_label.get("good"), Some(&2));
        assert_eq!(summary.low_confidence, 1);
        assert!((summary.mean_confidence.unwrap() - 0.8).abs() < 1e-6);
        assert!(summary.to_string().contains("labels: defective=1, good=2"));
    }
}
