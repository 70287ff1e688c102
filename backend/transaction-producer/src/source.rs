//! CSV record source.
//!
//! The input is the first `*.csv` file (by name) in the input directory:
//! `;`-separated, no header row, one transaction per line. Lines the reader
//! cannot decode are logged and skipped; lines with the wrong shape are
//! handed to the [`Ingestor`], which rejects them.

use reliable_publisher::{IngestSummary, Ingestor};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Failed to read input directory {path}: {source}")]
    Directory {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("No .csv file found in {0}")]
    NotFound(PathBuf),

    #[error("Failed to open {path}: {source}")]
    Open { path: PathBuf, source: csv::Error },

    #[error("Failed to read {path}: {source}")]
    Read { path: PathBuf, source: csv::Error },

    #[error("Publisher stopped before the input was drained")]
    PublisherGone,
}

/// Totals for one input file
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SourceSummary {
    pub ingest: IngestSummary,
    /// Lines the CSV reader could not decode
    pub unreadable: u64,
}

/// First `.csv` / `.CSV` file in `dir`, by file name
pub fn find_input_file(dir: &Path) -> Result<PathBuf, SourceError> {
    let entries = std::fs::read_dir(dir).map_err(|source| SourceError::Directory {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut candidates: Vec<PathBuf> = entries
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| path.is_file())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext == "csv" || ext == "CSV")
        })
        .collect();
    candidates.sort();

    candidates
        .into_iter()
        .next()
        .ok_or_else(|| SourceError::NotFound(dir.to_path_buf()))
}

/// Stream every record of `path` into `ingestor`.
///
/// Blocks on the job queue when it is full, so run it on a blocking thread.
pub fn read_records(path: &Path, ingestor: &mut Ingestor) -> Result<SourceSummary, SourceError> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|source| SourceError::Open {
            path: path.to_path_buf(),
            source,
        })?;

    info!(path = %path.display(), "Reading input file");
    let mut unreadable = 0;

    for (index, result) in reader.records().enumerate() {
        let line = index as u64 + 1;
        match result {
            Ok(record) => {
                let fields: Vec<&str> = record.iter().collect();
                if ingestor.submit_blocking(&fields).is_err() {
                    return Err(SourceError::PublisherGone);
                }
            }
            Err(e) if e.is_io_error() => {
                return Err(SourceError::Read {
                    path: path.to_path_buf(),
                    source: e,
                });
            }
            Err(e) => {
                unreadable += 1;
                warn!(line = line, error = %e, "Skipping unreadable line");
            }
        }
    }

    Ok(SourceSummary {
        ingest: ingestor.summary(),
        unreadable,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_metrics::PipelineContext;
    use reliable_publisher::job_queue;
    use std::fs;
    use tempfile::TempDir;

    const VALID: &str = "tx-1;2024-03-01T12:30:00Z;123.456.789-00;Maria;34;250.75;3";

    #[test]
    fn test_finds_first_csv_by_name() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("notes.txt"), "x").unwrap();
        fs::write(dir.path().join("b.CSV"), "").unwrap();
        fs::write(dir.path().join("a.csv"), "").unwrap();

        let found = find_input_file(dir.path()).unwrap();
        assert_eq!(found.file_name().unwrap(), "a.csv");
    }

    #[test]
    fn test_uppercase_extension_is_accepted() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("DATA.CSV"), "").unwrap();

        assert!(find_input_file(dir.path()).is_ok());
    }

    #[test]
    fn test_missing_csv_is_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("data.json"), "{}").unwrap();

        assert!(matches!(
            find_input_file(dir.path()),
            Err(SourceError::NotFound(_))
        ));
        assert!(matches!(
            find_input_file(&dir.path().join("absent")),
            Err(SourceError::Directory { .. })
        ));
    }

    #[test]
    fn test_reads_records_and_rejects_bad_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.csv");
        fs::write(
            &path,
            format!("{VALID}\ntx-2;not-a-date;doc;Ana;20;10.0;1\ntx-3;too;short\n{VALID}\n"),
        )
        .unwrap();

        let pipeline = PipelineContext::new("source-test");
        let (sender, queue) = job_queue(16);
        let mut ingestor = Ingestor::new(sender, pipeline.clone());

        let summary = read_records(&path, &mut ingestor).unwrap();

        assert_eq!(summary.ingest.records, 4);
        assert_eq!(summary.ingest.accepted, 2);
        assert_eq!(summary.ingest.rejected, 2);
        assert_eq!(summary.unreadable, 0);
        assert_eq!(pipeline.counters.snapshot().error, 2);
        drop(ingestor);

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let ids = runtime.block_on(async {
            let mut ids = Vec::new();
            while let Some(tx) = queue.next().await {
                ids.push(tx.id);
            }
            ids
        });
        assert_eq!(ids, vec!["tx-1", "tx-1"]);
    }

    #[test]
    fn test_invalid_utf8_line_is_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.csv");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"tx-9;\xff\xfe;doc;x;1;1;1\n");
        bytes.extend_from_slice(VALID.as_bytes());
        bytes.push(b'\n');
        fs::write(&path, bytes).unwrap();

        let (sender, _queue) = job_queue(16);
        let mut ingestor = Ingestor::new(sender, PipelineContext::new("source-test"));

        let summary = read_records(&path, &mut ingestor).unwrap();
        assert_eq!(summary.unreadable, 1);
        assert_eq!(summary.ingest.accepted, 1);
    }

    #[test]
    fn test_closed_queue_stops_reading() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("input.csv");
        fs::write(&path, format!("{VALID}\n{VALID}\n")).unwrap();

        let (sender, queue) = job_queue(16);
        drop(queue);
        let mut ingestor = Ingestor::new(sender, PipelineContext::new("source-test"));

        assert!(matches!(
            read_records(&path, &mut ingestor),
            Err(SourceError::PublisherGone)
        ));
    }
}
