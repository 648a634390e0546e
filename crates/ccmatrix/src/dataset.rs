//! Append-only CSV segments, one header per file.
//!
//! Rows are durable once [`DatasetWriter::append`] returns. A crash can tear
//! at most the row being written; earlier rows are never touched again. A
//! torn row is closed off with a newline before the next append and skipped
//! when the segment is read.

use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};

use ccmatrix_netsim::IpVersion;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::descriptor::RunDescriptor;
use crate::error::PersistError;
use crate::record::MetricsRecord;
use crate::runner::RawCapture;

pub const RAW_LOG_FILE: &str = "full_output.log";

/// How rows are split across files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SegmentLayout {
    /// `results_<protocol>.csv`
    Protocol,
    /// `dataset_<protocol>_<algorithm>.csv`
    ProtocolAlgorithm,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SegmentKey {
    pub protocol: IpVersion,
    pub algorithm: Option<String>,
}

impl SegmentKey {
    pub fn for_run(descriptor: &RunDescriptor, layout: SegmentLayout) -> Self {
        Self {
            protocol: descriptor.protocol,
            algorithm: match layout {
                SegmentLayout::Protocol => None,
                SegmentLayout::ProtocolAlgorithm => Some(descriptor.algorithm.clone()),
            },
        }
    }

    pub fn file_name(&self) -> String {
        match &self.algorithm {
            None => format!("results_{}.csv", self.protocol.key()),
            Some(algo) => format!("dataset_{}_{algo}.csv", self.protocol.key()),
        }
    }
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> PersistError + '_ {
    move |source| PersistError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> PersistError + '_ {
    move |source| PersistError::Csv {
        path: path.to_path_buf(),
        source,
    }
}

/// The header row, newline-terminated.
fn header_bytes() -> Vec<u8> {
    let mut line = MetricsRecord::HEADER.join(",");
    line.push('\n');
    line.into_bytes()
}

fn row_bytes(record: &MetricsRecord, path: &Path) -> Result<Vec<u8>, PersistError> {
    let mut wtr = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    wtr.serialize(record).map_err(csv_err(path))?;
    wtr.into_inner()
        .map_err(|e| PersistError::Io {
            path: path.to_path_buf(),
            source: e.into_error(),
        })
}

fn append_bytes(path: &Path, bytes: &[u8]) -> Result<(), PersistError> {
    let mut file = OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    file.write_all(bytes).map_err(io_err(path))?;
    file.sync_data().map_err(io_err(path))
}

fn lock_exclusive(file: &File) -> io::Result<()> {
    // SAFETY: the descriptor belongs to `file`, which outlives the call.
    // The lock is released when `file` is closed.
    if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Make an existing segment ready for appends, under an exclusive lock: an
/// empty file gets the header, a file ending in a torn row gets a newline.
fn prepare_existing(path: &Path) -> Result<(), PersistError> {
    let mut file = OpenOptions::new()
        .read(true)
        .append(true)
        .open(path)
        .map_err(io_err(path))?;
    lock_exclusive(&file).map_err(io_err(path))?;
    let len = file.metadata().map_err(io_err(path))?.len();
    if len == 0 {
        file.write_all(&header_bytes()).map_err(io_err(path))?;
    } else {
        let mut last = [0u8; 1];
        file.read_exact_at(&mut last, len - 1).map_err(io_err(path))?;
        if last[0] == b'\n' {
            return Ok(());
        }
        warn!(path = %path.display(), "segment ends in a torn row, closing it off");
        file.write_all(b"\n").map_err(io_err(path))?;
    }
    file.sync_data().map_err(io_err(path))
}

pub struct DatasetWriter {
    dir: PathBuf,
    layout: SegmentLayout,
    headed: HashSet<PathBuf>,
}

impl DatasetWriter {
    pub fn new(dir: impl Into<PathBuf>, layout: SegmentLayout) -> Result<Self, PersistError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(io_err(&dir))?;
        Ok(Self {
            dir,
            layout,
            headed: HashSet::new(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn layout(&self) -> SegmentLayout {
        self.layout
    }

    pub fn segment_path(&self, key: &SegmentKey) -> PathBuf {
        self.dir.join(key.file_name())
    }

    /// Append `record` to the segment for `descriptor`.
    pub fn append_run(&mut self, descriptor: &RunDescriptor, record: &MetricsRecord) -> Result<PathBuf, PersistError> {
        let key = SegmentKey::for_run(descriptor, self.layout);
        self.append(&key, record)
    }

    /// Append one row, installing the header first if the segment has none.
    pub fn append(&mut self, key: &SegmentKey, record: &MetricsRecord) -> Result<PathBuf, PersistError> {
        let path = self.segment_path(key);
        self.ensure_header(&path)?;
        let row = row_bytes(record, &path)?;
        append_bytes(&path, &row)?;
        debug!(path = %path.display(), id = record.id, "row appended");
        Ok(path)
    }

    fn ensure_header(&mut self, path: &Path) -> Result<(), PersistError> {
        if self.headed.contains(path) {
            return Ok(());
        }
        match fs::metadata(path) {
            Ok(_) => prepare_existing(path)?,
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.install_header(path)?,
            Err(e) => return Err(io_err(path)(e)),
        }
        self.headed.insert(path.to_path_buf());
        Ok(())
    }

    /// Write the header to a private file and hard-link it into place.
    /// Linking fails if the segment appeared meanwhile, so exactly one
    /// writer's header wins.
    fn install_header(&self, path: &Path) -> Result<(), PersistError> {
        let mut staged = tempfile::Builder::new()
            .prefix(".segment-")
            .tempfile_in(&self.dir)
            .map_err(io_err(&self.dir))?;
        staged.write_all(&header_bytes()).map_err(io_err(staged.path()))?;
        staged.as_file().sync_data().map_err(io_err(path))?;
        match fs::hard_link(staged.path(), path) {
            Ok(()) => {
                debug!(path = %path.display(), "segment created");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
            Err(e) => Err(io_err(path)(e)),
        }
    }
}

/// Every intact row of a segment, in file order. Rows that do not decode
/// (a row torn by a crash) are skipped with a warning.
pub fn read_segment(path: &Path) -> Result<Vec<MetricsRecord>, PersistError> {
    let mut rdr = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .map_err(csv_err(path))?;
    let mut rows = Vec::new();
    for row in rdr.deserialize::<MetricsRecord>() {
        match row {
            Ok(record) => rows.push(record),
            Err(e) if e.is_io_error() => return Err(csv_err(path)(e)),
            Err(e) => warn!(path = %path.display(), error = %e, "skipping undecodable row"),
        }
    }
    Ok(rows)
}

/// Append-only log of raw tool output, one block per cell.
pub struct RawLog {
    path: PathBuf,
    file: File,
}

impl RawLog {
    pub fn open(dir: &Path) -> Result<Self, PersistError> {
        let path = dir.join(RAW_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(io_err(&path))?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(&self, descriptor: &RunDescriptor, raw: &RawCapture) -> Result<(), PersistError> {
        let mut block = format!("=== {descriptor} ===\n");
        if let Some(run) = &raw.traffic {
            block.push_str(&format!("--- traffic (exit {:?}) ---\n{}\n", run.exit_code, run.output.trim_end()));
        }
        if let Some(run) = &raw.probe {
            block.push_str(&format!("--- probe (exit {:?}) ---\n{}\n", run.exit_code, run.output.trim_end()));
        }
        if let Some(evidence) = &raw.evidence {
            block.push_str(&format!(
                "--- capture query (window {:.2}s) ---\n{}\n",
                evidence.window.as_secs_f64(),
                evidence.query_output.trim_end()
            ));
        }
        for note in &raw.notes {
            block.push_str(&format!("note: {note}\n"));
        }
        (&self.file)
            .write_all(block.as_bytes())
            .map_err(io_err(&self.path))
    }
}
