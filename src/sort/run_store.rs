// Merge-run containers.
//
// A run is an immutable, sorted sequence of rows written once by a
// `RunWriter` and read back in write order by a `RunReader`. Runs are named
// by a `RunHandle` that is moved from the writer to the sort and finally back
// into `RunStore::drop_run`; it is never cloned.

use std::{
    collections::HashMap,
    fs::File,
    io::{BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tempfile::TempDir;

use crate::{error::SortError, log_debug, tuple::Tuple};

/// Anything sorted rows can be pushed into.
pub trait RowSink {
    fn append(&mut self, row: Tuple) -> Result<(), SortError>;
}

impl RowSink for Vec<Tuple> {
    fn append(&mut self, row: Tuple) -> Result<(), SortError> {
        self.push(row);
        Ok(())
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct RunHandle {
    id: u64,
    rows: usize,
    seq: u64,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Position of the run in input order among the runs of one sort. Rows
    /// that compare equal across runs are merged in this order.
    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub(crate) fn with_seq(mut self, seq: u64) -> Self {
        self.seq = seq;
        self
    }
}

pub trait RunWriter: RowSink {
    fn close(self) -> Result<RunHandle, SortError>;
}

pub trait RunReader {
    fn next(&mut self) -> Result<Option<Tuple>, SortError>;
    fn close(self) -> Result<(), SortError>;
}

pub trait RunStore {
    type Writer: RunWriter;
    type Reader: RunReader;

    fn create(&self) -> Result<Self::Writer, SortError>;
    fn open(&self, run: &RunHandle) -> Result<Self::Reader, SortError>;
    fn drop_run(&self, run: RunHandle) -> Result<(), SortError>;
}

/// One bincode-encoded file per run inside a private temporary directory.
/// The directory and anything left in it go away with the store.
pub struct FileRunStore {
    dir: TempDir,
    next_id: AtomicU64,
}

impl FileRunStore {
    pub fn new() -> Result<Self, SortError> {
        Ok(FileRunStore {
            dir: tempfile::tempdir()?,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn new_in<P: AsRef<Path>>(parent: P) -> Result<Self, SortError> {
        Ok(FileRunStore {
            dir: tempfile::tempdir_in(parent)?,
            next_id: AtomicU64::new(0),
        })
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    fn run_path(&self, id: u64) -> PathBuf {
        self.dir.path().join(format!("run-{:08}.bin", id))
    }
}

pub struct FileRunWriter {
    id: u64,
    writer: BufWriter<File>,
    rows: usize,
}

impl RowSink for FileRunWriter {
    fn append(&mut self, row: Tuple) -> Result<(), SortError> {
        bincode::serialize_into(&mut self.writer, &row)?;
        self.rows += 1;
        Ok(())
    }
}

impl RunWriter for FileRunWriter {
    fn close(mut self) -> Result<RunHandle, SortError> {
        self.writer.flush()?;
        Ok(RunHandle {
            id: self.id,
            rows: self.rows,
            seq: 0,
        })
    }
}

pub struct FileRunReader {
    reader: BufReader<File>,
    remaining: usize,
}

impl RunReader for FileRunReader {
    fn next(&mut self) -> Result<Option<Tuple>, SortError> {
        if self.remaining == 0 {
            return Ok(None);
        }
        let row: Tuple = bincode::deserialize_from(&mut self.reader)?;
        self.remaining -= 1;
        Ok(Some(row))
    }

    fn close(self) -> Result<(), SortError> {
        Ok(())
    }
}

impl RunStore for FileRunStore {
    type Writer = FileRunWriter;
    type Reader = FileRunReader;

    fn create(&self) -> Result<FileRunWriter, SortError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let file = File::create(self.run_path(id))?;
        Ok(FileRunWriter {
            id,
            writer: BufWriter::new(file),
            rows: 0,
        })
    }

    fn open(&self, run: &RunHandle) -> Result<FileRunReader, SortError> {
        let file = File::open(self.run_path(run.id))?;
        Ok(FileRunReader {
            reader: BufReader::new(file),
            remaining: run.rows,
        })
    }

    fn drop_run(&self, run: RunHandle) -> Result<(), SortError> {
        std::fs::remove_file(self.run_path(run.id))?;
        log_debug!("removed run file {} ({} rows)", run.id, run.rows);
        Ok(())
    }
}

type RunMap = Arc<Mutex<HashMap<u64, Arc<Vec<Tuple>>>>>;

fn lock_poisoned<T>(_: T) -> SortError {
    SortError::Storage("in-memory run map poisoned".to_string())
}

/// Keeps runs on the heap. Used by tests and for sorts that only need the
/// bounded buffer, not the disk.
#[derive(Default)]
pub struct InMemRunStore {
    runs: RunMap,
    next_id: AtomicU64,
}

impl InMemRunStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs created and closed but not yet dropped.
    pub fn num_runs(&self) -> usize {
        self.runs.lock().map(|runs| runs.len()).unwrap_or(0)
    }
}

pub struct InMemRunWriter {
    id: u64,
    rows: Vec<Tuple>,
    runs: RunMap,
}

impl RowSink for InMemRunWriter {
    fn append(&mut self, row: Tuple) -> Result<(), SortError> {
        self.rows.push(row);
        Ok(())
    }
}

impl RunWriter for InMemRunWriter {
    fn close(self) -> Result<RunHandle, SortError> {
        let handle = RunHandle {
            id: self.id,
            rows: self.rows.len(),
            seq: 0,
        };
        self.runs
            .lock()
            .map_err(lock_poisoned)?
            .insert(self.id, Arc::new(self.rows));
        Ok(handle)
    }
}

pub struct InMemRunReader {
    rows: Arc<Vec<Tuple>>,
    pos: usize,
}

impl RunReader for InMemRunReader {
    fn next(&mut self) -> Result<Option<Tuple>, SortError> {
        let row = self.rows.get(self.pos).cloned();
        if row.is_some() {
            self.pos += 1;
        }
        Ok(row)
    }

    fn close(self) -> Result<(), SortError> {
        Ok(())
    }
}

impl RunStore for InMemRunStore {
    type Writer = InMemRunWriter;
    type Reader = InMemRunReader;

    fn create(&self) -> Result<InMemRunWriter, SortError> {
        Ok(InMemRunWriter {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            rows: Vec::new(),
            runs: self.runs.clone(),
        })
    }

    fn open(&self, run: &RunHandle) -> Result<InMemRunReader, SortError> {
        let rows = self
            .runs
            .lock()
            .map_err(lock_poisoned)?
            .get(&run.id)
            .cloned()
            .ok_or_else(|| SortError::Storage(format!("unknown run {}", run.id)))?;
        Ok(InMemRunReader { rows, pos: 0 })
    }

    fn drop_run(&self, run: RunHandle) -> Result<(), SortError> {
        self.runs
            .lock()
            .map_err(lock_poisoned)?
            .remove(&run.id)
            .map(|_| ())
            .ok_or_else(|| SortError::Storage(format!("unknown run {}", run.id)))
    }
}
