use crate::{error::SortError, log_debug, log_info, log_trace, log_warn, schema::RowTemplate, tuple::Tuple};

use super::{
    run_store::{RowSink, RunHandle, RunReader, RunStore, RunWriter},
    sort_buffer::{InsertOutcome, SortBuffer},
    ExternalSort, SortState,
};

/// Write every row of `buffer`, in order, to a new run. Leaves the buffer
/// empty.
pub(crate) fn drain<S: RunStore>(store: &S, buffer: &mut SortBuffer) -> Result<RunHandle, SortError> {
    let mut writer = store.create()?;
    while let Some(row) = buffer.remove_first() {
        writer.append(row)?;
    }
    buffer.reset();
    let run = writer.close()?;
    log_debug!("drained {} rows into run {}", run.rows(), run.id());
    Ok(run)
}

/// Best effort; a leaked run is acceptable, a failing cleanup is not.
pub(crate) fn drop_runs<S: RunStore>(store: &S, runs: impl IntoIterator<Item = RunHandle>) {
    for run in runs {
        let id = run.id();
        if let Err(e) = store.drop_run(run) {
            log_warn!("failed to drop run {}: {}", id, e);
        }
    }
}

/// Merge runs until at most `min(buffer capacity, max_fan_in)` remain. Each
/// pass merges the first `fan_in` runs into one new run appended at the end.
/// Returns the number of passes.
///
/// The list is always a rotation of input order. A group that would wrap
/// around it is avoided by rotating the earliest run to the front first, so
/// every merged run covers a contiguous stretch of the input.
pub(crate) fn reduce_runs<S: RunStore>(
    store: &S,
    buffer: &mut SortBuffer,
    runs: &mut Vec<RunHandle>,
    max_fan_in: usize,
    template: &RowTemplate,
) -> Result<usize, SortError> {
    let fan_in = buffer.capacity().min(max_fan_in).max(2);
    let mut passes = 0;
    while runs.len() > fan_in {
        if runs[..fan_in].windows(2).any(|w| w[0].seq() > w[1].seq()) {
            let earliest = (0..runs.len()).min_by_key(|&i| runs[i].seq()).unwrap_or(0);
            runs.rotate_left(earliest);
        }
        let seq = runs[0].seq();
        let mut writer = store.create()?;
        let rows = match merge_into(store, &runs[..fan_in], buffer, template, &mut writer) {
            Ok(rows) => rows,
            Err(e) => {
                match writer.close() {
                    Ok(partial) => drop_runs(store, [partial]),
                    Err(close_err) => { log_warn!("failed to close partial run: {}", close_err); }
                }
                return Err(e);
            }
        };
        let merged = writer.close()?.with_seq(seq);
        log_info!(
            "merge pass {}: {} runs into run {} ({} rows), {} runs left",
            passes + 1,
            fan_in,
            merged.id(),
            rows,
            runs.len() - fan_in + 1
        );
        runs.push(merged);
        drop_runs(store, runs.drain(..fan_in));
        passes += 1;
    }
    Ok(passes)
}

fn merge_into<S: RunStore>(
    store: &S,
    runs: &[RunHandle],
    buffer: &mut SortBuffer,
    template: &RowTemplate,
    writer: &mut S::Writer,
) -> Result<usize, SortError> {
    let mut merge = MergeScan::start(store, runs, buffer, template)?;
    let rows = merge.push_into(buffer, template, writer)?;
    merge.close()?;
    Ok(rows)
}

/// K-way merge over a set of runs that uses the sort buffer as its priority
/// queue. Each pending row carries the index of its source run as its tag;
/// the buffer holds at most one pending row per source, so the observer
/// absorbs duplicates across runs exactly as it does within one. Equal rows
/// leave in source order, so `runs` must be given in input order.
pub(crate) struct MergeScan<R: RunReader> {
    readers: Vec<Option<R>>,
}

impl<R: RunReader> MergeScan<R> {
    pub(crate) fn start<S: RunStore<Reader = R>>(
        store: &S,
        runs: &[RunHandle],
        buffer: &mut SortBuffer,
        template: &RowTemplate,
    ) -> Result<Self, SortError> {
        if runs.len() > buffer.capacity() {
            return Err(SortError::Config(format!(
                "cannot merge {} runs through a buffer of {} rows",
                runs.len(),
                buffer.capacity()
            )));
        }
        buffer.reset();
        let mut merge = MergeScan {
            readers: Vec::with_capacity(runs.len()),
        };
        for run in runs {
            merge.readers.push(Some(store.open(run)?));
        }
        for source in 0..merge.readers.len() {
            merge.refill(source, buffer, template)?;
        }
        Ok(merge)
    }

    pub(crate) fn next(
        &mut self,
        buffer: &mut SortBuffer,
        template: &RowTemplate,
    ) -> Result<Option<Tuple>, SortError> {
        let Some(row) = buffer.remove_first() else {
            return Ok(None);
        };
        let source = buffer.last_removed_tag() as usize;
        self.refill(source, buffer, template)?;
        Ok(Some(row))
    }

    pub(crate) fn push_into<K: RowSink + ?Sized>(
        &mut self,
        buffer: &mut SortBuffer,
        template: &RowTemplate,
        sink: &mut K,
    ) -> Result<usize, SortError> {
        let mut count = 0;
        while let Some(row) = self.next(buffer, template)? {
            sink.append(row)?;
            count += 1;
        }
        Ok(count)
    }

    /// Read from `source` until one of its rows is stored in the buffer or
    /// the run is exhausted. A source whose pending row got absorbed by an
    /// equal row from an earlier source is refilled the same way.
    fn refill(
        &mut self,
        source: usize,
        buffer: &mut SortBuffer,
        template: &RowTemplate,
    ) -> Result<(), SortError> {
        let mut source = source;
        loop {
            self.refill_source(source, buffer, template)?;
            match buffer.take_displaced_tag() {
                Some(tag) => source = tag as usize,
                None => return Ok(()),
            }
        }
    }

    fn refill_source(
        &mut self,
        source: usize,
        buffer: &mut SortBuffer,
        template: &RowTemplate,
    ) -> Result<(), SortError> {
        loop {
            let Some(reader) = self.readers[source].as_mut() else {
                return Ok(());
            };
            let Some(row) = reader.next()? else {
                if let Some(reader) = self.readers[source].take() {
                    reader.close()?;
                }
                log_trace!("run source {} exhausted", source);
                return Ok(());
            };
            template.validate(&row)?;
            buffer.set_pending_tag(source as u32);
            match buffer.insert(row)? {
                InsertOutcome::Inserted => return Ok(()),
                InsertOutcome::Duplicate => continue,
                InsertOutcome::Full(_) => {
                    return Err(SortError::Config(format!(
                        "merge buffer of {} rows overflowed",
                        buffer.capacity()
                    )))
                }
            }
        }
    }

    pub(crate) fn close(self) -> Result<(), SortError> {
        for reader in self.readers.into_iter().flatten() {
            reader.close()?;
        }
        Ok(())
    }
}

/// Single-pass reader over the sorted result. Yields rows straight from the
/// buffer when nothing was spilled, otherwise from a merge of the runs.
///
/// Dropping the scan closes it: open readers are closed, runs dropped and
/// the sort moves to `DoneScanning`.
pub struct SortScan<'a, S: RunStore> {
    sort: &'a mut ExternalSort<S>,
    merge: Option<MergeScan<S::Reader>>,
    done: bool,
}

impl<'a, S: RunStore> SortScan<'a, S> {
    pub(super) fn new(sort: &'a mut ExternalSort<S>, merge: Option<MergeScan<S::Reader>>) -> Self {
        SortScan {
            sort,
            merge,
            done: false,
        }
    }

    fn next_row(&mut self) -> Result<Option<Tuple>, SortError> {
        let sort = &mut *self.sort;
        assert_eq!(sort.state, SortState::Scanning, "scan on a sort that is not scanning");
        let buffer = sort
            .buffer
            .as_mut()
            .expect("scanning sort without a buffer");
        match self.merge.as_mut() {
            None => match buffer.remove_first() {
                Some(row) => {
                    sort.template.validate(&row)?;
                    Ok(Some(row))
                }
                None => Ok(None),
            },
            Some(merge) => merge.next(buffer, &sort.template),
        }
    }

    /// Feed every remaining row into `sink`. Returns the number of rows.
    pub fn push_into<K: RowSink + ?Sized>(&mut self, sink: &mut K) -> Result<usize, SortError> {
        let mut count = 0;
        for row in self.by_ref() {
            sink.append(row?)?;
            count += 1;
        }
        Ok(count)
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.sort.state != SortState::Scanning {
            return;
        }
        if let Some(merge) = self.merge.take() {
            if let Err(e) = merge.close() {
                log_warn!("failed to close run readers: {}", e);
            }
        }
        let sort = &mut *self.sort;
        drop_runs(&*sort.store, sort.runs.drain(..));
        if let Some(buffer) = sort.buffer.as_mut() {
            buffer.reset();
        }
        sort.state = SortState::DoneScanning;
        log_debug!("scan closed");
    }
}

impl<S: RunStore> Iterator for SortScan<'_, S> {
    type Item = Result<Tuple, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_row() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                log_warn!("scan failed, aborting sort: {}", e);
                self.merge = None;
                self.sort.drop_sort();
                Some(Err(e))
            }
        }
    }
}

impl<S: RunStore> Drop for SortScan<'_, S> {
    fn drop(&mut self) {
        self.finish();
    }
}
