use crate::{error::SortError, log_debug, log_error, log_info, log_trace, tuple::Tuple};

use super::{
    arena::Node,
    merge::drain,
    run_store::RunStore,
    sort_buffer::InsertOutcome,
    ExternalSort, SortState,
};

/// Per-row bookkeeping cost of the buffer on top of the row itself.
const NODE_OVERHEAD: usize = std::mem::size_of::<Node>();

/// Feeds rows into a sort. Spills the buffer to a new run whenever it fills
/// up, unless the growth policy lets it grow first.
///
/// Closing (or dropping) the session moves the sort to `DoneInserting`. A
/// failed insert aborts the whole sort.
pub struct SortInserter<'a, S: RunStore> {
    sort: &'a mut ExternalSort<S>,
    /// Estimated bytes held by the buffer since the last spill.
    buffered_bytes: usize,
    growths: usize,
    closed: bool,
}

impl<'a, S: RunStore> SortInserter<'a, S> {
    pub(super) fn new(sort: &'a mut ExternalSort<S>) -> Self {
        SortInserter {
            sort,
            buffered_bytes: 0,
            growths: 0,
            closed: false,
        }
    }

    pub fn insert(&mut self, row: Tuple) -> Result<(), SortError> {
        assert_eq!(
            self.sort.state,
            SortState::Inserting,
            "insert into a sort that is not accepting rows"
        );
        let result = self.insert_row(row);
        if let Err(e) = &result {
            log_error!("insert failed, aborting sort: {}", e);
            self.sort.drop_sort();
        }
        result
    }

    pub fn insert_all<I: IntoIterator<Item = Tuple>>(&mut self, rows: I) -> Result<(), SortError> {
        for row in rows {
            self.insert(row)?;
        }
        Ok(())
    }

    fn insert_row(&mut self, row: Tuple) -> Result<(), SortError> {
        self.sort.template.validate(&row)?;
        self.sort.info.rows_input += 1;

        let row = match self.try_insert(row)? {
            None => return Ok(()),
            Some(row) => row,
        };

        // Growing is only worth it while the whole input may still fit in
        // memory, that is before the first spill.
        let row = if self.sort.runs.is_empty() && self.may_grow() {
            let percent = self.sort.config.growth_percent;
            let buffer = self.sort.buffer_mut();
            buffer.grow(percent);
            self.growths += 1;
            log_debug!(
                "sort buffer grown by {}% to {} rows",
                percent,
                self.sort.buffer_mut().capacity()
            );
            match self.try_insert(row)? {
                None => return Ok(()),
                Some(row) => row,
            }
        } else {
            row
        };

        self.spill()?;
        if self.try_insert(row)?.is_some() {
            return Err(SortError::Config(
                "row does not fit into an empty sort buffer".to_string(),
            ));
        }
        Ok(())
    }

    fn may_grow(&self) -> bool {
        let config = &self.sort.config;
        config
            .growth_policy
            .allows_growth(self.buffered_bytes, config.growth_percent, self.growths)
    }

    /// `None` when the buffer took care of the row, the row back when full.
    fn try_insert(&mut self, row: Tuple) -> Result<Option<Tuple>, SortError> {
        let row_bytes = row.estimated_size() + NODE_OVERHEAD;
        match self.sort.buffer_mut().insert(row)? {
            InsertOutcome::Inserted => {
                self.sort.info.rows_kept += 1;
                self.buffered_bytes += row_bytes;
                Ok(None)
            }
            InsertOutcome::Duplicate => {
                log_trace!("row absorbed by the sort observer");
                Ok(None)
            }
            InsertOutcome::Full(row) => Ok(Some(row)),
        }
    }

    fn spill(&mut self) -> Result<(), SortError> {
        let sort = &mut *self.sort;
        let buffer = sort.buffer.as_mut().expect("inserting sort without a buffer");
        let run = drain(&*sort.store, buffer)?.with_seq(sort.runs.len() as u64);
        log_debug!(
            "spilled run {} with {} rows ({} runs so far)",
            run.id(),
            run.rows(),
            sort.runs.len() + 1
        );
        sort.info.record_run(run.rows());
        sort.runs.push(run);
        self.buffered_bytes = 0;
        Ok(())
    }

    pub fn close(mut self) {
        self.finish();
    }

    fn finish(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let sort = &mut *self.sort;
        if sort.state != SortState::Inserting {
            return;
        }
        if !sort.runs.is_empty() {
            let pending = sort.buffer.as_ref().map_or(0, |b| b.len());
            if pending > 0 {
                sort.info.record_run(pending);
            }
        }
        sort.state = SortState::DoneInserting;
        log_info!(
            "insertion closed: {} rows in, {} kept, {} runs",
            sort.info.rows_input,
            sort.info.rows_kept,
            sort.info.num_merge_runs
        );
    }
}

impl<S: RunStore> Drop for SortInserter<'_, S> {
    fn drop(&mut self) {
        self.finish();
    }
}
