#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum SortKind {
    /// Every row fit in the sort buffer.
    #[default]
    Internal,
    /// At least one run was spilled.
    External,
}

impl std::fmt::Display for SortKind {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SortKind::Internal => write!(f, "internal"),
            SortKind::External => write!(f, "external"),
        }
    }
}

/// Statistics of one sort, filled in by the insertion session and the scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SortInfo {
    pub kind: SortKind,
    pub rows_input: u64,
    /// Rows stored after the observer had its say; absorbed rows are not
    /// counted.
    pub rows_kept: u64,
    /// Runs written by the insertion session. Once anything was spilled,
    /// the rows still buffered at close count as one more run, written when
    /// the scan opens. An empty buffer at close adds no run.
    pub num_merge_runs: usize,
    /// Row count of each run in `num_merge_runs`. The final run is recorded
    /// with the rows the buffer held when insertion closed.
    pub merge_run_sizes: Vec<usize>,
    /// Intermediate merge passes needed to get under the fan-in limit.
    pub merge_passes: usize,
}

impl SortInfo {
    pub(crate) fn record_run(&mut self, rows: usize) {
        self.kind = SortKind::External;
        self.num_merge_runs += 1;
        self.merge_run_sizes.push(rows);
    }
}

impl std::fmt::Display for SortInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        writeln!(f, "SortInfo:")?;
        writeln!(f, "  Sort type: {}", self.kind)?;
        writeln!(f, "  Rows input: {}", self.rows_input)?;
        writeln!(f, "  Rows kept: {}", self.rows_kept)?;
        if self.kind == SortKind::External {
            writeln!(f, "  Number of merge runs: {}", self.num_merge_runs)?;
            writeln!(f, "  Merge run sizes: {:?}", self.merge_run_sizes)?;
            writeln!(f, "  Intermediate merge passes: {}", self.merge_passes)?;
        }
        Ok(())
    }
}
