// External merge sort.
//
// Rows go into a bounded in-memory AVL buffer. When it fills up the buffer is
// drained into a sorted run; at scan time the runs are merged back, several
// passes deep if there are more runs than the buffer can merge at once.
//
//   Closed -> Initialized -> Inserting -> DoneInserting -> Scanning -> DoneScanning
//
// `drop_sort` returns to Closed from anywhere.
//
// Rows that compare equal come out in input order, spilled or not.

pub mod arena;
pub mod config;
pub mod info;
mod inserter;
mod merge;
pub mod observer;
pub mod ordering;
pub mod run_store;
pub mod sort_buffer;

use std::sync::Arc;

pub use inserter::SortInserter;
pub use merge::SortScan;

use crate::{
    error::SortError,
    log_debug, log_info,
    schema::{RowTemplate, RowTemplateRef},
};

use config::{
    MemoryBudgetAdvisor, SizingAdvisor, SortConfig, DEFAULT_SORT_BUFFER_MAX, MINIMUM_SORT_BUFFER_MAX,
};
use info::SortInfo;
use merge::{drain, drop_runs, reduce_runs, MergeScan};
use observer::SortObserver;
use ordering::SortOrder;
use run_store::{RowSink, RunHandle, RunStore};
use sort_buffer::SortBuffer;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SortState {
    Closed,
    Initialized,
    Inserting,
    DoneInserting,
    Scanning,
    DoneScanning,
}

pub struct ExternalSort<S: RunStore> {
    state: SortState,
    store: Arc<S>,
    advisor: Box<dyn SizingAdvisor>,
    config: SortConfig,
    template: RowTemplateRef,
    buffer: Option<SortBuffer>,
    runs: Vec<RunHandle>,
    info: SortInfo,
}

impl<S: RunStore> ExternalSort<S> {
    pub fn new(store: Arc<S>) -> Self {
        ExternalSort {
            state: SortState::Closed,
            store,
            advisor: Box::new(MemoryBudgetAdvisor::default()),
            config: SortConfig::default(),
            template: Arc::new(RowTemplate::new(Vec::new())),
            buffer: None,
            runs: Vec::new(),
            info: SortInfo::default(),
        }
    }

    /// Replace the advisor consulted for the buffer capacity when the
    /// configuration leaves it open.
    pub fn with_advisor(mut self, advisor: impl SizingAdvisor + 'static) -> Self {
        self.advisor = Box::new(advisor);
        self
    }

    pub fn state(&self) -> SortState {
        self.state
    }

    pub fn info(&self) -> &SortInfo {
        &self.info
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn buffer_capacity(&self) -> Option<usize> {
        self.buffer.as_ref().map(|b| b.capacity())
    }

    pub fn initialize(
        &mut self,
        order: SortOrder,
        template: RowTemplateRef,
        observer: Box<dyn SortObserver>,
        config: SortConfig,
    ) -> Result<(), SortError> {
        assert_eq!(
            self.state,
            SortState::Closed,
            "initialize on a sort that is already in use"
        );
        config.validate()?;
        order.validate(&template)?;

        let capacity = match (
            config.buffer_capacity,
            config.estimated_rows,
            config.estimated_row_size,
        ) {
            (Some(capacity), _, _) => capacity,
            // Advisors are caller code; a tiny buffer could not merge.
            (None, Some(rows), Some(row_size)) => self
                .advisor
                .buffer_capacity(rows, row_size)
                .map_or(DEFAULT_SORT_BUFFER_MAX, |c| c.max(MINIMUM_SORT_BUFFER_MAX)),
            _ => DEFAULT_SORT_BUFFER_MAX,
        };
        let initial_nodes = config.initial_nodes.clamp(1, capacity);
        log_info!(
            "sort initialized: {} columns, buffer of {} rows, fan-in {}",
            order.columns().len(),
            capacity,
            config.max_fan_in
        );

        self.buffer = Some(SortBuffer::new(order, observer, initial_nodes, capacity));
        self.template = template;
        self.config = config;
        self.info = SortInfo::default();
        self.state = SortState::Initialized;
        Ok(())
    }

    pub fn open(&mut self) -> SortInserter<'_, S> {
        assert_eq!(
            self.state,
            SortState::Initialized,
            "open needs a freshly initialized sort"
        );
        self.state = SortState::Inserting;
        SortInserter::new(self)
    }

    /// Start reading the sorted rows. Spills what is left in the buffer and
    /// merges runs down to the fan-in limit first if anything was spilled.
    pub fn open_scan(&mut self) -> Result<SortScan<'_, S>, SortError> {
        assert_eq!(
            self.state,
            SortState::DoneInserting,
            "scan needs a sort whose insertion is closed"
        );
        self.state = SortState::Scanning;
        let merge = match self.prepare_merge() {
            Ok(merge) => merge,
            Err(e) => {
                self.drop_sort();
                return Err(e);
            }
        };
        Ok(SortScan::new(self, merge))
    }

    /// Push every sorted row into `sink` and close the scan.
    pub fn push_to<K: RowSink + ?Sized>(&mut self, sink: &mut K) -> Result<usize, SortError> {
        let mut scan = self.open_scan()?;
        scan.push_into(sink)
    }

    fn prepare_merge(&mut self) -> Result<Option<MergeScan<S::Reader>>, SortError> {
        if self.runs.is_empty() {
            return Ok(None);
        }
        let buffer = self.buffer.as_mut().expect("sort buffer released");
        if !buffer.is_empty() {
            let run = drain(&*self.store, buffer)?.with_seq(self.runs.len() as u64);
            self.runs.push(run);
        }
        self.info.merge_passes = reduce_runs(
            &*self.store,
            buffer,
            &mut self.runs,
            self.config.max_fan_in,
            &self.template,
        )?;
        self.runs.sort_by_key(|run| run.seq());
        let merge = MergeScan::start(&*self.store, &self.runs, buffer, &self.template)?;
        Ok(Some(merge))
    }

    fn buffer_mut(&mut self) -> &mut SortBuffer {
        self.buffer.as_mut().expect("sort buffer released")
    }

    /// Release the buffer and every run. Valid in any state and never fails;
    /// the sort can be initialized again afterwards.
    pub fn drop_sort(&mut self) {
        if self.state == SortState::Closed && self.buffer.is_none() && self.runs.is_empty() {
            return;
        }
        self.buffer = None;
        drop_runs(&*self.store, self.runs.drain(..));
        self.state = SortState::Closed;
        log_debug!("sort dropped");
    }
}

impl<S: RunStore> Drop for ExternalSort<S> {
    fn drop(&mut self) {
        self.drop_sort();
    }
}

#[cfg(test)]
fn verify_sorted_results(
    result: &[crate::tuple::Tuple],
    order: &SortOrder,
) -> Result<(), String> {
    let mut observer = observer::KeepAll;
    for i in 1..result.len() {
        let prev = &result[i - 1];
        let curr = &result[i];
        let cmp_result = order
            .compare(prev, curr, &mut observer)
            .map_err(|e| e.to_string())?;
        if cmp_result == std::cmp::Ordering::Greater {
            return Err(format!(
                "Sort verification failed at row {}:\n\
                Previous tuple: {:?}\n\
                Current tuple: {:?}",
                i, prev, curr
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::{cell::RefCell, rc::Rc};

    use rand::{rngs::StdRng, seq::SliceRandom, Rng, SeedableRng};
    use rstest::rstest;

    use super::*;
    use crate::{
        schema::{ColumnDef, DataType},
        tuple::{Field, Tuple},
    };
    use super::{
        config::GrowthPolicy,
        observer::{DuplicateEliminator, KeepAll, SumAggregator, UniqueConstraintObserver},
        ordering::ColumnOrdering,
        run_store::{FileRunStore, InMemRunReader, InMemRunStore, InMemRunWriter, RunReader},
    };

    fn int_template(arity: usize) -> RowTemplateRef {
        Arc::new(RowTemplate::new(
            (0..arity)
                .map(|i| ColumnDef::new(&format!("c{}", i), DataType::Int, false))
                .collect(),
        ))
    }

    fn asc(col: usize) -> SortOrder {
        SortOrder::new(vec![ColumnOrdering::asc(col)])
    }

    fn keys(rows: &[Tuple]) -> Vec<i64> {
        rows.iter().map(|t| t.get(0).as_int().unwrap()).collect()
    }

    fn collect<S: RunStore>(sort: &mut ExternalSort<S>) -> Vec<Tuple> {
        let scan = sort.open_scan().unwrap();
        scan.map(|r| r.unwrap()).collect()
    }

    fn sort_rows<S: RunStore>(
        sort: &mut ExternalSort<S>,
        order: SortOrder,
        arity: usize,
        config: SortConfig,
        rows: Vec<Tuple>,
    ) -> Vec<Tuple> {
        sort.initialize(order, int_template(arity), Box::new(KeepAll), config)
            .unwrap();
        let mut inserter = sort.open();
        inserter.insert_all(rows).unwrap();
        inserter.close();
        collect(sort)
    }

    mod lifecycle {
        use super::*;

        #[test]
        fn test_spill_and_final_run() {
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(3).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            assert_eq!(sort.state(), SortState::Initialized);

            let mut inserter = sort.open();
            for (i, k) in [5, 3, 3, 1, 4].into_iter().enumerate() {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
                let expected_runs = if i < 3 { 0 } else { 1 };
                assert_eq!(store.num_runs(), expected_runs);
            }
            inserter.close();
            assert_eq!(sort.state(), SortState::DoneInserting);

            let info = sort.info().clone();
            assert_eq!(info.kind, info::SortKind::External);
            assert_eq!(info.num_merge_runs, 2);
            assert_eq!(info.merge_run_sizes, vec![3, 2]);
            assert_eq!(info.rows_input, 5);
            assert_eq!(info.rows_kept, 5);

            let out = collect(&mut sort);
            assert_eq!(keys(&out), vec![1, 3, 3, 4, 5]);
            assert_eq!(sort.state(), SortState::DoneScanning);
            assert_eq!(store.num_runs(), 0);
        }

        #[test]
        fn test_in_memory_sort() {
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let rows = (0..100).rev().map(|k| Tuple::from_fields(vec![k.into()])).collect();
            let out = sort_rows(&mut sort, asc(0), 1, SortConfig::default(), rows);
            assert_eq!(keys(&out), (0..100).collect::<Vec<_>>());
            assert_eq!(sort.info().kind, info::SortKind::Internal);
            assert_eq!(sort.info().num_merge_runs, 0);
        }

        #[test]
        #[should_panic(expected = "scan needs a sort whose insertion is closed")]
        fn test_second_scan_panics() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let rows = vec![Tuple::from_fields(vec![1.into()])];
            sort_rows(&mut sort, asc(0), 1, SortConfig::default(), rows);
            let _ = sort.open_scan();
        }

        #[test]
        #[should_panic(expected = "scan needs a sort whose insertion is closed")]
        fn test_scan_before_insert_panics() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default())
                .unwrap();
            let _ = sort.open_scan();
        }

        #[test]
        #[should_panic(expected = "open needs a freshly initialized sort")]
        fn test_reopen_insert_panics() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default())
                .unwrap();
            sort.open().close();
            sort.open();
        }

        #[test]
        #[should_panic(expected = "initialize on a sort that is already in use")]
        fn test_double_initialize_panics() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default())
                .unwrap();
            let _ = sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default());
        }

        #[test]
        fn test_dropped_inserter_closes() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default())
                .unwrap();
            {
                let mut inserter = sort.open();
                inserter.insert(Tuple::from_fields(vec![2.into()])).unwrap();
            }
            assert_eq!(sort.state(), SortState::DoneInserting);
            {
                let mut scan = sort.open_scan().unwrap();
                assert_eq!(scan.next().unwrap().unwrap(), Tuple::from_fields(vec![2.into()]));
            }
            assert_eq!(sort.state(), SortState::DoneScanning);
        }

        #[test]
        fn test_drop_sort_is_idempotent_and_releases_runs() {
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(4).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            let mut inserter = sort.open();
            for k in 0..20 {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();
            assert_eq!(store.num_runs(), 4);

            sort.drop_sort();
            assert_eq!(sort.state(), SortState::Closed);
            assert_eq!(store.num_runs(), 0);
            sort.drop_sort();
            assert_eq!(sort.state(), SortState::Closed);

            // A dropped sort can be reused.
            let rows = vec![Tuple::from_fields(vec![7.into()])];
            let out = sort_rows(&mut sort, asc(0), 1, SortConfig::default(), rows);
            assert_eq!(keys(&out), vec![7]);
        }

        #[test]
        fn test_dropping_sort_releases_runs() {
            let store = Arc::new(InMemRunStore::new());
            {
                let mut sort = ExternalSort::new(store.clone());
                let config = SortConfig::with_capacity(2).growth_policy(GrowthPolicy::Never);
                sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                    .unwrap();
                let mut inserter = sort.open();
                for k in 0..9 {
                    inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
                }
                inserter.close();
                assert!(store.num_runs() > 0);
            }
            assert_eq!(store.num_runs(), 0);
        }

        #[test]
        fn test_invalid_config_rejected() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let res = sort.initialize(
                asc(3),
                int_template(1),
                Box::new(KeepAll),
                SortConfig::default(),
            );
            assert!(matches!(res, Err(SortError::Config(_))));
            assert_eq!(sort.state(), SortState::Closed);
            let res = sort.initialize(
                asc(0),
                int_template(1),
                Box::new(KeepAll),
                SortConfig::default().max_fan_in(1),
            );
            assert!(matches!(res, Err(SortError::Config(_))));
        }

        #[test]
        fn test_advisor_sets_capacity() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()))
                .with_advisor(MemoryBudgetAdvisor { mem_use: 10_000 });
            let config = SortConfig::default().estimates(1_000_000, 100);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            assert_eq!(sort.buffer_capacity(), Some(100));

            sort.drop_sort();
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default())
                .unwrap();
            assert_eq!(sort.buffer_capacity(), Some(DEFAULT_SORT_BUFFER_MAX));
        }

        /// Keeps even keys only.
        struct EvenKeys;

        impl SortObserver for EvenKeys {
            fn insert_non_duplicate(&mut self, row: Tuple) -> Result<Option<Tuple>, SortError> {
                match row.get(0) {
                    Field::Int(Some(k)) if k % 2 != 0 => Ok(None),
                    _ => Ok(Some(row)),
                }
            }
        }

        #[test]
        fn test_empty_buffer_at_close_adds_no_run() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(2).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(EvenKeys), config)
                .unwrap();
            let mut inserter = sort.open();
            // The buffer spills to make room for 3, which the observer then drops.
            for k in [0, 2, 3] {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();
            assert_eq!(sort.info().kind, info::SortKind::External);
            assert_eq!(sort.info().num_merge_runs, 1);
            assert_eq!(sort.info().merge_run_sizes, vec![2]);
            assert_eq!(keys(&collect(&mut sort)), vec![0, 2]);
        }

        struct OneRowAdvisor;

        impl SizingAdvisor for OneRowAdvisor {
            fn buffer_capacity(&self, _: u64, _: usize) -> Option<usize> {
                Some(1)
            }
        }

        #[test]
        fn test_advisor_capacity_raised_to_minimum() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new())).with_advisor(OneRowAdvisor);
            let config = SortConfig::default()
                .estimates(50, 8)
                .growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            assert_eq!(sort.buffer_capacity(), Some(MINIMUM_SORT_BUFFER_MAX));

            let mut inserter = sort.open();
            for k in (0..50).rev() {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();
            assert_eq!(keys(&collect(&mut sort)), (0..50).collect::<Vec<_>>());
            assert!(sort.info().merge_passes > 0);
        }
    }

    mod ordering_and_spills {
        use super::*;

        /// Rows with random keys; the second column is the input position.
        fn random_rows(n: usize, key_range: i64, seed: u64) -> Vec<Tuple> {
            let mut rng = StdRng::seed_from_u64(seed);
            (0..n as i64)
                .map(|i| {
                    let k = rng.gen_range(0..key_range);
                    Tuple::from_fields(vec![k.into(), i.into()])
                })
                .collect()
        }

        fn stable_sorted(mut rows: Vec<Tuple>) -> Vec<Tuple> {
            rows.sort_by_key(|t| t.get(0).as_int().unwrap());
            rows
        }

        #[rstest]
        #[case::tiny_buffer(3, 512)]
        #[case::small_buffer(16, 512)]
        #[case::fan_in_two(8, 2)]
        #[case::fan_in_three(8, 3)]
        fn test_spill_transparency(#[case] capacity: usize, #[case] max_fan_in: usize) {
            let rows = random_rows(1000, 300, 7);

            let mut in_mem = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let expected = sort_rows(
                &mut in_mem,
                asc(0),
                2,
                SortConfig::with_capacity(2000).growth_policy(GrowthPolicy::Never),
                rows.clone(),
            );
            assert_eq!(in_mem.info().kind, info::SortKind::Internal);

            let mut spilling = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(capacity)
                .max_fan_in(max_fan_in)
                .growth_policy(GrowthPolicy::Never);
            let out = sort_rows(&mut spilling, asc(0), 2, config, rows);
            assert_eq!(spilling.info().kind, info::SortKind::External);
            if max_fan_in < 4 {
                assert!(spilling.info().merge_passes > 0);
            }

            assert_eq!(out.len(), 1000);
            assert_eq!(out, expected);
            verify_sorted_results(&out, &asc(0)).unwrap();
        }

        #[rstest]
        #[case::fan_in_four(4, 512)]
        #[case::fan_in_two(4, 2)]
        fn test_ties_keep_input_order(#[case] capacity: usize, #[case] max_fan_in: usize) {
            let rows = random_rows(40, 5, 21);
            let expected = stable_sorted(rows.clone());

            let mut in_mem = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(100).growth_policy(GrowthPolicy::Never);
            let unspilled = sort_rows(&mut in_mem, asc(0), 2, config, rows.clone());
            assert_eq!(unspilled, expected);

            let mut spilling = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(capacity)
                .max_fan_in(max_fan_in)
                .growth_policy(GrowthPolicy::Never);
            let spilled = sort_rows(&mut spilling, asc(0), 2, config, rows);
            assert_eq!(spilling.info().kind, info::SortKind::External);
            assert_eq!(spilled, unspilled);
        }

        #[test]
        fn test_eliminator_keeps_first_row_across_runs() {
            let rows = random_rows(300, 10, 5);
            let mut expected: Vec<Tuple> = Vec::new();
            for row in stable_sorted(rows.clone()) {
                if expected.last().map(|t| t.get(0)) != Some(row.get(0)) {
                    expected.push(row);
                }
            }

            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(4)
                .max_fan_in(2)
                .growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(2), Box::new(DuplicateEliminator), config)
                .unwrap();
            let mut inserter = sort.open();
            inserter.insert_all(rows).unwrap();
            inserter.close();
            assert!(sort.info().merge_passes > 0);
            assert_eq!(collect(&mut sort), expected);
        }

        #[test]
        fn test_multi_column_descending() {
            let mut rows = Vec::new();
            for a in 0..10 {
                for b in 0..10 {
                    rows.push(Tuple::from_fields(vec![a.into(), b.into()]));
                }
            }
            rows.shuffle(&mut StdRng::seed_from_u64(3));
            let order = SortOrder::new(vec![ColumnOrdering::desc(0), ColumnOrdering::asc(1)]);
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(7).growth_policy(GrowthPolicy::Never);
            let out = sort_rows(&mut sort, order.clone(), 2, config, rows);
            assert_eq!(out.len(), 100);
            verify_sorted_results(&out, &order).unwrap();
            assert_eq!(out[0], Tuple::from_fields(vec![9.into(), 0.into()]));
            assert_eq!(out[99], Tuple::from_fields(vec![0.into(), 9.into()]));
        }

        #[test]
        fn test_growth_avoids_spill() {
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(4).growth_policy(GrowthPolicy::Limited(3));
            let rows = (0..20).rev().map(|k| Tuple::from_fields(vec![k.into()])).collect();
            let out = sort_rows(&mut sort, asc(0), 1, config, rows);
            assert_eq!(keys(&out), (0..20).collect::<Vec<_>>());
            assert_eq!(sort.info().kind, info::SortKind::Internal);
            assert!(sort.buffer_capacity().unwrap() >= 20);
        }

        #[test]
        fn test_growth_stops_at_limit() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(4).growth_policy(GrowthPolicy::Limited(1));
            let rows = (0..40).map(|k| Tuple::from_fields(vec![k.into()])).collect();
            let out = sort_rows(&mut sort, asc(0), 1, config, rows);
            assert_eq!(out.len(), 40);
            assert_eq!(sort.info().kind, info::SortKind::External);
        }

        #[test]
        fn test_memory_budget_grows_then_spills() {
            let rows: Vec<Tuple> = (0..200).rev().map(|k| Tuple::from_fields(vec![k.into()])).collect();
            let row_bytes = rows[0].estimated_size() + std::mem::size_of::<arena::Node>();

            // Room for one doubling of a 4-row buffer, not for a second one.
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(4)
                .growth_policy(GrowthPolicy::MemoryBudget(20 * row_bytes));
            let out = sort_rows(&mut sort, asc(0), 1, config, rows.clone());
            assert_eq!(keys(&out), (0..200).collect::<Vec<_>>());
            assert_eq!(sort.info().kind, info::SortKind::External);
            let capacity = sort.buffer_capacity().unwrap();
            assert!(capacity > 4 && capacity < 200, "capacity {}", capacity);

            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(4)
                .growth_policy(GrowthPolicy::MemoryBudget(config::DEFAULT_MEM_USE));
            let out = sort_rows(&mut sort, asc(0), 1, config, rows);
            assert_eq!(keys(&out), (0..200).collect::<Vec<_>>());
            assert_eq!(sort.info().kind, info::SortKind::Internal);
            assert!(sort.buffer_capacity().unwrap() >= 200);
        }

        #[test]
        fn test_file_backed_sort() {
            let dir = tempfile::tempdir().unwrap();
            let store = Arc::new(FileRunStore::new_in(dir.path()).unwrap());
            let mut sort = ExternalSort::new(store.clone());
            let rows = random_rows(2000, 1_000_000, 11);
            let config = SortConfig::with_capacity(64)
                .max_fan_in(8)
                .growth_policy(GrowthPolicy::Never);
            let out = sort_rows(&mut sort, asc(0), 2, config, rows);
            assert_eq!(out.len(), 2000);
            verify_sorted_results(&out, &asc(0)).unwrap();
            assert!(sort.info().merge_passes > 0);
            assert_eq!(std::fs::read_dir(store.dir()).unwrap().count(), 0);
        }

        #[test]
        fn test_push_to_sink() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(5).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            let mut inserter = sort.open();
            for k in [9, 2, 7, 4, 5, 1, 8, 3, 6, 0] {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();

            let mut sink: Vec<Tuple> = Vec::new();
            assert_eq!(sort.push_to(&mut sink).unwrap(), 10);
            assert_eq!(keys(&sink), (0..10).collect::<Vec<_>>());
            assert_eq!(sort.state(), SortState::DoneScanning);
        }
    }

    mod duplicates {
        use super::*;

        #[test]
        fn test_eliminator_across_spills() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(4).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(DuplicateEliminator), config)
                .unwrap();
            let mut inserter = sort.open();
            for k in (0..60).map(|i| (i / 2) % 13) {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();
            let out = collect(&mut sort);
            assert_eq!(keys(&out), (0..13).collect::<Vec<_>>());
            assert!(sort.info().rows_kept < 60);
        }

        #[test]
        fn test_sum_aggregator_across_spills() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(3).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(2), Box::new(SumAggregator::new(1)), config)
                .unwrap();
            let mut inserter = sort.open();
            for i in 0..50 {
                inserter
                    .insert(Tuple::from_fields(vec![(i % 5).into(), 1.into()]))
                    .unwrap();
            }
            inserter.close();
            let out = collect(&mut sort);
            let expected: Vec<Tuple> = (0..5)
                .map(|k| Tuple::from_fields(vec![k.into(), 10.into()]))
                .collect();
            assert_eq!(out, expected);
        }

        fn nullable_key_template() -> RowTemplateRef {
            Arc::new(RowTemplate::new(vec![
                ColumnDef::new("k", DataType::Int, false),
                ColumnDef::new("j", DataType::Int, true),
                ColumnDef::new("rowid", DataType::String, false),
            ]))
        }

        fn unique_order() -> SortOrder {
            SortOrder::unique_with_duplicate_nulls(vec![
                ColumnOrdering::asc(0),
                ColumnOrdering::asc(1),
                ColumnOrdering::asc(2),
            ])
        }

        fn keyed(k: i64, j: Option<i64>, rowid: &str) -> Tuple {
            Tuple::from_fields(vec![k.into(), Field::Int(j), rowid.into()])
        }

        #[test]
        fn test_null_keys_kept_and_real_duplicate_absorbed() {
            let mut buf = SortBuffer::new(unique_order(), Box::new(DuplicateEliminator), 4, 16);
            use crate::sort::sort_buffer::InsertOutcome;
            assert_eq!(
                buf.insert(keyed(1, None, "A")).unwrap(),
                InsertOutcome::Inserted
            );
            assert_eq!(
                buf.insert(keyed(1, None, "B")).unwrap(),
                InsertOutcome::Inserted
            );
            assert_eq!(
                buf.insert(keyed(1, Some(5), "C")).unwrap(),
                InsertOutcome::Inserted
            );
            assert_eq!(
                buf.insert(keyed(1, Some(5), "D")).unwrap(),
                InsertOutcome::Duplicate
            );
            assert_eq!(buf.len(), 3);
        }

        #[test]
        fn test_unique_constraint_violation_aborts_sort() {
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(2).growth_policy(GrowthPolicy::Never);
            sort.initialize(
                unique_order(),
                nullable_key_template(),
                Box::new(UniqueConstraintObserver::immediate("uk")),
                config,
            )
            .unwrap();
            let mut inserter = sort.open();
            inserter.insert(keyed(1, None, "A")).unwrap();
            inserter.insert(keyed(1, None, "B")).unwrap();
            inserter.insert(keyed(1, Some(5), "C")).unwrap();
            let res = inserter.insert(keyed(1, Some(5), "D"));
            assert!(matches!(res, Err(SortError::DuplicateKey(_))));
            drop(inserter);
            assert_eq!(sort.state(), SortState::Closed);
            assert_eq!(store.num_runs(), 0);
        }

        #[test]
        fn test_unique_constraint_across_runs() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(2).growth_policy(GrowthPolicy::Never);
            sort.initialize(
                unique_order(),
                nullable_key_template(),
                Box::new(UniqueConstraintObserver::immediate("uk")),
                config,
            )
            .unwrap();
            let mut inserter = sort.open();
            for (k, rowid) in [(1, "A"), (2, "B"), (3, "C"), (1, "D")] {
                inserter.insert(keyed(k, Some(0), rowid)).unwrap();
            }
            inserter.close();
            // The collision is only visible once the runs are merged.
            let res = sort.open_scan().map(|scan| scan.collect::<Result<Vec<_>, _>>());
            let failed = match res {
                Err(e) => matches!(e, SortError::DuplicateKey(_)),
                Ok(Err(e)) => matches!(e, SortError::DuplicateKey(_)),
                Ok(Ok(_)) => false,
            };
            assert!(failed);
            assert_eq!(sort.state(), SortState::Closed);
        }

        #[test]
        fn test_deferred_unique_constraint_across_runs() {
            let seen = Rc::new(RefCell::new(Vec::new()));
            let sink = seen.clone();
            let observer =
                UniqueConstraintObserver::deferred("uk", move |t| sink.borrow_mut().push(t.clone()));
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(2).growth_policy(GrowthPolicy::Never);
            sort.initialize(unique_order(), nullable_key_template(), Box::new(observer), config)
                .unwrap();
            let mut inserter = sort.open();
            for (k, rowid) in [(1, "A"), (2, "B"), (3, "C"), (1, "D")] {
                inserter.insert(keyed(k, Some(0), rowid)).unwrap();
            }
            inserter.close();
            assert_eq!(sort.info().kind, info::SortKind::External);
            // A and D land in different runs and only meet in the merge.
            assert!(seen.borrow().is_empty());

            let out = collect(&mut sort);
            assert_eq!(
                out,
                vec![
                    keyed(1, Some(0), "A"),
                    keyed(1, Some(0), "D"),
                    keyed(2, Some(0), "B"),
                    keyed(3, Some(0), "C"),
                ]
            );
            assert!(seen.borrow().contains(&keyed(1, Some(0), "D")));
            assert_eq!(store.num_runs(), 0);
        }
    }

    mod failures {
        use super::*;

        /// Run store whose readers fail after handing out `reads` rows.
        struct FlakyStore {
            inner: InMemRunStore,
            reads: usize,
        }

        struct FlakyReader {
            inner: InMemRunReader,
            left: usize,
        }

        impl RunReader for FlakyReader {
            fn next(&mut self) -> Result<Option<Tuple>, SortError> {
                if self.left == 0 {
                    return Err(SortError::Storage("device unavailable".to_string()));
                }
                self.left -= 1;
                self.inner.next()
            }

            fn close(self) -> Result<(), SortError> {
                self.inner.close()
            }
        }

        impl RunStore for FlakyStore {
            type Writer = InMemRunWriter;
            type Reader = FlakyReader;

            fn create(&self) -> Result<InMemRunWriter, SortError> {
                self.inner.create()
            }

            fn open(&self, run: &RunHandle) -> Result<FlakyReader, SortError> {
                Ok(FlakyReader {
                    inner: self.inner.open(run)?,
                    left: self.reads,
                })
            }

            fn drop_run(&self, run: RunHandle) -> Result<(), SortError> {
                self.inner.drop_run(run)
            }
        }

        #[test]
        fn test_read_failure_aborts_scan() {
            let store = Arc::new(FlakyStore {
                inner: InMemRunStore::new(),
                reads: 2,
            });
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(8).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            let mut inserter = sort.open();
            for k in 0..20 {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();

            let results: Vec<_> = sort.open_scan().unwrap().collect();
            assert!(matches!(results.last(), Some(Err(SortError::Storage(_)))));
            assert!(results[..results.len() - 1].iter().all(|r| r.is_ok()));
            assert_eq!(sort.state(), SortState::Closed);
            assert_eq!(store.inner.num_runs(), 0);
            sort.drop_sort();
        }

        #[test]
        fn test_shape_error_aborts_insert() {
            let store = Arc::new(InMemRunStore::new());
            let mut sort = ExternalSort::new(store.clone());
            let config = SortConfig::with_capacity(3).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), config)
                .unwrap();
            let mut inserter = sort.open();
            for k in 0..10 {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            assert!(store.num_runs() > 0);
            let res = inserter.insert(Tuple::from_fields(vec!["ten".into()]));
            assert!(matches!(res, Err(SortError::Shape(_))));
            inserter.close();
            assert_eq!(sort.state(), SortState::Closed);
            assert_eq!(store.num_runs(), 0);
        }

        /// Appends a column to every new key, breaking the template.
        struct Widen;

        impl SortObserver for Widen {
            fn insert_non_duplicate(&mut self, mut row: Tuple) -> Result<Option<Tuple>, SortError> {
                row.push(0.into());
                Ok(Some(row))
            }
        }

        #[test]
        fn test_in_memory_scan_validates_rows() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            let config = SortConfig::with_capacity(16).growth_policy(GrowthPolicy::Never);
            sort.initialize(asc(0), int_template(1), Box::new(Widen), config)
                .unwrap();
            let mut inserter = sort.open();
            for k in 0..3 {
                inserter.insert(Tuple::from_fields(vec![k.into()])).unwrap();
            }
            inserter.close();
            assert_eq!(sort.info().kind, info::SortKind::Internal);

            let results: Vec<_> = sort.open_scan().unwrap().collect();
            assert_eq!(results.len(), 1);
            assert!(matches!(results[0], Err(SortError::Shape(_))));
            assert_eq!(sort.state(), SortState::Closed);
        }

        #[test]
        #[should_panic(expected = "insert into a sort that is not accepting rows")]
        fn test_insert_after_failure_panics() {
            let mut sort = ExternalSort::new(Arc::new(InMemRunStore::new()));
            sort.initialize(asc(0), int_template(1), Box::new(KeepAll), SortConfig::default())
                .unwrap();
            let mut inserter = sort.open();
            let _ = inserter.insert(Tuple::from_fields(vec![]));
            let _ = inserter.insert(Tuple::from_fields(vec![1.into()]));
        }
    }
}
