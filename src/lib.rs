mod error;
pub mod logger;
mod schema;
pub mod sort;
mod tuple;

pub use error::SortError;
pub use schema::{ColumnDef, DataType, RowTemplate, RowTemplateRef};
pub use tuple::{Field, Tuple};

pub mod prelude {
    pub use super::{ColumnDef, DataType, Field, RowTemplate, RowTemplateRef, SortError, Tuple};
    pub use crate::sort::{
        config::{
            GrowthPolicy, MemoryBudgetAdvisor, SizingAdvisor, SortConfig, DEFAULT_MAX_MERGE_RUNS,
            DEFAULT_MEM_USE, DEFAULT_SORT_BUFFER_MAX, MINIMUM_SORT_BUFFER_MAX,
        },
        info::{SortInfo, SortKind},
        observer::{
            DuplicateEliminator, KeepAll, SortObserver, SumAggregator, UniqueConstraintObserver,
        },
        ordering::{ColumnOrdering, SortOrder},
        run_store::{
            FileRunStore, InMemRunStore, RowSink, RunHandle, RunReader, RunStore, RunWriter,
        },
        sort_buffer::{InsertOutcome, SortBuffer},
        ExternalSort, SortInserter, SortScan, SortState,
    };
}
