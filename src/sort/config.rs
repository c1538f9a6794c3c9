use crate::error::SortError;

/// Default number of rows the sort buffer holds before spilling.
pub const DEFAULT_SORT_BUFFER_MAX: usize = 1024;
/// A smaller buffer cannot run a meaningful merge.
pub const MINIMUM_SORT_BUFFER_MAX: usize = 4;
/// Upper bound on the number of runs merged in one pass.
pub const DEFAULT_MAX_MERGE_RUNS: usize = 512;
/// Memory a sort may use for its buffer when nothing better is known.
pub const DEFAULT_MEM_USE: usize = 1 << 20;
/// Slots allocated up front; the arena doubles from here.
pub const DEFAULT_INITIAL_NODES: usize = 128;
pub const DEFAULT_GROWTH_PERCENT: usize = 100;

pub const SORT_BUFFER_MAX_ENV: &str = "EXTSORT_SORT_BUFFER_MAX";
pub const MAX_MERGE_RUNS_ENV: &str = "EXTSORT_MAX_MERGE_RUNS";
pub const MEM_USE_ENV: &str = "EXTSORT_MEM_USE";

/// Decides whether a full sort buffer may grow instead of spilling. Only
/// consulted before the first spill of a sort.
#[derive(Clone, Debug, PartialEq)]
pub enum GrowthPolicy {
    /// Always spill.
    Never,
    /// Grow at most this many times.
    Limited(usize),
    /// Grow while the additional memory needed fits in half of what is left
    /// of this many bytes.
    MemoryBudget(usize),
}

impl GrowthPolicy {
    /// `bytes_in_use` is the estimated footprint of the rows currently held
    /// by the buffer, `growths` the number of growths already performed.
    pub fn allows_growth(&self, bytes_in_use: usize, growth_percent: usize, growths: usize) -> bool {
        match self {
            GrowthPolicy::Never => false,
            GrowthPolicy::Limited(max) => growths < *max,
            GrowthPolicy::MemoryBudget(budget) => {
                let extra = bytes_in_use.saturating_mul(growth_percent) / 100;
                let available = budget.saturating_sub(bytes_in_use);
                extra > 0 && extra <= available / 2
            }
        }
    }
}

#[derive(Clone, Debug)]
pub struct SortConfig {
    /// Rows the buffer may hold. `None` asks the sizing advisor, falling back
    /// to `DEFAULT_SORT_BUFFER_MAX`.
    pub buffer_capacity: Option<usize>,
    pub initial_nodes: usize,
    pub max_fan_in: usize,
    pub growth_policy: GrowthPolicy,
    pub growth_percent: usize,
    pub estimated_rows: Option<u64>,
    pub estimated_row_size: Option<usize>,
}

impl Default for SortConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: None,
            initial_nodes: DEFAULT_INITIAL_NODES,
            max_fan_in: DEFAULT_MAX_MERGE_RUNS,
            growth_policy: GrowthPolicy::MemoryBudget(DEFAULT_MEM_USE),
            growth_percent: DEFAULT_GROWTH_PERCENT,
            estimated_rows: None,
            estimated_row_size: None,
        }
    }
}

impl SortConfig {
    pub fn with_capacity(buffer_capacity: usize) -> Self {
        Self {
            buffer_capacity: Some(buffer_capacity),
            ..Default::default()
        }
    }

    pub fn max_fan_in(mut self, max_fan_in: usize) -> Self {
        self.max_fan_in = max_fan_in;
        self
    }

    pub fn growth_policy(mut self, policy: GrowthPolicy) -> Self {
        self.growth_policy = policy;
        self
    }

    pub fn estimates(mut self, rows: u64, row_size: usize) -> Self {
        self.estimated_rows = Some(rows);
        self.estimated_row_size = Some(row_size);
        self
    }

    /// Defaults overridden by `EXTSORT_SORT_BUFFER_MAX`,
    /// `EXTSORT_MAX_MERGE_RUNS` and `EXTSORT_MEM_USE`.
    pub fn from_env() -> Result<Self, SortError> {
        let mut config = SortConfig::default();
        if let Some(cap) = env_usize(SORT_BUFFER_MAX_ENV)? {
            config.buffer_capacity = Some(cap);
        }
        if let Some(fan_in) = env_usize(MAX_MERGE_RUNS_ENV)? {
            config.max_fan_in = fan_in;
        }
        if let Some(mem) = env_usize(MEM_USE_ENV)? {
            config.growth_policy = GrowthPolicy::MemoryBudget(mem);
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SortError> {
        if let Some(cap) = self.buffer_capacity {
            if cap < 2 {
                return Err(SortError::Config(format!(
                    "buffer capacity must be at least 2, got {}",
                    cap
                )));
            }
        }
        if self.max_fan_in < 2 {
            return Err(SortError::Config(format!(
                "max fan-in must be at least 2, got {}",
                self.max_fan_in
            )));
        }
        Ok(())
    }
}

fn env_usize(name: &str) -> Result<Option<usize>, SortError> {
    match std::env::var(name) {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .map(Some)
            .map_err(|e| SortError::Config(format!("{}={:?}: {}", name, val, e))),
        Err(_) => Ok(None),
    }
}

/// Picks the initial buffer capacity from row estimates. Consulted once, at
/// initialization.
pub trait SizingAdvisor {
    fn buffer_capacity(&self, estimated_rows: u64, estimated_row_size: usize) -> Option<usize>;
}

/// Fits as many estimated rows as `mem_use` bytes allow, but never more
/// than the estimated row count and never less than the minimum buffer.
pub struct MemoryBudgetAdvisor {
    pub mem_use: usize,
}

impl Default for MemoryBudgetAdvisor {
    fn default() -> Self {
        Self {
            mem_use: DEFAULT_MEM_USE,
        }
    }
}

impl SizingAdvisor for MemoryBudgetAdvisor {
    fn buffer_capacity(&self, estimated_rows: u64, estimated_row_size: usize) -> Option<usize> {
        if estimated_rows == 0 || estimated_row_size == 0 {
            return None;
        }
        let rows_in_mem = self.mem_use / estimated_row_size;
        let rows = (estimated_rows.min(usize::MAX as u64) as usize).min(rows_in_mem);
        Some(rows.max(MINIMUM_SORT_BUFFER_MAX))
    }
}
