use crate::{error::SortError, tuple::Tuple};

/// Hooks the sort buffer calls while inserting, letting the caller rewrite,
/// drop or aggregate rows. The default methods keep every row.
pub trait SortObserver {
    /// Called before a row whose key is not yet in the buffer is stored.
    /// Returning `None` vetoes the insert. A rewritten row must keep the
    /// ordering key of the original.
    fn insert_non_duplicate(&mut self, row: Tuple) -> Result<Option<Tuple>, SortError> {
        Ok(Some(row))
    }

    /// Called when `row` compares equal to `existing`. Returning `None`
    /// absorbs `row` (the existing row may have been updated in place);
    /// returning a row stores it on the duplicate chain of `existing`.
    fn insert_duplicate(
        &mut self,
        row: Tuple,
        _existing: &mut Tuple,
    ) -> Result<Option<Tuple>, SortError> {
        Ok(Some(row))
    }

    /// In deferred mode a unique-key collision found by the comparator is
    /// reported through `remember_duplicate` instead of making rows equal.
    fn deferred(&self) -> bool {
        false
    }

    fn remember_duplicate(&mut self, _row: &Tuple) -> Result<(), SortError> {
        Ok(())
    }
}

/// Keeps every row, equal ones on duplicate chains.
#[derive(Default)]
pub struct KeepAll;

impl SortObserver for KeepAll {}

/// Keeps the first row of each key and drops the rest (DISTINCT).
#[derive(Default)]
pub struct DuplicateEliminator;

impl SortObserver for DuplicateEliminator {
    fn insert_duplicate(
        &mut self,
        _row: Tuple,
        _existing: &mut Tuple,
    ) -> Result<Option<Tuple>, SortError> {
        Ok(None)
    }
}

/// Folds rows with equal keys into one by summing `column`.
pub struct SumAggregator {
    column: usize,
}

impl SumAggregator {
    pub fn new(column: usize) -> Self {
        Self { column }
    }
}

impl SortObserver for SumAggregator {
    fn insert_duplicate(
        &mut self,
        row: Tuple,
        existing: &mut Tuple,
    ) -> Result<Option<Tuple>, SortError> {
        if self.column >= row.len() || self.column >= existing.len() {
            return Err(SortError::Observer(format!(
                "aggregate column {} out of range",
                self.column
            )));
        }
        let sum = existing.get(self.column).clone() + row.get(self.column).clone();
        *existing.get_mut(self.column) = sum?;
        Ok(None)
    }
}

/// Enforces a unique key. Immediate mode fails the sort on the first
/// collision; deferred mode hands each colliding row to a callback and keeps
/// it so the constraint can be checked later.
pub struct UniqueConstraintObserver {
    constraint: String,
    on_duplicate: Option<Box<dyn FnMut(&Tuple)>>,
}

impl UniqueConstraintObserver {
    pub fn immediate(constraint: &str) -> Self {
        Self {
            constraint: constraint.to_string(),
            on_duplicate: None,
        }
    }

    pub fn deferred(constraint: &str, on_duplicate: impl FnMut(&Tuple) + 'static) -> Self {
        Self {
            constraint: constraint.to_string(),
            on_duplicate: Some(Box::new(on_duplicate)),
        }
    }
}

impl SortObserver for UniqueConstraintObserver {
    fn insert_duplicate(
        &mut self,
        row: Tuple,
        existing: &mut Tuple,
    ) -> Result<Option<Tuple>, SortError> {
        match self.on_duplicate.as_mut() {
            Some(callback) => {
                callback(&row);
                Ok(Some(row))
            }
            None => Err(SortError::DuplicateKey(format!(
                "{}: {} collides with {}",
                self.constraint, row, existing
            ))),
        }
    }

    fn deferred(&self) -> bool {
        self.on_duplicate.is_some()
    }

    fn remember_duplicate(&mut self, row: &Tuple) -> Result<(), SortError> {
        if let Some(callback) = self.on_duplicate.as_mut() {
            callback(row);
        }
        Ok(())
    }
}
