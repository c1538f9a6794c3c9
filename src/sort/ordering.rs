use std::cmp::Ordering;

use crate::{error::SortError, schema::RowTemplate, tuple::Tuple};

use super::observer::SortObserver;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ColumnOrdering {
    pub column: usize,
    pub ascending: bool,
    /// Nulls compare below every value. Reversed along with the values on a
    /// descending column.
    pub nulls_low: bool,
}

impl ColumnOrdering {
    pub fn new(column: usize, ascending: bool) -> Self {
        Self {
            column,
            ascending,
            nulls_low: false,
        }
    }

    pub fn asc(column: usize) -> Self {
        Self::new(column, true)
    }

    pub fn desc(column: usize) -> Self {
        Self::new(column, false)
    }

    pub fn nulls_low(mut self, nulls_low: bool) -> Self {
        self.nulls_low = nulls_low;
        self
    }
}

/// Row order of one sort: the column list plus the choice of comparison.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SortOrder {
    columns: Vec<ColumnOrdering>,
    unique_with_duplicate_nulls: bool,
}

impl SortOrder {
    pub fn new(columns: Vec<ColumnOrdering>) -> Self {
        Self {
            columns,
            unique_with_duplicate_nulls: false,
        }
    }

    /// Order for building a unique index whose key may hold nulls. The last
    /// column is the row locator appended to the user key; it only takes
    /// part in the comparison when a key column is null (or the observer is
    /// deferred), so null keys never collapse.
    pub fn unique_with_duplicate_nulls(columns: Vec<ColumnOrdering>) -> Self {
        Self {
            columns,
            unique_with_duplicate_nulls: true,
        }
    }

    pub fn columns(&self) -> &[ColumnOrdering] {
        &self.columns
    }

    pub fn is_unique_with_duplicate_nulls(&self) -> bool {
        self.unique_with_duplicate_nulls
    }

    pub fn validate(&self, template: &RowTemplate) -> Result<(), SortError> {
        if self.columns.is_empty() {
            return Err(SortError::Config("sort order has no columns".to_string()));
        }
        if self.unique_with_duplicate_nulls && self.columns.len() < 2 {
            return Err(SortError::Config(
                "unique-with-duplicate-nulls order needs a key column and a locator".to_string(),
            ));
        }
        for ord in &self.columns {
            if ord.column >= template.arity() {
                return Err(SortError::Config(format!(
                    "sort column {} out of range for {}",
                    ord.column, template
                )));
            }
        }
        Ok(())
    }

    pub fn compare(
        &self,
        a: &Tuple,
        b: &Tuple,
        observer: &mut dyn SortObserver,
    ) -> Result<Ordering, SortError> {
        if self.unique_with_duplicate_nulls {
            self.compare_nulls_distinct(a, b, observer)
        } else {
            self.compare_columns(a, b, &self.columns)
        }
    }

    fn compare_columns(
        &self,
        a: &Tuple,
        b: &Tuple,
        columns: &[ColumnOrdering],
    ) -> Result<Ordering, SortError> {
        for ord in columns {
            let c = compare_column(a, b, ord)?;
            if c != Ordering::Equal {
                return Ok(c);
            }
        }
        Ok(Ordering::Equal)
    }

    fn compare_nulls_distinct(
        &self,
        a: &Tuple,
        b: &Tuple,
        observer: &mut dyn SortObserver,
    ) -> Result<Ordering, SortError> {
        let (locator, key) = self
            .columns
            .split_last()
            .expect("validated order has a locator column");
        let mut saw_null = false;
        for ord in key {
            let c = compare_column(a, b, ord)?;
            if c != Ordering::Equal {
                return Ok(c);
            }
            if a.fields()[ord.column].is_null() {
                saw_null = true;
            }
        }
        if !saw_null {
            if !observer.deferred() {
                return Ok(Ordering::Equal);
            }
            observer.remember_duplicate(a)?;
        }
        compare_column(a, b, locator)
    }
}

fn compare_column(a: &Tuple, b: &Tuple, ord: &ColumnOrdering) -> Result<Ordering, SortError> {
    let (fa, fb) = match (a.fields().get(ord.column), b.fields().get(ord.column)) {
        (Some(fa), Some(fb)) => (fa, fb),
        _ => {
            return Err(SortError::Shape(format!(
                "sort column {} missing from row",
                ord.column
            )))
        }
    };
    let c = fa.compare(fb, ord.nulls_low)?;
    Ok(if ord.ascending { c } else { c.reverse() })
}
