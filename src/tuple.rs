use std::{cmp::Ordering, fmt::Debug, ops::Add};

use serde::{Deserialize, Serialize};

use crate::{
    error::SortError,
    schema::{ColumnDef, DataType},
};

/// A fixed-arity row. The engine only looks inside a tuple through the
/// comparator and the template check.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tuple {
    fields: Vec<Field>,
}

impl Tuple {
    pub fn with_capacity(capacity: usize) -> Self {
        Tuple {
            fields: Vec::with_capacity(capacity),
        }
    }

    pub fn from_fields(fields: Vec<Field>) -> Self {
        Tuple { fields }
    }

    pub fn fields(&self) -> &Vec<Field> {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn get(&self, field_idx: usize) -> &Field {
        &self.fields[field_idx]
    }

    pub fn get_mut(&mut self, field_idx: usize) -> &mut Field {
        &mut self.fields[field_idx]
    }

    pub fn push(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// Rough number of heap and inline bytes held by this tuple. Used by the
    /// memory-budget growth policy, not for anything exact.
    pub fn estimated_size(&self) -> usize {
        let inline = std::mem::size_of::<Tuple>() + self.fields.len() * std::mem::size_of::<Field>();
        let heap: usize = self
            .fields
            .iter()
            .map(|f| match f {
                Field::String(Some(s)) => s.len(),
                _ => 0,
            })
            .sum();
        inline + heap
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        // Fixed-width columns, counted in chars.
        const WIDTH: usize = 10;
        for field in &self.fields {
            let text = field.to_string();
            if text.chars().count() > WIDTH {
                let head: String = text.chars().take(WIDTH - 3).collect();
                write!(f, "{}...|", head)?;
            } else {
                write!(f, "{:<width$}|", text, width = WIDTH)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, PartialOrd, Serialize, Deserialize)]
pub enum Field {
    Boolean(Option<bool>),
    Int(Option<i64>),
    Float(Option<f64>),
    String(Option<String>),
    Date(Option<i64>),
}

impl Field {
    pub fn null(data_type: &DataType) -> Self {
        match data_type {
            DataType::Boolean => Field::Boolean(None),
            DataType::Int => Field::Int(None),
            DataType::Float => Field::Float(None),
            DataType::String => Field::String(None),
            DataType::Date => Field::Date(None),
        }
    }

    pub fn data_type(&self) -> DataType {
        match self {
            Field::Boolean(_) => DataType::Boolean,
            Field::Int(_) => DataType::Int,
            Field::Float(_) => DataType::Float,
            Field::String(_) => DataType::String,
            Field::Date(_) => DataType::Date,
        }
    }

    pub fn is_null(&self) -> bool {
        match self {
            Field::Boolean(val) => val.is_none(),
            Field::Int(val) => val.is_none(),
            Field::Float(val) => val.is_none(),
            Field::String(val) => val.is_none(),
            Field::Date(val) => val.is_none(),
        }
    }

    /// Compare two fields of the same type. A null sorts below every value
    /// when `nulls_low` is set and above every value otherwise; two nulls
    /// are equal. Floats use the IEEE total order.
    pub fn compare(&self, other: &Field, nulls_low: bool) -> Result<Ordering, SortError> {
        fn with_nulls<T>(
            a: &Option<T>,
            b: &Option<T>,
            nulls_low: bool,
            cmp: impl Fn(&T, &T) -> Ordering,
        ) -> Ordering {
            match (a, b) {
                (None, None) => Ordering::Equal,
                (None, Some(_)) if nulls_low => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (Some(_), None) if nulls_low => Ordering::Greater,
                (Some(_), None) => Ordering::Less,
                (Some(a), Some(b)) => cmp(a, b),
            }
        }

        match (self, other) {
            (Field::Boolean(a), Field::Boolean(b)) => Ok(with_nulls(a, b, nulls_low, Ord::cmp)),
            (Field::Int(a), Field::Int(b)) => Ok(with_nulls(a, b, nulls_low, Ord::cmp)),
            (Field::Float(a), Field::Float(b)) => {
                Ok(with_nulls(a, b, nulls_low, |a: &f64, b: &f64| a.total_cmp(b)))
            }
            (Field::String(a), Field::String(b)) => Ok(with_nulls(a, b, nulls_low, Ord::cmp)),
            (Field::Date(a), Field::Date(b)) => Ok(with_nulls(a, b, nulls_low, Ord::cmp)),
            (x, y) => Err(SortError::Comparison(format!(
                "Cannot compare {:?} and {:?}",
                x, y
            ))),
        }
    }

    pub fn from_str(column_def: &ColumnDef, field: &str) -> Result<Self, String> {
        let data_type = column_def.data_type();
        let is_nullable = column_def.is_nullable();
        if is_nullable && (field == "NULL" || field == "null" || field.is_empty()) {
            Ok(Field::null(data_type))
        } else {
            match data_type {
                DataType::Boolean => {
                    let val = field.parse::<bool>().map_err(|e| e.to_string())?;
                    Ok(Field::Boolean(Some(val)))
                }
                DataType::Int => {
                    let val = field.parse::<i64>().map_err(|e| e.to_string())?;
                    Ok(Field::Int(Some(val)))
                }
                DataType::Float => {
                    let val = field.parse::<f64>().map_err(|e| e.to_string())?;
                    Ok(Field::Float(Some(val)))
                }
                DataType::String => Ok(Field::String(Some(field.to_string()))),
                DataType::Date => {
                    let val = field.parse::<i64>().map_err(|e| e.to_string())?;
                    Ok(Field::Date(Some(val)))
                }
            }
        }
    }

    pub fn as_int(&self) -> &Option<i64> {
        match self {
            Field::Int(val) => val,
            _ => panic!("Field is not an int"),
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Field::Boolean(val) => match val {
                Some(val) => write!(f, "{}", val),
                None => write!(f, "NULL"),
            },
            Field::Int(val) => match val {
                Some(val) => write!(f, "{}", val),
                None => write!(f, "NULL"),
            },
            Field::Float(val) => match val {
                Some(val) => write!(f, "{}", val),
                None => write!(f, "NULL"),
            },
            Field::String(val) => match val {
                Some(val) => write!(f, "{}", val),
                None => write!(f, "NULL"),
            },
            Field::Date(val) => match val {
                Some(val) => write!(f, "{}", val),
                None => write!(f, "NULL"),
            },
        }
    }
}

impl Add for Field {
    type Output = Result<Field, SortError>;

    fn add(self, other: Self) -> Self::Output {
        match (self, other) {
            (Field::Int(Some(v1)), Field::Int(Some(v2))) => match v1.checked_add(v2) {
                Some(sum) => Ok(Field::Int(Some(sum))),
                None => Err(SortError::Observer(format!(
                    "integer overflow adding {} and {}",
                    v1, v2
                ))),
            },
            (Field::Int(_), Field::Int(_)) => Ok(Field::Int(None)),
            (Field::Float(val1), Field::Int(val2)) => Ok(Field::Float(
                val1.and_then(|v1| val2.map(|v2| v1 + v2 as f64)),
            )),
            (Field::Int(val1), Field::Float(val2)) => Ok(Field::Float(
                val1.and_then(|v1| val2.map(|v2| v1 as f64 + v2)),
            )),
            (Field::Float(val1), Field::Float(val2)) => {
                Ok(Field::Float(val1.and_then(|v1| val2.map(|v2| v1 + v2))))
            }
            (x, y) => Err(SortError::Observer(format!(
                "Cannot add {:?} and {:?}",
                x, y
            ))),
        }
    }
}

impl From<i64> for Field {
    fn from(val: i64) -> Self {
        Field::Int(Some(val))
    }
}

impl From<f64> for Field {
    fn from(val: f64) -> Self {
        Field::Float(Some(val))
    }
}

impl From<bool> for Field {
    fn from(val: bool) -> Self {
        Field::Boolean(Some(val))
    }
}

impl From<String> for Field {
    fn from(val: String) -> Self {
        Field::String(Some(val))
    }
}

impl From<&str> for Field {
    fn from(val: &str) -> Self {
        Field::String(Some(val.to_string()))
    }
}
