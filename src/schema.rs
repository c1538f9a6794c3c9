use std::sync::Arc;

use crate::{error::SortError, tuple::Tuple};

pub type RowTemplateRef = Arc<RowTemplate>;

/// The fixed column-type vector every row in a sort must match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowTemplate {
    columns: Vec<ColumnDef>,
}

impl RowTemplate {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        RowTemplate { columns }
    }

    pub fn columns(&self) -> &Vec<ColumnDef> {
        &self.columns
    }

    pub fn arity(&self) -> usize {
        self.columns.len()
    }

    pub fn get_column(&self, idx: usize) -> &ColumnDef {
        &self.columns[idx]
    }

    /// Check arity, column types and nullability of `tuple`.
    pub fn validate(&self, tuple: &Tuple) -> Result<(), SortError> {
        if tuple.len() != self.columns.len() {
            return Err(SortError::Shape(format!(
                "expected {} columns, got {}",
                self.columns.len(),
                tuple.len()
            )));
        }
        for (i, (field, col)) in tuple.fields().iter().zip(&self.columns).enumerate() {
            let data_type = field.data_type();
            if &data_type != col.data_type() {
                return Err(SortError::Shape(format!(
                    "column {} ({}) expects {}, got {}",
                    i,
                    col.name(),
                    col.data_type(),
                    data_type
                )));
            }
            if field.is_null() && !col.is_nullable() {
                return Err(SortError::Shape(format!(
                    "column {} ({}) is not nullable",
                    i,
                    col.name()
                )));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for RowTemplate {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "Template: [")?;
        for (i, col) in self.columns.iter().enumerate() {
            write!(f, "{}: {}", col.name(), col.data_type())?;
            if col.is_nullable() {
                write!(f, "?")?;
            }
            if i < self.columns.len() - 1 {
                write!(f, ", ")?;
            }
        }
        write!(f, "]")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnDef {
    name: String,
    data_type: DataType,
    is_nullable: bool,
}

impl ColumnDef {
    /// Create a new column definition.
    /// name: Name of the column.
    /// data_type: Data type of the column.
    /// is_nullable: Whether the column is nullable.
    pub fn new(name: &str, data_type: DataType, is_nullable: bool) -> Self {
        ColumnDef {
            name: name.to_string(),
            data_type,
            is_nullable,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> &DataType {
        &self.data_type
    }

    pub fn is_nullable(&self) -> bool {
        self.is_nullable
    }
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataType {
    Boolean = 0,
    Int,
    Float,
    String,
    Date,
}

impl std::str::FromStr for DataType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "bool" | "boolean" => Ok(DataType::Boolean),
            "int" | "integer" | "bigint" => Ok(DataType::Int),
            "float" | "double" => Ok(DataType::Float),
            "string" | "str" | "varchar" | "text" => Ok(DataType::String),
            "date" => Ok(DataType::Date),
            other => Err(format!("Unknown data type: {}", other)),
        }
    }
}

impl std::fmt::Display for DataType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            DataType::Boolean => write!(f, "Boolean"),
            DataType::Int => write!(f, "Int"),
            DataType::Float => write!(f, "Float"),
            DataType::String => write!(f, "String"),
            DataType::Date => write!(f, "Date"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuple::Field;

    fn template() -> RowTemplate {
        RowTemplate::new(vec![
            ColumnDef::new("id", DataType::Int, false),
            ColumnDef::new("name", DataType::String, true),
        ])
    }

    #[test]
    fn test_validate_accepts_matching_row() {
        let t = Tuple::from_fields(vec![1.into(), Field::String(None)]);
        assert!(template().validate(&t).is_ok());
    }

    #[test]
    fn test_validate_rejects_arity() {
        let t = Tuple::from_fields(vec![1.into()]);
        assert!(matches!(template().validate(&t), Err(SortError::Shape(_))));
    }

    #[test]
    fn test_validate_rejects_type_and_null() {
        let wrong_type = Tuple::from_fields(vec!["x".into(), "y".into()]);
        assert!(matches!(
            template().validate(&wrong_type),
            Err(SortError::Shape(_))
        ));
        let null_key = Tuple::from_fields(vec![Field::Int(None), "y".into()]);
        assert!(matches!(
            template().validate(&null_key),
            Err(SortError::Shape(_))
        ));
    }

    #[test]
    fn test_data_type_from_str() {
        assert_eq!("INT".parse::<DataType>().unwrap(), DataType::Int);
        assert_eq!("varchar".parse::<DataType>().unwrap(), DataType::String);
        assert!("blob".parse::<DataType>().is_err());
    }
}
