use serde::{Deserialize, Serialize};

use crate::error::{Result, ServingError};

/// Shape used for NDARRAY columns whose real shape has not been observed yet.
pub const UNRESOLVED_SHAPE: [usize; 2] = [1, 1];

/// The type of a single named column in a [`Schema`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "UPPERCASE")]
pub enum ColumnType {
    Long,
    Double,
    String,
    Boolean,
    /// N-dimensional array column. The shape may be the `[1, 1]` sentinel
    /// until a concrete value has been observed.
    NdArray { shape: Vec<usize> },
}

impl ColumnType {
    pub fn ndarray_unresolved() -> Self {
        ColumnType::NdArray {
            shape: UNRESOLVED_SHAPE.to_vec(),
        }
    }

    /// Column types match for conformance purposes when their tags agree;
    /// NDARRAY shapes are compared only when both sides are resolved.
    pub fn accepts(&self, other: &ColumnType) -> bool {
        match (self, other) {
            (ColumnType::NdArray { shape: a }, ColumnType::NdArray { shape: b }) => {
                a.as_slice() == UNRESOLVED_SHAPE
                    || b.as_slice() == UNRESOLVED_SHAPE
                    || a == b
            }
            (a, b) => a == b,
        }
    }
}

/// Ordered, named, typed column list. Built once via [`SchemaBuilder`] and
/// immutable afterward; column order defines positional encodings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    columns: Vec<(String, ColumnType)>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    /// Builds a schema from parallel name/type slices.
    pub fn from_columns(names: &[&str], types: &[ColumnType]) -> Result<Self> {
        if names.len() != types.len() {
            return Err(ServingError::Configuration(format!(
                "schema column names ({}) and types ({}) differ in length",
                names.len(),
                types.len()
            )));
        }
        let mut builder = Schema::builder();
        for (name, ty) in names.iter().zip(types.iter()) {
            builder = builder.column(name, ty.clone());
        }
        builder.build()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(n, _)| n.as_str())
    }

    pub fn column_type(&self, name: &str) -> Option<&ColumnType> {
        self.columns
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, t)| t)
    }

    pub fn column_at(&self, index: usize) -> Option<(&str, &ColumnType)> {
        self.columns.get(index).map(|(n, t)| (n.as_str(), t))
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|(n, _)| n == name)
    }

    pub fn columns(&self) -> &[(String, ColumnType)] {
        &self.columns
    }
}

/// Builder enforcing unique column names and preserving insertion order.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    columns: Vec<(String, ColumnType)>,
}

impl SchemaBuilder {
    pub fn column(mut self, name: &str, column_type: ColumnType) -> Self {
        self.columns.push((name.to_string(), column_type));
        self
    }

    pub fn long(self, name: &str) -> Self {
        self.column(name, ColumnType::Long)
    }

    pub fn double(self, name: &str) -> Self {
        self.column(name, ColumnType::Double)
    }

    pub fn string(self, name: &str) -> Self {
        self.column(name, ColumnType::String)
    }

    pub fn boolean(self, name: &str) -> Self {
        self.column(name, ColumnType::Boolean)
    }

    pub fn ndarray(self, name: &str, shape: Vec<usize>) -> Self {
        self.column(name, ColumnType::NdArray { shape })
    }

    pub fn build(self) -> Result<Schema> {
        for (i, (name, _)) in self.columns.iter().enumerate() {
            if self.columns[..i].iter().any(|(n, _)| n == name) {
                return Err(ServingError::Configuration(format!(
                    "duplicate column name '{name}' in schema"
                )));
            }
            if let Some(ColumnType::NdArray { shape }) =
                self.columns.get(i).map(|(_, t)| t)
            {
                if shape.is_empty() || shape.iter().any(|&d| d == 0) {
                    return Err(ServingError::Configuration(format!(
                        "column '{name}' has invalid ndarray shape {shape:?}"
                    )));
                }
            }
        }
        Ok(Schema {
            columns: self.columns,
        })
    }
}
