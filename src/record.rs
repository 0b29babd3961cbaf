use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ServingError};
use crate::schema::{ColumnType, Schema};

/// Element type of an [`NdArray`]. Mirrors the numpy dtypes the serving
/// boundary understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F64,
    I64,
}

impl DType {
    pub fn size_bytes(&self) -> usize {
        match self {
            DType::F32 => 4,
            DType::F64 => 8,
            DType::I64 => 8,
        }
    }
}

/// Dense n-dimensional array: dtype, shape, and a flat little-endian-ordered
/// element buffer in row-major order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub dtype: DType,
    pub shape: Vec<usize>,
    data: ArrayData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
enum ArrayData {
    F32(Vec<f32>),
    F64(Vec<f64>),
    I64(Vec<i64>),
}

impl NdArray {
    pub fn from_f32(shape: Vec<usize>, data: Vec<f32>) -> Result<Self> {
        Self::check_len(&shape, data.len())?;
        Ok(NdArray {
            dtype: DType::F32,
            shape,
            data: ArrayData::F32(data),
        })
    }

    pub fn from_f64(shape: Vec<usize>, data: Vec<f64>) -> Result<Self> {
        Self::check_len(&shape, data.len())?;
        Ok(NdArray {
            dtype: DType::F64,
            shape,
            data: ArrayData::F64(data),
        })
    }

    pub fn from_i64(shape: Vec<usize>, data: Vec<i64>) -> Result<Self> {
        Self::check_len(&shape, data.len())?;
        Ok(NdArray {
            dtype: DType::I64,
            shape,
            data: ArrayData::I64(data),
        })
    }

    fn check_len(shape: &[usize], len: usize) -> Result<()> {
        let expected: usize = shape.iter().product();
        if expected != len {
            return Err(ServingError::Codec(format!(
                "shape {shape:?} implies {expected} elements, buffer has {len}"
            )));
        }
        Ok(())
    }

    pub fn element_count(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            ArrayData::F32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ArrayData::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            ArrayData::I64(v) => Some(v),
            _ => None,
        }
    }
}

/// A single typed value flowing through the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Long(i64),
    Double(f64),
    String(String),
    Boolean(bool),
    NdArray(NdArray),
}

impl Value {
    /// The column type this runtime value satisfies.
    pub fn column_type(&self) -> ColumnType {
        match self {
            Value::Long(_) => ColumnType::Long,
            Value::Double(_) => ColumnType::Double,
            Value::String(_) => ColumnType::String,
            Value::Boolean(_) => ColumnType::Boolean,
            Value::NdArray(arr) => ColumnType::NdArray {
                shape: arr.shape.clone(),
            },
        }
    }
}

/// A named batch of typed values conforming to exactly one [`Schema`].
///
/// Invariant: every key in `values` exists in `schema`, and each value's
/// runtime type matches the schema's declared column type for that key.
/// Enforced by [`Record::new`]; a `Record` is not mutated after build.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    schema: Schema,
    values: HashMap<String, Value>,
}

impl Record {
    pub fn new(schema: Schema, values: HashMap<String, Value>) -> Result<Self> {
        for (key, value) in &values {
            let declared = schema.column_type(key).ok_or_else(|| {
                ServingError::Configuration(format!(
                    "record value '{key}' not present in schema"
                ))
            })?;
            let actual = value.column_type();
            if !declared.accepts(&actual) {
                return Err(ServingError::Configuration(format!(
                    "record value '{key}' has type {actual:?}, schema declares {declared:?}"
                )));
            }
        }
        Ok(Record { schema, values })
    }

    /// A record with a schema but no values. Used by tests and by callers
    /// probing the empty-record guard in script transforms.
    pub fn empty(schema: Schema) -> Self {
        Record {
            schema,
            values: HashMap::new(),
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn values(&self) -> &HashMap<String, Value> {
        &self.values
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scores_schema() -> Schema {
        Schema::builder()
            .ndarray("scores", vec![1, 4])
            .build()
            .unwrap()
    }

    #[test]
    fn record_rejects_unknown_key() {
        let mut values = HashMap::new();
        values.insert("bogus".to_string(), Value::Long(1));
        let err = Record::new(scores_schema(), values).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn record_rejects_type_mismatch() {
        let mut values = HashMap::new();
        values.insert("scores".to_string(), Value::Boolean(true));
        let err = Record::new(scores_schema(), values).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn record_accepts_matching_ndarray() {
        let arr = NdArray::from_f32(vec![1, 4], vec![0.1, 0.2, 0.3, 0.4]).unwrap();
        let mut values = HashMap::new();
        values.insert("scores".to_string(), Value::NdArray(arr));
        let record = Record::new(scores_schema(), values).unwrap();
        assert!(!record.is_empty());
    }

    #[test]
    fn ndarray_shape_and_buffer_must_agree() {
        let err = NdArray::from_f32(vec![2, 3], vec![1.0]).unwrap_err();
        assert_eq!(err.kind(), "CodecError");
    }
}
