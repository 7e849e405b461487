//! Examples, batches and the typed field arrays they carry.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{NowcastingError, NowcastingResult};

/// A spatial center in OSGB36 metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub x: f64,
    pub y: f64,
}

impl Location {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }

    /// Fail with `InvalidCoordinate` unless both components are finite.
    pub fn ensure_finite(&self) -> NowcastingResult<()> {
        if self.is_finite() {
            Ok(())
        } else {
            Err(NowcastingError::InvalidCoordinate(format!(
                "non-finite center ({}, {})",
                self.x, self.y
            )))
        }
    }

    pub fn distance_to(&self, other: &Location) -> f64 {
        (self.x - other.x).hypot(self.y - other.y)
    }
}

impl std::fmt::Display for Location {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.1}, {:.1})", self.x, self.y)
    }
}

/// Element type of a field array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Float32,
    Float64,
    Int32,
    Int64,
}

impl DType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float64 => "float64",
            Self::Int32 => "int32",
            Self::Int64 => "int64",
        }
    }

    /// Parse from the `dtype` attribute string.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "float32" => Some(Self::Float32),
            "float64" => Some(Self::Float64),
            "int32" => Some(Self::Int32),
            "int64" => Some(Self::Int64),
            _ => None,
        }
    }
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Typed row-major buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum ArrayData {
    Float32(Vec<f32>),
    Float64(Vec<f64>),
    Int32(Vec<i32>),
    Int64(Vec<i64>),
}

impl ArrayData {
    pub fn len(&self) -> usize {
        match self {
            Self::Float32(v) => v.len(),
            Self::Float64(v) => v.len(),
            Self::Int32(v) => v.len(),
            Self::Int64(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Float32(_) => DType::Float32,
            Self::Float64(_) => DType::Float64,
            Self::Int32(_) => DType::Int32,
            Self::Int64(_) => DType::Int64,
        }
    }

    /// An empty buffer of the given type.
    pub fn empty(dtype: DType) -> Self {
        match dtype {
            DType::Float32 => Self::Float32(Vec::new()),
            DType::Float64 => Self::Float64(Vec::new()),
            DType::Int32 => Self::Int32(Vec::new()),
            DType::Int64 => Self::Int64(Vec::new()),
        }
    }

    /// Append another buffer of the same type.
    pub fn extend_from(&mut self, other: &ArrayData) -> NowcastingResult<()> {
        match (self, other) {
            (Self::Float32(a), Self::Float32(b)) => a.extend_from_slice(b),
            (Self::Float64(a), Self::Float64(b)) => a.extend_from_slice(b),
            (Self::Int32(a), Self::Int32(b)) => a.extend_from_slice(b),
            (Self::Int64(a), Self::Int64(b)) => a.extend_from_slice(b),
            (a, b) => {
                return Err(NowcastingError::BatchShapeMismatch(format!(
                    "cannot append {} to {}",
                    b.dtype(),
                    a.dtype()
                )))
            }
        }
        Ok(())
    }

    /// The sub-buffer `[start, start + len)`.
    pub fn slice(&self, start: usize, len: usize) -> ArrayData {
        let range = start..start + len;
        match self {
            Self::Float32(v) => Self::Float32(v[range].to_vec()),
            Self::Float64(v) => Self::Float64(v[range].to_vec()),
            Self::Int32(v) => Self::Int32(v[range].to_vec()),
            Self::Int64(v) => Self::Int64(v[range].to_vec()),
        }
    }
}

/// A named-dimension array: the unit every source produces.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldArray {
    pub dims: Vec<String>,
    pub shape: Vec<usize>,
    pub data: ArrayData,
}

impl FieldArray {
    /// Create a field array, checking that dims, shape and buffer agree.
    pub fn new(dims: &[&str], shape: Vec<usize>, data: ArrayData) -> NowcastingResult<Self> {
        if dims.len() != shape.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} dimension names for a {}-d shape",
                dims.len(),
                shape.len()
            )));
        }
        let expected: usize = shape.iter().product();
        if expected != data.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "shape {:?} needs {} elements, buffer has {}",
                shape,
                expected,
                data.len()
            )));
        }
        Ok(Self {
            dims: dims.iter().map(|d| d.to_string()).collect(),
            shape,
            data,
        })
    }

    pub fn f32(dims: &[&str], shape: Vec<usize>, data: Vec<f32>) -> NowcastingResult<Self> {
        Self::new(dims, shape, ArrayData::Float32(data))
    }

    pub fn f64(dims: &[&str], shape: Vec<usize>, data: Vec<f64>) -> NowcastingResult<Self> {
        Self::new(dims, shape, ArrayData::Float64(data))
    }

    pub fn i32(dims: &[&str], shape: Vec<usize>, data: Vec<i32>) -> NowcastingResult<Self> {
        Self::new(dims, shape, ArrayData::Int32(data))
    }

    pub fn i64(dims: &[&str], shape: Vec<usize>, data: Vec<i64>) -> NowcastingResult<Self> {
        Self::new(dims, shape, ArrayData::Int64(data))
    }

    /// A 1-d array along `dim`.
    pub fn vector_f32(dim: &str, data: Vec<f32>) -> Self {
        Self {
            dims: vec![dim.to_string()],
            shape: vec![data.len()],
            data: ArrayData::Float32(data),
        }
    }

    /// A 1-d array along `dim`.
    pub fn vector_i32(dim: &str, data: Vec<i32>) -> Self {
        Self {
            dims: vec![dim.to_string()],
            shape: vec![data.len()],
            data: ArrayData::Int32(data),
        }
    }

    /// A 1-d array along `dim`.
    pub fn vector_i64(dim: &str, data: Vec<i64>) -> Self {
        Self {
            dims: vec![dim.to_string()],
            shape: vec![data.len()],
            data: ArrayData::Int64(data),
        }
    }

    pub fn dtype(&self) -> DType {
        self.data.dtype()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_f32(&self) -> Option<&[f32]> {
        match &self.data {
            ArrayData::Float32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<&[f64]> {
        match &self.data {
            ArrayData::Float64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<&[i32]> {
        match &self.data {
            ArrayData::Int32(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<&[i64]> {
        match &self.data {
            ArrayData::Int64(v) => Some(v),
            _ => None,
        }
    }

    /// Whether two arrays have the same dims, shape and dtype.
    pub fn same_layout(&self, other: &FieldArray) -> bool {
        self.dims == other.dims && self.shape == other.shape && self.dtype() == other.dtype()
    }
}

/// One training sample: aligned fields from every source around `(t0, center)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Example {
    pub t0: DateTime<Utc>,
    pub center: Location,
    pub fields: BTreeMap<String, FieldArray>,
}

impl Example {
    pub fn new(t0: DateTime<Utc>, center: Location) -> Self {
        Self {
            t0,
            center,
            fields: BTreeMap::new(),
        }
    }

    /// Insert a field; fails with `FieldCollision` if the name is taken.
    pub fn insert(&mut self, name: impl Into<String>, array: FieldArray) -> NowcastingResult<()> {
        let name = name.into();
        if self.fields.contains_key(&name) {
            return Err(NowcastingError::FieldCollision(name));
        }
        self.fields.insert(name, array);
        Ok(())
    }

    /// Builder form of [`Example::insert`].
    pub fn with_field(mut self, name: impl Into<String>, array: FieldArray) -> NowcastingResult<Self> {
        self.insert(name, array)?;
        Ok(self)
    }

    /// Merge another fragment's fields into this example.
    ///
    /// The union must be disjoint; the first clash fails with
    /// `FieldCollision` and leaves `self` untouched.
    pub fn merge(&mut self, other: Example) -> NowcastingResult<()> {
        if let Some(name) = other.fields.keys().find(|k| self.fields.contains_key(*k)) {
            return Err(NowcastingError::FieldCollision(name.clone()));
        }
        self.fields.extend(other.fields);
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&FieldArray> {
        self.fields.get(name)
    }

    /// Like [`Example::field`] but fails with `Internal` when missing.
    pub fn require(&self, name: &str) -> NowcastingResult<&FieldArray> {
        self.fields
            .get(name)
            .ok_or_else(|| NowcastingError::internal(format!("example has no field '{}'", name)))
    }

    pub fn field_names(&self) -> Vec<String> {
        self.fields.keys().cloned().collect()
    }
}

/// An ordered set of examples sharing one configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Batch {
    pub examples: Vec<Example>,
}

impl Batch {
    pub fn new(examples: Vec<Example>) -> Self {
        Self { examples }
    }

    pub fn len(&self) -> usize {
        self.examples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }

    /// The example drawn at `(t0, center)`, if any.
    pub fn find(&self, t0: DateTime<Utc>, center: &Location) -> Option<&Example> {
        self.examples
            .iter()
            .find(|e| e.t0 == t0 && e.center == *center)
    }

    /// Field names of the first example; empty for an empty batch.
    pub fn field_names(&self) -> Vec<String> {
        self.examples
            .first()
            .map(|e| e.field_names())
            .unwrap_or_default()
    }

    /// Check that every example has the same field names, shapes and dtypes.
    pub fn ensure_uniform(&self) -> NowcastingResult<()> {
        let Some(first) = self.examples.first() else {
            return Ok(());
        };
        for (idx, example) in self.examples.iter().enumerate().skip(1) {
            if example.fields.len() != first.fields.len() {
                return Err(NowcastingError::BatchShapeMismatch(format!(
                    "example {} has {} fields, example 0 has {}",
                    idx,
                    example.fields.len(),
                    first.fields.len()
                )));
            }
            for (name, array) in &first.fields {
                match example.fields.get(name) {
                    Some(other) if other.same_layout(array) => {}
                    Some(other) => {
                        return Err(NowcastingError::BatchShapeMismatch(format!(
                            "field '{}' of example {} is {:?} {} but example 0 has {:?} {}",
                            name,
                            idx,
                            other.shape,
                            other.dtype(),
                            array.shape,
                            array.dtype()
                        )))
                    }
                    None => {
                        return Err(NowcastingError::BatchShapeMismatch(format!(
                            "example {} is missing field '{}'",
                            idx, name
                        )))
                    }
                }
            }
        }
        Ok(())
    }
}
