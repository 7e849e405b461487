//! Batch persistence as one Zarr V3 directory per batch.
//!
//! Layout of `<root>/<split>/<batch_idx:06>.zarr`:
//!
//! ```text
//! zarr.json                  root group: format_version, split, batch_idx,
//!                            n_examples, fields
//! <field>/                   [example, ...] one example per chunk,
//!                            attributes `dimensions` and `dtype`
//! t0_datetime/               [example] i64 Unix seconds
//! x_meters_center/           [example] f64
//! y_meters_center/           [example] f64
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument};

use zarrs::array::{Array, ArrayBuilder, DataType, FillValue};
use zarrs::array_subset::ArraySubset;
use zarrs::group::{Group, GroupBuilder};
use zarrs::storage::{ReadableStorageTraits, WritableStorageTraits};
use zarrs_filesystem::FilesystemStore;

use data_sources::{blosc_codec, zarr_error};
use nowcasting_common::time::from_unix_seconds;
use nowcasting_common::{
    ArrayData, Batch, DType, Example, FieldArray, Location, NowcastingError, NowcastingResult,
    OutputConfig, SplitName,
};

/// Version written to the root group.
pub const FORMAT_VERSION: u64 = 1;

pub const T0_FIELD: &str = "t0_datetime";
pub const X_CENTER_FIELD: &str = "x_meters_center";
pub const Y_CENTER_FIELD: &str = "y_meters_center";

type Attributes = serde_json::Map<String, serde_json::Value>;

/// Writes batches under a local root directory.
#[derive(Debug, Clone)]
pub struct Persister {
    root: PathBuf,
    compression_level: u8,
}

impl Persister {
    pub fn new(root: impl Into<PathBuf>, compression_level: u8) -> Self {
        Self {
            root: root.into(),
            compression_level,
        }
    }

    pub fn from_config(output: &OutputConfig) -> Self {
        Self::new(&output.local_path, output.compression_level)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// `<root>/<split>/<batch_idx:06>.zarr`
    pub fn batch_path(&self, split: SplitName, batch_idx: usize) -> PathBuf {
        self.root.join(split.as_str()).join(format!("{:06}.zarr", batch_idx))
    }

    /// Write a batch, replacing any previous directory for the same index.
    #[instrument(skip(self, batch), fields(examples = batch.len()))]
    pub fn write(&self, batch: &Batch, split: SplitName, batch_idx: usize) -> NowcastingResult<PathBuf> {
        batch.ensure_uniform()?;

        let path = self.batch_path(split, batch_idx);
        if path.exists() {
            std::fs::remove_dir_all(&path)?;
        }
        std::fs::create_dir_all(&path)?;
        let storage = Arc::new(FilesystemStore::new(&path).map_err(|e| zarr_error("open batch directory", e))?);

        let fields = batch.field_names();
        let mut attrs = Attributes::new();
        attrs.insert("format_version".into(), serde_json::json!(FORMAT_VERSION));
        attrs.insert("split".into(), serde_json::json!(split.as_str()));
        attrs.insert("batch_idx".into(), serde_json::json!(batch_idx));
        attrs.insert("n_examples".into(), serde_json::json!(batch.len()));
        attrs.insert("fields".into(), serde_json::json!(fields));

        let mut group = GroupBuilder::new();
        group.attributes(attrs);
        group
            .build(storage.clone(), "/")
            .map_err(|e| zarr_error("create batch group", e))?
            .store_metadata()
            .map_err(|e| zarr_error("store batch group metadata", e))?;

        let n = batch.len();
        for name in &fields {
            let first = batch.examples[0].require(name)?;
            let mut data = ArrayData::empty(first.dtype());
            for example in &batch.examples {
                data.extend_from(&example.require(name)?.data)?;
            }
            let mut dims = vec!["example".to_string()];
            dims.extend(first.dims.iter().cloned());
            let mut shape = vec![n];
            shape.extend(first.shape.iter().copied());
            let mut chunk: Vec<u64> = vec![1];
            chunk.extend(first.shape.iter().map(|d| (*d).max(1) as u64));

            self.write_array(&storage, name, &dims, &shape, chunk, &data)?;
        }

        let t0s: Vec<i64> = batch.examples.iter().map(|e| e.t0.timestamp()).collect();
        let xs: Vec<f64> = batch.examples.iter().map(|e| e.center.x).collect();
        let ys: Vec<f64> = batch.examples.iter().map(|e| e.center.y).collect();
        let dims = vec!["example".to_string()];
        let chunk = vec![n.max(1) as u64];
        self.write_array(&storage, T0_FIELD, &dims, &[n], chunk.clone(), &ArrayData::Int64(t0s))?;
        self.write_array(&storage, X_CENTER_FIELD, &dims, &[n], chunk.clone(), &ArrayData::Float64(xs))?;
        self.write_array(&storage, Y_CENTER_FIELD, &dims, &[n], chunk, &ArrayData::Float64(ys))?;

        info!(
            path = %path.display(),
            split = split.as_str(),
            batch_idx,
            examples = n,
            fields = fields.len(),
            "Persisted batch"
        );
        Ok(path)
    }

    fn write_array<S: ReadableStorageTraits + WritableStorageTraits + 'static>(
        &self,
        storage: &Arc<S>,
        name: &str,
        dims: &[String],
        shape: &[usize],
        chunk_shape: Vec<u64>,
        data: &ArrayData,
    ) -> NowcastingResult<()> {
        let dtype = data.dtype();
        let (data_type, fill_value, typesize) = match dtype {
            DType::Float32 => (DataType::Float32, FillValue::from(f32::NAN), 4),
            DType::Float64 => (DataType::Float64, FillValue::from(f64::NAN), 8),
            DType::Int32 => (DataType::Int32, FillValue::from(0i32), 4),
            DType::Int64 => (DataType::Int64, FillValue::from(0i64), 8),
        };
        let chunk_grid: zarrs::array::ChunkGrid = chunk_shape
            .try_into()
            .map_err(|e| NowcastingError::zarr(format!("chunk grid for {}: {:?}", name, e)))?;

        let mut attrs = Attributes::new();
        attrs.insert("dimensions".into(), serde_json::json!(dims));
        attrs.insert("dtype".into(), serde_json::json!(dtype.as_str()));

        let mut builder = ArrayBuilder::new(
            shape.iter().map(|d| *d as u64).collect::<Vec<_>>(),
            data_type,
            chunk_grid,
            fill_value,
        );
        builder.attributes(attrs);
        builder.bytes_to_bytes_codecs(vec![blosc_codec(self.compression_level, typesize)?]);

        let array = builder
            .build(storage.clone(), &format!("/{}", name))
            .map_err(|e| zarr_error("create field array", e))?;
        array
            .store_metadata()
            .map_err(|e| zarr_error("store field metadata", e))?;

        if data.is_empty() {
            return Ok(());
        }
        let subset = ArraySubset::new_with_shape(array.shape().to_vec());
        match data {
            ArrayData::Float32(v) => array.store_array_subset_elements(&subset, v),
            ArrayData::Float64(v) => array.store_array_subset_elements(&subset, v),
            ArrayData::Int32(v) => array.store_array_subset_elements(&subset, v),
            ArrayData::Int64(v) => array.store_array_subset_elements(&subset, v),
        }
        .map_err(|e| zarr_error("store field data", e))?;

        debug!(field = name, shape = ?shape, dtype = dtype.as_str(), "Wrote field");
        Ok(())
    }
}

/// Read a persisted batch back; every field is reproduced bit-exactly.
#[instrument]
pub fn load(path: &Path) -> NowcastingResult<Batch> {
    if !path.is_dir() {
        return Err(NowcastingError::permanent(format!(
            "batch {} does not exist",
            path.display()
        )));
    }
    let storage = Arc::new(FilesystemStore::new(path).map_err(|e| zarr_error("open batch directory", e))?);

    let group = Group::open(storage.clone(), "/").map_err(|e| zarr_error("open batch group", e))?;
    let attrs = group.attributes();
    let version = attrs.get("format_version").and_then(|v| v.as_u64());
    if version != Some(FORMAT_VERSION) {
        return Err(NowcastingError::zarr(format!(
            "unsupported batch format {:?} in {}",
            version,
            path.display()
        )));
    }
    let n = attrs
        .get("n_examples")
        .and_then(|v| v.as_u64())
        .ok_or_else(|| NowcastingError::zarr("missing attribute 'n_examples'"))? as usize;
    let fields: Vec<String> = serde_json::from_value(
        attrs
            .get("fields")
            .cloned()
            .ok_or_else(|| NowcastingError::zarr("missing attribute 'fields'"))?,
    )?;

    let t0s = match read_field(&storage, T0_FIELD, n)?.1 {
        ArrayData::Int64(v) => v,
        other => return Err(NowcastingError::zarr(format!("{} is {}", T0_FIELD, other.dtype()))),
    };
    let xs = read_f64(&storage, X_CENTER_FIELD, n)?;
    let ys = read_f64(&storage, Y_CENTER_FIELD, n)?;

    let mut examples = t0s
        .iter()
        .zip(xs.iter().zip(&ys))
        .map(|(t0, (x, y))| Ok(Example::new(from_unix_seconds(*t0)?, Location::new(*x, *y))))
        .collect::<NowcastingResult<Vec<_>>>()?;

    for name in &fields {
        let (layout, data) = read_field(&storage, name, n)?;
        let per_example: usize = layout.shape.iter().product();
        let dims: Vec<&str> = layout.dims.iter().map(String::as_str).collect();
        for (i, example) in examples.iter_mut().enumerate() {
            let array = FieldArray::new(&dims, layout.shape.clone(), data.slice(i * per_example, per_example))?;
            example.insert(name.clone(), array)?;
        }
    }

    debug!(path = %path.display(), examples = n, fields = fields.len(), "Loaded batch");
    Ok(Batch::new(examples))
}

/// Per-example dims and shape of a persisted field.
struct FieldLayout {
    dims: Vec<String>,
    shape: Vec<usize>,
}

fn read_field<S: ReadableStorageTraits + 'static>(
    storage: &Arc<S>,
    name: &str,
    n_examples: usize,
) -> NowcastingResult<(FieldLayout, ArrayData)> {
    let array = Array::open(storage.clone(), &format!("/{}", name)).map_err(|e| zarr_error("open field array", e))?;
    let attrs = array.attributes();

    let dtype = attrs
        .get("dtype")
        .and_then(|v| v.as_str())
        .and_then(DType::parse)
        .ok_or_else(|| NowcastingError::zarr(format!("field '{}' has no valid dtype", name)))?;
    let mut dims: Vec<String> = serde_json::from_value(
        attrs
            .get("dimensions")
            .cloned()
            .ok_or_else(|| NowcastingError::zarr(format!("field '{}' has no dimensions", name)))?,
    )?;

    let shape: Vec<usize> = array.shape().iter().map(|d| *d as usize).collect();
    if shape.first() != Some(&n_examples) || dims.len() != shape.len() || dims[0] != "example" {
        return Err(NowcastingError::zarr(format!(
            "field '{}' has shape {:?} and dimensions {:?} for {} examples",
            name, shape, dims, n_examples
        )));
    }
    dims.remove(0);
    let layout = FieldLayout {
        dims,
        shape: shape[1..].to_vec(),
    };

    if shape.iter().any(|d| *d == 0) {
        return Ok((layout, ArrayData::empty(dtype)));
    }
    let subset = ArraySubset::new_with_shape(array.shape().to_vec());
    let context = "read field data";
    let data = match dtype {
        DType::Float32 => ArrayData::Float32(
            array
                .retrieve_array_subset_elements::<f32>(&subset)
                .map_err(|e| zarr_error(context, e))?,
        ),
        DType::Float64 => ArrayData::Float64(
            array
                .retrieve_array_subset_elements::<f64>(&subset)
                .map_err(|e| zarr_error(context, e))?,
        ),
        DType::Int32 => ArrayData::Int32(
            array
                .retrieve_array_subset_elements::<i32>(&subset)
                .map_err(|e| zarr_error(context, e))?,
        ),
        DType::Int64 => ArrayData::Int64(
            array
                .retrieve_array_subset_elements::<i64>(&subset)
                .map_err(|e| zarr_error(context, e))?,
        ),
    };
    Ok((layout, data))
}

fn read_f64<S: ReadableStorageTraits + 'static>(storage: &Arc<S>, name: &str, n: usize) -> NowcastingResult<Vec<f64>> {
    match read_field(storage, name, n)?.1 {
        ArrayData::Float64(v) => Ok(v),
        other => Err(NowcastingError::zarr(format!("{} is {}", name, other.dtype()))),
    }
}
