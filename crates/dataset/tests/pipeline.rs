//! End-to-end runs of the pipeline over Zarr fixtures.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

use data_sources::{
    write_grid_zarr, write_timeseries_zarr_lat_lon, DataSource, GridMetadata, SourceFactory,
    TimeSeriesMetadata, ZarrSourceFactory,
};
use dataset::{load, Persister, Pipeline};
use nowcasting_common::{Configuration, NowcastingError, NowcastingResult, SplitName};
use storage::ObjectStorage;
use tempfile::TempDir;
use test_utils::grid::SAT_64;
use test_utils::{
    assert_all_finite, create_moving_blob_frames, create_pv_power_series, create_station_layout, reference_start,
    regular_timestamps, SAT_CHANNELS,
};

const CENTER: (f64, f64) = (364_000.0, 436_000.0);

/// Satellite and PV stores under `dir`, and a configuration reading them.
fn write_fixtures(dir: &Path, extra_output: &str) -> Configuration {
    let times = regular_timestamps(reference_start(), 5, 30);

    let sat = GridMetadata {
        times: times.clone(),
        x_coords: SAT_64.x_coords(),
        y_coords: SAT_64.y_coords(),
        channels: SAT_CHANNELS[..3].iter().map(|c| c.to_string()).collect(),
    };
    // The blob drifts a pixel east per frame.
    let frames = create_moving_blob_frames(30, SAT_64.height, SAT_64.width, 3, 1.0);
    write_grid_zarr(&dir.join("sat.zarr"), &sat, &frames).unwrap();

    let layout = create_station_layout(9, CENTER.0, CENTER.1, 2_000.0);
    let pv = TimeSeriesMetadata {
        times: times.clone(),
        ids: (0..9).collect(),
        x_coords: layout.iter().map(|p| p.0).collect(),
        y_coords: layout.iter().map(|p| p.1).collect(),
    };
    let power = create_pv_power_series(&times, 9, 3);
    write_timeseries_zarr_lat_lon(&dir.join("pv.zarr"), &pv, &power).unwrap();

    let yaml = format!(
        r#"
process:
  batch_size: 4
  seed: 7
  max_example_retries: 3
  num_workers: 2
  n_train_batches: 3
  n_validation_batches: 1
  n_test_batches: 0
split:
  method: same
input_data:
  history_minutes: 30
  forecast_minutes: 60
  satellite:
    zarr_path: {sat}
    channels: [IR_039, HRV]
    image_size_pixels: 32
  pv:
    zarr_path: {pv}
    n_entities_per_example: 1
    image_size_pixels: 16
  optical_flow:
    previous_timestep_for_flow: 1
    image_size_pixels: 16
output:
  local_path: {out}
{extra_output}
"#,
        sat = dir.join("sat.zarr").display(),
        pv = dir.join("pv.zarr").display(),
        out = dir.join("out").display(),
    );
    Configuration::from_yaml_str(&yaml).unwrap()
}

fn pipeline(config: Configuration) -> Pipeline {
    let config = Arc::new(config);
    Pipeline::new(config.clone(), Arc::new(ZarrSourceFactory::new(config)))
}

#[tokio::test]
async fn test_pipeline_writes_every_split() {
    let dir = TempDir::new().unwrap();
    let config = write_fixtures(dir.path(), "");
    let persister = Persister::from_config(&config.output);

    let reports = pipeline(config).run(None).await.unwrap();

    assert_eq!(reports.len(), 3);
    let train = &reports[0];
    assert_eq!(train.split, SplitName::Train);
    assert!(train.is_success(), "{:?}", train.failures);
    assert_eq!(train.batches.iter().map(|b| b.batch_idx).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert_eq!(train.examples(), 12);
    assert_eq!(reports[1].batches.len(), 1);
    assert!(reports[2].batches.is_empty());

    let batch = load(&persister.batch_path(SplitName::Train, 2)).unwrap();
    assert_eq!(batch.len(), 4);
    let example = &batch.examples[0];
    assert_eq!(example.require("sat_data").unwrap().shape, vec![19, 32, 32, 2]);
    assert_eq!(example.require("pv_yield").unwrap().shape, vec![19, 1]);
    let flow = example.require("opticalflow_data").unwrap();
    assert_eq!(flow.shape, vec![12, 16, 16, 2]);
    assert_all_finite!(flow.as_f32().unwrap());
    for example in &batch.examples {
        let flow = example.require("opticalflow_data").unwrap().as_f32().unwrap();
        assert!(flow.iter().all(|v| *v != -1.0));
        assert!(flow.iter().any(|v| *v > 0.0));
    }
    assert!(!persister.batch_path(SplitName::Test, 0).exists());
}

#[tokio::test]
async fn test_pipeline_is_deterministic() {
    let first = TempDir::new().unwrap();
    let second = TempDir::new().unwrap();
    let config_a = write_fixtures(first.path(), "");
    let config_b = write_fixtures(second.path(), "");
    let (persister_a, persister_b) = (
        Persister::from_config(&config_a.output),
        Persister::from_config(&config_b.output),
    );

    pipeline(config_a).run(Some(SplitName::Train)).await.unwrap();
    pipeline(config_b).run(Some(SplitName::Train)).await.unwrap();

    for idx in 0..3 {
        let a = load(&persister_a.batch_path(SplitName::Train, idx)).unwrap();
        let b = load(&persister_b.batch_path(SplitName::Train, idx)).unwrap();
        assert_eq!(a, b, "batch {} differs", idx);
    }
    // Different batch indices draw differently.
    let a0 = load(&persister_a.batch_path(SplitName::Train, 0)).unwrap();
    let a1 = load(&persister_a.batch_path(SplitName::Train, 1)).unwrap();
    assert_ne!(a0, a1);
}

#[tokio::test]
async fn test_pipeline_uploads_and_clears_local_batches() {
    let dir = TempDir::new().unwrap();
    let config = write_fixtures(
        dir.path(),
        "  upload:\n    endpoint: http://localhost:9000\n    bucket: prepared\n    prefix: v1/",
    );
    let persister = Persister::from_config(&config.output);
    let storage = Arc::new(ObjectStorage::in_memory());

    let reports = pipeline(config)
        .with_storage(storage.clone())
        .run(Some(SplitName::Validation))
        .await
        .unwrap();

    assert_eq!(reports.len(), 1);
    assert!(reports[0].is_success());
    assert!(!persister.batch_path(SplitName::Validation, 0).exists());
    let keys = storage.list("v1/validation").await.unwrap();
    assert!(keys.contains(&"v1/validation/000000.zarr/zarr.json".to_string()), "{:?}", keys);
    assert!(storage.exists("v1/validation/000000.zarr/sat_data/zarr.json").await.unwrap());
    let root = storage.get("v1/validation/000000.zarr/zarr.json").await.unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&root).is_ok());
}

/// Opens sources the first time only.
struct OneShotFactory {
    inner: ZarrSourceFactory,
    opened: std::sync::atomic::AtomicBool,
}

#[async_trait]
impl SourceFactory for OneShotFactory {
    async fn open_sources(&self) -> NowcastingResult<Vec<Arc<dyn DataSource>>> {
        if self.opened.swap(true, std::sync::atomic::Ordering::SeqCst) {
            return Err(NowcastingError::Storage("store went away".into()));
        }
        self.inner.open_sources().await
    }
}

#[tokio::test]
async fn test_worker_failures_are_reported() {
    let dir = TempDir::new().unwrap();
    let config = Arc::new(write_fixtures(dir.path(), ""));
    let factory = Arc::new(OneShotFactory {
        inner: ZarrSourceFactory::new(config.clone()),
        opened: Default::default(),
    });
    let pipeline = Pipeline::new(config, factory);

    // Splitting opens the sources; both workers then fail to open theirs.
    let reports = pipeline.run(Some(SplitName::Train)).await.unwrap();

    let train = &reports[0];
    assert!(!train.is_success());
    assert!(train.batches.is_empty());
    assert_eq!(train.failures.iter().map(|f| f.batch_idx).collect::<Vec<_>>(), vec![0, 1, 2]);
    assert!(train.failures[0].error.contains("store went away"));
}

#[tokio::test]
async fn test_missing_store_fails_before_any_batch() {
    let dir = TempDir::new().unwrap();
    let mut config = write_fixtures(dir.path(), "");
    if let Some(pv) = config.input_data.pv.as_mut() {
        pv.zarr_path = dir.path().join("missing.zarr");
    }

    assert!(pipeline(config).run(None).await.is_err());
    assert!(!dir.path().join("out").exists());
}
