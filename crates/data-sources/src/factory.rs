//! Opening every configured source.
//!
//! Each pipeline worker asks a [`SourceFactory`] for its own set of sources,
//! so store handles are never shared between workers.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use geospatial::{GeoReference, Osgb};
use nowcasting_common::{Configuration, NowcastingResult};

use crate::grid::GridDataSource;
use crate::point::PointDataSource;
use crate::source::DataSource;
use crate::store::{ZarrGridStore, ZarrTimeSeriesStore};

/// Creates a fresh set of raw data sources.
#[async_trait]
pub trait SourceFactory: Send + Sync {
    /// Open every configured raw source, in configuration order
    /// (satellite, NWP, PV, GSP).
    ///
    /// Derived sources are not included; they are built from assembled
    /// batches.
    async fn open_sources(&self) -> NowcastingResult<Vec<Arc<dyn DataSource>>>;
}

/// Opens sources from the Zarr directories named in the configuration.
pub struct ZarrSourceFactory {
    config: Arc<Configuration>,
    geo: Arc<dyn GeoReference>,
}

impl ZarrSourceFactory {
    /// Factory projecting station coordinates through the National Grid.
    pub fn new(config: Arc<Configuration>) -> Self {
        Self::with_geo(config, Arc::new(Osgb::new()))
    }

    pub fn with_geo(config: Arc<Configuration>, geo: Arc<dyn GeoReference>) -> Self {
        Self { config, geo }
    }
}

#[async_trait]
impl SourceFactory for ZarrSourceFactory {
    async fn open_sources(&self) -> NowcastingResult<Vec<Arc<dyn DataSource>>> {
        let input = &self.config.input_data;
        let retry = self.config.process.read_retry;
        let mut sources: Vec<Arc<dyn DataSource>> = Vec::new();

        if let Some(cfg) = &input.satellite {
            let store = Arc::new(ZarrGridStore::open_dir(&cfg.zarr_path)?);
            let source = GridDataSource::satellite(store, cfg, cfg.window(input)?, retry)?;
            sources.push(Arc::new(source));
        }
        if let Some(cfg) = &input.nwp {
            let store = Arc::new(ZarrGridStore::open_dir(&cfg.zarr_path)?);
            let source = GridDataSource::nwp(store, cfg, cfg.window(input)?, retry)?;
            sources.push(Arc::new(source));
        }
        if let Some(cfg) = &input.pv {
            let store = Arc::new(ZarrTimeSeriesStore::open_dir(&cfg.zarr_path, self.geo.as_ref())?);
            let source = PointDataSource::pv(store, cfg, cfg.window(input)?, retry)?;
            sources.push(Arc::new(source));
        }
        if let Some(cfg) = &input.gsp {
            let store = Arc::new(ZarrTimeSeriesStore::open_dir(&cfg.zarr_path, self.geo.as_ref())?);
            let source = PointDataSource::gsp(store, cfg, cfg.window(input)?, retry)?;
            sources.push(Arc::new(source));
        }

        info!(
            sources = ?sources.iter().map(|s| s.name()).collect::<Vec<_>>(),
            "Opened data sources"
        );
        Ok(sources)
    }
}
