//! Data sources for nowcasting examples.
//!
//! Every source implements [`DataSource`]: given a target time `t0` and a
//! center in OSGB metres it returns an example fragment holding its window
//! of data and companion coordinate fields.
//!
//! # Architecture
//!
//! ```text
//! Zarr directory / memory
//!      │
//!      ▼
//! GridStore / TimeSeriesStore   (metadata + read_window)
//!      │
//!      ▼
//! GridDataSource (satellite, NWP)    PointDataSource (PV, GSP)
//!      │                                   │
//!      └──────────────► Example ◄──────────┘
//!                          │
//!                          ▼
//!              OpticalFlowDataSource (derived from a batch)
//! ```

pub mod error;
pub mod factory;
pub mod grid;
pub mod optical_flow;
pub mod point;
pub mod source;
pub mod store;
pub mod types;
pub mod validation;
pub mod writer;

pub use error::zarr_error;
pub use factory::{SourceFactory, ZarrSourceFactory};
pub use grid::GridDataSource;
pub use optical_flow::OpticalFlowDataSource;
pub use point::PointDataSource;
pub use source::DataSource;
pub use store::{
    GridStore, MemoryGridStore, MemoryTimeSeriesStore, TimeSeriesStore, ZarrGridStore,
    ZarrTimeSeriesStore,
};
pub use types::{FieldNames, GridMetadata, RegularAxis, SourceKind, TimeSeriesMetadata};
pub use validation::{validate_fragment, OPTICAL_FLOW_SENTINEL};
pub use writer::{
    blosc_codec, write_grid_zarr, write_timeseries_zarr, write_timeseries_zarr_lat_lon,
    StationCoordinates, ZarrWriteResult, ZarrWriter,
};
