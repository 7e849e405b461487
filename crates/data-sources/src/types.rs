//! Core types for data sources and their backing stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use nowcasting_common::{NowcastingError, NowcastingResult};

/// The variants of the data-source capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    Satellite,
    Nwp,
    Pv,
    Gsp,
    OpticalFlow,
}

impl SourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Satellite => "satellite",
            Self::Nwp => "nwp",
            Self::Pv => "pv",
            Self::Gsp => "gsp",
            Self::OpticalFlow => "optical_flow",
        }
    }

    /// Whether the source is a gridded image source.
    pub fn is_grid(&self) -> bool {
        matches!(self, Self::Satellite | Self::Nwp)
    }

    /// Whether the source is a station time series source.
    pub fn is_point(&self) -> bool {
        matches!(self, Self::Pv | Self::Gsp)
    }

    /// Field names this source writes into an example.
    pub fn field_names(&self) -> FieldNames {
        match self {
            Self::Satellite => FieldNames {
                data: "sat_data",
                time: "sat_datetime_index",
                x: "sat_x_coords",
                y: "sat_y_coords",
                id: None,
            },
            Self::Nwp => FieldNames {
                data: "nwp",
                time: "nwp_target_time",
                x: "nwp_x_coords",
                y: "nwp_y_coords",
                id: None,
            },
            Self::Pv => FieldNames {
                data: "pv_yield",
                time: "pv_datetime_index",
                x: "pv_system_x_coords",
                y: "pv_system_y_coords",
                id: Some("pv_system_id"),
            },
            Self::Gsp => FieldNames {
                data: "gsp_yield",
                time: "gsp_datetime_index",
                x: "gsp_x_coords",
                y: "gsp_y_coords",
                id: Some("gsp_id"),
            },
            Self::OpticalFlow => FieldNames {
                data: "opticalflow_data",
                time: "opticalflow_datetime_index",
                x: "opticalflow_x_coords",
                y: "opticalflow_y_coords",
                id: None,
            },
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Example field names for one source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldNames {
    pub data: &'static str,
    pub time: &'static str,
    pub x: &'static str,
    pub y: &'static str,
    pub id: Option<&'static str>,
}

/// Axis and channel metadata of a gridded store.
#[derive(Debug, Clone, PartialEq)]
pub struct GridMetadata {
    /// Sorted timestamps along the time axis.
    pub times: Vec<DateTime<Utc>>,
    /// OSGB easting of every column.
    pub x_coords: Vec<f64>,
    /// OSGB northing of every row.
    pub y_coords: Vec<f64>,
    /// Channel names along the last axis.
    pub channels: Vec<String>,
}

impl GridMetadata {
    /// Array shape `[time, y, x, channel]`.
    pub fn shape(&self) -> [usize; 4] {
        [
            self.times.len(),
            self.y_coords.len(),
            self.x_coords.len(),
            self.channels.len(),
        ]
    }

    pub fn len(&self) -> usize {
        self.shape().iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check that times are strictly increasing.
    pub fn ensure_sorted_times(&self) -> NowcastingResult<()> {
        ensure_strictly_increasing(&self.times)
    }
}

/// Entity and time metadata of a station store.
#[derive(Debug, Clone, PartialEq)]
pub struct TimeSeriesMetadata {
    /// Sorted timestamps along the time axis.
    pub times: Vec<DateTime<Utc>>,
    /// Entity ids along the id axis.
    pub ids: Vec<i32>,
    /// OSGB easting of every entity.
    pub x_coords: Vec<f64>,
    /// OSGB northing of every entity.
    pub y_coords: Vec<f64>,
}

impl TimeSeriesMetadata {
    /// Array shape `[time, id]`.
    pub fn shape(&self) -> [usize; 2] {
        [self.times.len(), self.ids.len()]
    }

    pub fn len(&self) -> usize {
        self.times.len() * self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check coordinate vectors match the id axis and times are sorted.
    pub fn validate(&self) -> NowcastingResult<()> {
        if self.x_coords.len() != self.ids.len() || self.y_coords.len() != self.ids.len() {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} ids but {} x and {} y coordinates",
                self.ids.len(),
                self.x_coords.len(),
                self.y_coords.len()
            )));
        }
        ensure_strictly_increasing(&self.times)
    }
}

fn ensure_strictly_increasing(times: &[DateTime<Utc>]) -> NowcastingResult<()> {
    if times.windows(2).any(|w| w[0] >= w[1]) {
        return Err(NowcastingError::InvalidArgument(
            "timestamps must be strictly increasing".to_string(),
        ));
    }
    Ok(())
}

/// A regularly spaced coordinate axis.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RegularAxis {
    pub origin: f64,
    pub step: f64,
    pub len: usize,
}

impl RegularAxis {
    /// Check `coords` are evenly spaced and build the axis.
    pub fn from_coords(name: &str, coords: &[f64]) -> NowcastingResult<Self> {
        if coords.len() < 2 {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} axis needs at least 2 coordinates, got {}",
                name,
                coords.len()
            )));
        }
        let step = coords[1] - coords[0];
        if step == 0.0 || !step.is_finite() {
            return Err(NowcastingError::InvalidArgument(format!(
                "{} axis has invalid spacing {}",
                name, step
            )));
        }
        let tolerance = step.abs() * 1e-6;
        for (i, pair) in coords.windows(2).enumerate() {
            if ((pair[1] - pair[0]) - step).abs() > tolerance {
                return Err(NowcastingError::InvalidArgument(format!(
                    "{} axis is not regularly spaced at index {}",
                    name,
                    i + 1
                )));
            }
        }
        Ok(Self {
            origin: coords[0],
            step,
            len: coords.len(),
        })
    }

    /// Index of the nearest pixel; may lie outside `0..len`.
    pub fn nearest_index(&self, coord: f64) -> i64 {
        ((coord - self.origin) / self.step).round() as i64
    }

    /// The `size`-pixel window centred on the nearest pixel:
    /// `[i - size/2, i + size/2)`. Fails with `OutOfBounds` on overflow.
    pub fn crop(&self, name: &str, coord: f64, size: usize) -> NowcastingResult<std::ops::Range<usize>> {
        let center = self.nearest_index(coord);
        let half = (size / 2) as i64;
        let start = center - half;
        let end = center + half;
        if start < 0 || end > self.len as i64 {
            return Err(NowcastingError::out_of_bounds(
                format!("{} pixels {}..{} around {}", name, start, end, coord),
                format!("{} axis of {} pixels", name, self.len),
            ));
        }
        Ok(start as usize..end as usize)
    }

    pub fn coord(&self, index: usize) -> f64 {
        self.origin + self.step * index as f64
    }
}
