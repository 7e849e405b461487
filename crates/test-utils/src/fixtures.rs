//! Common test fixtures for nowcasting-dataset tests.
//!
//! This module provides pre-defined constants that represent common
//! scenarios: channel lists, grid extents and reference times.

use chrono::{DateTime, TimeZone, Utc};

/// SEVIRI satellite channel names.
pub const SAT_CHANNELS: [&str; 12] = [
    "HRV", "IR_016", "IR_039", "IR_087", "IR_097", "IR_108", "IR_120", "IR_134", "VIS006",
    "VIS008", "WV_062", "WV_073",
];

/// UKV NWP variable names.
pub const NWP_CHANNELS: [&str; 10] = [
    "t", "dswrf", "prate", "r", "sde", "si10", "vis", "lcc", "mcc", "hcc",
];

/// Common grid specifications for testing, in OSGB metres.
pub mod grid {
    /// A regular grid: origin of the first pixel and spacing per axis.
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub struct GridSpec {
        pub width: usize,
        pub height: usize,
        pub x0: f64,
        pub y0: f64,
        pub dx: f64,
        pub dy: f64,
    }

    impl GridSpec {
        /// X coordinate of every column.
        pub fn x_coords(&self) -> Vec<f64> {
            crate::regular_axis(self.x0, self.dx, self.width)
        }

        /// Y coordinate of every row.
        pub fn y_coords(&self) -> Vec<f64> {
            crate::regular_axis(self.y0, self.dy, self.height)
        }

        /// Coordinates of the pixel at (col, row).
        pub fn pixel(&self, col: usize, row: usize) -> (f64, f64) {
            (
                self.x0 + col as f64 * self.dx,
                self.y0 + row as f64 * self.dy,
            )
        }
    }

    /// 64x64 satellite-like grid at 2 km, north-up (y decreasing).
    pub const SAT_64: GridSpec = GridSpec {
        width: 64,
        height: 64,
        x0: 300_000.0,
        y0: 500_000.0,
        dx: 2_000.0,
        dy: -2_000.0,
    };

    /// 40x40 NWP-like grid at 4 km covering the same area as `SAT_64`.
    pub const NWP_40: GridSpec = GridSpec {
        width: 40,
        height: 40,
        x0: 290_000.0,
        y0: 510_000.0,
        dx: 4_000.0,
        dy: -4_000.0,
    };
}

/// A fixed reference start time for synthetic series.
pub fn reference_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2019, 1, 1, 0, 0, 0).unwrap()
}
