//! Test data generators for creating synthetic nowcasting inputs.
//!
//! These generators create predictable, verifiable data patterns that can be
//! used across the test suite. Grid frames are laid out `[time, y, x, channel]`
//! and station series `[time, id]`, both row-major.

use chrono::{DateTime, Duration, Utc};

/// Evenly spaced timestamps starting at `start`.
pub fn regular_timestamps(start: DateTime<Utc>, period_minutes: i64, count: usize) -> Vec<DateTime<Utc>> {
    (0..count)
        .map(|i| start + Duration::minutes(period_minutes * i as i64))
        .collect()
}

/// Evenly spaced coordinate axis.
pub fn regular_axis(start: f64, step: f64, count: usize) -> Vec<f64> {
    (0..count).map(|i| start + step * i as f64).collect()
}

/// Creates frames with predictable values.
///
/// Value at (t, row, col, ch) = `t * 1_000_000 + row * 1000 + col + ch * 0.001`,
/// which makes crops and time windows easy to verify.
pub fn create_indexed_frames(times: usize, height: usize, width: usize, channels: usize) -> Vec<f32> {
    let mut data = Vec::with_capacity(times * height * width * channels);
    for t in 0..times {
        for row in 0..height {
            for col in 0..width {
                for ch in 0..channels {
                    data.push((t * 1_000_000 + row * 1000 + col) as f32 + ch as f32 * 0.001);
                }
            }
        }
    }
    data
}

/// Creates frames with a smooth Gaussian blob drifting east.
///
/// The blob moves `shift_per_step` pixels per time step; values stay in
/// `[0.1, 1.1]` so none of them collide with the `-1` sentinel.
pub fn create_moving_blob_frames(
    times: usize,
    height: usize,
    width: usize,
    channels: usize,
    shift_per_step: f32,
) -> Vec<f32> {
    let mut data = Vec::with_capacity(times * height * width * channels);
    let sigma = (width.min(height) as f32 / 5.0).max(1.0);
    let cy = height as f32 / 2.0;
    for t in 0..times {
        let cx = width as f32 / 3.0 + shift_per_step * t as f32;
        for row in 0..height {
            for col in 0..width {
                let dx = col as f32 - cx;
                let dy = row as f32 - cy;
                let value = 0.1 + (-(dx * dx + dy * dy) / (2.0 * sigma * sigma)).exp();
                for ch in 0..channels {
                    data.push(value * (1.0 + ch as f32 * 0.01));
                }
            }
        }
    }
    data
}

/// Creates frames filled with a constant value.
pub fn create_constant_frames(times: usize, height: usize, width: usize, channels: usize, value: f32) -> Vec<f32> {
    vec![value; times * height * width * channels]
}

/// Stations on a square lattice centred on `(x0, y0)`.
///
/// # Arguments
///
/// * `count` - Number of stations
/// * `x0`, `y0` - Lattice centre (metres)
/// * `spacing` - Distance between neighbours (metres)
pub fn create_station_layout(count: usize, x0: f64, y0: f64, spacing: f64) -> Vec<(f64, f64)> {
    let side = (count as f64).sqrt().ceil() as usize;
    let offset = (side as f64 - 1.0) / 2.0;
    (0..count)
        .map(|i| {
            let col = (i % side) as f64 - offset;
            let row = (i / side) as f64 - offset;
            (x0 + col * spacing, y0 + row * spacing)
        })
        .collect()
}

/// Creates a solar-like power series for each station.
///
/// Values are non-negative; each station has its own capacity and a
/// deterministic wobble derived from `seed`.
pub fn create_pv_power_series(times: &[DateTime<Utc>], stations: usize, seed: u32) -> Vec<f32> {
    use chrono::Timelike;

    let mut data = Vec::with_capacity(times.len() * stations);
    for (t, time) in times.iter().enumerate() {
        let hour = time.hour() as f32 + time.minute() as f32 / 60.0;
        let daylight = ((hour - 6.0) / 12.0 * std::f32::consts::PI).sin().max(0.0);
        for id in 0..stations {
            let capacity = 1.0 + (id % 7) as f32;
            let wobble = (simple_hash(t as u32, id as u32, seed) % 100) as f32 / 1000.0;
            data.push(capacity * daylight + wobble);
        }
    }
    data
}

/// Simple deterministic hash for reproducible test data.
fn simple_hash(x: u32, y: u32, seed: u32) -> u32 {
    let mut h = seed;
    h = h.wrapping_mul(31).wrapping_add(x);
    h = h.wrapping_mul(31).wrapping_add(y);
    h ^= h >> 16;
    h = h.wrapping_mul(0x85ebca6b);
    h ^= h >> 13;
    h = h.wrapping_mul(0xc2b2ae35);
    h ^= h >> 16;
    h
}
