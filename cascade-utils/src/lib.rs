//! Common helpers shared across the cascade detector crates.

/// Detector settings and their JSON persistence.
pub mod config;
/// Image loading, plane extraction and resizing.
pub mod image_utils;
/// Instrumentation helpers for optional performance tracing.
pub mod telemetry;

use anyhow::Result;
use log::LevelFilter;

pub use config::{
    CascadeSettings, NormalizationMode, PyramidSettings, ResizeQuality, ScanSettings,
    StageSettings, TelemetrySettings,
};
pub use image_utils::{
    dynamic_to_bgr_planes, dynamic_to_gray_plane, load_image, resize_filter, resize_plane,
};
pub use telemetry::{
    TimingGuard, configure as configure_telemetry, telemetry_allows, telemetry_enabled,
    telemetry_level, timing_guard, timing_guard_if,
};

/// Initialize logging once.
///
/// `RUST_LOG` wins when set; otherwise `default_filter` applies. Telemetry output is always
/// let through so that [`configure_telemetry`] alone decides whether it appears.
pub fn init_logging(default_filter: LevelFilter) -> Result<()> {
    let mut builder = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(default_filter.as_str()),
    );
    builder.filter_module(telemetry::TELEMETRY_TARGET, LevelFilter::Trace);

    // A second initialisation (tests, embedding applications) is not an error.
    let _ = builder.try_init();
    Ok(())
}
