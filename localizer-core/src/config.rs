//! Typed configuration surface, loaded once at startup and treated as immutable
//! thereafter — matches every row of the configuration table in the external-interfaces
//! contract. A missing config file falls back to the embedded default below; a malformed
//! one present on disk is a fatal [`InitError::BadConfig`].

use std::path::Path;

use serde::Deserialize;

use crate::error::InitError;

const EMBEDDED_DEFAULT: &str = include_str!("../config/default.toml");

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub bus: BusConfig,
    pub anchors: AnchorsConfig,
    #[serde(default)]
    pub binner: BinnerConfig,
    #[serde(default)]
    pub solver: SolverConfig,
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub base_topic: String,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 5555,
            base_topic: "uwb".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AnchorsConfig {
    pub entries: Vec<AnchorEntry>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct AnchorEntry {
    pub id: u8,
    pub position: [f64; 3],
    pub yaw_deg: f64,
    pub tilt_deg: f64,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BinnerConfig {
    pub window_seconds: f64,
    pub outlier_sigma: f64,
    pub min_samples_for_outlier_check: usize,
    pub max_anchor_variance: f64,
}

impl Default for BinnerConfig {
    fn default() -> Self {
        Self {
            window_seconds: 1.5,
            outlier_sigma: 2.0,
            min_samples_for_outlier_check: 5,
            max_anchor_variance: 10_000.0,
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct SolverConfig {
    pub iteration_cap: usize,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self { iteration_cap: 200 }
    }
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub tick_seconds: f64,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self { tick_seconds: 1.0 }
    }
}

/// Load configuration from `path`, falling back to the embedded default when `path` is
/// `None` or does not exist. Mirrors the teacher's "missing is fine, malformed is fatal"
/// persistence pattern.
pub fn load(path: Option<&Path>) -> Result<AppConfig, InitError> {
    match path {
        Some(p) if p.exists() => {
            let raw = std::fs::read_to_string(p)
                .map_err(|e| InitError::BadConfig(format!("reading {}: {e}", p.display())))?;
            toml::from_str(&raw)
                .map_err(|e| InitError::BadConfig(format!("parsing {}: {e}", p.display())))
        }
        Some(p) => {
            tracing::info!(path = %p.display(), "config file not found, using embedded default");
            parse_embedded_default()
        }
        None => parse_embedded_default(),
    }
}

fn parse_embedded_default() -> Result<AppConfig, InitError> {
    toml::from_str(EMBEDDED_DEFAULT)
        .map_err(|e| InitError::BadConfig(format!("embedded default config: {e}")))
}
