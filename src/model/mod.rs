//! Lens model registry
//!
//! Camera models are identified by name strings of the form `LENSMODEL_*`.
//! The registry maps each name to its parameter layout: every supported model
//! carries a 4-element core (fx, fy, cx, cy) followed by model-specific
//! distortion parameters. The splined stereographic model additionally
//! embeds its configuration in the name itself.

use thiserror::Error;
use tracing::error;

/// Number of core intrinsics parameters (fx, fy, cx, cy) shared by all models
pub const NUM_INTRINSICS_CORE: usize = 4;

/// Lens model errors: unknown names and malformed configurations
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ModelError {
    /// The model name is not in the registry
    #[error("Unknown lens model: '{0}'")]
    UnknownModel(String),

    /// The model name was recognized but its embedded configuration is malformed
    #[error("Invalid configuration in lens model '{name}': {reason}")]
    InvalidConfiguration { name: String, reason: String },
}

impl ModelError {
    /// Log the error with tracing::error and return self for chaining
    #[must_use]
    pub fn log(self) -> Self {
        error!("{}", self);
        self
    }

    /// Log the error together with the underlying source error
    #[must_use]
    pub fn log_with_source<E: std::fmt::Debug>(self, source_error: E) -> Self {
        error!("{} | Source: {:?}", self, source_error);
        self
    }
}

/// Result type for lens model operations
pub type ModelResult<T> = Result<T, ModelError>;

/// Configuration of the splined stereographic model, parsed from the name
///
/// The knot grid is `nx × ny` control points with 2 parameters each, so the
/// full parameter count is `4 + 2·nx·ny`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SplineConfig {
    /// B-spline order (2 or 3)
    pub order: usize,
    /// Knots along the horizontal imager direction
    pub nx: usize,
    /// Knots along the vertical imager direction
    pub ny: usize,
    /// Horizontal field of view covered by the knot grid, degrees
    pub fov_x_deg: usize,
}

/// A supported lens model family with its parameter layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LensModel {
    /// Pure pinhole projection, core parameters only
    Pinhole,
    /// OpenCV model with k1, k2, p1, p2
    OpenCv4,
    /// OpenCV model with k1, k2, p1, p2, k3
    OpenCv5,
    /// OpenCV model with k1..k6, p1, p2
    OpenCv8,
    /// OpenCV model with k1..k6, p1, p2, s1..s4
    OpenCv12,
    /// CAHVOR model (5 distortion parameters past the core)
    Cahvor,
    /// Splined stereographic model, rich enough for very wide lenses
    SplinedStereographic(SplineConfig),
}

impl LensModel {
    /// Parse a `LENSMODEL_*` name string
    ///
    /// For the splined stereographic model the configuration is part of the
    /// name, e.g. `LENSMODEL_SPLINED_STEREOGRAPHIC_order=3_Nx=30_Ny=20_fov_x_deg=170`.
    ///
    /// # Errors
    /// `ModelError::UnknownModel` for names not in the registry;
    /// `ModelError::InvalidConfiguration` when the splined configuration
    /// suffix is missing a field or fails to parse.
    pub fn from_name(name: &str) -> ModelResult<Self> {
        match name {
            "LENSMODEL_PINHOLE" => Ok(LensModel::Pinhole),
            "LENSMODEL_OPENCV4" => Ok(LensModel::OpenCv4),
            "LENSMODEL_OPENCV5" => Ok(LensModel::OpenCv5),
            "LENSMODEL_OPENCV8" => Ok(LensModel::OpenCv8),
            "LENSMODEL_OPENCV12" => Ok(LensModel::OpenCv12),
            "LENSMODEL_CAHVOR" => Ok(LensModel::Cahvor),
            _ => {
                if let Some(config) = name.strip_prefix("LENSMODEL_SPLINED_STEREOGRAPHIC_") {
                    Self::parse_spline_config(name, config)
                } else {
                    Err(ModelError::UnknownModel(name.to_string()).log())
                }
            }
        }
    }

    fn parse_spline_config(name: &str, config: &str) -> ModelResult<Self> {
        let invalid = |reason: &str| ModelError::InvalidConfiguration {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        // Fields appear in a fixed order; field names may themselves
        // contain underscores, so we consume them positionally.
        let mut rest = config;
        let mut take = |key: &'static str| -> ModelResult<usize> {
            rest = rest
                .strip_prefix(key)
                .and_then(|r| r.strip_prefix('='))
                .ok_or_else(|| invalid(&format!("expected field '{key}'")).log())?;
            let end = rest.find('_').unwrap_or(rest.len());
            let value: usize = rest[..end]
                .parse()
                .map_err(|e| invalid(&format!("field '{key}' is not an integer")).log_with_source(e))?;
            rest = if end < rest.len() { &rest[end + 1..] } else { "" };
            Ok(value)
        };

        let order = take("order")?;
        let nx = take("Nx")?;
        let ny = take("Ny")?;
        let fov_x_deg = take("fov_x_deg")?;

        if !(2..=3).contains(&order) {
            return Err(invalid("order must be 2 or 3").log());
        }
        if nx < 4 || ny < 4 {
            return Err(invalid("knot grid must be at least 4x4").log());
        }
        if fov_x_deg == 0 {
            return Err(invalid("fov_x_deg must be positive").log());
        }

        Ok(LensModel::SplinedStereographic(SplineConfig {
            order,
            nx,
            ny,
            fov_x_deg,
        }))
    }

    /// Canonical name string, round-tripping with [`LensModel::from_name`]
    pub fn name(&self) -> String {
        match self {
            LensModel::Pinhole => "LENSMODEL_PINHOLE".to_string(),
            LensModel::OpenCv4 => "LENSMODEL_OPENCV4".to_string(),
            LensModel::OpenCv5 => "LENSMODEL_OPENCV5".to_string(),
            LensModel::OpenCv8 => "LENSMODEL_OPENCV8".to_string(),
            LensModel::OpenCv12 => "LENSMODEL_OPENCV12".to_string(),
            LensModel::Cahvor => "LENSMODEL_CAHVOR".to_string(),
            LensModel::SplinedStereographic(c) => format!(
                "LENSMODEL_SPLINED_STEREOGRAPHIC_order={}_Nx={}_Ny={}_fov_x_deg={}",
                c.order, c.nx, c.ny, c.fov_x_deg
            ),
        }
    }

    /// Total number of intrinsics parameters, core included
    pub fn param_count(&self) -> usize {
        match self {
            LensModel::Pinhole => NUM_INTRINSICS_CORE,
            LensModel::OpenCv4 => NUM_INTRINSICS_CORE + 4,
            LensModel::OpenCv5 => NUM_INTRINSICS_CORE + 5,
            LensModel::OpenCv8 => NUM_INTRINSICS_CORE + 8,
            LensModel::OpenCv12 => NUM_INTRINSICS_CORE + 12,
            LensModel::Cahvor => NUM_INTRINSICS_CORE + 5,
            LensModel::SplinedStereographic(c) => NUM_INTRINSICS_CORE + 2 * c.nx * c.ny,
        }
    }

    /// Number of distortion parameters past the core
    pub fn distortion_count(&self) -> usize {
        self.param_count() - NUM_INTRINSICS_CORE
    }

    /// Whether the model has the standard fx/fy/cx/cy core. True for every
    /// model in the registry today; kept as a query so callers don't assume.
    pub fn has_core(&self) -> bool {
        true
    }
}

impl std::fmt::Display for LensModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}
