//! Configuration handling for DP local updates.
//!
//! A [`LocalUpdateConfig`] bundles the training hyper-parameters and the DP
//! mechanism settings of a client. It can be built in code, read from a YAML
//! file, or read from environment variables, and is validated eagerly before
//! a session starts.

use std::env;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::clip::ClipNorm;
use crate::error::{DpError, Result};

/// DP mechanism applied to the local update.
///
/// YAML and environment values go through the same [`FromStr`] parser, so
/// names are case-insensitive everywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum DpMechanism {
    /// Plain SGD, no clipping and no noise.
    #[default]
    NoDp,
    /// Laplace mechanism with per-sample L1 clipping.
    Laplace,
    /// Analytic Gaussian mechanism with per-sample L2 clipping.
    Gaussian,
    /// Gaussian mechanism calibrated with the moments accountant over the
    /// whole session.
    MomentsAccountant,
}

impl DpMechanism {
    /// `true` when the mechanism clips and adds noise.
    #[must_use]
    pub const fn is_private(self) -> bool {
        !matches!(self, Self::NoDp)
    }

    /// Norm used for per-sample clipping, `None` for `no_dp`.
    #[must_use]
    pub const fn clip_norm(self) -> Option<ClipNorm> {
        match self {
            Self::NoDp => None,
            Self::Laplace => Some(ClipNorm::L1),
            Self::Gaussian | Self::MomentsAccountant => Some(ClipNorm::L2),
        }
    }

    /// `true` when the mechanism consumes `delta`.
    #[must_use]
    pub const fn uses_delta(self) -> bool {
        matches!(self, Self::Gaussian | Self::MomentsAccountant)
    }

    /// Canonical string name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::NoDp => "no_dp",
            Self::Laplace => "Laplace",
            Self::Gaussian => "Gaussian",
            Self::MomentsAccountant => "MA",
        }
    }
}

impl fmt::Display for DpMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DpMechanism {
    type Err = DpError;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "no_dp" | "nodp" | "none" => Ok(Self::NoDp),
            "laplace" => Ok(Self::Laplace),
            "gaussian" => Ok(Self::Gaussian),
            "ma" | "moments" => Ok(Self::MomentsAccountant),
            other => Err(DpError::config(format!("unsupported dp mechanism: {other}"))),
        }
    }
}

impl TryFrom<String> for DpMechanism {
    type Error = DpError;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl From<DpMechanism> for String {
    fn from(mechanism: DpMechanism) -> Self {
        mechanism.as_str().to_string()
    }
}

/// Hyper-parameters and DP settings of a local update session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalUpdateConfig {
    /// Number of local epochs (> 0).
    pub local_ep: usize,
    /// Local batch size (> 0).
    pub local_bs: usize,
    /// Initial learning rate (> 0).
    pub lr: f64,
    /// SGD momentum (>= 0).
    pub momentum: f64,
    /// Per-step learning-rate decay factor, in (0, 1].
    pub lr_decay: f64,
    /// DP mechanism.
    pub dp_mechanism: DpMechanism,
    /// Privacy budget epsilon (> 0) when DP is active.
    pub dp_epsilon: f64,
    /// Failure probability delta, in (0, 1), for the Gaussian mechanisms.
    pub dp_delta: f64,
    /// Per-sample clipping bound (> 0) when DP is active.
    pub dp_clip: f64,
}

impl Default for LocalUpdateConfig {
    fn default() -> Self {
        Self {
            local_ep: 5,
            local_bs: 10,
            lr: 0.01,
            momentum: 0.5,
            lr_decay: 0.995,
            dp_mechanism: DpMechanism::NoDp,
            dp_epsilon: 20.0,
            dp_delta: 1.0e-5,
            dp_clip: 20.0,
        }
    }
}

impl LocalUpdateConfig {
    /// Loads and validates a configuration from a YAML file.
    ///
    /// # Errors
    ///
    /// I/O and YAML errors, or [`DpError::Configuration`] on invalid values.
    pub fn from_yaml(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }

    /// Parses and validates a configuration from a YAML string.
    ///
    /// Missing fields fall back to [`LocalUpdateConfig::default`].
    ///
    /// # Errors
    ///
    /// YAML errors, or [`DpError::Configuration`] on invalid values
    /// (including an unknown `dp_mechanism`).
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let value: serde_yaml::Value = serde_yaml::from_str(raw)?;
        // An unknown mechanism is a configuration error, not a syntax error.
        if let Some(name) = value.get("dp_mechanism").and_then(serde_yaml::Value::as_str) {
            name.parse::<DpMechanism>()?;
        }
        let cfg: Self = serde_yaml::from_value(value)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Loads configuration from environment variables, falling back to defaults.
    ///
    /// Recognised variables (the `DPFED_` prefixed name wins over the short one):
    ///
    /// - `DPFED_LOCAL_EP` / `LOCAL_EP`
    /// - `DPFED_LOCAL_BS` / `LOCAL_BS`
    /// - `DPFED_LR` / `LR`
    /// - `DPFED_MOMENTUM` / `MOMENTUM`
    /// - `DPFED_LR_DECAY` / `LR_DECAY`
    /// - `DPFED_DP_MECHANISM` / `DP_MECHANISM` (`no_dp`, `Laplace`, `Gaussian`, `MA`)
    /// - `DPFED_DP_EPSILON` / `DP_EPSILON`
    /// - `DPFED_DP_DELTA` / `DP_DELTA`
    /// - `DPFED_DP_CLIP` / `DP_CLIP`
    ///
    /// # Errors
    ///
    /// [`DpError::Configuration`] if a variable cannot be parsed or the
    /// resulting configuration is invalid.
    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();

        if let Some(v) = parse_env(&["DPFED_LOCAL_EP", "LOCAL_EP"])? {
            cfg.local_ep = v;
        }
        if let Some(v) = parse_env(&["DPFED_LOCAL_BS", "LOCAL_BS"])? {
            cfg.local_bs = v;
        }
        if let Some(v) = parse_env(&["DPFED_LR", "LR"])? {
            cfg.lr = v;
        }
        if let Some(v) = parse_env(&["DPFED_MOMENTUM", "MOMENTUM"])? {
            cfg.momentum = v;
        }
        if let Some(v) = parse_env(&["DPFED_LR_DECAY", "LR_DECAY"])? {
            cfg.lr_decay = v;
        }
        if let Some(raw) = first_env(&["DPFED_DP_MECHANISM", "DP_MECHANISM"]) {
            cfg.dp_mechanism = raw.parse()?;
        }
        if let Some(v) = parse_env(&["DPFED_DP_EPSILON", "DP_EPSILON"])? {
            cfg.dp_epsilon = v;
        }
        if let Some(v) = parse_env(&["DPFED_DP_DELTA", "DP_DELTA"])? {
            cfg.dp_delta = v;
        }
        if let Some(v) = parse_env(&["DPFED_DP_CLIP", "DP_CLIP"])? {
            cfg.dp_clip = v;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    /// Checks every range the training loop relies on.
    ///
    /// DP fields are only checked when the mechanism is private; `dp_delta`
    /// only for the Gaussian mechanisms.
    ///
    /// # Errors
    ///
    /// [`DpError::Configuration`] describing the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.local_ep == 0 {
            return Err(DpError::config("local_ep must be > 0"));
        }
        if self.local_bs == 0 {
            return Err(DpError::config("local_bs must be > 0"));
        }
        if !(self.lr > 0.0 && self.lr.is_finite()) {
            return Err(DpError::config(format!("lr must be > 0, got {}", self.lr)));
        }
        if !(self.momentum >= 0.0 && self.momentum.is_finite()) {
            return Err(DpError::config(format!(
                "momentum must be >= 0, got {}",
                self.momentum
            )));
        }
        if !(self.lr_decay > 0.0 && self.lr_decay <= 1.0) {
            return Err(DpError::config(format!(
                "lr_decay must be in (0, 1], got {}",
                self.lr_decay
            )));
        }

        if self.dp_mechanism.is_private() {
            if !(self.dp_epsilon > 0.0 && self.dp_epsilon.is_finite()) {
                return Err(DpError::config(format!(
                    "dp_epsilon must be > 0, got {}",
                    self.dp_epsilon
                )));
            }
            if !(self.dp_clip > 0.0 && self.dp_clip.is_finite()) {
                return Err(DpError::config(format!(
                    "dp_clip must be > 0, got {}",
                    self.dp_clip
                )));
            }
        }
        if self.dp_mechanism.uses_delta() && !(self.dp_delta > 0.0 && self.dp_delta < 1.0) {
            return Err(DpError::config(format!(
                "dp_delta must be in (0, 1) for {}, got {}",
                self.dp_mechanism, self.dp_delta
            )));
        }

        Ok(())
    }
}

/// Returns the first defined environment variable from the given list.
fn first_env(keys: &[&str]) -> Option<String> {
    keys.iter().find_map(|key| env::var(key).ok())
}

/// Parses the first defined environment variable from the given list.
fn parse_env<T>(keys: &[&str]) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    first_env(keys)
        .map(|raw| {
            raw.trim().parse::<T>().map_err(|e| {
                DpError::config(format!("invalid value for {}: {raw} ({e})", keys[0]))
            })
        })
        .transpose()
}
