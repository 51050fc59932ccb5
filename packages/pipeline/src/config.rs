//! Pipeline configuration, loadable from TOML.
//!
//! Every section and key has a default, so an empty file is a valid
//! configuration:
//!
//! ```toml
//! [contiguity]
//! rule = "queen"
//!
//! [weights]
//! style = "row_standardized"
//! zero_policy = "error"
//!
//! [moran]
//! inference = "randomization"
//! permutations = 999
//! seed = 20240601
//! local_alpha = 0.05
//! reconcile_tolerance = 1e-8
//!
//! [model]
//! missing_exposure = "exclude"
//! log_precision_steps = 21
//!
//! [model.baseline]
//! max_iterations = 25
//! ```

use std::path::Path;

use crime_risk_autocorrelation::{MoranOptions, NullModel};
use crime_risk_regression::{GlmOptions, IcarOptions, MissingExposurePolicy};
use crime_risk_spatial::{ContiguityRule, WeightStyle, ZeroPolicy};
use serde::{Deserialize, Serialize};

use crate::PipelineError;

// ── Sections ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContiguityConfig {
    pub rule: ContiguityRule,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeightsConfig {
    pub style: WeightStyle,
    pub zero_policy: ZeroPolicy,
}

/// Moran statistics settings.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MoranConfig {
    /// Null model for global inference.
    pub inference: NullModel,
    /// Reshuffles for the permutation test.
    pub permutations: usize,
    /// Seed for the permutation test.
    pub seed: u64,
    /// Significance level for the filtered local cluster map.
    pub local_alpha: f64,
    /// Relative tolerance for the local/global consistency check.
    pub reconcile_tolerance: f64,
}

impl Default for MoranConfig {
    fn default() -> Self {
        let options = MoranOptions::default();
        Self {
            inference: options.null_model,
            permutations: options.permutations,
            seed: options.seed,
            local_alpha: 0.05,
            reconcile_tolerance: 1e-8,
        }
    }
}

impl MoranConfig {
    /// Options for the global statistic.
    #[must_use]
    pub const fn options(&self) -> MoranOptions {
        MoranOptions {
            null_model: self.inference,
            permutations: self.permutations,
            seed: self.seed,
        }
    }
}

/// Count model settings. The spatial model's options sit directly in
/// `[model]`; the baseline's in `[model.baseline]`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub missing_exposure: MissingExposurePolicy,
    #[serde(flatten)]
    pub spatial: IcarOptions,
    pub baseline: GlmOptions,
}

// ── Top-level configuration ──────────────────────────────────────────────

/// Complete configuration of one pipeline run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub contiguity: ContiguityConfig,
    pub weights: WeightsConfig,
    pub moran: MoranConfig,
    pub model: ModelConfig,
}

impl PipelineConfig {
    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Config`] if the text is not valid TOML or
    /// a value has the wrong type.
    pub fn from_toml_str(text: &str) -> Result<Self, PipelineError> {
        Ok(toml::from_str(text)?)
    }

    /// Reads and parses a TOML configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Io`] if the file cannot be read, otherwise
    /// as [`Self::from_toml_str`].
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let text = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&text)?;
        log::debug!("Loaded configuration from {}: {config:?}", path.display());
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_text_is_default() {
        let config = PipelineConfig::from_toml_str("").expect("parses");
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.contiguity.rule, ContiguityRule::Queen);
        assert_eq!(config.weights.style, WeightStyle::RowStandardized);
        assert_eq!(config.model.missing_exposure, MissingExposurePolicy::Exclude);
    }

    #[test]
    fn sections_override_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            [contiguity]
            rule = "rook"

            [weights]
            style = "binary"
            zero_policy = "zero_row"

            [moran]
            inference = "permutation"
            permutations = 99
            seed = 7

            [model]
            missing_exposure = "impute_mean"
            log_precision_steps = 5
            credible_level = 0.9

            [model.baseline]
            max_iterations = 10
            "#,
        )
        .expect("parses");

        assert_eq!(config.contiguity.rule, ContiguityRule::Rook);
        assert_eq!(config.weights.style, WeightStyle::Binary);
        assert_eq!(config.weights.zero_policy, ZeroPolicy::ZeroRow);
        assert_eq!(config.moran.options().null_model, NullModel::Permutation);
        assert_eq!(config.moran.options().permutations, 99);
        assert_eq!(config.moran.options().seed, 7);
        assert!((config.moran.local_alpha - 0.05).abs() < f64::EPSILON);
        assert_eq!(
            config.model.missing_exposure,
            MissingExposurePolicy::ImputeMean
        );
        assert_eq!(config.model.spatial.log_precision_steps, 5);
        assert!((config.model.spatial.credible_level - 0.9).abs() < f64::EPSILON);
        assert_eq!(config.model.spatial.max_iterations, 50);
        assert_eq!(config.model.baseline.max_iterations, 10);
    }

    #[test]
    fn bad_values_are_reported() {
        let err = PipelineConfig::from_toml_str("[contiguity]\nrule = \"bishop\"").err();
        assert!(matches!(err, Some(PipelineError::Config(_))));
    }
}
