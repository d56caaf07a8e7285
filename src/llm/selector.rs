//! Model selection based on hardware capabilities

use super::catalog::{ModelCatalog, ModelDescriptor};
use super::error::LocalAiError;
use super::hardware::HardwareSpecs;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use tracing::{debug, info, warn};

const DEFAULT_MIN_BUFFER_RATIO: f64 = 0.20;
const DEFAULT_MIN_BUFFER_BYTES: u64 = 512 * 1024 * 1024;
const DEFAULT_HYSTERESIS_RATIO: f64 = 0.10;

/// Coarse quality/speed label for a selected model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PerformanceTier {
    Minimal,
    Balanced,
    HighQuality,
}

impl PerformanceTier {
    pub fn from_quality(quality_score: u8) -> Self {
        match quality_score {
            70..=u8::MAX => PerformanceTier::HighQuality,
            40..=69 => PerformanceTier::Balanced,
            _ => PerformanceTier::Minimal,
        }
    }
}

impl std::fmt::Display for PerformanceTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PerformanceTier::Minimal => write!(f, "minimal"),
            PerformanceTier::Balanced => write!(f, "balanced"),
            PerformanceTier::HighQuality => write!(f, "high-quality"),
        }
    }
}

/// Non-fatal conditions attached to a recommendation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectionWarning {
    /// The chosen model does not leave the configured memory buffer free
    LowMemory {
        required_bytes: u64,
        available_bytes: u64,
    },
}

/// Output of model selection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecommendation {
    pub descriptor: ModelDescriptor,
    pub performance_tier: PerformanceTier,
    /// Available memory minus the model's estimated memory; negative under a low-memory fallback
    pub memory_headroom_bytes: i64,
    pub warnings: Vec<SelectionWarning>,
}

impl ModelRecommendation {
    pub fn has_low_memory_warning(&self) -> bool {
        self.warnings
            .iter()
            .any(|w| matches!(w, SelectionWarning::LowMemory { .. }))
    }
}

/// Tunables for model selection
#[derive(Debug, Clone, PartialEq)]
pub struct SelectionPolicy {
    /// Fraction of available memory kept free
    pub min_buffer_ratio: f64,
    /// Absolute lower bound on the kept-free memory
    pub min_buffer_bytes: u64,
    /// Relative change in available memory that triggers re-selection
    pub hysteresis_ratio: f64,
    /// Explicit model tag requested by the user
    pub preferred_model: Option<String>,
}

impl Default for SelectionPolicy {
    fn default() -> Self {
        Self {
            min_buffer_ratio: DEFAULT_MIN_BUFFER_RATIO,
            min_buffer_bytes: DEFAULT_MIN_BUFFER_BYTES,
            hysteresis_ratio: DEFAULT_HYSTERESIS_RATIO,
            preferred_model: None,
        }
    }
}

impl SelectionPolicy {
    /// Memory that must stay free given `available_bytes`
    pub fn buffer(&self, available_bytes: u64) -> u64 {
        let proportional = (available_bytes as f64 * self.min_buffer_ratio) as u64;
        proportional.max(self.min_buffer_bytes)
    }

    /// Whether a model leaves the buffer free
    pub fn fits(&self, model: &ModelDescriptor, available_bytes: u64) -> bool {
        model
            .estimated_memory_bytes
            .saturating_add(self.buffer(available_bytes))
            <= available_bytes
    }
}

/// Picks the best catalog model for a hardware snapshot
#[derive(Debug, Clone)]
pub struct ModelSelector {
    catalog: ModelCatalog,
    policy: SelectionPolicy,
}

impl ModelSelector {
    pub fn new(catalog: ModelCatalog, policy: SelectionPolicy) -> Self {
        Self { catalog, policy }
    }

    pub fn catalog(&self) -> &ModelCatalog {
        &self.catalog
    }

    pub fn policy(&self) -> &SelectionPolicy {
        &self.policy
    }

    /// Select the best model that fits in available memory
    ///
    /// Falls back to the smallest runnable model with a low-memory warning when
    /// nothing fits the buffer. Fails only if no model's hard floor is met.
    pub fn select(&self, specs: &HardwareSpecs) -> Result<ModelRecommendation, LocalAiError> {
        let available = specs.available_memory_bytes;

        if let Some(recommendation) = self.select_preferred(specs) {
            return Ok(recommendation);
        }

        debug!(
            "Model selection: {:.1}GB available, {:.1}GB buffer",
            specs.available_memory_gb(),
            self.policy.buffer(available) as f64 / (1024.0 * 1024.0 * 1024.0)
        );

        let best = self
            .catalog
            .iter()
            .filter(|model| self.policy.fits(model, available))
            .max_by_key(|model| {
                (
                    model.quality_score,
                    model.speed_score,
                    Reverse(model.estimated_memory_bytes),
                )
            });

        if let Some(model) = best {
            let recommendation = Self::recommend(model, available, Vec::new());
            info!(
                "Selected model: {} ({:.1}B params, {}, requires {:.1}GB RAM, tier {})",
                model.name,
                model.parameter_count_billion,
                model.quantization,
                model.estimated_memory_gb(),
                recommendation.performance_tier
            );
            return Ok(recommendation);
        }

        self.fallback(specs)
    }

    /// Whether available memory moved far enough to warrant a new selection
    pub fn needs_reselection(&self, previous: &HardwareSpecs, current: &HardwareSpecs) -> bool {
        needs_reselection(
            previous.available_memory_bytes,
            current.available_memory_bytes,
            self.policy.hysteresis_ratio,
        )
    }

    /// Recommendation for a specific catalog model
    ///
    /// Fails when the model is unknown or its hard memory floor is not met. A
    /// model that runs but leaves less than the buffer free carries a
    /// low-memory warning.
    pub fn recommend_named(
        &self,
        name: &str,
        specs: &HardwareSpecs,
    ) -> Result<ModelRecommendation, LocalAiError> {
        let available = specs.available_memory_bytes;

        let model = self.catalog.get(name).ok_or_else(|| LocalAiError::Config {
            message: format!("model '{}' is not in the catalog", name),
        })?;

        if model.min_memory_bytes > available {
            return Err(LocalAiError::InsufficientHardware {
                available_bytes: available,
                required_bytes: model.min_memory_bytes,
            });
        }

        let mut warnings = Vec::new();
        if !self.policy.fits(model, available) {
            warn!(
                "Model {} requires {:.1}GB but only {:.1}GB available (after buffer). May cause OOM!",
                model.name,
                model.estimated_memory_gb(),
                specs.available_memory_gb()
            );
            warnings.push(self.low_memory(model, available));
        }

        Ok(Self::recommend(model, available, warnings))
    }

    fn select_preferred(&self, specs: &HardwareSpecs) -> Option<ModelRecommendation> {
        let preferred = self.policy.preferred_model.as_deref()?;

        match self.recommend_named(preferred, specs) {
            Ok(recommendation) => {
                info!("Using explicitly requested model: {}", preferred);
                Some(recommendation)
            }
            Err(e) => {
                warn!(
                    "Cannot use requested model '{}': {}. Falling back to auto-selection.",
                    preferred, e
                );
                None
            }
        }
    }

    fn fallback(&self, specs: &HardwareSpecs) -> Result<ModelRecommendation, LocalAiError> {
        let available = specs.available_memory_bytes;

        let smallest_runnable = self
            .catalog
            .iter()
            .filter(|model| model.min_memory_bytes <= available)
            .min_by_key(|model| model.estimated_memory_bytes);

        let Some(model) = smallest_runnable else {
            let required_bytes = self
                .catalog
                .iter()
                .map(|model| model.min_memory_bytes)
                .min()
                .unwrap_or(0);
            info!(
                "No runnable model for {:.1}GB available (minimum {:.1}GB required)",
                specs.available_memory_gb(),
                required_bytes as f64 / (1024.0 * 1024.0 * 1024.0)
            );
            return Err(LocalAiError::InsufficientHardware {
                available_bytes: available,
                required_bytes,
            });
        };

        warn!(
            "Low memory: no model fits with buffer, falling back to {} ({:.1}GB with {:.1}GB available)",
            model.name,
            model.estimated_memory_gb(),
            specs.available_memory_gb()
        );

        let mut recommendation =
            Self::recommend(model, available, vec![self.low_memory(model, available)]);
        recommendation.performance_tier = PerformanceTier::Minimal;
        Ok(recommendation)
    }

    fn low_memory(&self, model: &ModelDescriptor, available: u64) -> SelectionWarning {
        SelectionWarning::LowMemory {
            required_bytes: model
                .estimated_memory_bytes
                .saturating_add(self.policy.buffer(available)),
            available_bytes: available,
        }
    }

    fn recommend(
        model: &ModelDescriptor,
        available: u64,
        warnings: Vec<SelectionWarning>,
    ) -> ModelRecommendation {
        ModelRecommendation {
            descriptor: model.clone(),
            performance_tier: PerformanceTier::from_quality(model.quality_score),
            memory_headroom_bytes: available as i64 - model.estimated_memory_bytes as i64,
            warnings,
        }
    }
}

/// Relative-change test shared by the selector and the client
pub fn needs_reselection(previous_bytes: u64, current_bytes: u64, hysteresis_ratio: f64) -> bool {
    if previous_bytes == 0 {
        return current_bytes != 0;
    }
    let delta = previous_bytes.abs_diff(current_bytes) as f64;
    delta / previous_bytes as f64 > hysteresis_ratio
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::catalog::Quantization;
    use yare::parameterized;

    const GIB: u64 = 1024 * 1024 * 1024;
    const MIB: u64 = 1024 * 1024;

    fn make_specs(available_bytes: u64) -> HardwareSpecs {
        HardwareSpecs {
            cpu_cores: 4,
            cpu_threads: 4,
            total_memory_bytes: 64 * GIB,
            available_memory_bytes: available_bytes,
            gpu_present: false,
            gpu_memory_bytes: 0,
            storage_is_ssd: true,
        }
    }

    fn model(name: &str, memory: u64, quality: u8, speed: u8, min_memory: u64) -> ModelDescriptor {
        ModelDescriptor {
            name: name.to_string(),
            parameter_count_billion: 1.0,
            quantization: Quantization::Q4_0,
            estimated_memory_bytes: memory,
            estimated_disk_bytes: memory,
            quality_score: quality,
            speed_score: speed,
            min_memory_bytes: min_memory,
            context_window_tokens: 4096,
        }
    }

    fn selector(models: Vec<ModelDescriptor>) -> ModelSelector {
        ModelSelector::new(ModelCatalog::new(models).unwrap(), SelectionPolicy::default())
    }

    #[test]
    fn test_buffer_is_max_of_ratio_and_floor() {
        let policy = SelectionPolicy::default();
        assert_eq!(policy.buffer(GIB), 512 * MIB);
        assert_eq!(policy.buffer(10 * GIB), 2 * GIB);
    }

    #[test]
    fn test_three_b_chosen_over_eight_b_with_4gb() {
        let three_b = ModelDescriptor {
            parameter_count_billion: 3.0,
            ..model("3b", 5 * GIB / 2, 55, 70, 2 * GIB)
        };
        let eight_b = ModelDescriptor {
            parameter_count_billion: 8.0,
            ..model("8b", 5 * GIB, 72, 45, 4 * GIB)
        };
        let selector = selector(vec![three_b, eight_b]);

        let rec = selector.select(&make_specs(4 * GIB)).unwrap();
        assert_eq!(rec.descriptor.name, "3b");
        assert_eq!(rec.performance_tier, PerformanceTier::Balanced);
        assert!(rec.warnings.is_empty());
        assert_eq!(rec.memory_headroom_bytes, (4 * GIB - 5 * GIB / 2) as i64);
    }

    #[test]
    fn test_prefers_quality_then_speed_then_smaller() {
        let selector = selector(vec![
            model("fast", GIB, 60, 90, GIB / 2),
            model("slow", GIB, 60, 50, GIB / 2),
            model("bigger-fast", 2 * GIB, 60, 90, GIB / 2),
            model("worse", GIB / 2, 40, 99, GIB / 4),
        ]);

        let rec = selector.select(&make_specs(16 * GIB)).unwrap();
        assert_eq!(rec.descriptor.name, "fast");
    }

    #[test]
    fn test_low_memory_fallback_to_smallest() {
        let selector = selector(vec![
            model("small", 2 * GIB, 30, 90, GIB),
            model("large", 6 * GIB, 80, 30, 5 * GIB),
        ]);

        // 2GB + 512MB buffer does not fit in 2.2GB, but the 1GB floor is met
        let rec = selector.select(&make_specs(2 * GIB + 200 * MIB)).unwrap();
        assert_eq!(rec.descriptor.name, "small");
        assert_eq!(rec.performance_tier, PerformanceTier::Minimal);
        assert!(rec.has_low_memory_warning());
    }

    #[test]
    fn test_insufficient_hardware_below_every_floor() {
        let selector = selector(vec![
            model("small", 2 * GIB, 30, 90, GIB),
            model("large", 6 * GIB, 80, 30, 5 * GIB),
        ]);

        let err = selector.select(&make_specs(GIB / 2)).unwrap_err();
        assert_eq!(
            err,
            LocalAiError::InsufficientHardware {
                available_bytes: GIB / 2,
                required_bytes: GIB,
            }
        );
    }

    #[test]
    fn test_fitting_recommendation_respects_buffer_across_range() {
        let selector = ModelSelector::new(ModelCatalog::builtin(), SelectionPolicy::default());
        let floor = selector.catalog().smallest().min_memory_bytes;

        let mut available = floor;
        while available < 48 * GIB {
            let rec = selector.select(&make_specs(available)).unwrap();
            if !rec.has_low_memory_warning() {
                assert!(
                    rec.descriptor.estimated_memory_bytes + selector.policy().buffer(available)
                        <= available,
                    "{} does not fit {} bytes",
                    rec.descriptor.name,
                    available
                );
            }
            available += 256 * MIB;
        }
    }

    #[test]
    fn test_preferred_model_used_when_runnable() {
        let policy = SelectionPolicy {
            preferred_model: Some("small".to_string()),
            ..Default::default()
        };
        let selector = ModelSelector::new(
            ModelCatalog::new(vec![
                model("small", GIB, 30, 90, GIB / 2),
                model("large", 4 * GIB, 80, 30, 3 * GIB),
            ])
            .unwrap(),
            policy,
        );

        let rec = selector.select(&make_specs(32 * GIB)).unwrap();
        assert_eq!(rec.descriptor.name, "small");
    }

    #[test]
    fn test_preferred_model_tight_fit_warns() {
        let policy = SelectionPolicy {
            preferred_model: Some("large".to_string()),
            ..Default::default()
        };
        let selector = ModelSelector::new(
            ModelCatalog::new(vec![
                model("small", GIB, 30, 90, GIB / 2),
                model("large", 4 * GIB, 80, 30, 3 * GIB),
            ])
            .unwrap(),
            policy,
        );

        let rec = selector.select(&make_specs(4 * GIB)).unwrap();
        assert_eq!(rec.descriptor.name, "large");
        assert!(rec.has_low_memory_warning());
    }

    #[test]
    fn test_recommend_named() {
        let selector = selector(vec![
            model("small", GIB, 30, 90, GIB / 2),
            model("large", 4 * GIB, 80, 30, 3 * GIB),
        ]);

        let rec = selector.recommend_named("large", &make_specs(16 * GIB)).unwrap();
        assert_eq!(rec.descriptor.name, "large");
        assert!(rec.warnings.is_empty());

        assert!(matches!(
            selector.recommend_named("large", &make_specs(2 * GIB)),
            Err(LocalAiError::InsufficientHardware { .. })
        ));
        assert!(matches!(
            selector.recommend_named("unknown", &make_specs(16 * GIB)),
            Err(LocalAiError::Config { .. })
        ));
    }

    #[test]
    fn test_unknown_preferred_model_falls_back() {
        let policy = SelectionPolicy {
            preferred_model: Some("missing".to_string()),
            ..Default::default()
        };
        let selector = ModelSelector::new(
            ModelCatalog::new(vec![model("small", GIB, 30, 90, GIB / 2)]).unwrap(),
            policy,
        );

        let rec = selector.select(&make_specs(8 * GIB)).unwrap();
        assert_eq!(rec.descriptor.name, "small");
    }

    #[parameterized(
        high = { 70, PerformanceTier::HighQuality },
        top = { 100, PerformanceTier::HighQuality },
        balanced_upper = { 69, PerformanceTier::Balanced },
        balanced_lower = { 40, PerformanceTier::Balanced },
        minimal = { 39, PerformanceTier::Minimal },
        zero = { 0, PerformanceTier::Minimal },
    )]
    fn test_tier_mapping(quality: u8, expected: PerformanceTier) {
        assert_eq!(PerformanceTier::from_quality(quality), expected);
    }

    #[parameterized(
        unchanged = { 8, 8, false },
        small_drop = { 100, 95, false },
        exact_threshold = { 100, 90, false },
        large_drop = { 100, 80, true },
        large_rise = { 100, 125, true },
    )]
    fn test_hysteresis(previous: u64, current: u64, expected: bool) {
        assert_eq!(needs_reselection(previous * GIB, current * GIB, 0.10), expected);
    }
}
