//! Static catalog of local models the engine can run

use super::error::LocalAiError;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

fn gib(value: f64) -> u64 {
    (value * GIB) as u64
}

/// Weight encoding of a model file
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Quantization {
    Q4_0,
    Q4_K_M,
    Q5_K_M,
    Q8_0,
    FP16,
}

impl fmt::Display for Quantization {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Quantization::Q4_0 => "Q4_0",
            Quantization::Q4_K_M => "Q4_K_M",
            Quantization::Q5_K_M => "Q5_K_M",
            Quantization::Q8_0 => "Q8_0",
            Quantization::FP16 => "FP16",
        };
        write!(f, "{}", label)
    }
}

/// A model the selector may choose
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelDescriptor {
    /// Engine model tag, unique within a catalog
    pub name: String,
    /// Parameter count in billions
    pub parameter_count_billion: f64,
    pub quantization: Quantization,
    /// Resident memory while loaded, including runtime overhead
    pub estimated_memory_bytes: u64,
    /// Size of the model file on disk
    pub estimated_disk_bytes: u64,
    /// Output quality, 0..=100
    pub quality_score: u8,
    /// Generation speed, 0..=100
    pub speed_score: u8,
    /// Hard floor of available memory below which the model must not run
    pub min_memory_bytes: u64,
    /// Largest context window the model is configured for
    pub context_window_tokens: u32,
}

impl ModelDescriptor {
    #[allow(clippy::too_many_arguments)]
    fn builtin(
        name: &str,
        parameter_count_billion: f64,
        quantization: Quantization,
        memory_gb: f64,
        disk_gb: f64,
        quality_score: u8,
        speed_score: u8,
        min_memory_gb: f64,
        context_window_tokens: u32,
    ) -> Self {
        Self {
            name: name.to_string(),
            parameter_count_billion,
            quantization,
            estimated_memory_bytes: gib(memory_gb),
            estimated_disk_bytes: gib(disk_gb),
            quality_score,
            speed_score,
            min_memory_bytes: gib(min_memory_gb),
            context_window_tokens,
        }
    }

    /// Estimated memory in gigabytes
    pub fn estimated_memory_gb(&self) -> f64 {
        self.estimated_memory_bytes as f64 / GIB
    }
}

/// Read-only ordered list of model descriptors, smallest footprint first
#[derive(Debug, Clone)]
pub struct ModelCatalog {
    entries: Vec<ModelDescriptor>,
}

impl ModelCatalog {
    /// Build a catalog from arbitrary entries
    ///
    /// Entries are ordered by estimated memory. Names must be unique and the
    /// catalog must not be empty.
    pub fn new(mut entries: Vec<ModelDescriptor>) -> Result<Self, LocalAiError> {
        if entries.is_empty() {
            return Err(LocalAiError::Config {
                message: "model catalog is empty".to_string(),
            });
        }

        let mut seen = HashSet::new();
        for entry in &entries {
            if !seen.insert(entry.name.as_str()) {
                return Err(LocalAiError::Config {
                    message: format!("duplicate model '{}' in catalog", entry.name),
                });
            }
        }

        entries.sort_by_key(|entry| entry.estimated_memory_bytes);
        Ok(Self { entries })
    }

    /// The models shipped with infrapilot, tuned for code and config generation
    pub fn builtin() -> Self {
        use Quantization::*;

        let entries = vec![
            ModelDescriptor::builtin("llama3.2:1b", 1.2, Q4_K_M, 1.4, 1.3, 30, 95, 1.0, 4096),
            ModelDescriptor::builtin("qwen2.5-coder:1.5b", 1.5, Q4_K_M, 1.8, 1.0, 38, 90, 1.2, 4096),
            ModelDescriptor::builtin("qwen2.5-coder:3b", 3.1, Q4_K_M, 2.6, 1.9, 55, 76, 2.0, 8192),
            ModelDescriptor::builtin("llama3.2:3b", 3.2, Q4_K_M, 3.0, 2.0, 50, 72, 2.2, 8192),
            ModelDescriptor::builtin("qwen2.5-coder:7b", 7.6, Q4_K_M, 5.5, 4.7, 72, 50, 4.5, 8192),
            ModelDescriptor::builtin("llama3.1:8b", 8.0, Q4_K_M, 6.0, 4.9, 70, 46, 5.0, 8192),
            ModelDescriptor::builtin(
                "qwen2.5-coder:7b-instruct-q8_0",
                7.6,
                Q8_0,
                9.0,
                8.1,
                76,
                38,
                7.5,
                8192,
            ),
            ModelDescriptor::builtin("qwen2.5-coder:14b", 14.8, Q4_K_M, 10.5, 9.0, 82, 28, 9.0, 16384),
            ModelDescriptor::builtin("qwen2.5-coder:32b", 32.8, Q4_K_M, 21.0, 20.0, 90, 12, 19.0, 16384),
        ];

        Self { entries }
    }

    pub fn entries(&self) -> &[ModelDescriptor] {
        &self.entries
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModelDescriptor> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up a model by its engine tag
    pub fn get(&self, name: &str) -> Option<&ModelDescriptor> {
        self.entries.iter().find(|entry| entry.name == name)
    }

    /// The entry with the smallest estimated memory
    pub fn smallest(&self) -> &ModelDescriptor {
        // Non-empty by construction, sorted ascending
        &self.entries[0]
    }
}

impl Default for ModelCatalog {
    fn default() -> Self {
        Self::builtin()
    }
}
