use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Top-level configuration structure for a remix.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RemixConfig {
    pub graph: GraphConfig,
    pub walker: WalkerConfig,
    pub generation: GenerationConfig,
    pub scheduler: SchedulerConfig,
}

impl RemixConfig {
    /// Parses a configuration document. Missing fields keep their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Reads and parses a configuration file.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

/// Weights applied to each segment feature when comparing two segments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct FeatureWeights {
    pub timbre: f64,
    pub pitch: f64,
    pub loudness_start: f64,
    pub loudness_max: f64,
    pub duration: f64,
    pub confidence: f64,
}

impl Default for FeatureWeights {
    fn default() -> Self {
        Self {
            timbre: 1.0,
            pitch: 10.0,
            loudness_start: 1.0,
            loudness_max: 1.0,
            duration: 100.0,
            confidence: 1.0,
        }
    }
}

/// Knobs of the similarity graph builder.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphConfig {
    pub max_neighbors: usize,
    pub max_threshold: u32,
    pub threshold_start: u32,
    pub threshold_step: u32,
    /// The threshold search targets `beats / branch_fraction_divisor` branching beats.
    pub branch_fraction_divisor: usize,
    /// Distance used when two compared segments are the same segment or one is missing.
    pub segment_penalty: f64,
    /// Added when two beats sit at different positions within their bars.
    pub parent_penalty: f64,
    pub reach_max_iterations: usize,
    pub reach_threshold_percent: f64,
    /// Backward-branch ceiling used when the longest active backward branch is short.
    pub backward_branch_ceiling_short: f64,
    /// Backward-branch ceiling used otherwise.
    pub backward_branch_ceiling_long: f64,
    /// Longest-backward-branch percentage below which the short ceiling applies.
    pub backward_branch_min_percent: usize,
    pub weights: FeatureWeights,
}

impl Default for GraphConfig {
    fn default() -> Self {
        Self {
            max_neighbors: 4,
            max_threshold: 80,
            threshold_start: 10,
            threshold_step: 5,
            branch_fraction_divisor: 6,
            segment_penalty: 100.0,
            parent_penalty: 100.0,
            reach_max_iterations: 1000,
            reach_threshold_percent: 50.0,
            backward_branch_ceiling_short: 65.0,
            backward_branch_ceiling_long: 55.0,
            backward_branch_min_percent: 50,
            weights: FeatureWeights::default(),
        }
    }
}

/// Branch probability schedule of the infinite walker.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WalkerConfig {
    pub min_branch_chance: f64,
    pub branch_chance_delta: f64,
    pub max_branch_chance: f64,
    /// Fixed seed for reproducible remixes. A random seed is drawn when absent.
    pub seed: Option<u64>,
}

impl Default for WalkerConfig {
    fn default() -> Self {
        Self {
            min_branch_chance: 0.18,
            branch_chance_delta: 0.018,
            max_branch_chance: 0.5,
            seed: None,
        }
    }
}

/// How far ahead of the listener the remix is generated.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct GenerationConfig {
    pub initial_seconds: f64,
    pub batch_seconds: f64,
    pub lookahead_seconds: f64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            initial_seconds: 60.0,
            batch_seconds: 30.0,
            lookahead_seconds: 25.0,
        }
    }
}

/// Timing of the audio scheduling loop, in host audio clock seconds.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    pub wake_early_seconds: f64,
    pub lookahead_seconds: f64,
    pub voice_release_margin_seconds: f64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            wake_early_seconds: 1.0,
            lookahead_seconds: 1.0,
            voice_release_margin_seconds: 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_documents_keep_defaults() {
        let config =
            RemixConfig::from_json_str(r#"{ "walker": { "seed": 7 }, "graph": { "max_neighbors": 2 } }"#)
                .unwrap();

        assert_eq!(config.walker.seed, Some(7));
        assert_eq!(config.walker.min_branch_chance, 0.18);
        assert_eq!(config.graph.max_neighbors, 2);
        assert_eq!(config.graph.max_threshold, 80);
        assert_eq!(config.generation, GenerationConfig::default());
    }

    #[test]
    fn rejects_malformed_documents() {
        assert!(RemixConfig::from_json_str("{ not json").is_err());
    }
}
