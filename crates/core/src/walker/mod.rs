use std::collections::VecDeque;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::config::WalkerConfig;
use crate::graph::{EdgeId, QuantumGraph};
use crate::{RemixError, Result};

/// Identifies what a [`Unit`] plays: the intro before the first analysed
/// beat, or one of the graph's beats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitIndex {
    LeadIn,
    Beat(usize),
}

impl UnitIndex {
    pub fn beat(self) -> Option<usize> {
        match self {
            UnitIndex::LeadIn => None,
            UnitIndex::Beat(index) => Some(index),
        }
    }

    /// True when `self` directly follows `prev` in the original track.
    pub fn follows(self, prev: UnitIndex) -> bool {
        match (prev, self) {
            (UnitIndex::LeadIn, UnitIndex::Beat(0)) => true,
            (UnitIndex::Beat(a), UnitIndex::Beat(b)) => a + 1 == b,
            _ => false,
        }
    }
}

/// A span of the original track returned by the walker.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub index: UnitIndex,
    pub start: f64,
    pub duration: f64,
}

impl Unit {
    pub fn is_lead_in(&self) -> bool {
        self.index == UnitIndex::LeadIn
    }
}

/// Source of uniform draws in `[0, 1)` for branch decisions.
pub trait RandomSource: Send {
    fn next_f64(&mut self) -> f64;
}

/// [`RandomSource`] backed by a seeded [`StdRng`], so a remix can be replayed
/// from its seed.
#[derive(Debug, Clone)]
pub struct SeededRandom {
    seed: u64,
    rng: StdRng,
}

impl SeededRandom {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Draws a fresh seed from the thread-local generator.
    pub fn from_entropy() -> Self {
        Self::new(rand::random::<u64>())
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }
}

impl RandomSource for SeededRandom {
    fn next_f64(&mut self) -> f64 {
        self.rng.random::<f64>()
    }
}

/// Walks the similarity graph forever: mostly beat after beat, sometimes
/// jumping to a similar beat with a chance that grows until it fires.
pub struct InfiniteWalker {
    graph: Arc<QuantumGraph>,
    config: WalkerConfig,
    random: Box<dyn RandomSource>,
    branch_chance: f64,
    /// Active edges per beat, rotated as they are used.
    rings: Vec<VecDeque<EdgeId>>,
}

impl InfiniteWalker {
    pub fn new(graph: Arc<QuantumGraph>, config: WalkerConfig, random: Box<dyn RandomSource>) -> Self {
        let rings = (0..graph.len())
            .map(|beat| graph.active_ids(beat).iter().copied().collect())
            .collect();

        Self {
            branch_chance: config.min_branch_chance,
            graph,
            config,
            random,
            rings,
        }
    }

    pub fn graph(&self) -> &Arc<QuantumGraph> {
        &self.graph
    }

    pub fn branch_chance(&self) -> f64 {
        self.branch_chance
    }

    /// Returns the unit to play after `current`, or the opening unit when
    /// `current` is `None`.
    pub fn next(&mut self, current: Option<&Unit>) -> Result<Unit> {
        let Some(current) = current else {
            return Ok(self.opening_unit());
        };

        match current.index {
            UnitIndex::LeadIn => Ok(self.beat_unit(0)),
            UnitIndex::Beat(index) => {
                let next = index + 1;
                if next < self.graph.len() {
                    let chosen = self.select_branch(next);
                    return Ok(self.beat_unit(chosen));
                }

                let loop_point = self.graph.loop_point();
                if loop_point.wraps_to_start && index == loop_point.index {
                    trace!(from = index, "wrapping to first beat");
                    self.branch_chance = self.config.min_branch_chance;
                    return Ok(self.beat_unit(0));
                }

                Err(RemixError::WalkExhausted { index })
            }
        }
    }

    fn opening_unit(&self) -> Unit {
        let first = &self.graph.beats()[0];
        if first.start == 0.0 {
            self.beat_unit(0)
        } else {
            Unit {
                index: UnitIndex::LeadIn,
                start: 0.0,
                duration: first.start,
            }
        }
    }

    fn beat_unit(&self, index: usize) -> Unit {
        let beat = &self.graph.beats()[index];
        Unit {
            index: UnitIndex::Beat(index),
            start: beat.start,
            duration: beat.duration,
        }
    }

    /// Either keeps `seed` or swaps it for its least recently used neighbor.
    fn select_branch(&mut self, seed: usize) -> usize {
        if self.rings[seed].is_empty() || !self.should_branch(seed) {
            return seed;
        }

        let ring = &mut self.rings[seed];
        let Some(id) = ring.pop_front() else {
            return seed;
        };
        ring.push_back(id);

        let destination = self.graph.edge(id).destination;
        trace!(from = seed, to = destination, "branching");
        destination
    }

    fn should_branch(&mut self, seed: usize) -> bool {
        let loop_point = self.graph.loop_point();
        if seed == loop_point.index && !loop_point.wraps_to_start {
            self.branch_chance = self.config.min_branch_chance;
            return true;
        }

        self.branch_chance =
            (self.branch_chance + self.config.branch_chance_delta).min(self.config.max_branch_chance);
        let draw = self.random.next_f64();
        let branch = draw < self.branch_chance;
        if branch {
            self.branch_chance = self.config.min_branch_chance;
        }
        branch
    }
}

impl std::fmt::Debug for InfiniteWalker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InfiniteWalker")
            .field("beats", &self.graph.len())
            .field("branch_chance", &self.branch_chance)
            .finish()
    }
}

/// Replays a fixed list of draws, repeating the last one once exhausted.
#[derive(Debug, Clone)]
pub struct ScriptedRandom {
    draws: Vec<f64>,
    position: usize,
}

impl ScriptedRandom {
    pub fn new(draws: Vec<f64>) -> Self {
        Self { draws, position: 0 }
    }

    /// A source that never clears the branch chance.
    pub fn never() -> Self {
        Self::new(vec![1.0])
    }
}

impl RandomSource for ScriptedRandom {
    fn next_f64(&mut self) -> f64 {
        let draw = self
            .draws
            .get(self.position)
            .or_else(|| self.draws.last())
            .copied()
            .unwrap_or(1.0);
        self.position += 1;
        draw
    }
}
