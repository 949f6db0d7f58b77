//! Arena representation of a song's beats and the similarity edges between
//! them. All cross references (bar, segments, edge endpoints) are indices.

mod builder;

use serde::{Deserialize, Serialize};

use crate::analysis::Segment;

pub use builder::SimilarityGraphBuilder;

/// Position of an [`Edge`] in the graph's edge arena. Ids grow in the order
/// edges were ranked, so a lower id is an older, closer neighbor.
pub type EdgeId = usize;

/// A beat-level analysis unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Quantum {
    pub index: usize,
    pub start: f64,
    pub duration: f64,
    pub confidence: f64,
    /// Enclosing bar, if the analysis has one covering this beat.
    pub parent: Option<usize>,
    /// Position of this beat within its bar.
    pub index_in_parent: usize,
    /// Indices of the segments overlapping this beat, in time order.
    pub segments: Vec<usize>,
}

impl Quantum {
    pub fn end(&self) -> f64 {
        self.start + self.duration
    }
}

/// Directed candidate transition between two beats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: usize,
    pub destination: usize,
    pub distance: f64,
}

/// The beat every walk is forced to branch at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopPoint {
    pub index: usize,
    /// Set when no beat could serve as a natural loop point: the walk plays
    /// through to the final beat and wraps back to the first one.
    pub wraps_to_start: bool,
}

/// Serializable overview of a built graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSummary {
    pub beats: usize,
    pub threshold: u32,
    pub loop_point: LoopPoint,
    pub branching_beats: usize,
    pub active_edges: usize,
    pub candidate_edges: usize,
    pub longest_backward_percent: usize,
}

/// Beats plus their candidate and active neighbor edges. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantumGraph {
    pub(crate) beats: Vec<Quantum>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) edges: Vec<Edge>,
    pub(crate) candidates: Vec<Vec<EdgeId>>,
    pub(crate) active: Vec<Vec<EdgeId>>,
    pub(crate) reach: Vec<usize>,
    pub(crate) threshold: u32,
    pub(crate) loop_point: LoopPoint,
}

impl QuantumGraph {
    pub fn len(&self) -> usize {
        self.beats.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beats.is_empty()
    }

    pub fn beats(&self) -> &[Quantum] {
        &self.beats
    }

    pub fn beat(&self, index: usize) -> Option<&Quantum> {
        self.beats.get(index)
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn edge(&self, id: EdgeId) -> &Edge {
        &self.edges[id]
    }

    /// Every edge under the loose distance ceiling, closest first.
    pub fn candidate_edges(&self, beat: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.candidates[beat].iter().map(move |&id| &self.edges[id])
    }

    /// The pruned neighbor list used while walking.
    pub fn active_edges(&self, beat: usize) -> impl Iterator<Item = &Edge> + '_ {
        self.active[beat].iter().map(move |&id| &self.edges[id])
    }

    pub(crate) fn active_ids(&self, beat: usize) -> &[EdgeId] {
        &self.active[beat]
    }

    /// Destinations of the active edges of `beat`.
    pub fn neighbors(&self, beat: usize) -> Vec<usize> {
        self.active_edges(beat).map(|edge| edge.destination).collect()
    }

    /// Span from the earliest beat reachable from `beat` to the end of the track.
    pub fn reach(&self, beat: usize) -> usize {
        self.reach[beat]
    }

    /// Distance threshold the active neighbor lists were cut at.
    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn loop_point(&self) -> LoopPoint {
        self.loop_point
    }

    /// Longest active backward edge as a whole percentage of the track.
    pub fn longest_backward_percent(&self) -> usize {
        builder::longest_backward_percent(&self.edges, &self.active)
    }

    pub fn summary(&self) -> GraphSummary {
        GraphSummary {
            beats: self.len(),
            threshold: self.threshold,
            loop_point: self.loop_point,
            branching_beats: self.active.iter().filter(|ids| !ids.is_empty()).count(),
            active_edges: self.active.iter().map(Vec::len).sum(),
            candidate_edges: self.candidates.iter().map(Vec::len).sum(),
            longest_backward_percent: self.longest_backward_percent(),
        }
    }
}

/// Hand-wired graph for walker and materializer tests: one-second beats at
/// `starts`, with `links` as active edges in the given order.
#[cfg(test)]
pub(crate) fn wired_graph(starts: &[f64], links: &[(usize, usize)], loop_point: LoopPoint) -> QuantumGraph {
    let beats: Vec<Quantum> = starts
        .iter()
        .enumerate()
        .map(|(index, &start)| Quantum {
            index,
            start,
            duration: 1.0,
            confidence: 1.0,
            parent: None,
            index_in_parent: 0,
            segments: Vec::new(),
        })
        .collect();

    let mut active = vec![Vec::new(); beats.len()];
    let edges: Vec<Edge> = links
        .iter()
        .enumerate()
        .map(|(id, &(source, destination))| {
            active[source].push(id);
            Edge {
                id,
                source,
                destination,
                distance: id as f64,
            }
        })
        .collect();

    QuantumGraph {
        reach: vec![0; beats.len()],
        candidates: active.clone(),
        beats,
        segments: Vec::new(),
        edges,
        active,
        threshold: 0,
        loop_point,
    }
}
