use std::cmp::Ordering;

use tracing::{debug, info};

use crate::analysis::{Segment, TimedUnit, TrackAnalysis};
use crate::config::GraphConfig;
use crate::graph::{Edge, EdgeId, LoopPoint, Quantum, QuantumGraph};
use crate::{RemixError, Result};

/// Derives the neighbor graph of a song's beats from its segment features.
///
/// Construction is deterministic: the same analysis and configuration always
/// produce the same edges, threshold and loop point.
#[derive(Debug, Clone, Default)]
pub struct SimilarityGraphBuilder {
    config: GraphConfig,
}

impl SimilarityGraphBuilder {
    pub fn new(config: GraphConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    pub fn build(&self, analysis: &TrackAnalysis) -> Result<QuantumGraph> {
        analysis.validate()?;
        if self.config.max_neighbors == 0 || self.config.branch_fraction_divisor == 0 {
            return Err(RemixError::msg(
                "graph config needs max_neighbors and branch_fraction_divisor above zero",
            ));
        }

        let beats = link_beats(&analysis.beats, &analysis.bars, &analysis.segments);
        let segments = analysis.segments.clone();

        let mut edges = Vec::new();
        let candidates: Vec<Vec<EdgeId>> = beats
            .iter()
            .map(|q1| self.rank_neighbors(q1, &beats, &segments, &mut edges))
            .collect();

        let threshold = self.select_threshold(&edges, &candidates);
        let mut active = collect_active(&edges, &candidates, threshold as f64);

        let ceiling = if longest_backward_percent(&edges, &active)
            < self.config.backward_branch_min_percent
        {
            self.config.backward_branch_ceiling_short
        } else {
            self.config.backward_branch_ceiling_long
        };
        insert_best_backward_branch(&edges, &candidates, &mut active, threshold as f64, ceiling);

        let reach = compute_reach(&edges, &active, self.config.reach_max_iterations);
        let candidate = find_loop_point(&reach, &active, self.config.reach_threshold_percent);
        let loop_point = close_loop(&edges, &mut active, candidate);

        info!(
            beats = beats.len(),
            threshold,
            loop_point = loop_point.index,
            wraps = loop_point.wraps_to_start,
            "built similarity graph"
        );

        Ok(QuantumGraph {
            beats,
            segments,
            edges,
            candidates,
            active,
            reach,
            threshold,
            loop_point,
        })
    }

    /// Keeps the `max_neighbors` closest beats under the distance ceiling and
    /// registers them in the edge arena, closest first.
    fn rank_neighbors(
        &self,
        q1: &Quantum,
        beats: &[Quantum],
        segments: &[Segment],
        edges: &mut Vec<Edge>,
    ) -> Vec<EdgeId> {
        let ceiling = self.config.max_threshold as f64;
        let mut ranked: Vec<(usize, f64)> = beats
            .iter()
            .filter(|q2| q2.index != q1.index)
            .map(|q2| (q2.index, self.beat_distance(q1, q2, segments)))
            .filter(|(_, distance)| *distance < ceiling)
            .collect();

        ranked.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        ranked.truncate(self.config.max_neighbors);

        ranked
            .into_iter()
            .map(|(destination, distance)| {
                let id = edges.len();
                edges.push(Edge {
                    id,
                    source: q1.index,
                    destination,
                    distance,
                });
                id
            })
            .collect()
    }

    /// Average per-position segment distance, plus a penalty when the two
    /// beats sit at different positions within their bars.
    pub fn beat_distance(&self, q1: &Quantum, q2: &Quantum, segments: &[Segment]) -> f64 {
        let penalty = self.config.segment_penalty;
        let parent_distance = if q1.index_in_parent == q2.index_in_parent {
            0.0
        } else {
            self.config.parent_penalty
        };

        if q1.segments.is_empty() {
            return penalty + parent_distance;
        }

        let sum: f64 = q1
            .segments
            .iter()
            .enumerate()
            .map(|(position, &seg1)| match q2.segments.get(position) {
                Some(&seg2) if seg2 != seg1 => {
                    self.segment_distance(&segments[seg1], &segments[seg2])
                }
                _ => penalty,
            })
            .sum();

        sum / q1.segments.len() as f64 + parent_distance
    }

    /// Weighted combination of the feature differences between two segments.
    pub fn segment_distance(&self, seg1: &Segment, seg2: &Segment) -> f64 {
        let weights = &self.config.weights;
        let timbre = euclidean_distance(&seg1.timbre, &seg2.timbre);
        let pitch = euclidean_distance(&seg1.pitches, &seg2.pitches);
        let loudness_start = (seg1.loudness_start - seg2.loudness_start).abs();
        let loudness_max = (seg1.loudness_max - seg2.loudness_max).abs();
        let duration = (seg1.duration - seg2.duration).abs();
        let confidence = (seg1.confidence - seg2.confidence).abs();

        timbre * weights.timbre
            + pitch * weights.pitch
            + loudness_start * weights.loudness_start
            + loudness_max * weights.loudness_max
            + duration * weights.duration
            + confidence * weights.confidence
    }

    /// Smallest threshold at which enough beats have at least one neighbor.
    fn select_threshold(&self, edges: &[Edge], candidates: &[Vec<EdgeId>]) -> u32 {
        let target = candidates.len() / self.config.branch_fraction_divisor;
        let step = self.config.threshold_step.max(1);

        let mut threshold = self.config.threshold_start;
        while threshold < self.config.max_threshold {
            let branching = candidates
                .iter()
                .filter(|ids| {
                    ids.iter()
                        .any(|&id| edges[id].distance <= threshold as f64)
                })
                .count();
            debug!(threshold, branching, target, "evaluated branch threshold");
            if branching >= target {
                return threshold;
            }
            threshold += step;
        }

        self.config.max_threshold
    }
}

fn euclidean_distance(v1: &[f64], v2: &[f64]) -> f64 {
    v1.iter()
        .zip(v2)
        .map(|(a, b)| (b - a) * (b - a))
        .sum::<f64>()
        .sqrt()
}

/// Resolves each beat's bar, position in bar and overlapping segments.
fn link_beats(beats: &[TimedUnit], bars: &[TimedUnit], segments: &[Segment]) -> Vec<Quantum> {
    let mut quanta: Vec<Quantum> = beats
        .iter()
        .enumerate()
        .map(|(index, beat)| Quantum {
            index,
            start: beat.start,
            duration: beat.duration,
            confidence: beat.confidence,
            parent: None,
            index_in_parent: 0,
            segments: Vec::new(),
        })
        .collect();

    let mut last = 0;
    for (bar_index, bar) in bars.iter().enumerate() {
        let mut children = 0;
        for (j, quantum) in quanta.iter_mut().enumerate().skip(last) {
            if quantum.start >= bar.start && quantum.start < bar.end() {
                quantum.parent = Some(bar_index);
                quantum.index_in_parent = children;
                children += 1;
                last = j;
            } else if quantum.start > bar.start {
                break;
            }
        }
    }

    let mut last = 0;
    for quantum in &mut quanta {
        for (j, segment) in segments.iter().enumerate().skip(last) {
            if segment.end() < quantum.start {
                continue;
            }
            if segment.start > quantum.end() {
                break;
            }
            last = j;
            quantum.segments.push(j);
        }
    }

    quanta
}

fn collect_active(edges: &[Edge], candidates: &[Vec<EdgeId>], threshold: f64) -> Vec<Vec<EdgeId>> {
    candidates
        .iter()
        .map(|ids| {
            ids.iter()
                .copied()
                .filter(|&id| edges[id].distance <= threshold)
                .collect()
        })
        .collect()
}

pub(super) fn longest_backward_percent(edges: &[Edge], active: &[Vec<EdgeId>]) -> usize {
    if active.is_empty() {
        return 0;
    }

    let longest = active
        .iter()
        .flatten()
        .map(|&id| &edges[id])
        .filter(|edge| edge.destination < edge.source)
        .map(|edge| edge.source - edge.destination)
        .max()
        .unwrap_or(0);

    longest * 100 / active.len()
}

/// Promotes the candidate edge that jumps furthest back (under `ceiling`) into
/// the active set, even when it is above the chosen threshold.
fn insert_best_backward_branch(
    edges: &[Edge],
    candidates: &[Vec<EdgeId>],
    active: &mut [Vec<EdgeId>],
    threshold: f64,
    ceiling: f64,
) {
    let count = candidates.len() as f64;
    let mut best: Option<(f64, EdgeId)> = None;

    for &id in candidates.iter().flatten() {
        let edge = &edges[id];
        if edge.destination >= edge.source || edge.distance >= ceiling {
            continue;
        }
        let percent = (edge.source - edge.destination) as f64 * 100.0 / count;
        if best.map_or(true, |(best_percent, _)| percent > best_percent) {
            best = Some((percent, id));
        }
    }

    if let Some((percent, id)) = best {
        let edge = &edges[id];
        if edge.distance > threshold {
            debug!(
                source = edge.source,
                destination = edge.destination,
                percent,
                "promoted backward branch"
            );
            active[edge.source].push(id);
        }
    }
}

/// Fixed-point propagation of how far back each beat can travel, expressed as
/// the span from the earliest reachable beat to the end of the track.
fn compute_reach(edges: &[Edge], active: &[Vec<EdgeId>], max_iterations: usize) -> Vec<usize> {
    let count = active.len();
    let mut reach: Vec<usize> = (0..count).map(|index| count - index).collect();

    for _ in 0..max_iterations {
        let mut changes = 0;

        for index in 0..count {
            let mut best = reach[index];
            for &id in &active[index] {
                best = best.max(reach[edges[id].destination]);
            }
            if index + 1 < count {
                best = best.max(reach[index + 1]);
            }

            if best > reach[index] {
                reach[index] = best;
                changes += 1;
                for earlier in &mut reach[..index] {
                    if *earlier < best {
                        *earlier = best;
                    }
                }
            }
        }

        if changes == 0 {
            break;
        }
    }

    reach
}

/// Scans from the end of the track for the latest branching beat whose reach
/// covers the largest share of the track.
fn find_loop_point(reach: &[usize], active: &[Vec<EdgeId>], threshold_percent: f64) -> Option<usize> {
    let count = reach.len();
    let mut best = None;
    let mut longest = 0.0;

    for index in (0..count).rev() {
        let distance_to_end = count - index;
        let percent = (reach[index] as f64 - distance_to_end as f64) * 100.0 / count as f64;

        if percent > longest && !active[index].is_empty() {
            longest = percent;
            best = Some(index);
            if percent >= threshold_percent {
                break;
            }
        }
    }

    best
}

/// Makes `[0, loop point]` closed under traversal: every beat up to the loop
/// point only keeps edges landing before it. Falls back to wrapping from the
/// final beat when no candidate keeps a backward edge.
fn close_loop(edges: &[Edge], active: &mut [Vec<EdgeId>], candidate: Option<usize>) -> LoopPoint {
    let last = active.len() - 1;

    let natural = candidate.filter(|&index| {
        active[index]
            .iter()
            .any(|&id| edges[id].destination < index)
    });

    let loop_point = match natural {
        Some(index) => LoopPoint {
            index,
            wraps_to_start: false,
        },
        None => LoopPoint {
            index: last,
            wraps_to_start: true,
        },
    };

    for ids in &mut active[..=loop_point.index] {
        ids.retain(|&id| edges[id].destination < loop_point.index);
    }

    loop_point
}

#[cfg(test)]
mod tests {
    use super::*;

    fn segment(start: f64, timbre: f64, pitch: f64) -> Segment {
        Segment {
            start,
            duration: 1.0,
            confidence: 0.5,
            loudness_start: -20.0,
            loudness_max: -10.0,
            loudness_max_time: 0.1,
            pitches: vec![pitch, 0.0],
            timbre: vec![timbre, 0.0],
        }
    }

    /// One segment per beat, features repeating every `period` beats.
    fn patterned(beats: usize, beats_per_bar: usize, period: usize) -> TrackAnalysis {
        TrackAnalysis {
            bars: (0..beats.div_ceil(beats_per_bar))
                .map(|bar| TimedUnit::new((bar * beats_per_bar) as f64, beats_per_bar as f64))
                .collect(),
            beats: (0..beats).map(|i| TimedUnit::new(i as f64, 1.0)).collect(),
            segments: (0..beats)
                .map(|i| segment(i as f64, (i % period) as f64 * 3.0, (i % period) as f64 * 0.1))
                .collect(),
            ..Default::default()
        }
    }

    fn edge(id: EdgeId, source: usize, destination: usize, distance: f64) -> Edge {
        Edge {
            id,
            source,
            destination,
            distance,
        }
    }

    #[test]
    fn links_beats_to_bars_and_segments() {
        let analysis = patterned(8, 4, 4);
        let beats = link_beats(&analysis.beats, &analysis.bars, &analysis.segments);

        assert_eq!(beats[5].parent, Some(1));
        assert_eq!(beats[5].index_in_parent, 1);
        assert_eq!(beats[0].segments, vec![0, 1]);
        assert_eq!(beats[5].segments, vec![5, 6]);
        assert_eq!(beats[7].segments, vec![7]);
    }

    #[test]
    fn identical_features_at_same_bar_position_are_close() {
        let analysis = patterned(12, 4, 4);
        let builder = SimilarityGraphBuilder::default();
        let beats = link_beats(&analysis.beats, &analysis.bars, &analysis.segments);

        let same = builder.beat_distance(&beats[5], &beats[9], &analysis.segments);
        let shifted = builder.beat_distance(&beats[5], &beats[6], &analysis.segments);
        let against_self = builder.beat_distance(&beats[5], &beats[5], &analysis.segments);

        assert_eq!(same, 0.0);
        assert!(shifted >= 100.0);
        assert_eq!(against_self, 100.0);
    }

    #[test]
    fn segment_distance_weights_pitch_and_duration() {
        let builder = SimilarityGraphBuilder::default();
        let a = segment(0.0, 0.0, 0.0);
        let mut b = segment(1.0, 0.0, 0.5);
        assert!((builder.segment_distance(&a, &b) - 5.0).abs() < 1e-9);

        b.pitches = a.pitches.clone();
        b.duration = 1.1;
        assert!((builder.segment_distance(&a, &b) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn neighbor_lists_are_ranked_and_bounded() {
        let graph = SimilarityGraphBuilder::default()
            .build(&patterned(32, 4, 4))
            .unwrap();

        let mut last_id = None;
        for beat in 0..graph.len() {
            let edges: Vec<_> = graph.candidate_edges(beat).collect();
            assert!(edges.len() <= 4);
            for pair in edges.windows(2) {
                assert!(pair[0].distance <= pair[1].distance);
            }
            for edge in edges {
                assert_ne!(edge.destination, beat);
                assert!(edge.distance < 80.0);
                assert!(last_id.map_or(true, |last| edge.id > last));
                last_id = Some(edge.id);
            }
        }
    }

    #[test]
    fn building_is_deterministic() {
        let analysis = patterned(48, 4, 8);
        let builder = SimilarityGraphBuilder::default();

        assert_eq!(builder.build(&analysis).unwrap(), builder.build(&analysis).unwrap());
    }

    #[test]
    fn loop_point_closes_the_pre_loop_region() {
        let graph = SimilarityGraphBuilder::default()
            .build(&patterned(32, 4, 4))
            .unwrap();
        let loop_point = graph.loop_point();

        assert!(!loop_point.wraps_to_start);
        assert!(graph
            .active_edges(loop_point.index)
            .all(|edge| edge.destination < loop_point.index));
        assert!(graph.active_edges(loop_point.index).next().is_some());
        for beat in 0..loop_point.index {
            assert!(graph
                .active_edges(beat)
                .all(|edge| edge.destination < loop_point.index));
        }
    }

    #[test]
    fn featureless_song_wraps_from_the_last_beat() {
        let analysis = TrackAnalysis {
            beats: (0..4).map(|i| TimedUnit::new(i as f64, 1.0)).collect(),
            ..Default::default()
        };
        let graph = SimilarityGraphBuilder::default().build(&analysis).unwrap();

        assert_eq!(
            graph.loop_point(),
            LoopPoint {
                index: 3,
                wraps_to_start: true
            }
        );
        assert_eq!(graph.summary().active_edges, 0);
    }

    #[test]
    fn rejects_analysis_without_beats() {
        let err = SimilarityGraphBuilder::default()
            .build(&TrackAnalysis::default())
            .unwrap_err();
        assert!(matches!(err, RemixError::InvalidAnalysis(_)));
    }

    #[test]
    fn threshold_search_stops_at_first_sufficient_value() {
        let builder = SimilarityGraphBuilder::default();
        let edges = vec![edge(0, 0, 3, 12.0), edge(1, 1, 4, 31.0)];
        let mut candidates = vec![Vec::new(); 12];
        candidates[0] = vec![0];
        candidates[1] = vec![1];

        // 12 beats need 2 branching beats.
        assert_eq!(builder.select_threshold(&edges, &candidates), 35);
        candidates[1].clear();
        assert_eq!(builder.select_threshold(&edges, &candidates), 80);
    }

    #[test]
    fn promotes_furthest_backward_candidate_above_threshold() {
        let edges = vec![
            edge(0, 5, 3, 20.0),
            edge(1, 9, 1, 60.0),
            edge(2, 8, 0, 70.0),
        ];
        let candidates = vec![
            vec![],
            vec![],
            vec![],
            vec![],
            vec![],
            vec![0],
            vec![],
            vec![],
            vec![2],
            vec![1],
        ];
        let mut active = collect_active(&edges, &candidates, 25.0);
        assert_eq!(longest_backward_percent(&edges, &active), 20);

        insert_best_backward_branch(&edges, &candidates, &mut active, 25.0, 65.0);
        assert_eq!(active[9], vec![1]);
        assert!(active[8].is_empty());
    }

    #[test]
    fn reach_propagates_backward_jumps_to_earlier_beats() {
        let edges = vec![edge(0, 6, 1, 10.0)];
        let mut active = vec![Vec::new(); 8];
        active[6] = vec![0];

        let reach = compute_reach(&edges, &active, 1000);
        assert_eq!(reach[6], 7);
        assert_eq!(reach[0], 8);
        assert_eq!(reach[7], 1);

        assert_eq!(find_loop_point(&reach, &active, 50.0), Some(6));
    }
}
