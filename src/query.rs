//! Approximate nearest-neighbor queries.
//!
//! A query moves through [`QueryState`]s: its signature is computed on the
//! device, candidates are read from the owning ranks' buckets of every table,
//! and the candidates are refined by exact distance. When no table yields a
//! candidate and multi-probe is enabled, neighboring buckets are probed in
//! rounds before the query is declared empty.

use log::trace;
use ordered_float::OrderedFloat;

use crate::compute::ComputeEngine;
use crate::data::PointWindow;
use crate::error::{LshError, Result};
use crate::hash_functions::LshHash;
use crate::hash_table::{CandidateSet, DistributedHashTable};
use crate::types::{HashValue, Neighbor, Signature};
use crate::utils::try_parallel_range;

/// Progress of a single query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum QueryState {
    SignatureComputed,
    CandidatesGathered,
    Refined,
    Done,
}

/// Work performed by one query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueryStats {
    /// Distinct candidates refined by exact distance.
    pub candidates_examined: usize,
    /// Neighboring buckets read by multi-probe.
    pub probes_issued: usize,
    /// Buckets read in total, probes included.
    pub buckets_read: usize,
    /// Last state reached.
    pub state: QueryState,
}

impl Default for QueryStats {
    fn default() -> Self {
        Self {
            candidates_examined: 0,
            probes_issued: 0,
            buckets_read: 0,
            state: QueryState::SignatureComputed,
        }
    }
}

impl QueryStats {
    fn advance(&mut self, next: QueryState) {
        debug_assert!(next >= self.state, "query moved back from {:?} to {:?}", self.state, next);
        trace!("query {:?} -> {:?}", self.state, next);
        self.state = next;
    }
}

/// Answers queries against a built [`DistributedHashTable`].
pub struct QueryEngine<'a> {
    table: &'a DistributedHashTable,
    engine: &'a ComputeEngine,
    points: &'a PointWindow,
}

impl<'a> QueryEngine<'a> {
    pub fn new(table: &'a DistributedHashTable, engine: &'a ComputeEngine, points: &'a PointWindow) -> Self {
        Self { table, engine, points }
    }

    /// Up to `k` neighbors of `point`, nearest first, ties broken by id.
    pub fn query(&self, point: &[f32], k: usize, multi_probe: bool) -> Result<Vec<Neighbor>> {
        self.query_with_stats(point, k, multi_probe).map(|(neighbors, _)| neighbors)
    }

    /// [`QueryEngine::query`] plus the work it took.
    pub fn query_with_stats(&self, point: &[f32], k: usize, multi_probe: bool) -> Result<(Vec<Neighbor>, QueryStats)> {
        if k == 0 {
            let mut stats = QueryStats::default();
            stats.advance(QueryState::Done);
            return Ok((Vec::new(), stats));
        }
        self.check_dims(point)?;

        let batch = [point.to_vec()];
        let signature = self
            .engine
            .compute_signatures_batch(&batch[..], self.table.family())?
            .pop()
            .ok_or_else(|| LshError::compute(self.engine.rank(), vec!["no signature computed".into()]))?;
        self.answer(point, &signature, k, multi_probe)
    }

    /// Answer many queries; signatures are computed in one device batch.
    pub fn query_batch(&self, points: &[Vec<f32>], k: usize, multi_probe: bool) -> Result<Vec<Vec<Neighbor>>> {
        if k == 0 {
            return Ok(vec![Vec::new(); points.len()]);
        }
        for point in points {
            self.check_dims(point)?;
        }

        let signatures = self.engine.compute_signatures_batch(points, self.table.family())?;
        points
            .iter()
            .zip(&signatures)
            .map(|(point, signature)| self.answer(point, signature, k, multi_probe).map(|(n, _)| n))
            .collect()
    }

    fn check_dims(&self, point: &[f32]) -> Result<()> {
        let dims = self.table.family().dims();
        if point.len() != dims {
            return Err(LshError::invalid_argument(format!(
                "query has {} dimensions, expected {}",
                point.len(),
                dims
            )));
        }
        Ok(())
    }

    fn answer(
        &self,
        point: &[f32],
        signature: &Signature,
        k: usize,
        multi_probe: bool,
    ) -> Result<(Vec<Neighbor>, QueryStats)> {
        let mut stats = QueryStats::default();

        let candidates = self.table.gather_candidates(signature)?;
        stats.buckets_read += self.table.num_tables();
        if candidates.is_empty() && multi_probe {
            self.multi_probe(point, signature, &candidates, &mut stats)?;
        }
        stats.advance(QueryState::CandidatesGathered);

        let ids = candidates.into_sorted_vec();
        stats.candidates_examined = ids.len();
        let coordinates = self.points.fetch_many(&ids)?;
        let distances = self.engine.compute_distances_batch(point, &coordinates)?;

        let mut neighbors: Vec<Neighbor> = ids
            .into_iter()
            .zip(distances)
            .map(|(id, distance)| Neighbor::new(id, distance))
            .collect();
        neighbors.sort_by_key(|n| (OrderedFloat(n.distance), n.id));
        neighbors.truncate(k);
        stats.advance(QueryState::Refined);

        stats.advance(QueryState::Done);
        Ok((neighbors, stats))
    }

    /// Neighboring hash values of every table, nearest perturbations first.
    ///
    /// Functions are perturbed by +1 then -1, starting from the last one.
    fn probe_sequence(&self, point: &[f32], signature: &Signature) -> Vec<Vec<HashValue>> {
        let family = self.table.family();
        let max_probes = self.table.config().max_probes;

        (0..self.table.num_tables())
            .map(|table| {
                let components = family.components(table, point);
                let mut probes = Vec::with_capacity(max_probes);
                'functions: for function in (0..components.len()).rev() {
                    for delta in [1, -1] {
                        if probes.len() == max_probes {
                            break 'functions;
                        }
                        let mut perturbed = components.clone();
                        if !family.perturb(&mut perturbed, function, delta) {
                            continue;
                        }
                        let hash = family.combine(&perturbed);
                        if hash != signature.get(table) && !probes.contains(&hash) {
                            probes.push(hash);
                        }
                    }
                }
                probes
            })
            .collect()
    }

    /// Probe one neighboring bucket per table per round until a candidate shows up.
    fn multi_probe(
        &self,
        point: &[f32],
        signature: &Signature,
        candidates: &CandidateSet,
        stats: &mut QueryStats,
    ) -> Result<()> {
        let sequence = self.probe_sequence(point, signature);
        let rounds = sequence.iter().map(Vec::len).max().unwrap_or(0);

        for round in 0..rounds {
            let probed = try_parallel_range(sequence.len(), |table| match sequence[table].get(round) {
                Some(&hash) => {
                    let bucket = self.table.read_bucket(table, hash)?;
                    candidates.extend(bucket.ids());
                    Ok::<_, LshError>(1usize)
                }
                None => Ok(0),
            })?;
            let issued: usize = probed.iter().sum();
            stats.probes_issued += issued;
            stats.buckets_read += issued;
            trace!("multi-probe round {}: {} probes, {} candidates", round, issued, candidates.len());
            if !candidates.is_empty() {
                break;
            }
        }
        Ok(())
    }
}
