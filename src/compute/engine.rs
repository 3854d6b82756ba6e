//! Per-rank compute device.
//!
//! The device is a dedicated rayon pool. Kernels are submitted without
//! blocking and report their outcome into a shared queue; failures only become
//! visible at [`ComputeEngine::synchronize`], which returns every failure since
//! the previous synchronization as one aggregated error.

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use super::kernels;
use crate::config::{ComputeConfig, Metric};
use crate::data::PointSource;
use crate::error::{LshError, Result};
use crate::hash_functions::LshHash;
use crate::index::{LinearIndexMapper, PointTable};
use crate::types::{Rank, Signature};
use crate::utils::panic_message;

/// Description of the device a rank computes on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub name: String,
    pub compute_units: usize,
    pub work_group_size: usize,
}

#[derive(Default)]
struct QueueState {
    in_flight: usize,
    failures: Vec<String>,
}

#[derive(Default)]
struct Queue {
    state: Mutex<QueueState>,
    idle: Condvar,
}

/// Handle to the result of a submitted kernel.
///
/// The value is available after a successful [`ComputeEngine::synchronize`].
pub struct Ticket<T> {
    slot: Arc<Mutex<Option<T>>>,
}

impl<T> Ticket<T> {
    /// Take the kernel's result. `None` if the kernel failed or has not run yet.
    pub fn take(self) -> Option<T> {
        self.slot.lock().take()
    }
}

/// Owns the device context of one rank.
pub struct ComputeEngine {
    rank: Rank,
    pool: ThreadPool,
    queue: Arc<Queue>,
    work_group_size: usize,
    metric: Metric,
}

impl ComputeEngine {
    /// Create the device of `rank`.
    pub fn new(rank: Rank, config: &ComputeConfig, metric: Metric) -> Result<Self> {
        config.validate()?;
        let pool = ThreadPoolBuilder::new()
            .num_threads(config.num_threads)
            .thread_name(move |i| format!("rank-{}-device-{}", rank, i))
            .build()
            .map_err(|e| LshError::compute(rank, vec![format!("device creation failed: {}", e)]))?;

        debug!(
            "[rank {}] device with {} compute units, work groups of {}",
            rank,
            pool.current_num_threads(),
            config.work_group_size
        );

        Ok(Self {
            rank,
            pool,
            queue: Arc::new(Queue::default()),
            work_group_size: config.work_group_size,
            metric,
        })
    }

    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Metric used by [`ComputeEngine::compute_distances_batch`].
    pub fn metric(&self) -> Metric {
        self.metric
    }

    pub fn work_group_size(&self) -> usize {
        self.work_group_size
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            name: format!("cpu-pool@rank{}", self.rank),
            compute_units: self.pool.current_num_threads(),
            work_group_size: self.work_group_size,
        }
    }

    /// Submit a kernel for asynchronous execution.
    ///
    /// Returned errors and panics are recorded and surface at the next
    /// [`ComputeEngine::synchronize`].
    pub fn submit<T, F>(&self, name: &'static str, kernel: F) -> Ticket<T>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T> + Send + 'static,
    {
        let slot = Arc::new(Mutex::new(None));
        let out = Arc::clone(&slot);
        let queue = Arc::clone(&self.queue);
        queue.state.lock().in_flight += 1;

        self.pool.spawn(move || {
            let failure = match panic::catch_unwind(AssertUnwindSafe(kernel)) {
                Ok(Ok(value)) => {
                    *out.lock() = Some(value);
                    None
                }
                Ok(Err(err)) => Some(format!("{}: {}", name, err)),
                Err(payload) => Some(format!("{} panicked: {}", name, panic_message(payload.as_ref()))),
            };

            let mut state = queue.state.lock();
            if let Some(failure) = failure {
                state.failures.push(failure);
            }
            state.in_flight -= 1;
            if state.in_flight == 0 {
                queue.idle.notify_all();
            }
        });

        Ticket { slot }
    }

    /// Wait for every kernel submitted since the previous synchronization.
    ///
    /// Each failure is logged, then all of them are returned as one
    /// `ComputeFailure`.
    pub fn synchronize(&self) -> Result<()> {
        let mut state = self.queue.state.lock();
        while state.in_flight > 0 {
            self.queue.idle.wait(&mut state);
        }
        let failures = std::mem::take(&mut state.failures);
        drop(state);

        if failures.is_empty() {
            return Ok(());
        }
        for failure in &failures {
            warn!("[rank {}] kernel failure: {}", self.rank, failure);
        }
        Err(LshError::compute(self.rank, failures))
    }

    /// Copy points `[start, end)` of `points` into one owned row-major buffer.
    fn stage<P: PointSource + ?Sized>(points: &P, start: usize, end: usize) -> Vec<f32> {
        let dims = points.dims();
        let mut buffer = vec![0.0f32; (end - start) * dims];
        for (row, index) in buffer.chunks_exact_mut(dims.max(1)).zip(start..end) {
            points.copy_point(index, &mut row[..dims]);
        }
        buffer
    }

    fn work_groups(&self, len: usize) -> impl Iterator<Item = (usize, usize)> {
        let size = self.work_group_size;
        (0..len).step_by(size).map(move |start| (start, (start + size).min(len)))
    }

    fn collect<T>(&self, tickets: Vec<Ticket<T>>) -> Result<Vec<T>> {
        self.synchronize()?;
        tickets
            .into_iter()
            .map(|ticket| {
                ticket
                    .take()
                    .ok_or_else(|| LshError::compute(self.rank, vec!["kernel result missing".into()]))
            })
            .collect()
    }

    /// Signatures of all `points`, in input order. One kernel per work group.
    pub fn compute_signatures_batch<P, H>(&self, points: &P, family: &Arc<H>) -> Result<Vec<Signature>>
    where
        P: PointSource + ?Sized,
        H: LshHash + 'static,
    {
        if !points.is_empty() && points.dims() != family.dims() {
            return Err(LshError::invalid_argument(format!(
                "points have {} dimensions, hash functions expect {}",
                points.dims(),
                family.dims()
            )));
        }

        let dims = points.dims();
        let tables = family.num_tables();
        let tickets: Vec<_> = self
            .work_groups(points.len())
            .map(|(start, end)| {
                let buffer = Self::stage(points, start, end);
                let family = Arc::clone(family);
                self.submit("compute_signatures", move || {
                    let count = end - start;
                    let mapper = PointTable::new(count, tables);
                    let mut hashes = vec![0u32; mapper.size()];
                    for point in 0..count {
                        let coords = &buffer[point * dims..(point + 1) * dims];
                        for table in 0..tables {
                            hashes[mapper.flatten((point, table))] = family.hash(table, coords);
                        }
                    }
                    Ok(hashes)
                })
            })
            .collect();

        let groups = self.collect(tickets)?;
        Ok(groups
            .into_iter()
            .flat_map(|hashes| {
                hashes
                    .chunks(tables.max(1))
                    .map(|row| Signature::new(row.to_vec()))
                    .collect::<Vec<_>>()
            })
            .collect())
    }

    /// Distances from `query` to every candidate, in input order.
    pub fn compute_distances_batch(&self, query: &[f32], candidates: &[Vec<f32>]) -> Result<Vec<f32>> {
        if let Some(bad) = candidates.iter().find(|c| c.len() != query.len()) {
            return Err(LshError::invalid_argument(format!(
                "candidate has {} dimensions, query has {}",
                bad.len(),
                query.len()
            )));
        }

        let query: Arc<Vec<f32>> = Arc::new(query.to_vec());
        let metric = self.metric;
        let tickets: Vec<_> = self
            .work_groups(candidates.len())
            .map(|(start, end)| {
                let group: Vec<Vec<f32>> = candidates[start..end].to_vec();
                let query = Arc::clone(&query);
                self.submit("compute_distances", move || {
                    Ok(group
                        .iter()
                        .map(|c| kernels::distance(metric, &query, c))
                        .collect::<Vec<f32>>())
                })
            })
            .collect();

        Ok(self.collect(tickets)?.into_iter().flatten().collect())
    }

    /// Projections of every point onto `num_vectors` row-major vectors.
    ///
    /// Returns one vector per projection, each holding all points in input order.
    pub fn compute_projections_batch<P>(
        &self,
        points: &P,
        vectors: &Arc<Vec<f32>>,
        num_vectors: usize,
    ) -> Result<Vec<Vec<f32>>>
    where
        P: PointSource + ?Sized,
    {
        let dims = points.dims();
        if vectors.len() != num_vectors * dims {
            return Err(LshError::invalid_argument(format!(
                "{} projection coefficients do not match {} vectors of {} dimensions",
                vectors.len(),
                num_vectors,
                dims
            )));
        }

        let tickets: Vec<_> = self
            .work_groups(points.len())
            .map(|(start, end)| {
                let buffer = Self::stage(points, start, end);
                let vectors = Arc::clone(vectors);
                self.submit("compute_projections", move || {
                    let count = end - start;
                    let mapper = PointTable::new(count, num_vectors);
                    let mut values = vec![0.0f32; mapper.size()];
                    for point in 0..count {
                        let coords = &buffer[point * dims..(point + 1) * dims];
                        for v in 0..num_vectors {
                            values[mapper.flatten((point, v))] =
                                kernels::dot(&vectors[v * dims..(v + 1) * dims], coords);
                        }
                    }
                    Ok(values)
                })
            })
            .collect();

        let mut projections = vec![Vec::with_capacity(points.len()); num_vectors];
        for group in self.collect(tickets)? {
            for row in group.chunks(num_vectors.max(1)) {
                for (v, value) in row.iter().enumerate() {
                    projections[v].push(*value);
                }
            }
        }
        Ok(projections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LshConfig;
    use crate::error::ErrorKind;
    use crate::hash_functions::RandomProjections;

    fn engine() -> ComputeEngine {
        let config = ComputeConfig::new().with_num_threads(2).with_work_group_size(4);
        ComputeEngine::new(0, &config, Metric::L2).unwrap()
    }

    #[test]
    fn test_submit_and_synchronize() {
        let engine = engine();
        let tickets: Vec<_> = (0..10).map(|i| engine.submit("square", move || Ok(i * i))).collect();
        engine.synchronize().unwrap();
        let values: Vec<i32> = tickets.into_iter().map(|t| t.take().unwrap()).collect();
        assert_eq!(values, (0..10).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    fn test_failures_are_aggregated() {
        let engine = engine();
        let _ok = engine.submit("fine", || Ok(1));
        let _err = engine.submit::<i32, _>("broken", || Err(LshError::invalid_argument("bad input")));
        let _panic = engine.submit::<i32, _>("exploding", || panic!("boom"));

        let err = engine.synchronize().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ComputeFailure);
        assert_eq!(err.failures().len(), 2);
        assert!(err.failures().iter().any(|f| f.contains("bad input")));
        assert!(err.failures().iter().any(|f| f.contains("boom")));

        // failures are reported once
        assert!(engine.synchronize().is_ok());
    }

    #[test]
    fn test_signatures_preserve_order() {
        let engine = engine();
        let config = LshConfig::new().with_num_hash_tables(3).with_seed(5);
        let family = Arc::new(RandomProjections::new(&config, 6).unwrap());
        let points: Vec<Vec<f32>> = (0..11).map(|i| vec![i as f32 * 0.3; 6]).collect();

        let signatures = engine.compute_signatures_batch(points.as_slice(), &family).unwrap();
        assert_eq!(signatures.len(), 11);
        for (point, signature) in points.iter().zip(&signatures) {
            assert_eq!(signature, &family.compute_signature(point).unwrap());
        }
    }

    #[test]
    fn test_signatures_dimension_mismatch() {
        let engine = engine();
        let family = Arc::new(RandomProjections::new(&LshConfig::default(), 4).unwrap());
        let points = vec![vec![0.0f32; 3]];
        let err = engine.compute_signatures_batch(points.as_slice(), &family).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_distances_batch() {
        let engine = engine();
        let query = vec![0.0f32, 0.0];
        let candidates: Vec<Vec<f32>> = (0..9).map(|i| vec![i as f32, 0.0]).collect();
        let distances = engine.compute_distances_batch(&query, &candidates).unwrap();
        assert_eq!(distances, (0..9).map(|i| i as f32).collect::<Vec<_>>());
        assert!(engine.compute_distances_batch(&query, &[vec![1.0]]).is_err());
    }

    #[test]
    fn test_projections_batch() {
        let engine = engine();
        let points: Vec<Vec<f32>> = (0..5).map(|i| vec![i as f32, 1.0]).collect();
        let vectors = Arc::new(vec![1.0, 0.0, 0.0, 2.0]);
        let projections = engine.compute_projections_batch(points.as_slice(), &vectors, 2).unwrap();
        assert_eq!(projections[0], vec![0.0, 1.0, 2.0, 3.0, 4.0]);
        assert_eq!(projections[1], vec![2.0; 5]);
    }

    #[test]
    fn test_device_info() {
        let info = engine().device_info();
        assert_eq!(info.compute_units, 2);
        assert_eq!(info.work_group_size, 4);
    }
}
