//! Parallel execution utilities.

use rayon::prelude::*;

/// Run a fallible `f` for every index in `0..n` in parallel and return the
/// results in index order, or the error of the lowest failing index.
pub fn try_parallel_range<U, E, F>(n: usize, f: F) -> Result<Vec<U>, E>
where
    U: Send,
    E: Send,
    F: Fn(usize) -> Result<U, E> + Sync + Send,
{
    let results: Vec<Result<U, E>> = (0..n).into_par_iter().map(f).collect();
    results.into_iter().collect()
}
