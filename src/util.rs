use std::ops::Range;

use itertools::Itertools;

/// Groups ascending block indices into maximal contiguous runs, splitting any
/// run longer than `max_len` blocks.
pub fn contiguous_runs(indices: impl IntoIterator<Item = u64>, max_len: u64) -> Vec<Range<u64>> {
  assert!(max_len > 0, "max run length must be non-zero");
  indices
    .into_iter()
    .map(|x| x..x + 1)
    .coalesce(|a, b| {
      if a.end == b.start && a.end - a.start < max_len {
        Ok(a.start..b.end)
      } else {
        Err((a, b))
      }
    })
    .collect()
}

pub fn now_millis() -> i64 {
  chrono::Utc::now().timestamp_millis()
}
