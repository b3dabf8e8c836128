use crate::types::SourceId;

/// Aggregate skew metrics for per-source selection counts.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceSkew {
    pub total: u64,
    pub sources: usize,
    pub min: u64,
    pub max: u64,
    pub mean: f64,
    pub max_share: f64,
    pub min_share: f64,
    pub ratio: f64,
    /// Largest absolute gap between an observed and an expected share.
    pub max_deviation: Option<f64>,
    pub per_source: Vec<SourceShare>,
}

/// Observed share of one source, next to its configured weight.
#[derive(Clone, Debug, PartialEq)]
pub struct SourceShare {
    pub source: SourceId,
    pub count: u64,
    pub share: f64,
    pub expected: Option<f64>,
}

/// Compute skew metrics from `(source, count)` pairs in source order.
///
/// `expected` holds the target share of each source, in the same order.
/// Returns `None` for an empty session or mismatched lengths.
pub fn source_skew(counts: &[(SourceId, u64)], expected: Option<&[f64]>) -> Option<SourceSkew> {
    if counts.is_empty() || expected.is_some_and(|weights| weights.len() != counts.len()) {
        return None;
    }
    let total: u64 = counts.iter().map(|(_, count)| count).sum();
    let sources = counts.len();
    let min = counts.iter().map(|(_, count)| *count).min()?;
    let max = counts.iter().map(|(_, count)| *count).max()?;
    let share_of = |count: u64| {
        if total == 0 {
            0.0
        } else {
            count as f64 / total as f64
        }
    };
    let ratio = if min == 0 {
        f64::INFINITY
    } else {
        max as f64 / min as f64
    };
    let mut per_source: Vec<SourceShare> = counts
        .iter()
        .enumerate()
        .map(|(idx, (source, count))| SourceShare {
            source: source.clone(),
            count: *count,
            share: share_of(*count),
            expected: expected.map(|weights| weights[idx]),
        })
        .collect();
    let max_deviation = expected.map(|_| {
        per_source
            .iter()
            .filter_map(|entry| entry.expected.map(|want| (entry.share - want).abs()))
            .fold(0.0, f64::max)
    });
    per_source.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.source.cmp(&b.source)));
    Some(SourceSkew {
        total,
        sources,
        min,
        max,
        mean: total as f64 / sources as f64,
        max_share: share_of(max),
        min_share: share_of(min),
        ratio,
        max_deviation,
        per_source,
    })
}
