//! Two-sample Mann–Whitney U comparisons between cohorts.

use std::f64::consts::SQRT_2;

use tracing::{info, warn};

use crate::cohort::CohortAssignment;
use crate::config::{CohortComparison, PipelineConfig};
use crate::error::{PipelineError, Result};
use crate::models::{Direction, FeatureTable, Outcome, RankTest, SignificanceResult, TestMethod};

/// Largest sample size for which the exact null distribution is used.
const EXACT_MAX_SAMPLE: usize = 8;
/// Upper bound on n1 * n2, the support of the exact distribution.
const EXACT_MAX_PAIRS: usize = 1_000_000;

/// Mid-ranks (1-based) of `values` and the sizes of tied groups.
pub(crate) fn midranks(values: &[f64]) -> (Vec<f64>, Vec<usize>) {
    let mut order: Vec<usize> = (0..values.len()).collect();
    order.sort_by(|&a, &b| values[a].total_cmp(&values[b]));

    let mut ranks = vec![0.0; values.len()];
    let mut ties = Vec::new();
    let mut i = 0;
    while i < order.len() {
        let mut j = i + 1;
        while j < order.len() && values[order[j]] == values[order[i]] {
            j += 1;
        }
        let rank = (i + j + 1) as f64 / 2.0;
        for &idx in &order[i..j] {
            ranks[idx] = rank;
        }
        if j - i > 1 {
            ties.push(j - i);
        }
        i = j;
    }
    (ranks, ties)
}

/// Frequencies of U = 0..=m*n under the null, i.e. the coefficients of the
/// Gaussian binomial [m+n choose m]_q. `None` when a count overflows.
fn u_frequencies(m: usize, n: usize) -> Option<Vec<i128>> {
    let (k, rest) = if m <= n { (m, n) } else { (n, m) };
    let mut poly: Vec<i128> = vec![1];
    for i in 1..=k {
        let shift = rest + i;
        let mut next = vec![0i128; poly.len() + shift];
        for (j, c) in poly.iter().enumerate() {
            next[j] = next[j].checked_add(*c)?;
            next[j + shift] = next[j + shift].checked_sub(*c)?;
        }
        for j in i..next.len() {
            next[j] = next[j].checked_add(next[j - i])?;
        }
        next.truncate(i * rest + 1);
        poly = next;
    }
    Some(poly)
}

fn checked_sum<'a>(mut counts: impl Iterator<Item = &'a i128>) -> Option<i128> {
    counts.try_fold(0i128, |acc, c| acc.checked_add(*c))
}

/// P(U >= u) under the exact null distribution, if it is representable.
fn exact_sf(u: f64, m: usize, n: usize) -> Option<f64> {
    let freqs = u_frequencies(m, n)?;
    let total = checked_sum(freqs.iter())?;
    let start = u.ceil().max(0.0) as usize;
    let upper = checked_sum(freqs.iter().skip(start))?;
    Some(upper as f64 / total as f64)
}

pub(crate) fn normal_sf(z: f64) -> f64 {
    0.5 * libm::erfc(z / SQRT_2)
}

/// Two-sided Mann–Whitney U test. The statistic is U for the first sample.
/// Returns `None` when either sample has fewer than two observations.
pub fn mann_whitney_u(first: &[f64], second: &[f64], alpha: f64) -> Option<RankTest> {
    let (n1, n2) = (first.len(), second.len());
    if n1 < 2 || n2 < 2 {
        return None;
    }

    let combined: Vec<f64> = first.iter().chain(second.iter()).copied().collect();
    let (ranks, ties) = midranks(&combined);
    let r1: f64 = ranks[..n1].iter().sum();
    let (m1, m2) = (n1 as f64, n2 as f64);
    let u1 = r1 - m1 * (m1 + 1.0) / 2.0;
    let u2 = m1 * m2 - u1;
    let u = u1.max(u2);
    let mu = m1 * m2 / 2.0;

    let direction = if u1 > mu {
        Direction::Higher
    } else if u1 < mu {
        Direction::Lower
    } else {
        Direction::Equal
    };

    let exact = if ties.is_empty()
        && (n1 <= EXACT_MAX_SAMPLE || n2 <= EXACT_MAX_SAMPLE)
        && n1 * n2 <= EXACT_MAX_PAIRS
    {
        exact_sf(u, n1, n2)
    } else {
        None
    };
    let (method, p_value) = if let Some(sf) = exact {
        (TestMethod::Exact, 2.0 * sf)
    } else {
        let n = m1 + m2;
        let tie_term: f64 = ties.iter().map(|&t| (t * t * t - t) as f64).sum();
        let variance = m1 * m2 / 12.0 * ((n + 1.0) - tie_term / (n * (n - 1.0)));
        if variance <= 0.0 {
            (TestMethod::Asymptotic, 1.0)
        } else {
            let z = (u - mu - 0.5) / variance.sqrt();
            (TestMethod::Asymptotic, 2.0 * normal_sf(z))
        }
    };
    let p_value = p_value.clamp(0.0, 1.0);

    Some(RankTest {
        statistic: u1,
        p_value,
        is_significant: p_value < alpha,
        direction,
        method,
    })
}

/// Runs the test for every metric between two cohorts of one labeling scheme.
///
/// Cohorts below the configured minimum size yield `NotComputable` rows for
/// every metric; unknown metric columns are fatal.
pub fn compare_cohorts(
    table: &FeatureTable,
    assignment: &CohortAssignment,
    comparison: &CohortComparison,
    config: &PipelineConfig,
) -> Result<Vec<SignificanceResult>> {
    let (first, second) = (comparison.first, comparison.second);
    let columns = config
        .metrics
        .iter()
        .map(|metric| table.column(metric).map(|c| (metric, c)))
        .collect::<Result<Vec<_>>>()?;

    let make = |metric: &str, n_a: usize, n_b: usize, test: Outcome<RankTest>| SignificanceResult {
        metric: metric.to_string(),
        scheme: assignment.scheme.clone(),
        cohort_a: first,
        cohort_b: second,
        n_a,
        n_b,
        test,
    };

    let (members_a, members_b) = match assignment.pair(first, second, config.min_cohort_size) {
        Ok(pair) => pair,
        Err(err @ PipelineError::InsufficientCohortSize { .. }) => {
            warn!(scheme = %assignment.scheme, "{err}; comparison skipped");
            let n_a = assignment.members(first).len();
            let n_b = assignment.members(second).len();
            return Ok(columns
                .iter()
                .map(|(metric, _)| make(metric, n_a, n_b, Outcome::NotComputable(err.to_string())))
                .collect());
        }
        Err(err) => return Err(err),
    };

    let mut results = Vec::with_capacity(columns.len());
    for (metric, column) in &columns {
        let a: Vec<f64> = members_a.iter().filter_map(|&i| column[i]).collect();
        let b: Vec<f64> = members_b.iter().filter_map(|&i| column[i]).collect();
        let test = match mann_whitney_u(&a, &b, config.alpha) {
            Some(test) => Outcome::Computed(test),
            None => Outcome::NotComputable(format!(
                "{metric}: fewer than 2 non-null observations ({} vs {})",
                a.len(),
                b.len()
            )),
        };
        results.push(make(metric, a.len(), b.len(), test));
    }

    let significant = results
        .iter()
        .filter(|r| matches!(&r.test, Outcome::Computed(t) if t.is_significant))
        .count();
    info!(
        scheme = %assignment.scheme,
        pair = %format!("{first} vs {second}"),
        metrics = results.len(),
        significant,
        "cohort comparison complete"
    );
    Ok(results)
}
