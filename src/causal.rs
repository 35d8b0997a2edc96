//! Treatment-effect estimation with a maximum-likelihood logistic regression.

use nalgebra::{Cholesky, DMatrix, DVector, Dyn};
use ndarray::{Array1, Array2, Axis};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cohort::{mean, median};
use crate::error::{PipelineError, Result};
use crate::models::{CausalEstimate, FeatureTable, FitSummary, Outcome};
use crate::significance::normal_sf;

const MAX_ITERATIONS: usize = 35;
const TOLERANCE: f64 = 1e-8;

/// Turns a numeric column into a 0/1 indicator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum IndicatorRule {
    Positive,
    AtLeast { threshold: f64 },
    Above { threshold: f64 },
    AboveMean,
    AboveMedian,
    BelowMedian,
}

impl IndicatorRule {
    /// Column-level statistics are taken over every non-null cell.
    pub fn apply(&self, values: &[Option<f64>]) -> Vec<Option<f64>> {
        let present: Vec<f64> = values.iter().flatten().copied().collect();
        let cut = match self {
            Self::AboveMean => mean(&present),
            Self::AboveMedian | Self::BelowMedian => median(&present),
            _ => None,
        };
        let hit = |v: f64| -> bool {
            match self {
                Self::Positive => v > 0.0,
                Self::AtLeast { threshold } => v >= *threshold,
                Self::Above { threshold } => v > *threshold,
                Self::AboveMean | Self::AboveMedian => cut.is_some_and(|c| v > c),
                Self::BelowMedian => cut.is_some_and(|c| v < c),
            }
        };
        values
            .iter()
            .map(|cell| cell.map(|v| if hit(v) { 1.0 } else { 0.0 }))
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Indicator {
    pub column: String,
    #[serde(flatten)]
    pub rule: IndicatorRule,
}

impl Indicator {
    pub fn new(column: impl Into<String>, rule: IndicatorRule) -> Self {
        Self {
            column: column.into(),
            rule,
        }
    }

    pub fn values(&self, table: &FeatureTable) -> Result<Vec<Option<f64>>> {
        Ok(self.rule.apply(&table.column(&self.column)?))
    }
}

/// One causal question: does `treatment` change the odds of `outcome`?
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CausalSpec {
    pub name: String,
    pub treatment: Indicator,
    pub outcome: Indicator,
    #[serde(default)]
    pub covariates: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CausalReport {
    pub name: String,
    pub treatment: String,
    pub outcome: String,
    pub result: Outcome<CausalEstimate>,
}

#[derive(Debug, Clone)]
pub struct LogitFit {
    pub coefficients: Array1<f64>,
    pub covariance: Array2<f64>,
    pub log_likelihood: f64,
    pub null_log_likelihood: f64,
    pub iterations: usize,
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

fn log_likelihood(y: &Array1<f64>, p: &Array1<f64>) -> f64 {
    y.iter()
        .zip(p.iter())
        .map(|(&yi, &pi)| {
            let pi = pi.clamp(f64::MIN_POSITIVE, 1.0 - f64::EPSILON);
            yi * pi.ln() + (1.0 - yi) * (1.0 - pi).ln()
        })
        .sum()
}

/// Cholesky factor of the information matrix X'WX at `p`.
fn information(x: &Array2<f64>, p: &Array1<f64>) -> Result<Cholesky<f64, Dyn>> {
    let weights = p.mapv(|pi| pi * (1.0 - pi));
    let weighted = x * &weights.insert_axis(Axis(1));
    let xtwx = x.t().dot(&weighted);
    let k = xtwx.nrows();
    Cholesky::new(DMatrix::from_fn(k, k, |i, j| xtwx[[i, j]]))
        .ok_or_else(|| PipelineError::non_convergent("information matrix is not positive definite"))
}

/// Newton–Raphson maximum likelihood for a binary logit. `x` must already
/// contain the intercept column.
pub fn fit_logit(x: &Array2<f64>, y: &Array1<f64>) -> Result<LogitFit> {
    let (n, k) = x.dim();
    if n <= k {
        return Err(PipelineError::non_convergent(format!(
            "{n} observations for {k} parameters"
        )));
    }
    let positives = y.sum();
    if positives == 0.0 || positives == n as f64 {
        return Err(PipelineError::non_convergent("outcome has a single class"));
    }

    let mut beta = Array1::<f64>::zeros(k);
    let mut converged = false;
    let mut iterations = 0;

    while iterations < MAX_ITERATIONS {
        iterations += 1;
        let p = x.dot(&beta).mapv(sigmoid);
        let gradient = x.t().dot(&(y - &p));
        let step = information(x, &p)?.solve(&DVector::from_iterator(k, gradient.iter().copied()));
        beta += &Array1::from_iter(step.iter().copied());

        if beta.iter().any(|b| !b.is_finite()) {
            return Err(PipelineError::non_convergent("coefficients diverged"));
        }
        if step.amax() < TOLERANCE {
            converged = true;
            break;
        }
    }
    if !converged {
        return Err(PipelineError::non_convergent(format!(
            "no convergence after {MAX_ITERATIONS} iterations"
        )));
    }

    let p = x.dot(&beta).mapv(sigmoid);
    let separated = p
        .iter()
        .zip(y.iter())
        .all(|(pi, yi)| (pi - yi).abs() < 1e-8);
    if separated {
        return Err(PipelineError::non_convergent("perfect separation"));
    }
    // covariance at the final estimate
    let inverse = information(x, &p)?.inverse();
    let covariance = Array2::from_shape_fn((k, k), |(i, j)| inverse[(i, j)]);

    let ybar = positives / n as f64;
    let null_log_likelihood = n as f64 * (ybar * ybar.ln() + (1.0 - ybar) * (1.0 - ybar).ln());

    Ok(LogitFit {
        log_likelihood: log_likelihood(y, &p),
        coefficients: beta,
        covariance,
        null_log_likelihood,
        iterations,
    })
}

/// Fits `outcome ~ 1 + treatment + covariates` and reads the treatment effect
/// off the fitted model.
pub fn estimate(table: &FeatureTable, spec: &CausalSpec) -> Result<CausalEstimate> {
    let treatment = spec.treatment.values(table)?;
    let outcome = spec.outcome.values(table)?;
    let covariates = spec
        .covariates
        .iter()
        .map(|name| table.column(name))
        .collect::<Result<Vec<_>>>()?;

    let complete: Vec<usize> = (0..table.len())
        .filter(|&i| {
            treatment[i].is_some()
                && outcome[i].is_some()
                && covariates.iter().all(|c| c[i].is_some())
        })
        .collect();
    let dropped = table.len() - complete.len();
    if dropped > 0 {
        debug!(
            spec = %spec.name,
            dropped,
            "rows with null treatment, outcome or covariate dropped"
        );
    }

    let k = 2 + covariates.len();
    let mut x = Array2::<f64>::zeros((complete.len(), k));
    let mut y = Array1::<f64>::zeros(complete.len());
    for (r, &i) in complete.iter().enumerate() {
        x[[r, 0]] = 1.0;
        x[[r, 1]] = treatment[i].unwrap_or_default();
        for (c, column) in covariates.iter().enumerate() {
            x[[r, 2 + c]] = column[i].unwrap_or_default();
        }
        y[r] = outcome[i].unwrap_or_default();
    }

    let treated = x.column(1).sum();
    if treated == 0.0 || treated == complete.len() as f64 {
        return Err(PipelineError::non_convergent("treatment has a single class"));
    }

    let fit = fit_logit(&x, &y)?;
    let beta = &fit.coefficients;
    let ate = beta[1];
    if !ate.is_finite() {
        return Err(PipelineError::non_convergent("treatment coefficient is not finite"));
    }

    let covariate_means: Vec<f64> = (2..k).map(|c| x.column(c).mean().unwrap_or(0.0)).collect();
    let adjustment: f64 = covariate_means
        .iter()
        .zip(beta.iter().skip(2))
        .map(|(m, b)| m * b)
        .sum();
    let baseline_probability = sigmoid(beta[0] + adjustment);
    let treated_probability = sigmoid(beta[0] + ate + adjustment);

    let std_err = fit.covariance[[1, 1]].max(0.0).sqrt();
    let z = ate / std_err;
    let summary = FitSummary {
        observations: complete.len(),
        iterations: fit.iterations,
        log_likelihood: fit.log_likelihood,
        null_log_likelihood: fit.null_log_likelihood,
        pseudo_r2: 1.0 - fit.log_likelihood / fit.null_log_likelihood,
        treatment_std_err: std_err,
        treatment_z: z,
        treatment_p_value: 2.0 * normal_sf(z.abs()),
    };

    Ok(CausalEstimate {
        treatment_name: spec.treatment.column.clone(),
        outcome_name: spec.outcome.column.clone(),
        ate,
        odds_ratio: ate.exp(),
        baseline_probability,
        treated_probability,
        absolute_probability_delta: treated_probability - baseline_probability,
        fit: summary,
    })
}

/// Estimates every configured question. A non-convergent fit fails only its
/// own question; schema problems abort.
pub fn estimate_all(table: &FeatureTable, specs: &[CausalSpec]) -> Result<Vec<CausalReport>> {
    let mut reports = Vec::with_capacity(specs.len());
    for spec in specs {
        let result = match estimate(table, spec) {
            Ok(estimate) => {
                info!(
                    spec = %spec.name,
                    ate = estimate.ate,
                    odds_ratio = estimate.odds_ratio,
                    delta = estimate.absolute_probability_delta,
                    "causal estimate"
                );
                Outcome::Computed(estimate)
            }
            Err(err @ PipelineError::NonConvergentFit { .. }) => {
                warn!(spec = %spec.name, "{err}");
                Outcome::NotComputable(err.to_string())
            }
            Err(err) => return Err(err),
        };
        reports.push(CausalReport {
            name: spec.name.clone(),
            treatment: spec.treatment.column.clone(),
            outcome: spec.outcome.column.clone(),
            result,
        });
    }
    Ok(reports)
}
