use thiserror::Error;

/// Failures raised by the pipeline components.
///
/// `DataQuality`, `InsufficientCohortSize`, `InsufficientRows` and
/// `NonConvergentFit` are local to a single row, comparison, model or estimate
/// and are degraded by the caller into per-item results. The remaining
/// variants abort the run.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("data quality issue at line {line}: {reason}")]
    DataQuality { line: usize, reason: String },

    #[error("cohort {scheme}/{label} has {found} observations, at least {required} required")]
    InsufficientCohortSize {
        scheme: String,
        label: String,
        found: usize,
        required: usize,
    },

    #[error("{model}: {found} complete rows, at least {required} required")]
    InsufficientRows {
        model: String,
        found: usize,
        required: usize,
    },

    #[error("logistic fit did not converge: {reason}")]
    NonConvergentFit { reason: String },

    #[error("schema mismatch in {source_name}: {detail}")]
    SchemaMismatch { source_name: String, detail: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    pub fn schema(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::SchemaMismatch {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }

    pub fn non_convergent(reason: impl Into<String>) -> Self {
        Self::NonConvergentFit {
            reason: reason.into(),
        }
    }

    /// True for failures that must abort the whole run.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::SchemaMismatch { .. }
                | Self::Config(_)
                | Self::Toml(_)
                | Self::Csv(_)
                | Self::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn local_failures_are_not_fatal() {
        let cohort = PipelineError::InsufficientCohortSize {
            scheme: "stability".into(),
            label: "Unstable".into(),
            found: 2,
            required: 5,
        };
        assert!(!cohort.is_fatal());
        assert!(!PipelineError::non_convergent("separation").is_fatal());
        assert!(PipelineError::schema("events.csv", "missing teacher_id").is_fatal());
    }

    #[test]
    fn messages_name_the_cohort() {
        let err = PipelineError::InsufficientCohortSize {
            scheme: "year_rank".into(),
            label: "BestOfYear".into(),
            found: 3,
            required: 5,
        };
        assert_eq!(
            err.to_string(),
            "cohort year_rank/BestOfYear has 3 observations, at least 5 required"
        );
    }
}
