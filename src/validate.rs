//! Validation of model output.
//!
//! The model is asked for JSON but nothing guarantees it complies. Output
//! that fails to parse or violates the schema is not an error for the
//! caller: it degrades to the "no risks found" default and the reason is
//! kept on the [`Outcome`] for logging and metrics.

use serde::Deserialize;

use crate::{AnalysisSummary, Span};

/// Result of validating model output. Both arms carry a usable value.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    Valid(T),
    Degraded { value: T, reason: String },
}

impl<T> Outcome<T> {
    pub fn into_value(self) -> T {
        match self {
            Outcome::Valid(v) => v,
            Outcome::Degraded { value, .. } => value,
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Outcome::Degraded { .. })
    }

    pub fn degrade_reason(&self) -> Option<&str> {
        match self {
            Outcome::Valid(_) => None,
            Outcome::Degraded { reason, .. } => Some(reason),
        }
    }
}

/// Summary and spans parsed from a full-analysis response.
#[derive(Debug, Clone, PartialEq, Default, Deserialize)]
pub struct AnalysisBody {
    pub summary: AnalysisSummary,
    #[serde(default)]
    pub spans: Vec<Span>,
}

fn parse_or_default<T>(text: &str) -> Outcome<T>
where
    T: for<'de> Deserialize<'de> + Default,
{
    match serde_json::from_str::<T>(text) {
        Ok(value) => Outcome::Valid(value),
        Err(err) => Outcome::Degraded {
            value: T::default(),
            reason: err.to_string(),
        },
    }
}

/// Parse a full-analysis response into summary plus spans.
pub fn parse_analysis(text: &str) -> Outcome<AnalysisBody> {
    parse_or_default(text)
}

/// Parse a summary-only response. Fails open the same way as
/// [`parse_analysis`].
pub fn parse_summary(text: &str) -> Outcome<AnalysisSummary> {
    parse_or_default(text)
}
