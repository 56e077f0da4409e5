use std::path::Path;

use carbond_whisper::AggregationMethod;
use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

use crate::schemas::{parse_sections, SchemaError};

#[derive(Debug, Error)]
pub enum AggregationError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Syntax(#[from] SchemaError),

    #[error("section [{section}]: bad pattern: {source}")]
    BadPattern {
        section: String,
        source: regex::Error,
    },

    #[error("section [{section}]: unknown aggregation method {method:?}")]
    UnknownMethod { section: String, method: String },

    #[error("section [{section}]: xFilesFactor {value:?} not in [0,1]")]
    BadXFilesFactor { section: String, value: String },
}

/// One roll-up policy from the storage aggregation file.
#[derive(Debug)]
pub struct AggregationPolicy {
    pub name: String,
    pattern: Option<Regex>,
    pub x_files_factor: f32,
    pub method: AggregationMethod,
}

static DEFAULT_POLICY: Lazy<AggregationPolicy> = Lazy::new(|| AggregationPolicy {
    name: "default".to_string(),
    pattern: None,
    x_files_factor: 0.5,
    method: AggregationMethod::Average,
});

/// The storage-aggregation table. Unlike schemas, a miss falls back to the
/// Graphite default of `(average, 0.5)`.
#[derive(Debug, Default)]
pub struct WhisperAggregation {
    policies: Vec<AggregationPolicy>,
}

impl WhisperAggregation {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, AggregationError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self, AggregationError> {
        let mut policies = Vec::new();

        for section in parse_sections(content)? {
            let pattern = match section.get("pattern") {
                Some(src) => {
                    Some(Regex::new(src).map_err(|source| AggregationError::BadPattern {
                        section: section.name.clone(),
                        source,
                    })?)
                }
                None => None,
            };

            let x_files_factor = match section.get("xFilesFactor") {
                Some(raw) => {
                    let value: f32 =
                        raw.parse()
                            .map_err(|_| AggregationError::BadXFilesFactor {
                                section: section.name.clone(),
                                value: raw.to_string(),
                            })?;
                    if !(0.0..=1.0).contains(&value) {
                        return Err(AggregationError::BadXFilesFactor {
                            section: section.name.clone(),
                            value: raw.to_string(),
                        });
                    }
                    value
                }
                None => DEFAULT_POLICY.x_files_factor,
            };

            let method = match section.get("aggregationMethod") {
                Some(name) => AggregationMethod::from_name(name).ok_or_else(|| {
                    AggregationError::UnknownMethod {
                        section: section.name.clone(),
                        method: name.to_string(),
                    }
                })?,
                None => DEFAULT_POLICY.method,
            };

            policies.push(AggregationPolicy {
                name: section.name,
                pattern,
                x_files_factor,
                method,
            });
        }

        Ok(Self { policies })
    }

    /// First matching policy, or the built-in default.
    pub fn matches(&self, metric: &str) -> &AggregationPolicy {
        self.policies
            .iter()
            .find(|p| p.pattern.as_ref().is_some_and(|re| re.is_match(metric)))
            .unwrap_or(&DEFAULT_POLICY)
    }
}
