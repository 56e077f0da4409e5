use std::path::Path;

use carbond_whisper::{parse_retention_defs, Retention, WhisperError};
use regex::Regex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line {line}: expected `key = value`, got {text:?}")]
    BadLine { line: usize, text: String },

    #[error("section [{section}]: missing {field}")]
    MissingField { section: String, field: &'static str },

    #[error("section [{section}]: bad pattern: {source}")]
    BadPattern {
        section: String,
        source: regex::Error,
    },

    #[error("section [{section}]: bad retentions: {source}")]
    BadRetentions {
        section: String,
        source: WhisperError,
    },
}

/// One `[section]` of the storage schemas file.
#[derive(Debug)]
pub struct Schema {
    pub name: String,
    pub pattern: Regex,
    pub retention_str: String,
    pub retentions: Vec<Retention>,
}

/// The storage-schemas table: sections matched against metric names in
/// declaration order, first match wins, no default.
#[derive(Debug, Default)]
pub struct WhisperSchemas {
    schemas: Vec<Schema>,
}

impl WhisperSchemas {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SchemaError> {
        Self::parse(&std::fs::read_to_string(path)?)
    }

    pub fn parse(content: &str) -> Result<Self, SchemaError> {
        let mut schemas = Vec::new();

        for section in parse_sections(content)? {
            let pattern_src = section
                .get("pattern")
                .ok_or_else(|| SchemaError::MissingField {
                    section: section.name.clone(),
                    field: "pattern",
                })?;
            let pattern = Regex::new(pattern_src).map_err(|source| SchemaError::BadPattern {
                section: section.name.clone(),
                source,
            })?;

            let retention_str = section
                .get("retentions")
                .ok_or_else(|| SchemaError::MissingField {
                    section: section.name.clone(),
                    field: "retentions",
                })?
                .to_string();
            let retentions =
                parse_retention_defs(&retention_str).map_err(|source| SchemaError::BadRetentions {
                    section: section.name.clone(),
                    source,
                })?;

            schemas.push(Schema {
                name: section.name,
                pattern,
                retention_str,
                retentions,
            });
        }

        Ok(Self { schemas })
    }

    /// First section whose pattern matches, in declaration order.
    pub fn matches(&self, metric: &str) -> Option<&Schema> {
        self.schemas.iter().find(|s| s.pattern.is_match(metric))
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}

pub(crate) struct Section {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl Section {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Minimal reader for Graphite's INI-like section files. `#` and `;` start
/// comments; keys before any section header are an error.
pub(crate) fn parse_sections(content: &str) -> Result<Vec<Section>, SchemaError> {
    let mut sections: Vec<Section> = Vec::new();

    for (idx, raw) in content.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            sections.push(Section {
                name: name.trim().to_string(),
                entries: Vec::new(),
            });
            continue;
        }

        let (key, value) = line.split_once('=').ok_or_else(|| SchemaError::BadLine {
            line: idx + 1,
            text: raw.to_string(),
        })?;
        let section = sections.last_mut().ok_or_else(|| SchemaError::BadLine {
            line: idx + 1,
            text: raw.to_string(),
        })?;
        section
            .entries
            .push((key.trim().to_string(), value.trim().to_string()));
    }

    Ok(sections)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SCHEMAS: &str = r"
# storage schemas
[carbon]
pattern = ^carbon\.
retentions = 60:90d

[high]
pattern = ^servers\.
retentions = 10s:6h,1m:30d

[default]
pattern = .*
retentions = 60s:1d
";

    #[test]
    fn parses_and_matches_in_declaration_order() {
        let schemas = WhisperSchemas::parse(SCHEMAS).unwrap();

        let m = schemas.matches("carbon.agents.host.cache.size").unwrap();
        assert_eq!(m.name, "carbon");
        assert_eq!(m.retentions, vec![Retention::new(60, 129600)]);

        let m = schemas.matches("servers.web01.cpu").unwrap();
        assert_eq!(m.name, "high");
        assert_eq!(m.retentions.len(), 2);

        // `.*` in [default] would match carbon metrics too; declaration
        // order decides.
        let m = schemas.matches("anything.else").unwrap();
        assert_eq!(m.name, "default");
    }

    #[test]
    fn no_match_without_catch_all() {
        let schemas = WhisperSchemas::parse("[only]\npattern = ^x\\.\nretentions = 60:100\n").unwrap();
        assert!(schemas.matches("y.z").is_none());
    }

    #[test]
    fn missing_fields_are_rejected() {
        assert!(matches!(
            WhisperSchemas::parse("[a]\nretentions = 60:100\n"),
            Err(SchemaError::MissingField { field: "pattern", .. })
        ));
        assert!(matches!(
            WhisperSchemas::parse("[a]\npattern = .*\n"),
            Err(SchemaError::MissingField { field: "retentions", .. })
        ));
    }

    #[test]
    fn bad_syntax_is_rejected() {
        assert!(matches!(
            WhisperSchemas::parse("pattern = .*\n"),
            Err(SchemaError::BadLine { line: 1, .. })
        ));
        assert!(matches!(
            WhisperSchemas::parse("[a]\nnonsense line\n"),
            Err(SchemaError::BadLine { line: 2, .. })
        ));
        assert!(matches!(
            WhisperSchemas::parse("[a]\npattern = [unclosed\nretentions = 60:100\n"),
            Err(SchemaError::BadPattern { .. })
        ));
        assert!(matches!(
            WhisperSchemas::parse("[a]\npattern = .*\nretentions = bogus\n"),
            Err(SchemaError::BadRetentions { .. })
        ));
    }
}
