//! Core data models used throughout tender-watch.
//!
//! These types describe the regulatory regimes, search modes, and the
//! notice records that flow from the result collector through the dedup
//! reconciler into the output files.

use serde::Deserialize;
use std::fmt;
use std::str::FromStr;

/// Statutory procurement track a notice belongs to.
///
/// The regime decides how identifiers are validated, which table the
/// reconciler queries, and what an output line looks like.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
pub enum Regime {
    /// Track 44: bare 19-digit notice identifiers.
    #[serde(rename = "44")]
    #[value(name = "44")]
    A,
    /// Track 223: 11-digit notification numbers plus registry detail ids.
    #[serde(rename = "223")]
    #[value(name = "223")]
    B,
}

impl Regime {
    /// Short code used in task names, logs and table names.
    pub fn code(&self) -> &'static str {
        match self {
            Regime::A => "44",
            Regime::B => "223",
        }
    }

    /// Table holding the notices already ingested for this regime.
    pub fn table(&self) -> &'static str {
        match self {
            Regime::A => "notifications44",
            Regime::B => "notifications223",
        }
    }

    /// Whether `number` is a well-formed notification number for this regime.
    pub fn accepts(&self, number: &str) -> bool {
        let digits = !number.is_empty() && number.bytes().all(|b| b.is_ascii_digit());
        match self {
            Regime::A => digits && number.len() == 19,
            Regime::B => digits && number.len() == 11 && number.starts_with('3'),
        }
    }
}

impl fmt::Display for Regime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

impl FromStr for Regime {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "44" => Ok(Regime::A),
            "223" => Ok(Regime::B),
            other => anyhow::bail!("Unknown regime: '{}'. Must be 44 or 223.", other),
        }
    }
}

/// What kind of criteria a task's input file holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    /// Free-text keyword phrases.
    Keywords,
    /// Hierarchical classification codes.
    Codes,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Keywords => f.write_str("keywords"),
            SearchMode::Codes => f.write_str("codes"),
        }
    }
}

/// How multiple keyword phrases combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum MatchPolicy {
    /// Every phrase must match.
    All,
    /// At least one phrase matches.
    #[default]
    Any,
}

/// A discovered notice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectedRecord {
    /// Regime A notice.
    Identifier(String),
    /// Regime B notice with registry details, which may be empty when the
    /// detail page could not be resolved.
    Detailed {
        number: String,
        notice_info_id: String,
        platform_file_id: String,
    },
}

impl CollectedRecord {
    /// Identity used by the reconciler.
    pub fn key(&self) -> &str {
        match self {
            CollectedRecord::Identifier(id) => id,
            CollectedRecord::Detailed { number, .. } => number,
        }
    }

    /// Line written to the output file.
    pub fn to_line(&self) -> String {
        match self {
            CollectedRecord::Identifier(id) => id.clone(),
            CollectedRecord::Detailed {
                number,
                notice_info_id,
                platform_file_id,
            } => [number, notice_info_id, platform_file_id]
                .iter()
                .filter(|field| !field.is_empty())
                .map(|field| field.as_str())
                .collect::<Vec<_>>()
                .join(";"),
        }
    }

    /// Parse a line in output format back into a record.
    pub fn from_line(line: &str, regime: Regime) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        match regime {
            Regime::A => Some(CollectedRecord::Identifier(line.to_string())),
            Regime::B => {
                let mut fields = line.split(';').map(str::trim);
                let number = fields.next()?.to_string();
                Some(CollectedRecord::Detailed {
                    number,
                    notice_info_id: fields.next().unwrap_or_default().to_string(),
                    platform_file_id: fields.next().unwrap_or_default().to_string(),
                })
            }
        }
    }
}

/// Drop records whose key is malformed for `regime`.
pub fn retain_valid(records: Vec<CollectedRecord>, regime: Regime) -> Vec<CollectedRecord> {
    records
        .into_iter()
        .filter(|record| {
            let ok = regime.accepts(record.key());
            if !ok {
                tracing::debug!(regime = %regime, key = record.key(), "dropping malformed record");
            }
            ok
        })
        .collect()
}
