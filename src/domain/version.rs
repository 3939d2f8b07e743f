// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Service version strings and version range expressions.
//
// A version is 1 to 3 dot-separated non-negative integers ("2", "2.1",
// "2.1.4"); missing components compare as zero. A range is either a bare
// version, which means "that version or anything newer", or an explicit
// interval such as "[1.2.0,4.5)" with the usual inclusive/exclusive
// bracket notation and INFINITY allowed as the upper bound.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum VersionError {
    #[error("invalid version string: {0}")]
    InvalidVersion(String),
    #[error("invalid version range expression: {0}")]
    InvalidRange(String),
}

/// A parsed version. Ordering is componentwise with missing parts as zero,
/// so `1.2` == `1.2.0` and `1.10` > `1.9.5`.
#[derive(Debug, Clone, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Version {
    parts: Vec<u64>,
    text: String,
}

impl Version {
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        if !is_version_string(s) {
            return Err(VersionError::InvalidVersion(s.to_string()));
        }
        let parts = s
            .split('.')
            .map(|p| p.parse::<u64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| VersionError::InvalidVersion(s.to_string()))?;
        Ok(Self {
            parts,
            text: s.to_string(),
        })
    }

    fn part(&self, i: usize) -> u64 {
        self.parts.get(i).copied().unwrap_or(0)
    }
}

impl PartialEq for Version {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        for i in 0..3 {
            match self.part(i).cmp(&other.part(i)) {
                Ordering::Equal => continue,
                non_eq => return non_eq,
            }
        }
        Ordering::Equal
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl TryFrom<String> for Version {
    type Error = VersionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        Version::parse(&s)
    }
}

impl From<Version> for String {
    fn from(v: Version) -> Self {
        v.text
    }
}

/// True when `s` is a well-formed version string.
pub fn is_version_string(s: &str) -> bool {
    if s.is_empty() {
        return false;
    }
    let parts: Vec<&str> = s.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return false;
    }
    parts
        .iter()
        .all(|p| !p.is_empty() && p.chars().all(|c| c.is_ascii_digit()))
}

/// A half-open, closed, or unbounded version interval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VersionRange {
    start: Version,
    start_inclusive: bool,
    /// None is INFINITY.
    end: Option<Version>,
    end_inclusive: bool,
    text: String,
}

const INFINITY: &str = "INFINITY";

impl VersionRange {
    /// The range containing every version.
    pub fn all() -> Self {
        Self::parse("[0.0.0,INFINITY)").expect("constant range parses")
    }

    pub fn parse(expr: &str) -> Result<Self, VersionError> {
        let trimmed: String = expr.chars().filter(|c| !c.is_whitespace()).collect();
        if trimmed.is_empty() {
            return Err(VersionError::InvalidRange(expr.to_string()));
        }

        // A bare version means "this or newer".
        if is_version_string(&trimmed) {
            let start = Version::parse(&trimmed)?;
            return Ok(Self {
                start,
                start_inclusive: true,
                end: None,
                end_inclusive: false,
                text: trimmed,
            });
        }

        let start_inclusive = match trimmed.chars().next() {
            Some('[') => true,
            Some('(') => false,
            _ => return Err(VersionError::InvalidRange(expr.to_string())),
        };
        let end_inclusive = match trimmed.chars().last() {
            Some(']') => true,
            Some(')') => false,
            _ => return Err(VersionError::InvalidRange(expr.to_string())),
        };

        let inner = &trimmed[1..trimmed.len() - 1];
        let (lo, hi) = inner
            .split_once(',')
            .ok_or_else(|| VersionError::InvalidRange(expr.to_string()))?;

        let start = Version::parse(lo)?;
        let end = if hi.eq_ignore_ascii_case(INFINITY) {
            None
        } else {
            Some(Version::parse(hi)?)
        };

        Ok(Self {
            start,
            start_inclusive,
            end,
            end_inclusive,
            text: trimmed,
        })
    }

    pub fn includes(&self, v: &Version) -> bool {
        let lower_ok = match v.cmp(&self.start) {
            Ordering::Greater => true,
            Ordering::Equal => self.start_inclusive,
            Ordering::Less => false,
        };
        if !lower_ok {
            return false;
        }
        match &self.end {
            None => true,
            Some(end) => match v.cmp(end) {
                Ordering::Less => true,
                Ordering::Equal => self.end_inclusive,
                Ordering::Greater => false,
            },
        }
    }

    pub fn includes_str(&self, version: &str) -> Result<bool, VersionError> {
        Ok(self.includes(&Version::parse(version)?))
    }
}

impl fmt::Display for VersionRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.text)
    }
}

impl TryFrom<String> for VersionRange {
    type Error = VersionError;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        VersionRange::parse(&s)
    }
}

impl From<VersionRange> for String {
    fn from(r: VersionRange) -> Self {
        r.text
    }
}
