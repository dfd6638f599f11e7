//! Status-code range specs for HTTP-style validators.
//!
//! Specs are comma-separated codes or inclusive ranges, e.g.
//! `"302,200-299,403"`.

use std::fmt;

use crate::ValidatorError;

/// An ordered list of inclusive status-code ranges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusCodeRanges {
    ranges: Vec<(u16, u16)>,
}

impl StatusCodeRanges {
    /// Parse a spec such as `"302,200-299,403"`. Rejects non-numeric parts,
    /// inverted ranges and ranges with more than two ends.
    pub fn parse(spec: &str) -> Result<Self, ValidatorError> {
        let bad = || ValidatorError::InvalidStatusCodes(spec.to_string());

        let mut ranges = Vec::new();
        for part in spec.split(',') {
            let mut ends = part.trim().split('-');
            let lower: u16 = ends.next().ok_or_else(bad)?.parse().map_err(|_| bad())?;
            let upper = match ends.next() {
                Some(u) => u.parse().map_err(|_| bad())?,
                None => lower,
            };
            if ends.next().is_some() || lower > upper {
                return Err(bad());
            }
            ranges.push((lower, upper));
        }
        Ok(Self { ranges })
    }

    /// Whether `code` falls in any range.
    pub fn contains(&self, code: u16) -> bool {
        self.ranges.iter().any(|(lo, hi)| (*lo..=*hi).contains(&code))
    }

    /// Canonical form of the spec, round-tripping what [`parse`] accepted.
    ///
    /// [`parse`]: StatusCodeRanges::parse
    pub fn render(&self) -> String {
        self.ranges
            .iter()
            .map(|(lo, hi)| {
                if lo == hi {
                    lo.to_string()
                } else {
                    format!("{lo}-{hi}")
                }
            })
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl fmt::Display for StatusCodeRanges {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.render())
    }
}
