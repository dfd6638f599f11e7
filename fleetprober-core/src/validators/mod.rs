//! Validators run a probe's response payload through configured checks.
//!
//! A validator failure flips an otherwise successful probe result to failure
//! and increments the per-validator failure counter that probes export as a
//! map-valued metric.

use std::fmt::Debug;
use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::metrics::MapValue;
use crate::ValidatorError;

pub mod http;

/// A payload check with a stable name.
pub trait Validator: Send + Sync + Debug {
    /// Name used in the `validation_failure` map.
    fn name(&self) -> &str;

    /// Whether the payload passes this check.
    fn validate(&self, payload: &[u8]) -> Result<bool, ValidatorError>;
}

/// Validates that the payload matches a regex.
#[derive(Debug)]
pub struct RegexValidator {
    name: String,
    re: Regex,
}

impl RegexValidator {
    /// Compile a regex validator. Fails on an invalid pattern.
    pub fn new(name: impl Into<String>, pattern: &str) -> Result<Self, ValidatorError> {
        Ok(Self {
            name: name.into(),
            re: Regex::new(pattern)?,
        })
    }
}

impl Validator for RegexValidator {
    fn name(&self) -> &str {
        &self.name
    }

    fn validate(&self, payload: &[u8]) -> Result<bool, ValidatorError> {
        Ok(self.re.is_match(&String::from_utf8_lossy(payload)))
    }
}

/// Zero-valued failure map with one key per validator. Probes attach this to
/// their per-target results so every validator shows up in exported metrics
/// even before its first failure.
pub fn validation_failure_map(validators: &[Arc<dyn Validator>]) -> MapValue {
    let mut map = MapValue::new("validator");
    for v in validators {
        map.ensure_key(v.name());
    }
    map
}

/// Run every validator against `payload`, incrementing `failure_map` for each
/// failure. Returns the names of the validators that failed. A validator
/// error counts as a failure.
pub fn run_validators(
    validators: &[Arc<dyn Validator>],
    payload: &[u8],
    failure_map: &mut MapValue,
) -> Vec<String> {
    let mut failed = Vec::new();
    for v in validators {
        let ok = match v.validate(payload) {
            Ok(ok) => ok,
            Err(err) => {
                warn!(validator = v.name(), %err, "validator error");
                false
            }
        };
        if !ok {
            failure_map.inc_key_by(v.name(), 1);
            failed.push(v.name().to_string());
        }
    }
    failed
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn regex_validator_matches_payload() {
        let v = RegexValidator::new("has-ok", "(?m)^OK$").unwrap();
        assert!(v.validate(b"status\nOK\n").unwrap());
        assert!(!v.validate(b"status\nfail\n").unwrap());
        assert!(RegexValidator::new("bad", "[unclosed").is_err());
    }

    #[test]
    fn failures_are_counted_per_validator() {
        let validators: Vec<Arc<dyn Validator>> = vec![
            Arc::new(RegexValidator::new("a", "alpha").unwrap()),
            Arc::new(RegexValidator::new("b", "beta").unwrap()),
        ];
        let mut failures = validation_failure_map(&validators);
        assert_eq!(failures.get("a"), 0);
        assert_eq!(failures.get("b"), 0);

        let failed = run_validators(&validators, b"alpha only", &mut failures);
        assert_eq!(failed, vec!["b".to_string()]);
        assert_eq!(failures.get("a"), 0);
        assert_eq!(failures.get("b"), 1);
    }
}
