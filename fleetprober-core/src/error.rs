/// Errors produced while constructing or combining metric values.
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Two values of incompatible variants were combined
    #[error("can't combine {left} with {right}")]
    TypeMismatch {
        /// Variant name of the value being mutated
        left: &'static str,
        /// Variant name of the value being added
        right: &'static str,
    },
    /// A distribution bucket specification was invalid
    #[error("invalid distribution buckets: {0}")]
    InvalidBuckets(String),
    /// Distributions with different bucket layouts were combined
    #[error("distribution bucket layouts differ")]
    BucketMismatch,
    /// A sample was missing a metric the consumer requires
    #[error("missing metric {0} in event metrics")]
    MissingMetric(&'static str),
    /// Payload-metrics options don't form a usable parser
    #[error("invalid payload metrics config: {0}")]
    InvalidConfig(String),
}

/// Errors produced by validator configuration or execution.
#[derive(Debug, thiserror::Error)]
pub enum ValidatorError {
    /// A status-code specification could not be parsed
    #[error("invalid status code spec {0:?}")]
    InvalidStatusCodes(String),
    /// A validator regex failed to compile
    #[error("invalid regex: {0}")]
    BadRegex(#[from] regex::Error),
}

/// Errors produced by target providers.
#[derive(Debug, thiserror::Error)]
pub enum TargetError {
    /// The named target is not known to the provider
    #[error("unknown target {0}")]
    UnknownTarget(String),
    /// The target exists but carries no resolvable address
    #[error("no address for target {0}")]
    Unresolvable(String),
}
