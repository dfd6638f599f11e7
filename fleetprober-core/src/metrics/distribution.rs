use std::fmt;

use crate::MetricsError;

/// A histogram with explicit bucket bounds.
///
/// `bounds` are the finite, strictly increasing upper bounds of the first
/// `bounds.len()` buckets; one extra overflow bucket catches everything at or
/// above the last bound. `counts` therefore always has `bounds.len() + 1`
/// entries.
#[derive(Debug, Clone, PartialEq)]
pub struct Distribution {
    bounds: Vec<f64>,
    counts: Vec<u64>,
    sum: f64,
    count: u64,
}

impl Distribution {
    /// New empty distribution over the given bucket bounds.
    pub fn new(bounds: Vec<f64>) -> Result<Self, MetricsError> {
        if bounds.is_empty() {
            return Err(MetricsError::InvalidBuckets("no bounds given".into()));
        }
        if bounds.windows(2).any(|w| w[0] >= w[1]) {
            return Err(MetricsError::InvalidBuckets(format!(
                "bounds not strictly increasing: {bounds:?}"
            )));
        }
        let counts = vec![0; bounds.len() + 1];
        Ok(Self {
            bounds,
            counts,
            sum: 0.0,
            count: 0,
        })
    }

    /// Parse a comma-separated bound spec such as `"1,2,4,8,16"`.
    pub fn from_spec(spec: &str) -> Result<Self, MetricsError> {
        let bounds = spec
            .split(',')
            .map(|part| {
                part.trim()
                    .parse::<f64>()
                    .map_err(|_| MetricsError::InvalidBuckets(format!("bad bound {part:?}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(bounds)
    }

    /// Record one observation.
    pub fn add_sample(&mut self, sample: f64) {
        let bucket = self
            .bounds
            .iter()
            .position(|b| sample < *b)
            .unwrap_or(self.bounds.len());
        self.counts[bucket] += 1;
        self.sum += sample;
        self.count += 1;
    }

    /// Merge another distribution with the same bucket layout.
    pub fn add(&mut self, other: &Distribution) -> Result<(), MetricsError> {
        if self.bounds != other.bounds {
            return Err(MetricsError::BucketMismatch);
        }
        for (c, o) in self.counts.iter_mut().zip(&other.counts) {
            *c += o;
        }
        self.sum += other.sum;
        self.count += other.count;
        Ok(())
    }

    /// Bucket upper bounds.
    pub fn bounds(&self) -> &[f64] {
        &self.bounds
    }

    /// Per-bucket counts, `bounds().len() + 1` entries.
    pub fn counts(&self) -> &[u64] {
        &self.counts
    }

    /// Sum of all observations.
    pub fn sum(&self) -> f64 {
        self.sum
    }

    /// Number of observations.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean of all observations, zero when empty.
    pub fn mean(&self) -> f64 {
        if self.count == 0 {
            0.0
        } else {
            self.sum / self.count as f64
        }
    }
}

impl fmt::Display for Distribution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "dist:sum:{}|count:{}|lb:", self.sum, self.count)?;
        let bounds: Vec<String> = self.bounds.iter().map(f64::to_string).collect();
        write!(f, "{}|counts:", bounds.join(","))?;
        let counts: Vec<String> = self.counts.iter().map(u64::to_string).collect();
        write!(f, "{}", counts.join(","))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn samples_land_in_the_right_buckets() {
        let mut d = Distribution::from_spec("1,2,4").unwrap();
        for sample in [0.5, 1.0, 1.5, 3.0, 4.0, 100.0] {
            d.add_sample(sample);
        }
        // buckets: (-inf,1) [1,2) [2,4) [4,inf)
        assert_eq!(d.counts(), &[1, 2, 1, 2]);
        assert_eq!(d.count(), 6);
        assert_eq!(d.sum(), 110.0);
    }

    #[test]
    fn bad_specs_rejected() {
        assert!(Distribution::from_spec("").is_err());
        assert!(Distribution::from_spec("1,zz").is_err());
        assert!(Distribution::from_spec("4,2").is_err());
        assert!(Distribution::from_spec("1,1").is_err());
    }

    #[test]
    fn merge_requires_same_layout() {
        let mut a = Distribution::from_spec("1,2").unwrap();
        let mut b = Distribution::from_spec("1,2").unwrap();
        a.add_sample(0.5);
        b.add_sample(1.5);
        a.add(&b).unwrap();
        assert_eq!(a.counts(), &[1, 1, 0]);

        let c = Distribution::from_spec("1,3").unwrap();
        assert!(a.add(&c).is_err());
    }
}
