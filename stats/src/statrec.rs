use serde::{Deserialize, Serialize};

/// How samples are weighted.
///
/// `Point` records weight each sample explicitly (usually 1.0).
/// `Interval` records track a level over time: each update supplies the new
/// level and the current time, and the previous level is weighted by the
/// elapsed interval.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecKind {
    Point,
    Interval,
}

/// A sampled statistic with mean/stddev and an optional fixed-bin histogram.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StatRec {
    pub name: String,
    kind: RecKind,
    samples: f64,
    sum: f64,
    sum_sq: f64,
    min: f64,
    max: f64,
    /// histogram bounds: `bins` equal-width buckets over [low, high),
    /// plus an overflow bucket
    low: f64,
    high: f64,
    hist: Vec<f64>,
    // interval bookkeeping
    last_value: f64,
    last_time: f64,
}

impl StatRec {
    pub fn point(name: &str, bins: usize, low: f64, high: f64) -> Self {
        Self::new(name, RecKind::Point, bins, low, high)
    }

    pub fn interval(name: &str, bins: usize, low: f64, high: f64) -> Self {
        Self::new(name, RecKind::Interval, bins, low, high)
    }

    fn new(name: &str, kind: RecKind, bins: usize, low: f64, high: f64) -> Self {
        Self {
            name: name.to_string(),
            kind,
            samples: 0.0,
            sum: 0.0,
            sum_sq: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
            low,
            high,
            hist: vec![0.0; if bins > 0 { bins + 1 } else { 0 }],
            last_value: 0.0,
            last_time: 0.0,
        }
    }

    /// Record a sample.
    ///
    /// For point records `weight_or_time` is the sample weight; for interval
    /// records it is the current simulation time.
    pub fn update(&mut self, value: f64, weight_or_time: f64) {
        let (v, w) = match self.kind {
            RecKind::Point => (value, weight_or_time),
            RecKind::Interval => {
                let elapsed = weight_or_time - self.last_time;
                let prev = self.last_value;
                self.last_value = value;
                self.last_time = weight_or_time;
                if elapsed <= 0.0 {
                    return;
                }
                (prev, elapsed)
            }
        };
        self.samples += w;
        self.sum += v * w;
        self.sum_sq += v * v * w;
        self.min = self.min.min(v);
        self.max = self.max.max(v);
        if !self.hist.is_empty() {
            let bins = self.hist.len() - 1;
            let idx = if v >= self.high || self.high <= self.low {
                bins
            } else if v < self.low {
                0
            } else {
                (((v - self.low) / (self.high - self.low)) * bins as f64) as usize
            };
            self.hist[idx.min(bins)] += w;
        }
    }

    #[must_use]
    pub fn samples(&self) -> f64 {
        self.samples
    }

    #[must_use]
    pub fn mean(&self) -> f64 {
        if self.samples > 0.0 {
            self.sum / self.samples
        } else {
            0.0
        }
    }

    #[must_use]
    pub fn sdev(&self) -> f64 {
        if self.samples > 0.0 {
            let mean = self.mean();
            (self.sum_sq / self.samples - mean * mean).max(0.0).sqrt()
        } else {
            0.0
        }
    }

    #[must_use]
    pub fn histogram(&self) -> &[f64] {
        &self.hist
    }

    pub fn reset(&mut self) {
        let bins = self.hist.len();
        *self = Self {
            name: std::mem::take(&mut self.name),
            kind: self.kind,
            hist: vec![0.0; bins],
            low: self.low,
            high: self.high,
            ..Self::new("", self.kind, 0, self.low, self.high)
        };
    }
}

impl std::fmt::Display for StatRec {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(
            f,
            "{}: {} samples @ mean {:.3} [stddev {:.3}]",
            self.name,
            self.samples,
            self.mean(),
            self.sdev()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::StatRec;

    #[test]
    fn point_mean_and_sdev() {
        let mut rec = StatRec::point("lat", 4, 0.0, 40.0);
        for v in [10.0, 20.0, 30.0] {
            rec.update(v, 1.0);
        }
        assert_eq!(rec.samples(), 3.0);
        assert!((rec.mean() - 20.0).abs() < 1e-9);
        assert!((rec.sdev() - (200.0f64 / 3.0).sqrt()).abs() < 1e-9);
    }

    #[test]
    fn interval_weights_by_elapsed_time() {
        let mut rec = StatRec::interval("occ", 0, 0.0, 8.0);
        rec.update(2.0, 0.0); // level 2 from t=0
        rec.update(4.0, 10.0); // level 2 held for 10
        rec.update(0.0, 15.0); // level 4 held for 5
        // mean = (2*10 + 4*5) / 15
        assert!((rec.mean() - 40.0 / 15.0).abs() < 1e-9);
    }

    #[test]
    fn histogram_overflow_bucket() {
        let mut rec = StatRec::point("h", 2, 0.0, 10.0);
        rec.update(1.0, 1.0);
        rec.update(6.0, 1.0);
        rec.update(100.0, 1.0);
        assert_eq!(rec.histogram(), &[1.0, 1.0, 1.0]);
    }
}
