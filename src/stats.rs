use serde::{Deserialize, Serialize};

/// Median of `values`; the mean of the two middle elements for even length.
///
/// Returns NaN for an empty slice. Use [`median_opt`] where "no data" must be
/// distinguishable from a number.
pub fn median(values: &[f64]) -> f64 {
    median_opt(values).unwrap_or(f64::NAN)
}

pub fn median_opt(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        Some((sorted[mid - 1] + sorted[mid]) / 2.0)
    } else {
        Some(sorted[mid])
    }
}

/// Append-only latency deltas in milliseconds, in trial order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeltaSeries {
    name: String,
    values: Vec<f64>,
}

impl DeltaSeries {
    pub fn new(name: impl Into<String>) -> Self {
        DeltaSeries { name: name.into(), values: Vec::new() }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn push(&mut self, delta_ms: f64) {
        self.values.push(delta_ms);
    }

    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn median(&self) -> Option<f64> {
        median_opt(&self.values)
    }
}

/// Formats an optional median for user-facing output.
pub fn fmt_ms(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.1} ms", v),
        None => "n/a (no data)".to_string(),
    }
}
