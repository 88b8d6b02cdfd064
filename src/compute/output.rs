use super::value::Dtype;
use crate::store::RefKind;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

/// The recorded values of one reference.
///
/// `shape` is `[samples, steps]` (plus a trailing width when wider than 1) for
/// time-varying references, and `[samples]` (plus width) for static Variables
/// and Metrics. `data` is row-major over `shape`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Series {
    pub kind: RefKind,
    pub dtype: Dtype,
    /// False for values computed once (static Variables and Metrics).
    pub per_step: bool,
    pub width: usize,
    pub shape: Vec<usize>,
    pub data: Vec<f64>,
}

impl Series {
    pub(crate) fn new(kind: RefKind, dtype: Dtype, samples: usize, steps: Option<usize>, width: usize, data: Vec<f64>) -> Self {
        let mut shape = vec![samples];
        shape.extend(steps);
        if width > 1 {
            shape.push(width);
        }
        Self { kind, dtype, per_step: steps.is_some(), width, shape, data }
    }

    pub fn samples(&self) -> usize { self.shape.first().copied().unwrap_or(0) }

    /// All values of one sample, flattened.
    pub fn sample(&self, s: usize) -> &[f64] {
        let stride = self.data.len() / self.samples().max(1);
        &self.data[s * stride..(s + 1) * stride]
    }

    /// The `width` values of sample `s` at step `t`. Values computed once ignore `t`.
    pub fn step(&self, s: usize, t: usize) -> &[f64] {
        let row = self.sample(s);
        let t = if self.per_step { t } else { 0 };
        &row[t * self.width..(t + 1) * self.width]
    }

    /// First column of sample `s` at step `t`.
    pub fn at(&self, s: usize, t: usize) -> f64 {
        self.step(s, t)[0]
    }
}

/// Everything a run produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOutput {
    pub model: String,
    pub steps: usize,
    pub samples: usize,
    pub seed: u64,
    pub series: IndexMap<String, Series>,
    /// Canonical text of each binding used, by reference name.
    pub bindings: IndexMap<String, String>,
}

impl RunOutput {
    pub fn get(&self, name: &str) -> Option<&Series> { self.series.get(name) }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    pub fn from_json(input: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(input)
    }
}

impl std::ops::Index<&str> for RunOutput {
    type Output = Series;

    fn index(&self, name: &str) -> &Series {
        match self.series.get(name) {
            Some(series) => series,
            None => panic!("no series named '{}' in run of '{}'", name, self.model),
        }
    }
}
