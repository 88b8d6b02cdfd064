use super::error::EvalError;
use super::value::{Batch, Dtype};
use crate::store::RefId;

/// Dense history storage for one reference: `capacity` slots of
/// `(samples, width)` values, laid out time-major.
#[derive(Debug, Clone)]
struct Track {
    width: usize,
    capacity: usize,
    dtype: Dtype,
    data: Vec<f64>,
}

/// The per-run history of every reference. Unwritten slots read as zero.
#[derive(Debug, Clone, Default)]
pub struct Ledger {
    samples: usize,
    tracks: Vec<Option<Track>>,
}

impl Ledger {
    pub fn new(samples: usize, references: usize) -> Self {
        Self { samples, tracks: vec![None; references] }
    }

    pub fn samples(&self) -> usize { self.samples }

    pub fn allocate(&mut self, id: RefId, width: usize, capacity: usize, dtype: Dtype) {
        if id.index() >= self.tracks.len() {
            self.tracks.resize(id.index() + 1, None);
        }
        let data = vec![0.0; capacity * self.samples * width];
        self.tracks[id.index()] = Some(Track { width, capacity, dtype, data });
    }

    fn track(&self, id: RefId) -> Result<&Track, EvalError> {
        self.tracks
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(EvalError::MissingStorage(id.0))
    }

    pub fn width(&self, id: RefId) -> Result<usize, EvalError> {
        Ok(self.track(id)?.width)
    }

    pub fn capacity(&self, id: RefId) -> Result<usize, EvalError> {
        Ok(self.track(id)?.capacity)
    }

    /// Stores `value` at slot `t`, broadcasting unit axes to the slot's shape.
    pub fn write(&mut self, id: RefId, t: usize, value: &Batch) -> Result<(), EvalError> {
        let samples = self.samples;
        let track = self
            .tracks
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(EvalError::MissingStorage(id.0))?;
        let width = track.width;

        let fits = (value.samples() == 1 || value.samples() == samples) && (value.width() == 1 || value.width() == width);
        if !fits || t >= track.capacity {
            return Err(EvalError::Shape {
                op: "store".to_string(),
                detail: format!(
                    "value of shape {} does not fit slot {} of shape ({}, {})",
                    value.shape_label(),
                    t,
                    samples,
                    width
                ),
            });
        }

        let base = t * samples * width;
        for s in 0..samples {
            let row = &mut track.data[base + s * width..base + (s + 1) * width];
            for (c, v) in row.iter_mut().enumerate() {
                *v = value.get(s, c);
            }
        }
        Ok(())
    }

    /// The `(samples, width)` value at slot `t`; slots past the capacity read zero.
    pub fn read(&self, id: RefId, t: usize) -> Result<Batch, EvalError> {
        let track = self.track(id)?;
        let size = self.samples * track.width;
        let data = if t < track.capacity {
            track.data[t * size..(t + 1) * size].to_vec()
        } else {
            vec![0.0; size]
        };
        Ok(Batch::new(self.samples, track.width, track.dtype, data))
    }

    /// The first `len` slots of a width-1 reference as a `(samples, len)` batch.
    pub fn history(&self, id: RefId, len: usize) -> Result<Batch, EvalError> {
        let track = self.track(id)?;
        if track.width != 1 {
            return Err(EvalError::Shape {
                op: "timeseries".to_string(),
                detail: format!("history views need width 1, found {}", track.width),
            });
        }
        let samples = self.samples;
        let mut data = vec![0.0; samples * len];
        for t in 0..len.min(track.capacity) {
            for s in 0..samples {
                data[s * len + t] = track.data[t * samples + s];
            }
        }
        Ok(Batch::new(samples, len, track.dtype, data))
    }

    /// The first `steps` slots reordered sample-major: `(samples, steps, width)`.
    pub fn series(&self, id: RefId, steps: usize) -> Result<Vec<f64>, EvalError> {
        let track = self.track(id)?;
        let (samples, width) = (self.samples, track.width);
        let steps = steps.min(track.capacity);
        let mut out = vec![0.0; samples * steps * width];
        for t in 0..steps {
            for s in 0..samples {
                let src = (t * samples + s) * width;
                let dst = (s * steps + t) * width;
                out[dst..dst + width].copy_from_slice(&track.data[src..src + width]);
            }
        }
        Ok(out)
    }
}
