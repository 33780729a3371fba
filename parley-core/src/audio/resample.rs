//! Sample-rate conversion for finished captures.
//!
//! Microphones run at their native rate (usually 44.1 or 48 kHz); uploads are
//! 16 kHz mono. `RateConverter` wraps a rubato `FastFixedIn` session and is a
//! plain copy when both rates already match.
//!
//! ```ignore
//! let mut rc = RateConverter::new(48_000, 16_000, 1024)?;
//! let mut out = rc.process(&samples);
//! out.extend(rc.finish());
//! ```

use rubato::{FastFixedIn, PolynomialDegree, Resampler};
use tracing::{debug, error};

use crate::error::{ParleyError, Result};

/// Input frames per rubato call.
pub const DEFAULT_CHUNK: usize = 1024;

pub struct RateConverter {
    /// `None` in passthrough mode.
    resampler: Option<FastFixedIn<f32>>,
    pending: Vec<f32>,
    chunk_size: usize,
    out: Vec<Vec<f32>>,
}

impl RateConverter {
    /// # Errors
    /// `ParleyError::Capture` if either rate is zero or rubato rejects the ratio.
    pub fn new(from_rate: u32, to_rate: u32, chunk_size: usize) -> Result<Self> {
        if from_rate == 0 || to_rate == 0 {
            return Err(ParleyError::Capture(format!(
                "invalid sample rates {from_rate} -> {to_rate}"
            )));
        }
        let chunk_size = chunk_size.max(1);
        if from_rate == to_rate {
            return Ok(Self {
                resampler: None,
                pending: Vec::new(),
                chunk_size,
                out: Vec::new(),
            });
        }

        let resampler = FastFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            PolynomialDegree::Cubic,
            chunk_size,
            1,
        )
        .map_err(|e| ParleyError::Capture(format!("resampler init: {e}")))?;
        let out = vec![vec![0f32; resampler.output_frames_max()]; 1];

        debug!(from_rate, to_rate, chunk_size, "resampler ready");

        Ok(Self {
            resampler: Some(resampler),
            pending: Vec::new(),
            chunk_size,
            out,
        })
    }

    pub fn is_passthrough(&self) -> bool {
        self.resampler.is_none()
    }

    /// Feed samples; returns whatever full chunks produced (possibly nothing).
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return samples.to_vec();
        };
        self.pending.extend_from_slice(samples);

        let mut produced = Vec::new();
        let mut offset = 0;
        while self.pending.len() - offset >= self.chunk_size {
            let block = &self.pending[offset..offset + self.chunk_size];
            match resampler.process_into_buffer(&[block], &mut self.out, None) {
                Ok((_, n)) => produced.extend_from_slice(&self.out[0][..n]),
                Err(e) => error!("resampler process error: {e}"),
            }
            offset += self.chunk_size;
        }
        self.pending.drain(..offset);
        produced
    }

    /// Flush the partial tail. The converter can be reused afterwards.
    pub fn finish(&mut self) -> Vec<f32> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Vec::new();
        };
        if self.pending.is_empty() {
            return Vec::new();
        }
        let tail = std::mem::take(&mut self.pending);
        let input: [&[f32]; 1] = [&tail];
        let result = match resampler.process_partial_into_buffer(Some(&input[..]), &mut self.out, None) {
            Ok((_, n)) => {
                // Keep only the share of the padded block that real input accounts for.
                let keep = ((tail.len() as f64 / self.chunk_size as f64) * n as f64).ceil() as usize;
                self.out[0][..keep.min(n)].to_vec()
            }
            Err(e) => {
                error!("resampler flush error: {e}");
                Vec::new()
            }
        };
        resampler.reset();
        result
    }
}

/// One-shot conversion of a whole buffer.
pub fn convert_all(samples: &[f32], from_rate: u32, to_rate: u32) -> Result<Vec<f32>> {
    let mut rc = RateConverter::new(from_rate, to_rate, DEFAULT_CHUNK)?;
    let mut out = rc.process(samples);
    out.extend(rc.finish());
    Ok(out)
}
