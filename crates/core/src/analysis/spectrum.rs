use std::{f32::consts::PI, fmt, sync::Arc};

use realfft::{num_complex::Complex32, RealFftPlanner, RealToComplex};

use crate::Result;

/// Analysis window applied before the transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Window {
    Hann,
    Blackman,
}

impl Window {
    fn value(self, index: usize, len: usize) -> f32 {
        if len <= 1 {
            return 1.0;
        }

        match self {
            Window::Hann => 0.5 - 0.5 * ((2.0 * PI * index as f32) / (len as f32 - 1.0)).cos(),
            Window::Blackman => {
                let x = index as f32 / len as f32;
                0.42 - 0.5 * (2.0 * PI * x).cos() + 0.08 * (4.0 * PI * x).cos()
            }
        }
    }
}

/// Cached real FFT that turns a block of samples into `len / 2` bin
/// magnitudes, replanning only when the block length changes.
pub struct Spectrum {
    window: Window,
    planner: RealFftPlanner<f32>,
    fft: Option<FftResources>,
}

impl Spectrum {
    pub fn new(window: Window) -> Self {
        Self {
            window,
            planner: RealFftPlanner::new(),
            fft: None,
        }
    }

    /// Writes `|X_k| / len` for `k in 0..len / 2` into `out`. Blocks shorter
    /// than two samples produce no bins.
    pub fn magnitudes(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        out.clear();
        let len = samples.len();
        if len < 2 {
            return Ok(());
        }

        let window = self.window;
        let fft = self.prepare_fft(len);
        for (index, value) in samples.iter().enumerate() {
            fft.input[index] = *value * window.value(index, len);
        }

        fft.plan
            .process_with_scratch(&mut fft.input, &mut fft.spectrum, &mut fft.scratch)?;

        let scale = 1.0 / len as f32;
        out.extend(
            fft.spectrum
                .iter()
                .take(len / 2)
                .map(|bin| bin.norm() * scale),
        );
        Ok(())
    }

    fn prepare_fft(&mut self, size: usize) -> &mut FftResources {
        let fft = match self.fft.take() {
            Some(fft) if fft.size == size => fft,
            _ => {
                let plan = self.planner.plan_fft_forward(size);
                FftResources {
                    size,
                    scratch: plan.make_scratch_vec(),
                    spectrum: plan.make_output_vec(),
                    input: plan.make_input_vec(),
                    plan,
                }
            }
        };

        self.fft.insert(fft)
    }
}

struct FftResources {
    size: usize,
    plan: Arc<dyn RealToComplex<f32>>,
    scratch: Vec<Complex32>,
    spectrum: Vec<Complex32>,
    input: Vec<f32>,
}

impl fmt::Debug for Spectrum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Spectrum")
            .field("window", &self.window)
            .field("size", &self.fft.as_ref().map(|fft| fft.size))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sine_peaks_at_its_bin() {
        let len = 256;
        let samples: Vec<f32> = (0..len)
            .map(|i| (2.0 * PI * 16.0 * i as f32 / len as f32).sin())
            .collect();
        let mut spectrum = Spectrum::new(Window::Hann);
        let mut mags = Vec::new();
        spectrum.magnitudes(&samples, &mut mags).unwrap();

        assert_eq!(mags.len(), len / 2);
        let peak = mags
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(b.1))
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 16);
    }

    #[test]
    fn replans_when_block_length_changes() {
        let mut spectrum = Spectrum::new(Window::Blackman);
        let mut mags = Vec::new();
        spectrum.magnitudes(&[0.0; 64], &mut mags).unwrap();
        assert_eq!(mags.len(), 32);
        spectrum.magnitudes(&[0.0; 100], &mut mags).unwrap();
        assert_eq!(mags.len(), 50);
        assert!(mags.iter().all(|m| *m == 0.0));
    }

    #[test]
    fn tiny_blocks_produce_no_bins() {
        let mut spectrum = Spectrum::new(Window::Hann);
        let mut mags = vec![1.0];
        spectrum.magnitudes(&[0.5], &mut mags).unwrap();
        assert!(mags.is_empty());
    }
}
