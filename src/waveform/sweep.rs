use serde::{Deserialize, Serialize};
use std::convert::TryFrom;

use crate::error::VentError;

/// Simulated time spanned by one full screen at one pixel per frame.
const BASE_SCREEN_SPAN_MS: f64 = 12_000.0;

/// Paper speed of the waveform display in mm/s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum SweepSpeed {
    Slow,
    #[default]
    Medium,
    Fast,
}

impl SweepSpeed {
    pub fn mm_per_second(self) -> u32 {
        match self {
            SweepSpeed::Slow => 10,
            SweepSpeed::Medium => 25,
            SweepSpeed::Fast => 50,
        }
    }

    /// Pixels the scanline advances per display frame.
    pub fn pixel_rate(self) -> usize {
        match self {
            SweepSpeed::Slow => 1,
            SweepSpeed::Medium => 2,
            SweepSpeed::Fast => 4,
        }
    }

    pub fn screen_span_ms(self) -> f64 {
        BASE_SCREEN_SPAN_MS / self.pixel_rate() as f64
    }
}

impl TryFrom<u32> for SweepSpeed {
    type Error = VentError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            10 => Ok(SweepSpeed::Slow),
            25 => Ok(SweepSpeed::Medium),
            50 => Ok(SweepSpeed::Fast),
            other => Err(VentError::InvalidConfig(format!(
                "Sweep speed must be 10, 25 or 50 mm/s, got {}",
                other
            ))),
        }
    }
}

impl From<SweepSpeed> for u32 {
    fn from(speed: SweepSpeed) -> Self {
        speed.mm_per_second()
    }
}

/// Where and when one waveform sample is drawn.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SweepSample {
    pub pixel: usize,
    pub time_ms: f64,
}

/// Scanline position and the simulated time that drives the sampler.
/// Simulated time only moves forward; the scanline wraps at the width.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepClock {
    speed: SweepSpeed,
    width: usize,
    scanline: usize,
    first_pass: bool,
    simulated_ms: f64,
}

impl SweepClock {
    pub fn new(width: usize, speed: SweepSpeed) -> Self {
        Self {
            speed,
            width: width.max(1),
            scanline: 0,
            first_pass: true,
            simulated_ms: 0.0,
        }
    }

    pub fn speed(&self) -> SweepSpeed {
        self.speed
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn scanline(&self) -> usize {
        self.scanline
    }

    pub fn is_first_pass(&self) -> bool {
        self.first_pass
    }

    pub fn simulated_ms(&self) -> f64 {
        self.simulated_ms
    }

    pub fn time_per_pixel_ms(&self) -> f64 {
        self.speed.screen_span_ms() / self.width as f64
    }

    /// Sample positions for one display frame.
    pub fn advance_frame(&mut self) -> Vec<SweepSample> {
        let step = self.time_per_pixel_ms();
        let mut samples = Vec::with_capacity(self.speed.pixel_rate());

        for _ in 0..self.speed.pixel_rate() {
            samples.push(SweepSample {
                pixel: self.scanline,
                time_ms: self.simulated_ms,
            });
            self.scanline += 1;
            self.simulated_ms += step;
            if self.scanline >= self.width {
                self.scanline = 0;
                self.first_pass = false;
            }
        }
        samples
    }

    /// New surface width. Only the drawing phase restarts.
    pub fn resize(&mut self, width: usize) {
        self.width = width.max(1);
        self.restart();
    }

    pub fn set_speed(&mut self, speed: SweepSpeed) {
        self.speed = speed;
        self.restart();
    }

    /// Starts a fresh trace from the left edge.
    pub fn restart(&mut self) {
        self.scanline = 0;
        self.first_pass = true;
    }
}
