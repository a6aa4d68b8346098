use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Uniform};

/// Source of the bounded jitter used by the mechanics model and the waveform
/// sampler. Swapped for a fixed source in tests.
pub trait NoiseSource {
    /// Uniform sample in `[0, 1)`.
    fn unit(&mut self) -> f64;

    /// Uniform sample in `[low, high)`.
    fn uniform(&mut self, low: f64, high: f64) -> f64 {
        low + (high - low) * self.unit()
    }
}

pub struct RngNoise<R: Rng = StdRng> {
    rng: R,
    unit: Uniform<f64>,
}

impl RngNoise<StdRng> {
    pub fn new(seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(s) => StdRng::seed_from_u64(s),
            None => StdRng::from_entropy(),
        };
        Self::from_rng(rng)
    }
}

impl<R: Rng> RngNoise<R> {
    pub fn from_rng(rng: R) -> Self {
        Self {
            rng,
            unit: Uniform::new(0.0, 1.0),
        }
    }
}

impl<R: Rng> NoiseSource for RngNoise<R> {
    fn unit(&mut self) -> f64 {
        self.unit.sample(&mut self.rng)
    }
}

/// Always returns the same unit sample.
#[derive(Debug, Clone, Copy)]
pub struct FixedNoise(pub f64);

impl FixedNoise {
    pub fn midpoint() -> Self {
        Self(0.5)
    }
}

impl NoiseSource for FixedNoise {
    fn unit(&mut self) -> f64 {
        self.0.clamp(0.0, 1.0 - f64::EPSILON)
    }
}

impl<N: NoiseSource + ?Sized> NoiseSource for &mut N {
    fn unit(&mut self) -> f64 {
        (**self).unit()
    }
}

impl<N: NoiseSource + ?Sized> NoiseSource for Box<N> {
    fn unit(&mut self) -> f64 {
        (**self).unit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seeded_noise_is_reproducible() {
        let mut a = RngNoise::new(Some(42));
        let mut b = RngNoise::new(Some(42));
        for _ in 0..16 {
            assert_eq!(a.unit(), b.unit());
        }
    }

    #[test]
    fn test_uniform_stays_in_bounds() {
        let mut noise = RngNoise::new(Some(7));
        for _ in 0..1000 {
            let v = noise.uniform(-0.5, 0.5);
            assert!((-0.5..0.5).contains(&v));
        }
    }

    #[test]
    fn test_fixed_noise_extremes() {
        let mut low = FixedNoise(0.0);
        let mut high = FixedNoise(1.0);
        assert_eq!(low.uniform(5.0, 10.0), 5.0);
        assert!(high.uniform(5.0, 10.0) < 10.0);
    }
}
