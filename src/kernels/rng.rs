//! Per-thread PCG32 generator state for noise kernels.

use bytemuck::{Pod, Zeroable};

/// PCG32 default multiplier.
const PCG_MULT: u64 = 6364136223846793005;
/// PCG32 default increment base.
const PCG_INIT: u64 = 0x853c49e6748fea9b;

/// PCG32 state, stored one per point in device memory (16 bytes).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct PcgState {
    state: u64,
    inc: u64,
}

impl PcgState {
    /// Independent sequence `idx` of the generator seeded with `seed`.
    pub fn new(idx: u64, seed: u64) -> Self {
        let mut rng = Self {
            state: 0,
            inc: (idx.wrapping_add(1) << 1) | 1,
        };
        rng.next_u32();
        rng.state = rng.state.wrapping_add(PCG_INIT.wrapping_add(seed));
        rng.next_u32();
        rng
    }

    pub fn next_u32(&mut self) -> u32 {
        let old = self.state;
        self.state = old.wrapping_mul(PCG_MULT).wrapping_add(self.inc | 1);
        let xorshifted = (((old >> 18) ^ old) >> 27) as u32;
        let rot = (old >> 59) as u32;
        xorshifted.rotate_right(rot)
    }

    /// Uniform float in [0, 1).
    pub fn next_f32(&mut self) -> f32 {
        let bits = (self.next_u32() >> 9) | 0x3f80_0000;
        f32::from_bits(bits) - 1.0
    }

    /// Standard normal sample (Box-Muller).
    pub fn next_normal(&mut self) -> f32 {
        // 1 - u keeps the log argument in (0, 1].
        let u1 = 1.0 - self.next_f32();
        let u2 = self.next_f32();
        (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequences_differ() {
        let mut a = PcgState::new(0, 42);
        let mut b = PcgState::new(1, 42);
        assert_ne!(a.next_u32(), b.next_u32());
        assert_eq!(PcgState::new(7, 1), PcgState::new(7, 1));
    }

    #[test]
    fn test_normal_moments() {
        let mut rng = PcgState::new(3, 1234);
        let n = 20_000;
        let samples: Vec<f32> = (0..n).map(|_| rng.next_normal()).collect();
        let mean = samples.iter().sum::<f32>() / n as f32;
        let var = samples.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / n as f32;
        assert!(mean.abs() < 0.05, "mean {mean}");
        assert!((var - 1.0).abs() < 0.05, "variance {var}");
        assert!(samples.iter().all(|x| x.is_finite()));
    }
}
