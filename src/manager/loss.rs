use rand::rngs::StdRng;
use rand::Rng;

/// Drops packets at random to emulate a lossy network. Only compiled into debug builds.
pub struct LossSimulator {
    probability: f32,
    rng: StdRng,
}

impl LossSimulator {
    pub fn new(probability: f32, rng: StdRng) -> Self {
        Self { probability, rng }
    }

    pub fn should_drop(&mut self) -> bool {
        self.probability > 0.0 && self.rng.gen::<f32>() < self.probability
    }
}
