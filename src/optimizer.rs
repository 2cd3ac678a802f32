use clap::ValueEnum;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
}

/// Moment estimates for one parameter tensor.
#[derive(Debug, Clone, Default)]
struct Moments {
    m: Vec<f64>,
    v: Vec<f64>,
}

#[derive(Debug, Clone)]
pub struct Adam {
    pub learning_rate: f64,
    pub beta1: f64,
    pub beta2: f64,
    pub epsilon: f64,
    step: u32,
    slots: Vec<Moments>,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Adam {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
            step: 0,
            slots: Vec::new(),
        }
    }
}

/// Updates parameters in place from their gradients.
///
/// Each parameter tensor is addressed by a stable `slot` so stateful
/// optimizers can keep per-tensor moments across steps.
#[derive(Debug, Clone)]
pub enum Optimizer {
    Sgd { learning_rate: f64 },
    Adam(Adam),
}

impl Optimizer {
    pub fn new(kind: OptimizerKind, learning_rate: f64) -> Self {
        match kind {
            OptimizerKind::Sgd => Optimizer::Sgd { learning_rate },
            OptimizerKind::Adam => Optimizer::Adam(Adam::new(learning_rate)),
        }
    }

    /// Marks the start of one batch update; call once before the `update`s for that batch.
    pub fn begin_step(&mut self) {
        if let Optimizer::Adam(adam) = self {
            adam.step += 1;
        }
    }

    pub fn update(&mut self, slot: usize, params: &mut [f64], grads: &[f64]) {
        debug_assert_eq!(params.len(), grads.len());
        match self {
            Optimizer::Sgd { learning_rate } => {
                for (p, g) in params.iter_mut().zip(grads) {
                    *p -= *learning_rate * g;
                }
            }
            Optimizer::Adam(adam) => {
                if adam.slots.len() <= slot {
                    adam.slots.resize_with(slot + 1, Moments::default);
                }
                let state = &mut adam.slots[slot];
                if state.m.len() != params.len() {
                    state.m = vec![0.0; params.len()];
                    state.v = vec![0.0; params.len()];
                }

                let t = adam.step.clamp(1, i32::MAX as u32) as i32;
                let bias1 = 1.0 - adam.beta1.powi(t);
                let bias2 = 1.0 - adam.beta2.powi(t);
                for i in 0..params.len() {
                    let g = grads[i];
                    state.m[i] = adam.beta1 * state.m[i] + (1.0 - adam.beta1) * g;
                    state.v[i] = adam.beta2 * state.v[i] + (1.0 - adam.beta2) * g * g;
                    let m_hat = state.m[i] / bias1;
                    let v_hat = state.v[i] / bias2;
                    params[i] -= adam.learning_rate * m_hat / (v_hat.sqrt() + adam.epsilon);
                }
            }
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Optimizer::Sgd { learning_rate } => *learning_rate,
            Optimizer::Adam(adam) => adam.learning_rate,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // minimise f(x) = (x - 3)^2
    fn run(mut opt: Optimizer, steps: usize) -> f64 {
        let mut x = [0.0];
        for _ in 0..steps {
            let grad = [2.0 * (x[0] - 3.0)];
            opt.begin_step();
            opt.update(0, &mut x, &grad);
        }
        x[0]
    }

    #[test]
    fn sgd_takes_plain_gradient_steps() {
        let mut opt = Optimizer::new(OptimizerKind::Sgd, 0.1);
        let mut x = [1.0, -1.0];
        opt.begin_step();
        opt.update(0, &mut x, &[0.5, -2.0]);
        assert!((x[0] - 0.95).abs() < 1e-12);
        assert!((x[1] + 0.8).abs() < 1e-12);
    }

    #[test]
    fn adam_first_step_moves_by_learning_rate() {
        let mut opt = Optimizer::new(OptimizerKind::Adam, 0.01);
        let mut x = [0.0];
        opt.begin_step();
        opt.update(0, &mut x, &[-4.0]);
        assert!((x[0] - 0.01).abs() < 1e-6);
    }

    #[test]
    fn both_optimizers_converge_on_a_quadratic() {
        assert!((run(Optimizer::new(OptimizerKind::Sgd, 0.1), 200) - 3.0).abs() < 1e-3);
        assert!((run(Optimizer::new(OptimizerKind::Adam, 0.1), 1000) - 3.0).abs() < 1e-2);
    }

    #[test]
    fn adam_bias_correction_starts_at_step_one() {
        // an update before any begin_step is treated as the first step
        let mut opt = Optimizer::new(OptimizerKind::Adam, 0.01);
        let mut x = [0.0];
        opt.update(0, &mut x, &[2.0]);
        assert!((x[0] + 0.01).abs() < 1e-6);
    }

    #[test]
    fn adam_keeps_separate_state_per_slot() {
        let mut opt = Optimizer::new(OptimizerKind::Adam, 0.01);
        let mut a = [0.0];
        let mut b = [0.0, 0.0];
        opt.begin_step();
        opt.update(0, &mut a, &[1.0]);
        opt.update(3, &mut b, &[-1.0, 0.0]);
        assert!(a[0] < 0.0);
        assert!(b[0] > 0.0);
        assert_eq!(b[1], 0.0);
    }
}
