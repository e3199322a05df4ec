//! Adam optimizer over the primitive arena

use std::ops::Range;

use crate::config::{GaussianDistribution, PrimitiveLearningRates};

use super::primitive::{layout, Primitive};
use super::store::PrimitiveStore;

/// Adam hyper-parameters shared by map and pose optimization
#[derive(Debug, Clone, Copy)]
pub struct AdamConfig {
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-15,
        }
    }
}

/// One bias-corrected Adam update over a parameter slice
pub fn adam_update(
    param: &mut [f32],
    grad: &[f32],
    m: &mut [f32],
    v: &mut [f32],
    lr: f32,
    adam: &AdamConfig,
    iteration: u64,
) {
    let step = iteration.clamp(1, i32::MAX as u64) as i32;
    let bias_correction1 = 1.0 - adam.beta1.powi(step);
    let bias_correction2 = 1.0 - adam.beta2.powi(step);

    for i in 0..param.len() {
        m[i] = adam.beta1 * m[i] + (1.0 - adam.beta1) * grad[i];
        v[i] = adam.beta2 * v[i] + (1.0 - adam.beta2) * grad[i] * grad[i];

        let m_hat = m[i] / bias_correction1;
        let v_hat = v[i] / bias_correction2;

        param[i] -= lr * m_hat / (v_hat.sqrt() + adam.eps);
    }
}

/// Parameter groups of the flat primitive layout with their learning rates
fn parameter_groups(lrs: &PrimitiveLearningRates) -> [(Range<usize>, f32); 5] {
    [
        (layout::POSITION..layout::POSITION + 3, lrs.means3d),
        (layout::COLOR..layout::COLOR + 3, lrs.rgb_colors),
        (layout::ROTATION..layout::ROTATION + 4, lrs.unnorm_rotations),
        (layout::OPACITY..layout::OPACITY + 1, lrs.logit_opacities),
        (layout::LOG_SCALE..layout::LOG_SCALE + 3, lrs.log_scales),
    ]
}

/// Applies Adam steps to every primitive using the gradients stored in its slot.
#[derive(Debug, Clone)]
pub struct PrimitiveOptimizer {
    groups: [(Range<usize>, f32); 5],
    adam: AdamConfig,
    distribution: GaussianDistribution,
    step: u64,
}

impl PrimitiveOptimizer {
    pub fn new(lrs: &PrimitiveLearningRates, distribution: GaussianDistribution) -> Self {
        Self {
            groups: parameter_groups(lrs),
            adam: AdamConfig::default(),
            distribution,
            step: 0,
        }
    }

    /// Number of steps taken since the last reset
    pub fn step_count(&self) -> u64 {
        self.step
    }

    pub fn set_step_count(&mut self, step: u64) {
        self.step = step;
    }

    /// Forget all moment estimates and restart bias correction
    pub fn reset(&mut self, store: &mut PrimitiveStore) {
        self.step = 0;
        store.reset_moments();
    }

    /// One Adam step on every primitive
    pub fn step(&mut self, store: &mut PrimitiveStore) {
        self.step += 1;
        for entry in store.entries_mut() {
            let mut params = entry.primitive.to_array();
            let mut grad = entry.state.grad;
            if self.distribution == GaussianDistribution::Isotropic {
                let s = layout::LOG_SCALE;
                let mean = (grad[s] + grad[s + 1] + grad[s + 2]) / 3.0;
                grad[s..s + 3].fill(mean);
            }
            for (range, lr) in &self.groups {
                if *lr == 0.0 {
                    continue;
                }
                adam_update(
                    &mut params[range.clone()],
                    &grad[range.clone()],
                    &mut entry.state.moment1[range.clone()],
                    &mut entry.state.moment2[range.clone()],
                    *lr,
                    &self.adam,
                    self.step,
                );
            }
            entry.primitive = Primitive::from_array(&params);
        }
    }
}
