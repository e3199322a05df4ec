//! Photometric + depth loss with analytic image gradients

use crate::config::LossWeights;
use crate::core::RgbdView;

use super::renderer::{ImageGradients, RenderError, RenderOutput};

/// How per-pixel errors are reduced to a scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    /// Tracking: sum over the mask
    Sum,
    /// Mapping: mean over the mask
    Mean,
}

/// Loss configuration for one optimization stage
#[derive(Debug, Clone, Copy)]
pub struct LossSettings {
    pub use_l1: bool,
    pub use_sil_for_loss: bool,
    pub sil_thres: f32,
    pub ignore_outlier_depth_loss: bool,
    pub weights: LossWeights,
    pub reduction: Reduction,
    /// Restrict the color term to the depth/silhouette mask
    pub mask_color: bool,
}

/// Scalar loss terms and the gradient images to hand to the backward pass
#[derive(Debug, Clone)]
pub struct LossTerms {
    /// Weighted total
    pub total: f32,
    /// Unweighted color term
    pub color: f32,
    /// Unweighted depth term
    pub depth: f32,
    /// Pixels inside the depth mask
    pub mask_pixels: usize,
    pub grads: ImageGradients,
}

/// Median of a slice; 0 for an empty slice
pub fn median(values: &[f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    let mid = (sorted.len() - 1) / 2;
    let (_, m, _) = sorted.select_nth_unstable_by(mid, |a, b| a.total_cmp(b));
    *m
}

/// Per-pixel loss mask: observed depth present, optional outlier rejection
/// and optional silhouette gating.
pub fn loss_mask(output: &RenderOutput, view: &RgbdView, settings: &LossSettings) -> Vec<bool> {
    let gt = &view.depth.data;
    let mut mask: Vec<bool> = gt.iter().map(|d| d.is_finite() && *d > 0.0).collect();

    if settings.ignore_outlier_depth_loss {
        let errors: Vec<f32> = gt
            .iter()
            .zip(&output.depth)
            .zip(&mask)
            .map(|((g, r), valid)| if *valid { (g - r).abs() } else { 0.0 })
            .collect();
        let med = median(&errors);
        if med > 0.0 {
            for (m, e) in mask.iter_mut().zip(&errors) {
                *m = *m && *e < 10.0 * med;
            }
        }
    }

    if settings.use_sil_for_loss {
        for (m, s) in mask.iter_mut().zip(&output.silhouette) {
            *m = *m && *s > settings.sil_thres;
        }
    }

    mask
}

fn error_and_grad(diff: f32, use_l1: bool) -> (f32, f32) {
    if !diff.is_finite() {
        return (0.0, 0.0);
    }
    if use_l1 {
        let grad = if diff > 0.0 {
            1.0
        } else if diff < 0.0 {
            -1.0
        } else {
            0.0
        };
        (diff.abs(), grad)
    } else {
        (diff * diff, 2.0 * diff)
    }
}

/// Compute the loss of `output` against the observed `view`
pub fn compute_loss(
    output: &RenderOutput,
    view: &RgbdView,
    settings: &LossSettings,
) -> Result<LossTerms, RenderError> {
    output.validate(&view.camera)?;
    if !view.is_consistent() {
        return Err(RenderError::ShapeMismatch {
            expected: view.camera.pixel_count(),
            actual: view.depth.data.len(),
        });
    }

    let n = view.camera.pixel_count();
    let mask = loss_mask(output, view, settings);
    let mask_pixels = mask.iter().filter(|m| **m).count();
    let mut grads = ImageGradients::zeros(n);

    let mut depth_sum = 0.0f32;
    for i in 0..n {
        if !mask[i] {
            continue;
        }
        let (err, g) = error_and_grad(output.depth[i] - view.depth.data[i], settings.use_l1);
        depth_sum += err;
        grads.depth[i] = g;
    }

    let mut color_sum = 0.0f32;
    let mut color_elems = 0usize;
    for i in 0..n {
        if settings.mask_color && !mask[i] {
            continue;
        }
        for c in 0..3 {
            let k = i * 3 + c;
            let (err, g) = error_and_grad(output.color[k] - view.color.data[k], settings.use_l1);
            color_sum += err;
            grads.color[k] = g;
        }
        color_elems += 3;
    }

    let (depth_norm, color_norm) = match settings.reduction {
        Reduction::Sum => (1.0, 1.0),
        Reduction::Mean => (
            1.0 / mask_pixels.max(1) as f32,
            1.0 / color_elems.max(1) as f32,
        ),
    };

    let depth = depth_sum * depth_norm;
    let color = color_sum * color_norm;
    let w = settings.weights;

    let depth_scale = w.depth * depth_norm;
    for g in &mut grads.depth {
        *g *= depth_scale;
    }
    let color_scale = w.im * color_norm;
    for g in &mut grads.color {
        *g *= color_scale;
    }

    Ok(LossTerms {
        total: w.im * color + w.depth * depth,
        color,
        depth,
        mask_pixels,
        grads,
    })
}
