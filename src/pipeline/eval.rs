//! Progress evaluation: render quality and pose error for one frame

use log::info;
use thiserror::Error;

use crate::core::{CameraPose, RgbdFrame};
use crate::fusion::{PrimitiveStore, RenderError, Renderer};

/// Floor on the color MSE so a perfect render reports a finite PSNR
const MIN_MSE: f32 = 1e-10;

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("frame {0} has no valid depth to evaluate against")]
    NoValidDepth(usize),
    #[error("frame {frame}: {metric} is not finite")]
    NonFinite { frame: usize, metric: &'static str },
    #[error("render failed during evaluation: {0}")]
    Render(#[from] RenderError),
}

/// Metrics of one frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrameMetrics {
    pub frame_index: usize,
    pub psnr: f32,
    /// Mean absolute depth error over valid observed pixels
    pub depth_l1: f32,
    /// Camera center distance to ground truth
    pub translation_error: Option<f32>,
    /// Rotation angle to ground truth, degrees
    pub rotation_error_deg: Option<f32>,
}

impl FrameMetrics {
    pub fn log(&self, stage: &str) {
        match (self.translation_error, self.rotation_error_deg) {
            (Some(te), Some(re)) => info!(
                "[{}] frame {}: PSNR {:.2} dB, depth L1 {:.4}, ATE {:.4}, RE {:.3} deg",
                stage, self.frame_index, self.psnr, self.depth_l1, te, re
            ),
            _ => info!(
                "[{}] frame {}: PSNR {:.2} dB, depth L1 {:.4}",
                stage, self.frame_index, self.psnr, self.depth_l1
            ),
        }
    }
}

/// Peak signal-to-noise ratio of colors in `[0, 1]`
pub fn psnr(rendered: &[f32], observed: &[f32]) -> f32 {
    let n = rendered.len().min(observed.len());
    if n == 0 {
        return f32::NAN;
    }
    let mse = rendered
        .iter()
        .zip(observed)
        .map(|(r, o)| (r - o) * (r - o))
        .sum::<f32>()
        / n as f32;
    -10.0 * mse.max(MIN_MSE).log10()
}

/// Render `frame` at `pose` and compare it with the observation.
///
/// `gt` is the normalized ground-truth pose, when the sequence has one.
pub fn evaluate_frame<R: Renderer + ?Sized>(
    renderer: &mut R,
    store: &PrimitiveStore,
    frame: &RgbdFrame,
    pose: &CameraPose,
    gt: Option<&CameraPose>,
) -> Result<FrameMetrics, EvalError> {
    let view = &frame.view;
    let output = renderer.render(store, pose, &view.camera)?;
    output.validate(&view.camera)?;

    let mut depth_sum = 0.0f32;
    let mut valid = 0usize;
    for (r, g) in output.depth.iter().zip(&view.depth.data) {
        if g.is_finite() && *g > 0.0 {
            depth_sum += (r - g).abs();
            valid += 1;
        }
    }
    if valid == 0 {
        return Err(EvalError::NoValidDepth(frame.index));
    }

    let metrics = FrameMetrics {
        frame_index: frame.index,
        psnr: psnr(&output.color, &view.color.data),
        depth_l1: depth_sum / valid as f32,
        translation_error: gt.map(|g| pose.center_distance(g)),
        rotation_error_deg: gt.map(|g| pose.rotation_angle_to(g)),
    };

    let checks = [
        ("psnr", Some(metrics.psnr)),
        ("depth_l1", Some(metrics.depth_l1)),
        ("translation_error", metrics.translation_error),
        ("rotation_error", metrics.rotation_error_deg),
    ];
    for (metric, value) in checks {
        if value.map_or(false, |v| !v.is_finite()) {
            return Err(EvalError::NonFinite { frame: frame.index, metric });
        }
    }
    Ok(metrics)
}
