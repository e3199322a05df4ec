//! Map expansion: seed primitives where the map does not explain a frame

use log::debug;

use crate::config::ScaleInitMethod;
use crate::core::{CameraPose, RgbdView};
use crate::fusion::init::{initial_scales, primitives_from_points, unproject_view, NeighborScaleLimits};
use crate::fusion::loss::median;
use crate::fusion::{PrimitiveStore, RenderError, RenderOutput, Renderer};

/// Depth errors above this multiple of the median mark geometry in front of the map
const DEPTH_ERROR_FACTOR: f32 = 50.0;

/// Pixels the current map fails to explain.
///
/// A pixel qualifies when it has valid observed depth and either the rendered
/// silhouette is below `sil_thres` or the map renders behind the observation
/// by more than 50x the median depth error.
pub fn unexplained_mask(output: &RenderOutput, view: &RgbdView, sil_thres: f32) -> Vec<bool> {
    let gt = &view.depth.data;
    let errors: Vec<f32> = gt
        .iter()
        .zip(&output.depth)
        .map(|(g, r)| if g.is_finite() && *g > 0.0 { (g - r).abs() } else { 0.0 })
        .collect();
    let med = median(&errors);

    gt.iter()
        .zip(&output.depth)
        .zip(&output.silhouette)
        .zip(&errors)
        .map(|(((g, r), s), e)| {
            let valid = g.is_finite() && *g > 0.0;
            let uncovered = *s < sil_thres;
            let occluding = r > g && *e > DEPTH_ERROR_FACTOR * med;
            valid && (uncovered || occluding)
        })
        .collect()
}

/// Adds primitives for unexplained pixels of frame views.
#[derive(Debug, Clone)]
pub struct MapExpander {
    sil_thres: f32,
    scale_method: ScaleInitMethod,
    limits: NeighborScaleLimits,
}

impl MapExpander {
    pub fn new(sil_thres: f32, scale_method: ScaleInitMethod) -> Self {
        Self {
            sil_thres,
            scale_method,
            limits: NeighborScaleLimits::default(),
        }
    }

    /// Render `view` at `pose` and insert one primitive per unexplained pixel.
    ///
    /// Returns the number of primitives added.
    pub fn expand<R: Renderer + ?Sized>(
        &self,
        renderer: &mut R,
        store: &mut PrimitiveStore,
        view: &RgbdView,
        pose: &CameraPose,
        frame_index: usize,
    ) -> Result<usize, RenderError> {
        let output = renderer.render(store, pose, &view.camera)?;
        output.validate(&view.camera)?;
        let mask = unexplained_mask(&output, view, self.sil_thres);
        let points = unproject_view(view, pose, Some(&mask));
        if points.is_empty() {
            return Ok(0);
        }

        let scales = initial_scales(&points, view.camera.mean_focal(), self.scale_method, &self.limits);
        let added = store.extend(primitives_from_points(&points, &scales), frame_index);
        debug!("frame {}: added {} primitives ({} total)", frame_index, added, store.len());
        Ok(added)
    }
}
