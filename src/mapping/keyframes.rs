//! Keyframe history and overlap-ranked working set selection

use glam::Vec3;
use rayon::prelude::*;

use crate::config::OverlapParams;
use crate::core::{Camera, CameraPose, DepthImage, RgbdView};

/// A retained frame used as a mapping reference
#[derive(Debug, Clone)]
pub struct Keyframe {
    pub frame_index: usize,
    /// Estimated world-to-camera pose
    pub pose: CameraPose,
    pub view: RgbdView,
}

/// Keyframe admission decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyframeDecision {
    /// Frame qualifies and its pose is finite
    Admit,
    /// Frame does not fall on the keyframe cadence
    Skip,
    /// Frame qualifies but a pose is not finite
    RejectNonFinite,
}

/// Member of a mapping working set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkingEntry {
    /// Index into the keyframe sequence
    Keyframe(usize),
    /// The frame currently being processed
    Live,
}

/// Append-only keyframe sequence with overlap scoring.
#[derive(Debug, Clone)]
pub struct KeyframeManager {
    keyframes: Vec<Keyframe>,
    keyframe_every: usize,
    overlap: OverlapParams,
}

impl KeyframeManager {
    pub fn new(keyframe_every: usize, overlap: OverlapParams) -> Self {
        Self {
            keyframes: Vec::new(),
            keyframe_every: keyframe_every.max(1),
            overlap,
        }
    }

    pub fn keyframes(&self) -> &[Keyframe] {
        &self.keyframes
    }

    pub fn len(&self) -> usize {
        self.keyframes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keyframes.is_empty()
    }

    pub fn last(&self) -> Option<&Keyframe> {
        self.keyframes.last()
    }

    /// Frame indices of all keyframes, in order
    pub fn frame_indices(&self) -> Vec<usize> {
        self.keyframes.iter().map(|k| k.frame_index).collect()
    }

    /// Whether a frame becomes a keyframe.
    ///
    /// The first frame, every `keyframe_every`-th frame (`(t + 1) % N == 0`)
    /// and the final frame qualify; the estimated pose and, when present,
    /// the ground-truth pose must be finite.
    pub fn decide(
        &self,
        frame_index: usize,
        is_first: bool,
        is_last: bool,
        pose: &CameraPose,
        gt_pose: Option<&CameraPose>,
    ) -> KeyframeDecision {
        let on_cadence = is_first || is_last || (frame_index + 1) % self.keyframe_every == 0;
        if !on_cadence {
            return KeyframeDecision::Skip;
        }
        if !pose.is_finite() || gt_pose.map_or(false, |p| !p.is_finite()) {
            return KeyframeDecision::RejectNonFinite;
        }
        KeyframeDecision::Admit
    }

    /// Append a keyframe. Rejects non-finite poses and indices that do not
    /// strictly increase.
    pub fn push(&mut self, keyframe: Keyframe) -> bool {
        if !keyframe.pose.is_finite() {
            return false;
        }
        if let Some(last) = self.keyframes.last() {
            if keyframe.frame_index <= last.frame_index {
                return false;
            }
        }
        self.keyframes.push(keyframe);
        true
    }

    /// Deterministic sample of world points from the current frame's valid depth
    fn sample_world_points(&self, depth: &DepthImage, camera: &Camera, pose: &CameraPose) -> Vec<Vec3> {
        let valid = depth.valid_indices();
        if valid.is_empty() {
            return Vec::new();
        }
        let samples = self.overlap.pixel_samples.max(1);
        let stride = (valid.len() + samples - 1) / samples;
        let c2w = pose.inverse();
        let width = depth.width as usize;

        valid
            .iter()
            .step_by(stride.max(1))
            .map(|&i| {
                let u = (i % width) as f32;
                let v = (i / width) as f32;
                c2w.transform_point(camera.unproject(u, v, depth.data[i]))
            })
            .collect()
    }

    /// Number of `points` that reproject inside `keyframe` with consistent depth
    fn overlap_score(&self, points: &[Vec3], keyframe: &Keyframe) -> usize {
        let camera = &keyframe.view.camera;
        let tolerance = self.overlap.depth_tolerance;
        points
            .iter()
            .filter(|p| {
                let local = keyframe.pose.transform_point(**p);
                let Some(pixel) = camera.project(local) else {
                    return false;
                };
                if !camera.is_in_image(pixel, self.overlap.edge_margin) {
                    return false;
                }
                if tolerance <= 0.0 {
                    return true;
                }
                match keyframe.view.depth.at(pixel.x as u32, pixel.y as u32) {
                    Some(d) if d > 0.0 && d.is_finite() => (local.z - d).abs() <= tolerance * d,
                    _ => false,
                }
            })
            .count()
    }

    /// Rank `candidates` by overlap with the current frame.
    ///
    /// Returns at most `k` indices into `candidates`, highest score first,
    /// ties going to the larger frame index. Candidates with no overlap are
    /// never returned.
    pub fn select_overlapping(
        &self,
        depth: &DepthImage,
        pose: &CameraPose,
        camera: &Camera,
        candidates: &[Keyframe],
        k: usize,
    ) -> Vec<usize> {
        if k == 0 || candidates.is_empty() {
            return Vec::new();
        }
        let points = self.sample_world_points(depth, camera, pose);
        if points.is_empty() {
            return Vec::new();
        }

        let scores: Vec<usize> = candidates
            .par_iter()
            .map(|kf| self.overlap_score(&points, kf))
            .collect();

        let mut ranked: Vec<usize> = (0..candidates.len()).filter(|&i| scores[i] > 0).collect();
        ranked.sort_by(|&a, &b| {
            scores[b]
                .cmp(&scores[a])
                .then(candidates[b].frame_index.cmp(&candidates[a].frame_index))
        });
        ranked.truncate(k);
        ranked
    }

    /// Working set for mapping the live frame: up to `window_size - 2`
    /// overlap-ranked keyframes, then the most recent keyframe, then the live frame.
    pub fn working_set(&self, view: &RgbdView, pose: &CameraPose, window_size: usize) -> Vec<WorkingEntry> {
        let mut set = Vec::new();
        if let Some((_, older)) = self.keyframes.split_last() {
            let k = window_size.saturating_sub(2);
            set.extend(
                self.select_overlapping(&view.depth, pose, &view.camera, older, k)
                    .into_iter()
                    .map(WorkingEntry::Keyframe),
            );
            set.push(WorkingEntry::Keyframe(self.keyframes.len() - 1));
        }
        set.push(WorkingEntry::Live);
        set
    }
}
