//! Per-frame pose history

use std::collections::BTreeMap;

use glam::Mat4;

use super::pose::CameraPose;

/// One estimated world-to-camera pose per processed frame index.
#[derive(Debug, Clone, Default)]
pub struct Trajectory {
    poses: BTreeMap<usize, CameraPose>,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the accepted pose for `frame_index`, replacing any earlier estimate
    pub fn insert(&mut self, frame_index: usize, pose: CameraPose) {
        self.poses.insert(frame_index, pose);
    }

    pub fn get(&self, frame_index: usize) -> Option<&CameraPose> {
        self.poses.get(&frame_index)
    }

    pub fn len(&self) -> usize {
        self.poses.len()
    }

    pub fn is_empty(&self) -> bool {
        self.poses.is_empty()
    }

    /// Latest pose strictly before `frame_index`
    pub fn previous(&self, frame_index: usize) -> Option<(usize, &CameraPose)> {
        self.poses.range(..frame_index).next_back().map(|(i, p)| (*i, p))
    }

    /// The two latest poses strictly before `frame_index`, newest first
    pub fn previous_two(&self, frame_index: usize) -> Option<(&CameraPose, &CameraPose)> {
        let mut iter = self.poses.range(..frame_index).rev();
        let (_, last) = iter.next()?;
        let (_, before) = iter.next()?;
        Some((last, before))
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &CameraPose)> {
        self.poses.iter().map(|(i, p)| (*i, p))
    }
}

/// Maps ground-truth camera-to-world transforms into the relative
/// world-to-camera convention anchored at the first observed transform.
#[derive(Debug, Clone, Copy, Default)]
pub struct RelativePoseNormalizer {
    first_c2w_inv: Option<Mat4>,
}

impl RelativePoseNormalizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restore a normalizer from a stored anchor
    pub fn with_anchor(first_c2w: Mat4) -> Self {
        Self {
            first_c2w_inv: Some(first_c2w.inverse()),
        }
    }

    /// Anchor transform (camera-to-world of the first frame), if set
    pub fn anchor(&self) -> Option<Mat4> {
        self.first_c2w_inv.map(|m| m.inverse())
    }

    /// `w2c = inverse(inverse(first_c2w) * c2w)`; the first call sets the anchor.
    pub fn relative_w2c(&mut self, c2w: Mat4) -> CameraPose {
        let first_inv = *self.first_c2w_inv.get_or_insert_with(|| c2w.inverse());
        let rel_c2w = first_inv * c2w;
        CameraPose::from_matrix(&rel_c2w.inverse())
    }
}
