//! SLAM checkpointing utilities for saving and resuming frame-loop state.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use glam::Mat4;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::{Camera, CameraPose, Trajectory};
use crate::fusion::{Primitive, PrimitiveEntry, PrimitiveHandle, PrimitiveState, PrimitiveStore, PARAM_DIM};

/// Snapshot format written by this crate
pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("failed to create checkpoint directory {path}: {source}")]
    CreateDir { path: PathBuf, source: std::io::Error },
    #[error("failed to write checkpoint {path}: {source}")]
    Write { path: PathBuf, source: std::io::Error },
    #[error("failed to read checkpoint {path}: {source}")]
    Read { path: PathBuf, source: std::io::Error },
    #[error("failed to serialize checkpoint {path}: {source}")]
    Serialize { path: PathBuf, source: serde_json::Error },
    #[error("failed to deserialize checkpoint {path}: {source}")]
    Deserialize { path: PathBuf, source: serde_json::Error },
    #[error("checkpoint {path} has version {found}, expected {expected}")]
    Version { path: PathBuf, found: u32, expected: u32 },
    #[error("checkpoint is inconsistent: {0}")]
    Invalid(String),
}

/// Full frame-loop state after frame `frame_index`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlamCheckpoint {
    pub version: u32,
    pub frame_index: usize,
    pub primitives: Vec<CheckpointPrimitive>,
    /// Adam step count of the map optimizer
    pub optimizer_step: u64,
    /// Lifecycle iteration counter (global clock)
    #[serde(default)]
    pub lifecycle_iteration: u64,
    pub poses: Vec<CheckpointPose>,
    pub keyframe_indices: Vec<usize>,
    pub scene: CheckpointScene,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPrimitive {
    pub handle: u64,
    pub params: [f32; PARAM_DIM],
    pub moment1: [f32; PARAM_DIM],
    pub moment2: [f32; PARAM_DIM],
    pub grad_accum: f32,
    pub denom: f32,
    pub birth_frame: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointPose {
    pub frame_index: usize,
    /// `[x, y, z, w]`, unnormalized
    pub quaternion: [f32; 4],
    pub translation: [f32; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointScene {
    pub scene_radius: f32,
    pub intrinsics: Camera,
    pub densify_intrinsics: Camera,
    /// Column-major camera-to-world anchor of ground-truth normalization
    #[serde(default)]
    pub gt_anchor: Option<[f32; 16]>,
}

impl CheckpointScene {
    pub fn anchor(&self) -> Option<Mat4> {
        self.gt_anchor.map(|cols| Mat4::from_cols_array(&cols))
    }
}

impl SlamCheckpoint {
    /// Snapshot the store and trajectory
    pub fn capture(
        frame_index: usize,
        store: &PrimitiveStore,
        optimizer_step: u64,
        lifecycle_iteration: u64,
        trajectory: &Trajectory,
        keyframe_indices: Vec<usize>,
        scene: CheckpointScene,
    ) -> Self {
        let primitives = store
            .entries()
            .iter()
            .map(|e| CheckpointPrimitive {
                handle: e.handle.id(),
                params: e.primitive.to_array(),
                moment1: e.state.moment1,
                moment2: e.state.moment2,
                grad_accum: e.state.grad_accum,
                denom: e.state.denom,
                birth_frame: e.birth_frame,
            })
            .collect();

        let poses = trajectory
            .iter()
            .map(|(frame_index, pose)| CheckpointPose {
                frame_index,
                quaternion: pose.quaternion(),
                translation: pose.translation().to_array(),
            })
            .collect();

        Self {
            version: CHECKPOINT_VERSION,
            frame_index,
            primitives,
            optimizer_step,
            lifecycle_iteration,
            poses,
            keyframe_indices,
            scene,
        }
    }

    /// Rebuild the store with its optimizer state and original handles
    pub fn to_store(&self) -> Result<PrimitiveStore, CheckpointError> {
        let mut store = PrimitiveStore::new();
        for p in &self.primitives {
            let entry = PrimitiveEntry {
                handle: PrimitiveHandle::new(p.handle),
                primitive: Primitive::from_array(&p.params),
                state: PrimitiveState {
                    moment1: p.moment1,
                    moment2: p.moment2,
                    grad_accum: p.grad_accum,
                    denom: p.denom,
                    ..Default::default()
                },
                birth_frame: p.birth_frame,
            };
            if !store.restore_entry(entry) {
                return Err(CheckpointError::Invalid(format!(
                    "primitive handle {} is out of order",
                    p.handle
                )));
            }
        }
        Ok(store)
    }

    pub fn to_trajectory(&self) -> Trajectory {
        let mut trajectory = Trajectory::new();
        for p in &self.poses {
            trajectory.insert(p.frame_index, CameraPose::from_arrays(&p.quaternion, &p.translation));
        }
        trajectory
    }
}

/// Writes a checkpoint every `interval` frames into `dir`
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    interval: usize,
    last_saved: Option<usize>,
}

impl CheckpointManager {
    /// `interval == 0` disables periodic saving. The directory is created on
    /// the first save.
    pub fn new<P: Into<PathBuf>>(dir: P, interval: usize) -> Self {
        Self {
            dir: dir.into(),
            interval,
            last_saved: None,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn last_saved(&self) -> Option<usize> {
        self.last_saved
    }

    pub fn is_due(&self, frame_index: usize) -> bool {
        self.interval > 0 && frame_index % self.interval == 0
    }

    /// Save when `frame_index` falls on the interval; `snapshot` runs only then
    pub fn maybe_save<F>(&mut self, frame_index: usize, snapshot: F) -> Result<Option<PathBuf>, CheckpointError>
    where
        F: FnOnce() -> SlamCheckpoint,
    {
        if !self.is_due(frame_index) {
            return Ok(None);
        }
        self.save(&snapshot()).map(Some)
    }

    /// Save unconditionally
    pub fn save(&mut self, checkpoint: &SlamCheckpoint) -> Result<PathBuf, CheckpointError> {
        if !self.dir.exists() {
            fs::create_dir_all(&self.dir).map_err(|source| CheckpointError::CreateDir {
                path: self.dir.clone(),
                source,
            })?;
        }
        let path = checkpoint_path(&self.dir, checkpoint.frame_index);
        save_checkpoint(checkpoint, &path)?;
        self.last_saved = Some(checkpoint.frame_index);
        Ok(path)
    }
}

pub fn save_checkpoint(checkpoint: &SlamCheckpoint, path: &Path) -> Result<(), CheckpointError> {
    let file = File::create(path).map_err(|source| CheckpointError::Write {
        path: path.to_path_buf(),
        source,
    })?;
    let writer = BufWriter::new(file);
    serde_json::to_writer(writer, checkpoint).map_err(|source| CheckpointError::Serialize {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(())
}

pub fn load_checkpoint(path: &Path) -> Result<SlamCheckpoint, CheckpointError> {
    let file = File::open(path).map_err(|source| CheckpointError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let reader = BufReader::new(file);
    let checkpoint: SlamCheckpoint =
        serde_json::from_reader(reader).map_err(|source| CheckpointError::Deserialize {
            path: path.to_path_buf(),
            source,
        })?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(CheckpointError::Version {
            path: path.to_path_buf(),
            found: checkpoint.version,
            expected: CHECKPOINT_VERSION,
        });
    }
    Ok(checkpoint)
}

pub fn load_latest_checkpoint(dir: &Path) -> Result<Option<SlamCheckpoint>, CheckpointError> {
    if !dir.exists() {
        return Ok(None);
    }

    let mut best: Option<(usize, PathBuf)> = None;
    for entry in fs::read_dir(dir).map_err(|source| CheckpointError::Read {
        path: dir.to_path_buf(),
        source,
    })? {
        let entry = entry.map_err(|source| CheckpointError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if let Some(frame_index) = parse_checkpoint_name(&path) {
            if best.as_ref().map_or(true, |(idx, _)| frame_index > *idx) {
                best = Some((frame_index, path));
            }
        }
    }

    let Some((_, path)) = best else {
        return Ok(None);
    };
    load_checkpoint(&path).map(Some)
}

pub fn checkpoint_path(dir: &Path, frame_index: usize) -> PathBuf {
    dir.join(format!("checkpoint_{frame_index}.json"))
}

fn parse_checkpoint_name(path: &Path) -> Option<usize> {
    let file_name = path.file_name()?.to_str()?;
    file_name
        .strip_prefix("checkpoint_")?
        .strip_suffix(".json")?
        .parse::<usize>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Quat, Vec3};

    fn scene() -> CheckpointScene {
        let camera = Camera::new(8.0, 8.0, 8.0, 6.0, 16, 12);
        CheckpointScene {
            scene_radius: 0.7,
            intrinsics: camera,
            densify_intrinsics: camera.scaled_to(32, 24),
            gt_anchor: Some(Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)).to_cols_array()),
        }
    }

    fn build_state() -> (PrimitiveStore, Trajectory) {
        let mut store = PrimitiveStore::new();
        let a = store.push(Primitive::new(Vec3::new(0.0, 0.0, 2.0), Vec3::splat(0.3), 0.01, 0.5), 0);
        store.push(Primitive::new(Vec3::new(1.0, 0.0, 2.0), Vec3::splat(0.6), 0.02, 0.9), 0);
        store.push(Primitive::new(Vec3::new(2.0, 0.0, 2.0), Vec3::splat(0.9), 0.03, 0.2), 4);
        store.remove(&[a]);
        if let Some(state) = store.entries_mut().next() {
            state.state.moment1[3] = 0.25;
            state.state.denom = 2.0;
        }

        let mut trajectory = Trajectory::new();
        trajectory.insert(0, CameraPose::identity());
        trajectory.insert(1, CameraPose::new(Quat::from_rotation_y(0.1), Vec3::new(0.0, 0.0, 0.1)));
        (store, trajectory)
    }

    #[test]
    fn test_checkpoint_roundtrip() {
        let (store, trajectory) = build_state();
        let checkpoint = SlamCheckpoint::capture(12, &store, 30, 90, &trajectory, vec![0, 4], scene());

        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 12);
        save_checkpoint(&checkpoint, &path).unwrap();
        assert!(path.ends_with("checkpoint_12.json"));

        let loaded = load_checkpoint(&path).unwrap();
        assert_eq!(loaded.frame_index, 12);
        assert_eq!(loaded.optimizer_step, 30);
        assert_eq!(loaded.lifecycle_iteration, 90);
        assert_eq!(loaded.keyframe_indices, vec![0, 4]);
        assert_eq!(loaded.scene.anchor(), scene().anchor());

        let mut restored = loaded.to_store().unwrap();
        assert_eq!(restored.len(), store.len());
        for (a, b) in restored.entries().iter().zip(store.entries()) {
            assert_eq!(a.handle, b.handle);
            assert_eq!(a.primitive.to_array(), b.primitive.to_array());
            assert_eq!(a.state.moment1, b.state.moment1);
            assert_eq!(a.state.denom, b.state.denom);
            assert_eq!(a.birth_frame, b.birth_frame);
        }
        // handles keep increasing past the restored ones
        let fresh = restored.push(Primitive::new(Vec3::ZERO, Vec3::ZERO, 0.01, 0.5), 13);
        assert_eq!(fresh.id(), 3);

        let poses = loaded.to_trajectory();
        assert_eq!(poses.len(), 2);
        let p1 = poses.get(1).unwrap();
        assert_eq!(p1.quaternion(), trajectory.get(1).unwrap().quaternion());
        assert_eq!(p1.translation(), Vec3::new(0.0, 0.0, 0.1));
    }

    #[test]
    fn test_version_mismatch_is_rejected() {
        let (store, trajectory) = build_state();
        let mut checkpoint = SlamCheckpoint::capture(1, &store, 0, 0, &trajectory, vec![0], scene());
        checkpoint.version = CHECKPOINT_VERSION + 1;

        let dir = tempfile::tempdir().unwrap();
        let path = checkpoint_path(dir.path(), 1);
        save_checkpoint(&checkpoint, &path).unwrap();
        assert!(matches!(load_checkpoint(&path), Err(CheckpointError::Version { .. })));
    }

    #[test]
    fn test_load_latest_checkpoint() {
        let (store, trajectory) = build_state();
        let dir = tempfile::tempdir().unwrap();
        for t in [3, 10, 8] {
            let ckpt = SlamCheckpoint::capture(t, &store, 0, 0, &trajectory, vec![0], scene());
            save_checkpoint(&ckpt, &checkpoint_path(dir.path(), t)).unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let latest = load_latest_checkpoint(dir.path()).unwrap().unwrap();
        assert_eq!(latest.frame_index, 10);
        assert!(load_latest_checkpoint(&dir.path().join("missing")).unwrap().is_none());
    }

    #[test]
    fn test_manager_honours_interval() {
        let (store, trajectory) = build_state();
        let dir = tempfile::tempdir().unwrap();
        let mut manager = CheckpointManager::new(dir.path().join("ckpt"), 5);
        assert!(!manager.dir().exists());

        let mut snapshots = 0;
        for t in 0..11 {
            let saved = manager
                .maybe_save(t, || {
                    snapshots += 1;
                    SlamCheckpoint::capture(t, &store, 0, 0, &trajectory, vec![0], scene())
                })
                .unwrap();
            assert_eq!(saved.is_some(), t % 5 == 0);
        }
        assert_eq!(snapshots, 3);
        assert_eq!(manager.last_saved(), Some(10));
        assert!(checkpoint_path(manager.dir(), 5).exists());

        let mut disabled = CheckpointManager::new(dir.path().join("off"), 0);
        assert!(disabled.maybe_save(0, || unreachable!()).unwrap().is_none());
        assert!(!disabled.dir().exists());
    }
}
