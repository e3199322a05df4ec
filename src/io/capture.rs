//! Capture-session dataset (`transforms.json` + color + depth images).
//!
//! The manifest stores full-resolution intrinsics (`fl_x`, `fl_y`, `cx`,
//! `cy`, `w`, `h`) and per-frame camera-to-world transforms in the
//! ARKit/OpenGL camera convention (y up, z backwards). Frames are resampled
//! to the configured resolution and poses are flipped into the y-down,
//! z-forward convention used everywhere else.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};

use glam::Mat4;
use image::imageops::FilterType;
use image::DynamicImage;
use serde::Deserialize;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::ColorType;

use crate::config::DataParams;
use crate::core::{Camera, ColorImage, DepthImage, RgbdFrame, RgbdView};

use super::dataset::{select_indices, Dataset, DatasetError, Result};

/// Depth multiplier when the manifest gives none: samples are meters
const DEFAULT_INTEGER_DEPTH_SCALE: f32 = 1.0;

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureManifest {
    pub fl_x: f32,
    pub fl_y: f32,
    pub cx: f32,
    pub cy: f32,
    pub w: u32,
    pub h: u32,
    #[serde(default)]
    pub integer_depth_scale: Option<f32>,
    pub frames: Vec<CaptureFrame>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureFrame {
    pub file_path: String,
    #[serde(default)]
    pub depth_path: Option<String>,
    /// Row-major camera-to-world
    pub transform_matrix: [[f32; 4]; 4],
}

impl CaptureFrame {
    /// Depth file for this frame; defaults to `depth/<stem>.tiff`
    fn depth_file(&self) -> PathBuf {
        match &self.depth_path {
            Some(p) => PathBuf::from(p),
            None => {
                let stem = Path::new(&self.file_path)
                    .file_stem()
                    .map(|s| s.to_string_lossy().into_owned())
                    .unwrap_or_default();
                PathBuf::from("depth").join(format!("{stem}.tiff"))
            }
        }
    }
}

/// Converts an ARKit camera-to-world into the internal convention: `P * c2w * P^T`
/// with `P = diag(1, -1, -1, 1)`.
pub fn arkit_to_internal(c2w: Mat4) -> Mat4 {
    let p = Mat4::from_diagonal(glam::Vec4::new(1.0, -1.0, -1.0, 1.0));
    p * c2w * p.transpose()
}

/// Dataset backed by one capture session directory
pub struct CaptureDataset {
    root: PathBuf,
    manifest: CaptureManifest,
    indices: Vec<usize>,
    camera: Camera,
    densify_camera: Option<Camera>,
}

impl CaptureDataset {
    /// Open `basedir/sequence` as configured in `params`
    pub fn open(params: &DataParams) -> Result<Self> {
        Self::open_dir(params.basedir.join(&params.sequence), params)
    }

    pub fn open_dir<P: AsRef<Path>>(root: P, params: &DataParams) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        let file = std::fs::File::open(root.join("transforms.json"))?;
        let manifest: CaptureManifest = serde_json::from_reader(std::io::BufReader::new(file))?;

        if manifest.w == 0 || manifest.h == 0 {
            return Err(DatasetError::Format("manifest image size is zero".to_string()));
        }

        let full = Camera::new(manifest.fl_x, manifest.fl_y, manifest.cx, manifest.cy, manifest.w, manifest.h);
        let camera = full.scaled_to(params.desired_image_width, params.desired_image_height);
        let densify_camera = match (params.densification_image_width, params.densification_image_height) {
            (Some(w), Some(h)) => Some(full.scaled_to(w, h)),
            _ => None,
        };
        let indices = select_indices(
            manifest.frames.len(),
            params.start,
            params.end,
            params.stride,
            params.num_frames,
        );

        log::info!(
            "Opened capture {} with {} of {} frames at {}x{}",
            root.display(),
            indices.len(),
            manifest.frames.len(),
            camera.width,
            camera.height
        );

        Ok(Self {
            root,
            manifest,
            indices,
            camera,
            densify_camera,
        })
    }

    fn depth_scale(&self) -> f32 {
        self.manifest.integer_depth_scale.unwrap_or(DEFAULT_INTEGER_DEPTH_SCALE)
    }

    fn load_view(&self, color: &DynamicImage, depth: &DepthImage, camera: Camera) -> RgbdView {
        let rgb = image::imageops::resize(&color.to_rgb8(), camera.width, camera.height, FilterType::Triangle);
        let data = rgb.as_raw().iter().map(|v| *v as f32 / 255.0).collect();
        RgbdView::new(
            ColorImage::new(camera.width, camera.height, data),
            resize_nearest(depth, camera.width, camera.height),
            camera,
        )
    }
}

impl Dataset for CaptureDataset {
    fn len(&self) -> usize {
        self.indices.len()
    }

    fn camera(&self) -> Camera {
        self.camera
    }

    fn load_frame(&self, index: usize) -> Result<RgbdFrame> {
        let position = *self.indices.get(index).ok_or(DatasetError::FrameIndex(index))?;
        let entry = &self.manifest.frames[position];

        let color = image::io::Reader::open(self.root.join(&entry.file_path))?
            .with_guessed_format()?
            .decode()
            .map_err(|e| DatasetError::Image(e.to_string()))?;
        let depth = load_depth(
            &self.root.join(entry.depth_file()),
            self.depth_scale(),
            self.manifest.w as f32 / self.manifest.h as f32,
        )?;
        if depth.valid_indices().is_empty() {
            return Err(DatasetError::MissingDepth(index));
        }

        let view = self.load_view(&color, &depth, self.camera);
        let c2w = Mat4::from_cols_array_2d(&entry.transform_matrix).transpose();
        let mut frame = RgbdFrame::new(index, view).with_ground_truth(arkit_to_internal(c2w));
        if let Some(camera) = self.densify_camera {
            frame = frame.with_densify_view(self.load_view(&color, &depth, camera));
        }
        Ok(frame)
    }
}

/// Load a metric depth map.
///
/// TIFF and PNG samples (integer or float) are multiplied by `scale`. Files
/// that are not images are read as raw little-endian `f32` buffers whose
/// shape follows `aspect` (width / height).
pub fn load_depth(path: &Path, scale: f32, aspect: f32) -> Result<DepthImage> {
    let extension = path.extension().and_then(|e| e.to_str()).map(|e| e.to_lowercase());
    match extension.as_deref() {
        Some("tiff" | "tif") => load_tiff_depth(path, scale),
        Some("png") => load_png_depth(path, scale),
        _ => load_raw_depth(path, aspect),
    }
}

fn tiff_error(err: tiff::TiffError) -> DatasetError {
    DatasetError::Image(err.to_string())
}

/// Single-channel float depth from the capture app, or integer depth
fn load_tiff_depth(path: &Path, scale: f32) -> Result<DepthImage> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?)).map_err(tiff_error)?;
    let (width, height) = decoder.dimensions().map_err(tiff_error)?;
    let channels = match decoder.colortype().map_err(tiff_error)? {
        ColorType::Gray(_) => 1,
        ColorType::GrayA(_) => 2,
        ColorType::RGB(_) => 3,
        ColorType::RGBA(_) => 4,
        other => {
            return Err(DatasetError::Image(format!(
                "unsupported depth TIFF color type {:?} in {}",
                other,
                path.display()
            )))
        }
    };

    let samples: Vec<f32> = match decoder.read_image().map_err(tiff_error)? {
        DecodingResult::F32(v) => v,
        DecodingResult::F64(v) => v.into_iter().map(|d| d as f32).collect(),
        DecodingResult::U8(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U16(v) => v.into_iter().map(f32::from).collect(),
        DecodingResult::U32(v) => v.into_iter().map(|d| d as f32).collect(),
        _ => {
            return Err(DatasetError::Image(format!(
                "unsupported depth TIFF sample format in {}",
                path.display()
            )))
        }
    };

    let data: Vec<f32> = samples.iter().step_by(channels).map(|d| d * scale).collect();
    if data.len() != width as usize * height as usize {
        return Err(DatasetError::Format(format!(
            "depth {} holds {} samples for {}x{}",
            path.display(),
            data.len(),
            width,
            height
        )));
    }
    Ok(DepthImage::new(width, height, data))
}

fn load_png_depth(path: &Path, scale: f32) -> Result<DepthImage> {
    let img = image::io::Reader::open(path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| DatasetError::Image(e.to_string()))?;
    let (width, height) = (img.width(), img.height());

    let data: Vec<f32> = match img {
        DynamicImage::ImageLuma16(luma) => luma.pixels().map(|p| p.0[0] as f32 * scale).collect(),
        DynamicImage::ImageLuma8(luma) => luma.pixels().map(|p| p.0[0] as f32 * scale).collect(),
        other => {
            return Err(DatasetError::Image(format!(
                "Expected single-channel depth image, got {:?}",
                other.color()
            )))
        }
    };

    Ok(DepthImage::new(width, height, data))
}

fn load_raw_depth(path: &Path, aspect: f32) -> Result<DepthImage> {
    let bytes = std::fs::read(path)?;
    if bytes.len() % 4 != 0 || bytes.is_empty() {
        return Err(DatasetError::Format(format!(
            "raw depth {} has {} bytes, not a float buffer",
            path.display(),
            bytes.len()
        )));
    }
    let n = bytes.len() / 4;
    let height = ((n as f32 / aspect).sqrt()).round() as usize;
    let width = if height == 0 { 0 } else { n / height };
    if width * height != n {
        return Err(DatasetError::Format(format!(
            "raw depth {} with {} values does not fit aspect {:.3}",
            path.display(),
            n,
            aspect
        )));
    }

    let data = bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect();
    Ok(DepthImage::new(width as u32, height as u32, data))
}

/// Nearest-neighbour resampling; depth must not be blended across edges
pub fn resize_nearest(depth: &DepthImage, width: u32, height: u32) -> DepthImage {
    if depth.width == width && depth.height == height {
        return depth.clone();
    }
    if depth.width == 0 || depth.height == 0 {
        return DepthImage::filled(width, height, 0.0);
    }
    let mut data = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        let sy = ((y as f32 + 0.5) * depth.height as f32 / height as f32) as u32;
        for x in 0..width {
            let sx = ((x as f32 + 0.5) * depth.width as f32 / width as f32) as u32;
            data.push(depth.at(sx.min(depth.width - 1), sy.min(depth.height - 1)).unwrap_or(0.0));
        }
    }
    DepthImage::new(width, height, data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::{Vec3, Vec4};
    use image::{ImageBuffer, Luma, Rgb};

    fn write_session(dir: &Path, frames: usize) {
        std::fs::create_dir_all(dir.join("images")).unwrap();
        let mut entries = Vec::new();
        for i in 0..frames {
            let color: ImageBuffer<Rgb<u8>, Vec<u8>> = ImageBuffer::from_pixel(8, 6, Rgb([255, 0, 0]));
            color.save(dir.join(format!("images/{i}.png"))).unwrap();

            let depth: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_pixel(4, 3, Luma([1500]));
            depth.save(dir.join(format!("images/{i}.depth.png"))).unwrap();

            entries.push(format!(
                r#"{{"file_path": "images/{i}.png", "depth_path": "images/{i}.depth.png",
                    "transform_matrix": [[1,0,0,{i}],[0,1,0,0],[0,0,1,0],[0,0,0,1]]}}"#
            ));
        }
        let manifest = format!(
            r#"{{"fl_x": 8.0, "fl_y": 8.0, "cx": 4.0, "cy": 3.0, "w": 8, "h": 6,
                "camera_angle_x": 0.9, "integer_depth_scale": 0.001, "frames": [{}]}}"#,
            entries.join(",")
        );
        std::fs::write(dir.join("transforms.json"), manifest).unwrap();
    }

    fn params() -> DataParams {
        DataParams {
            desired_image_width: 4,
            desired_image_height: 3,
            ..Default::default()
        }
    }

    #[test]
    fn test_open_and_load_frame() {
        let dir = tempfile::tempdir().unwrap();
        write_session(dir.path(), 3);

        let dataset = CaptureDataset::open_dir(dir.path(), &params()).unwrap();
        assert_eq!(dataset.len(), 3);
        assert_eq!(dataset.camera().width, 4);
        assert!((dataset.camera().fx - 4.0).abs() < 1e-6);

        let frame = dataset.load_frame(2).unwrap();
        assert_eq!(frame.index, 2);
        assert!(frame.view.is_consistent());
        assert!((frame.view.depth.data[0] - 1.5).abs() < 1e-6);
        assert!((frame.view.color.data[0] - 1.0).abs() < 1e-6);

        let c2w = frame.gt_c2w.unwrap();
        assert!((c2w.w_axis.truncate() - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_missing_image_is_per_frame_error() {
        let dir = tempfile::tempdir().unwrap();
        write_session(dir.path(), 2);
        std::fs::remove_file(dir.path().join("images/1.png")).unwrap();

        let dataset = CaptureDataset::open_dir(dir.path(), &params()).unwrap();
        assert!(dataset.load_frame(0).is_ok());
        assert!(dataset.load_frame(1).is_err());
        assert!(matches!(dataset.load_frame(5), Err(DatasetError::FrameIndex(5))));
    }

    #[test]
    fn test_stride_and_densify_view() {
        let dir = tempfile::tempdir().unwrap();
        write_session(dir.path(), 4);
        let p = DataParams {
            stride: 2,
            densification_image_width: Some(8),
            densification_image_height: Some(6),
            ..params()
        };
        let dataset = CaptureDataset::open_dir(dir.path(), &p).unwrap();
        assert_eq!(dataset.len(), 2);
        let frame = dataset.load_frame(1).unwrap();
        let dense = frame.densify_view.unwrap();
        assert_eq!(dense.camera.width, 8);
        assert_eq!(dense.depth.data.len(), 48);
    }

    #[test]
    fn test_float_tiff_depth() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.depth.tiff");
        let values: Vec<f32> = (0..12).map(|i| 0.5 + i as f32 * 0.25).collect();
        let mut encoder = tiff::encoder::TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder
            .write_image::<tiff::encoder::colortype::Gray32Float>(4, 3, &values)
            .unwrap();

        let depth = load_depth(&path, 1.0, 4.0 / 3.0).unwrap();
        assert_eq!((depth.width, depth.height), (4, 3));
        assert_eq!(depth.data, values);

        let scaled = load_depth(&path, 2.0, 4.0 / 3.0).unwrap();
        assert_eq!(scaled.data[3], 2.0 * values[3]);
    }

    #[test]
    fn test_integer_tiff_depth_is_scaled() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.depth.tif");
        let values: Vec<u16> = vec![1000, 2000, 0, 4000];
        let mut encoder = tiff::encoder::TiffEncoder::new(File::create(&path).unwrap()).unwrap();
        encoder.write_image::<tiff::encoder::colortype::Gray16>(2, 2, &values).unwrap();

        let depth = load_depth(&path, 0.001, 1.0).unwrap();
        for (got, want) in depth.data.iter().zip([1.0, 2.0, 0.0, 4.0]) {
            assert!((got - want).abs() < 1e-6);
        }
    }

    #[test]
    fn test_raw_depth_buffer() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("0.bin");
        let values: Vec<u8> = (0..12).flat_map(|i| (i as f32).to_le_bytes()).collect();
        std::fs::write(&path, values).unwrap();

        let depth = load_depth(&path, 1.0, 4.0 / 3.0).unwrap();
        assert_eq!((depth.width, depth.height), (4, 3));
        assert_eq!(depth.data[5], 5.0);
    }

    #[test]
    fn test_arkit_conversion_flips_y_and_z() {
        let c2w = Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0));
        let converted = arkit_to_internal(c2w);
        assert_eq!(converted.w_axis, Vec4::new(1.0, -2.0, -3.0, 1.0));
    }
}
