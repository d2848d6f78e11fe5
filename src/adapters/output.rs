use crate::error::ClientError;
use crate::utils::lib::{ensure_dir, timestamp_prefix};
use anyhow::{Context, Result};
use image::{imageops, DynamicImage, RgbImage};
use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

pub const PREVIEW_DIR: &str = "combined_img_output";
pub const PREVIEW_FILE: &str = "combined_img_output.jpg";
/// Largest width or height a JPEG can carry.
pub const MAX_PREVIEW_DIMENSION: u32 = 65_535;

/// How downloaded inference images are named inside the output directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImageNaming {
    /// `output_img_{index}.jpg`; a later run overwrites an earlier one.
    #[default]
    Indexed,
    /// `{timestamp}_{infer_id}_output_img_{index}.jpg`.
    Timestamped,
}

impl ImageNaming {
    pub fn file_names(&self, infer_id: &str, count: usize) -> Vec<String> {
        let prefix = match self {
            ImageNaming::Indexed => String::new(),
            ImageNaming::Timestamped => format!("{}_{}_", timestamp_prefix(), infer_id),
        };
        (0..count)
            .map(|index| format!("{}output_img_{}.jpg", prefix, index))
            .collect()
    }
}

pub fn model_file_path(output_dir: &Path, class_name: &str) -> PathBuf {
    output_dir.join(format!("{}_img_model.ckpt", class_name))
}

pub fn preview_path(output_dir: &Path) -> PathBuf {
    output_dir.join(PREVIEW_DIR).join(PREVIEW_FILE)
}

/// Decodes every regular file in `output_dir` that is an image, in file-name order.
fn load_output_images(output_dir: &Path) -> Result<Vec<DynamicImage>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(output_dir)
        .with_context(|| format!("Failed to read directory: {:?}", output_dir))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        let path = entry.path();
        if path.is_file() {
            paths.push(path);
        }
    }
    paths.sort();

    let mut images = Vec::new();
    for path in paths {
        match image::open(&path) {
            Ok(img) => images.push(img),
            Err(e) => warn!("Skipping {:?} in preview: {}", path, e),
        }
    }
    Ok(images)
}

/// Index of the first image in the longest run of trailing images whose
/// combined width fits in a JPEG. Images are `(width, height)` pairs.
pub fn preview_window(dimensions: &[(u32, u32)]) -> Result<usize> {
    let mut start = dimensions.len();
    let mut total_width = 0u64;
    for (index, &(width, height)) in dimensions.iter().enumerate().rev() {
        let fits = height <= MAX_PREVIEW_DIMENSION
            && total_width + u64::from(width) <= u64::from(MAX_PREVIEW_DIMENSION);
        if !fits {
            break;
        }
        total_width += u64::from(width);
        start = index;
    }

    if start == dimensions.len() && !dimensions.is_empty() {
        let (width, height) = dimensions[dimensions.len() - 1];
        return Err(ClientError::Validation(format!(
            "image of {}x{} is too large for a preview (max {} pixels per side)",
            width, height, MAX_PREVIEW_DIMENSION
        ))
        .into());
    }
    Ok(start)
}

/// Pastes the images left to right on a black canvas as tall as the tallest one.
pub fn stitch_horizontally(images: &[DynamicImage]) -> RgbImage {
    let total_width = images.iter().map(|i| i.width()).sum();
    let max_height = images.iter().map(|i| i.height()).max().unwrap_or(0);
    let mut canvas = RgbImage::new(total_width, max_height);

    let mut x_offset = 0i64;
    for img in images {
        imageops::replace(&mut canvas, &img.to_rgb8(), x_offset, 0);
        x_offset += i64::from(img.width());
    }
    canvas
}

/// Writes the side-by-side composite of the output directory. Returns `None`
/// when there is nothing to stitch.
pub fn write_preview(output_dir: &Path) -> Result<Option<PathBuf>> {
    let images = load_output_images(output_dir)?;
    if images.is_empty() {
        warn!("No images in {:?} to preview", output_dir);
        return Ok(None);
    }

    let dimensions: Vec<(u32, u32)> = images.iter().map(|i| (i.width(), i.height())).collect();
    let start = preview_window(&dimensions)?;
    if start > 0 {
        warn!(
            "Preview limited to the last {} of {} images in {:?}",
            images.len() - start,
            images.len(),
            output_dir
        );
    }
    let images = &images[start..];

    let composite = stitch_horizontally(images);
    let path = preview_path(output_dir);
    if let Some(parent) = path.parent() {
        ensure_dir(parent)?;
    }
    composite
        .save(&path)
        .with_context(|| format!("Failed to save preview to {:?}", path))?;
    info!("Saved preview of {} images to {:?}", images.len(), path);
    Ok(Some(path))
}

/// Opens `path` with the platform's default viewer without waiting for it.
pub fn show_image(path: &Path) -> Result<()> {
    let mut command = if cfg!(target_os = "macos") {
        Command::new("open")
    } else if cfg!(target_os = "windows") {
        let mut command = Command::new("cmd");
        command.args(["/C", "start", ""]);
        command
    } else {
        Command::new("xdg-open")
    };
    command
        .arg(path)
        .spawn()
        .with_context(|| format!("Failed to open image viewer for {:?}", path))?;
    debug!("Opened viewer for {:?}", path);
    Ok(())
}
