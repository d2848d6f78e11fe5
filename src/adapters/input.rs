use crate::adapters::api::ImageUpload;
use crate::error::ClientError;
use anyhow::{Context, Result};
use image::ImageFormat;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};

/// Collects the training images from a directory. Files qualify by their
/// content (PNG or JPEG signature), never by extension.
pub struct ImageInputAdapter {
    input_folder: PathBuf,
}

impl ImageInputAdapter {
    pub fn new(input_folder: PathBuf) -> Self {
        info!("Creating new ImageInputAdapter with input folder: {:?}", input_folder);
        Self { input_folder }
    }

    fn list_regular_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(&self.input_folder)
            .with_context(|| format!("Failed to read directory: {:?}", self.input_folder))?
        {
            let entry = entry.context("Failed to read directory entry")?;
            let path = entry.path();
            if path.is_file() {
                files.push(path);
            }
        }
        files.sort();
        Ok(files)
    }

    /// Reads every PNG/JPEG file in the folder, in file-name order.
    pub fn fetch_images(&self) -> Result<Vec<ImageUpload>> {
        info!("Reading images from folder: {:?}", self.input_folder);
        let mut images = Vec::new();
        for path in self.list_regular_files()? {
            let bytes = fs::read(&path).with_context(|| format!("Failed to read file: {:?}", path))?;
            match sniff_mime(&bytes) {
                Some(mime) => {
                    debug!("Accepted {:?} as {}", path, mime);
                    images.push(ImageUpload {
                        file_name: file_name_of(&path)?,
                        mime,
                        bytes,
                    });
                }
                None => debug!("Skipping non-image file: {:?}", path),
            }
        }

        if images.is_empty() {
            return Err(ClientError::Validation(format!(
                "Make sure you have PNG or JPEG image files stored in {:?}",
                self.input_folder
            ))
            .into());
        }
        info!("Found {} images in folder", images.len());
        Ok(images)
    }
}

/// MIME type for the training formats the service accepts.
pub fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => Some("image/png"),
        Ok(ImageFormat::Jpeg) => Some("image/jpeg"),
        _ => None,
    }
}

fn file_name_of(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .with_context(|| format!("Failed to get file name of {:?}", path))
}
