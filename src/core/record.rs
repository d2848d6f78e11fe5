use crate::error::ClientError;
use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::Path;

const TRAIN_ID_KEY: &str = "train_id";
const CLASS_NAME_KEY: &str = "class_name";

/// The two facts needed to resume work on an existing train job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobRecord {
    pub train_id: String,
    pub class_name: String,
}

impl JobRecord {
    pub fn new(train_id: impl Into<String>, class_name: impl Into<String>) -> Self {
        Self {
            train_id: train_id.into(),
            class_name: class_name.into(),
        }
    }

    pub fn to_record_string(&self) -> String {
        format!(
            "{}:{}\n{}:{}",
            TRAIN_ID_KEY, self.train_id, CLASS_NAME_KEY, self.class_name
        )
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut train_id = None;
        let mut class_name = None;

        for (number, line) in text.lines().enumerate() {
            let line = line.trim_end();
            if line.trim().is_empty() {
                continue;
            }
            let (key, value) = line.split_once(':').ok_or_else(|| {
                ClientError::Configuration(format!(
                    "record line {} is not `key:value`: {:?}",
                    number + 1,
                    line
                ))
            })?;
            match key.trim() {
                TRAIN_ID_KEY => train_id = Some(value.trim().to_string()),
                CLASS_NAME_KEY => class_name = Some(value.trim().to_string()),
                other => {
                    return Err(ClientError::Configuration(format!(
                        "unknown key {:?} in record",
                        other
                    ))
                    .into())
                }
            }
        }

        let train_id = required(train_id, TRAIN_ID_KEY)?;
        let class_name = required(class_name, CLASS_NAME_KEY)?;
        Ok(Self { train_id, class_name })
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| {
            ClientError::Configuration(format!("cannot read job record {:?}: {}", path, e))
        })?;
        let record = Self::parse(&text).with_context(|| format!("Invalid job record {:?}", path))?;
        info!("Loaded train job {} ({}) from {:?}", record.train_id, record.class_name, path);
        Ok(record)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create directory: {:?}", parent))?;
            }
        }
        fs::write(path, self.to_record_string())
            .with_context(|| format!("Failed to write job record {:?}", path))?;
        info!("Saved train job {} to {:?}", self.train_id, path);
        Ok(())
    }
}

fn required(value: Option<String>, key: &str) -> Result<String> {
    match value {
        Some(value) if !value.is_empty() => Ok(value),
        _ => Err(ClientError::Configuration(format!("record is missing `{}`", key)).into()),
    }
}
