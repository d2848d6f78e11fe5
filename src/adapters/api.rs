use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use std::path::Path;

#[cfg(test)]
use mockall::automock;

/// A single training image, already read from disk.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageUpload {
    pub file_name: String,
    pub mime: &'static str,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrainRequest {
    pub train_id: String,
    pub class_name: String,
    pub epochs: u32,
    pub text_encoder_steps: u32,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InferRequest {
    pub train_id: String,
    pub prompt: String,
    pub num_samples: u32,
    pub seed: u64,
    pub guidance_scale: u32,
    pub callback_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct CreatedJob {
    pub train_id: String,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct SubmittedInference {
    pub infer_id: String,
}

/// Training is finished once the service reports a `model_uri`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct TrainStatus {
    #[serde(default)]
    pub model_uri: Option<String>,
}

/// Inference is finished once the service reports `infer_uris`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct InferStatus {
    #[serde(default)]
    pub infer_uris: Option<Vec<String>>,
}

impl TrainStatus {
    pub fn completed(&self) -> bool {
        self.model_uri.is_some()
    }
}

impl InferStatus {
    pub fn completed(&self) -> bool {
        self.infer_uris.is_some()
    }
}

/// The remote training/inference service. One method per endpoint; the
/// session sequences them.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ImageModelApi {
    async fn create_train_job(&self) -> Result<CreatedJob>;

    async fn upload_image(&self, train_id: &str, image: ImageUpload) -> Result<()>;

    async fn run_training(&self, request: &TrainRequest) -> Result<()>;

    async fn train_status(&self, train_id: &str) -> Result<TrainStatus>;

    async fn infer(&self, request: &InferRequest) -> Result<SubmittedInference>;

    async fn inference_status(&self, infer_id: &str) -> Result<InferStatus>;

    async fn delete_train_job(&self, train_id: &str) -> Result<Value>;

    /// Fetches `url` into `dest`, returning the number of bytes written.
    async fn download(&self, url: &str, dest: &Path) -> Result<u64>;
}
