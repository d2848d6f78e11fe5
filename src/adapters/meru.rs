use super::api::{
    CreatedJob, ImageModelApi, ImageUpload, InferRequest, InferStatus, SubmittedInference,
    TrainRequest, TrainStatus,
};
use crate::error::ClientError;
use anyhow::{Context, Result};
use async_trait::async_trait;
use log::{debug, error, info};
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::multipart::{Form, Part};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

pub const DEFAULT_BASE_URL: &str = "https://api.usemeru.com";
pub const API_KEY_HEADER: &str = "x-api-key";

/// HTTP client for the Meru training and inference API. Every POST is a
/// multipart form, authenticated with the `x-api-key` header.
pub struct MeruClient {
    client: reqwest::Client,
    base_url: String,
    headers: HeaderMap,
}

impl MeruClient {
    pub fn new(api_key: &str) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            headers: generate_headers(api_key)?,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// POSTs to `path`, as a multipart form when `form` is given and with an
    /// empty body otherwise.
    async fn send_post(&self, path: &str, form: Option<Form>) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(self.endpoint(path))
            .headers(self.headers.clone());
        if let Some(form) = form {
            request = request.multipart(form);
        }
        let response = request
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", path))?;

        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .with_context(|| format!("Failed to get error text from {}", path))?;
            error!("Request to {} failed with {}: {}", path, status, error_text);
            Err(ClientError::remote(path, format!("{}: {}", status, error_text)).into())
        }
    }

    async fn send_form(&self, path: &str, form: Form) -> Result<reqwest::Response> {
        self.send_post(path, Some(form)).await
    }

    async fn decode<T: DeserializeOwned>(path: &str, response: reqwest::Response) -> Result<T> {
        let body = response
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", path))?;
        debug!("Response from {}: {}", path, body);
        serde_json::from_str(&body).map_err(|e| {
            error!("Malformed JSON from {}: {}", path, e);
            ClientError::remote(path, format!("malformed JSON body: {}", e)).into()
        })
    }

    async fn post_form<T: DeserializeOwned>(&self, path: &str, form: Form) -> Result<T> {
        let response = self.send_form(path, form).await?;
        Self::decode(path, response).await
    }
}

pub fn generate_headers(api_key: &str) -> Result<HeaderMap> {
    let api_key = api_key.trim();
    if api_key.is_empty() {
        return Err(ClientError::Configuration("API key must not be empty".to_string()).into());
    }
    let mut value = HeaderValue::from_str(api_key)
        .map_err(|_| ClientError::Configuration("API key is not a valid header value".to_string()))?;
    value.set_sensitive(true);
    let mut headers = HeaderMap::new();
    headers.insert(API_KEY_HEADER, value);
    Ok(headers)
}

pub fn train_form_fields(request: &TrainRequest) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("train_id", request.train_id.clone()),
        ("class", request.class_name.clone()),
        ("epochs", request.epochs.to_string()),
        ("text_enc", request.text_encoder_steps.to_string()),
    ];
    if let Some(callback) = &request.callback_url {
        fields.push(("callback", callback.clone()));
    }
    fields
}

pub fn infer_form_fields(request: &InferRequest) -> Vec<(&'static str, String)> {
    let mut fields = vec![
        ("train_id", request.train_id.clone()),
        ("prompt", request.prompt.clone()),
        ("num_samples", request.num_samples.to_string()),
        ("seed", request.seed.to_string()),
        ("guidance_scale", request.guidance_scale.to_string()),
    ];
    if let Some(callback) = &request.callback_url {
        fields.push(("callback", callback.clone()));
    }
    fields
}

fn text_form(fields: Vec<(&'static str, String)>) -> Form {
    fields
        .into_iter()
        .fold(Form::new(), |form, (name, value)| form.text(name, value))
}

#[async_trait]
impl ImageModelApi for MeruClient {
    async fn create_train_job(&self) -> Result<CreatedJob> {
        let response = self.send_post("/train/create", None).await?;
        let job: CreatedJob = Self::decode("/train/create", response).await?;
        info!("Created train job {}", job.train_id);
        Ok(job)
    }

    async fn upload_image(&self, train_id: &str, image: ImageUpload) -> Result<()> {
        let file_name = image.file_name.clone();
        let part = Part::bytes(image.bytes)
            .file_name(image.file_name)
            .mime_str(image.mime)
            .context("Failed to set MIME type")?;
        let form = Form::new()
            .text("train_id", train_id.to_string())
            .part("images", part);
        self.send_form("/train/upload", form).await?;
        debug!("Uploaded {} to train job {}", file_name, train_id);
        Ok(())
    }

    async fn run_training(&self, request: &TrainRequest) -> Result<()> {
        self.send_form("/train/run", text_form(train_form_fields(request)))
            .await?;
        info!("Training started for {}", request.train_id);
        Ok(())
    }

    async fn train_status(&self, train_id: &str) -> Result<TrainStatus> {
        let form = text_form(vec![("train_id", train_id.to_string())]);
        self.post_form("/train/status", form).await
    }

    async fn infer(&self, request: &InferRequest) -> Result<SubmittedInference> {
        let submitted: SubmittedInference = self
            .post_form("/inference/infer", text_form(infer_form_fields(request)))
            .await?;
        info!("Submitted inference {}", submitted.infer_id);
        Ok(submitted)
    }

    async fn inference_status(&self, infer_id: &str) -> Result<InferStatus> {
        let form = text_form(vec![("infer_id", infer_id.to_string())]);
        self.post_form("/inference/status", form).await
    }

    async fn delete_train_job(&self, train_id: &str) -> Result<Value> {
        let form = text_form(vec![("train_id", train_id.to_string())]);
        self.post_form("/train/delete", form).await
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<u64> {
        let mut response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("Failed to send download request for {}", url))?;

        if !response.status().is_success() {
            let status = response.status();
            error!("Download of {} failed with {}", url, status);
            return Err(ClientError::remote(url, format!("download failed: {}", status)).into());
        }

        let partial = partial_path(dest);
        match write_body(&mut response, &partial).await {
            Ok(written) => {
                if let Err(e) = tokio::fs::rename(&partial, dest).await {
                    let _ = tokio::fs::remove_file(&partial).await;
                    return Err(e).with_context(|| format!("Failed to move download into {:?}", dest));
                }
                debug!("Downloaded {} bytes from {} to {:?}", written, url, dest);
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e).with_context(|| format!("Failed to download {}", url))
            }
        }
    }
}

/// Sibling of `dest` that receives the body until it is complete.
pub fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

async fn write_body(response: &mut reqwest::Response, path: &Path) -> Result<u64> {
    let mut file = tokio::fs::File::create(path)
        .await
        .with_context(|| format!("Failed to create file: {:?}", path))?;
    let mut written = 0u64;
    while let Some(chunk) = response
        .chunk()
        .await
        .context("Failed to read download body")?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("Failed to write to file: {:?}", path))?;
        written += chunk.len() as u64;
    }
    file.flush()
        .await
        .with_context(|| format!("Failed to flush file: {:?}", path))?;
    Ok(written)
}
