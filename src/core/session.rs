use crate::adapters::api::{ImageModelApi, InferRequest, TrainRequest, TrainStatus};
use crate::adapters::input::ImageInputAdapter;
use crate::adapters::output::{model_file_path, show_image, write_preview, ImageNaming};
use crate::core::record::JobRecord;
use crate::error::ClientError;
use crate::utils::lib::{ensure_dir, poll_until, PollPolicy};
use anyhow::{Context, Result};
use log::{debug, info};
use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub input_dir: PathBuf,
    pub output_dir: PathBuf,
    pub record_path: PathBuf,
    pub naming: ImageNaming,
    pub train_poll: PollPolicy,
    pub infer_poll: PollPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            input_dir: PathBuf::from("input"),
            output_dir: PathBuf::from("output"),
            record_path: PathBuf::from("model_details.txt"),
            naming: ImageNaming::default(),
            train_poll: PollPolicy::training(),
            infer_poll: PollPolicy::inference(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub epochs: u32,
    pub text_encoder_steps: u32,
    pub callback_url: Option<String>,
    pub download_model: bool,
    pub download_dir: PathBuf,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            epochs: 1600,
            text_encoder_steps: 100,
            callback_url: None,
            download_model: true,
            download_dir: PathBuf::from("img_model"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrainOutcome {
    pub model_uri: String,
    pub model_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PromptOptions {
    pub num_samples: u32,
    pub seed: u64,
    pub guidance_scale: u32,
    pub callback_url: Option<String>,
    pub show: bool,
}

impl Default for PromptOptions {
    fn default() -> Self {
        Self {
            num_samples: 1,
            seed: 42,
            guidance_scale: 10,
            callback_url: None,
            show: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PromptOutcome {
    pub prompt: String,
    pub images: Vec<PathBuf>,
    pub preview: Option<PathBuf>,
}

/// A train job on the remote service plus the local directories it reads
/// from and writes to. Every operation runs to completion, poll loops
/// included, before returning.
pub struct Session<A: ImageModelApi> {
    api: A,
    record: JobRecord,
    config: SessionConfig,
}

impl<A: ImageModelApi + Sync> Session<A> {
    pub fn from_record(api: A, record: JobRecord, config: SessionConfig) -> Self {
        Self { api, record, config }
    }

    /// Loads the job record at `config.record_path`, or creates a new train
    /// job for `class_name` and persists it there.
    pub async fn initialize(
        api: A,
        config: SessionConfig,
        load_existing: bool,
        class_name: Option<String>,
    ) -> Result<Self> {
        if load_existing {
            let record = JobRecord::load(&config.record_path)?;
            return Ok(Self::from_record(api, record, config));
        }

        let class_name = validate_class_name(class_name)?;
        let created = api
            .create_train_job()
            .await
            .context("Failed to create train job")?;
        let record = JobRecord::new(created.train_id, class_name);
        record.save(&config.record_path)?;
        Ok(Self::from_record(api, record, config))
    }

    pub fn train_id(&self) -> &str {
        &self.record.train_id
    }

    pub fn class_name(&self) -> &str {
        &self.record.class_name
    }

    pub fn record(&self) -> &JobRecord {
        &self.record
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Uploads every PNG/JPEG in the input directory, one request per file.
    pub async fn upload_images(&self) -> Result<usize> {
        let images = ImageInputAdapter::new(self.config.input_dir.clone()).fetch_images()?;
        let total = images.len();
        for image in images {
            info!("Posting: {}", image.file_name);
            let file_name = image.file_name.clone();
            self.api
                .upload_image(self.train_id(), image)
                .await
                .with_context(|| format!("Failed to upload {}", file_name))?;
        }
        info!("Uploaded {} images", total);
        Ok(total)
    }

    pub async fn train(&self, options: &TrainOptions) -> Result<TrainOutcome> {
        self.upload_images().await?;

        let request = TrainRequest {
            train_id: self.record.train_id.clone(),
            class_name: self.record.class_name.clone(),
            epochs: options.epochs,
            text_encoder_steps: options.text_encoder_steps,
            callback_url: options.callback_url.clone(),
        };
        self.api
            .run_training(&request)
            .await
            .context("Failed to start training")?;
        info!("Starting to train with id: {}", self.train_id());

        let api = &self.api;
        let train_id = self.train_id();
        let model_uri = poll_until("training", self.config.train_poll, move || async move {
            api.train_status(train_id).await.map(|status| status.model_uri)
        })
        .await?;
        info!("Model trained: {}", model_uri);

        let model_path = if options.download_model {
            Some(self.fetch_model(&model_uri, &options.download_dir).await?)
        } else {
            None
        };
        Ok(TrainOutcome { model_uri, model_path })
    }

    pub async fn status(&self) -> Result<TrainStatus> {
        self.api
            .train_status(self.train_id())
            .await
            .context("Failed to fetch training status")
    }

    /// Saves the trained checkpoint as `{output_dir}/{class_name}_img_model.ckpt`.
    pub async fn download_model(&self, output_dir: &Path) -> Result<PathBuf> {
        let status = self.status().await?;
        let model_uri = status.model_uri.ok_or_else(|| {
            ClientError::Validation(format!(
                "train job {} has not produced a model yet",
                self.train_id()
            ))
        })?;
        self.fetch_model(&model_uri, output_dir).await
    }

    async fn fetch_model(&self, model_uri: &str, output_dir: &Path) -> Result<PathBuf> {
        ensure_dir(output_dir)?;
        let path = model_file_path(output_dir, self.class_name());
        let bytes = self
            .api
            .download(model_uri, &path)
            .await
            .context("Failed to download model")?;
        info!("Saved model ({} bytes) to {:?}", bytes, path);
        Ok(path)
    }

    pub async fn delete_model(&self) -> Result<Value> {
        info!("Deleting model with train_id: {}", self.train_id());
        self.api
            .delete_train_job(self.train_id())
            .await
            .context("Failed to delete train job")
    }

    /// Runs inference for `prompt` and saves the images into the output
    /// directory. The prompt must mention the class name.
    pub async fn get_images(&self, prompt: &str, options: &PromptOptions) -> Result<Vec<PathBuf>> {
        if !prompt.contains(self.class_name()) {
            return Err(ClientError::Validation(format!(
                "Please make sure your class name: {} is in the prompt",
                self.class_name()
            ))
            .into());
        }

        info!("Running inference on: {}", prompt);
        let request = InferRequest {
            train_id: self.record.train_id.clone(),
            prompt: prompt.to_string(),
            num_samples: options.num_samples,
            seed: options.seed,
            guidance_scale: options.guidance_scale,
            callback_url: options.callback_url.clone(),
        };
        let submitted = self
            .api
            .infer(&request)
            .await
            .context("Failed to submit inference")?;

        let api = &self.api;
        let infer_id = submitted.infer_id.as_str();
        let uris = poll_until("inference", self.config.infer_poll, move || async move {
            api.inference_status(infer_id).await.map(|status| status.infer_uris)
        })
        .await?;

        let output_dir = &self.config.output_dir;
        ensure_dir(output_dir)?;
        let names = self.config.naming.file_names(infer_id, uris.len());
        let mut saved = Vec::with_capacity(uris.len());
        for (uri, name) in uris.iter().zip(names) {
            let path = output_dir.join(name);
            self.api
                .download(uri, &path)
                .await
                .with_context(|| format!("Failed to download image {}", uri))?;
            debug!("Saved {} to {:?}", uri, path);
            saved.push(path);
        }
        info!("Images saved to: {:?}", output_dir);
        if self.config.naming == ImageNaming::Indexed {
            info!("Move them before prompting again or they will be overwritten");
        }
        Ok(saved)
    }

    /// `get_images` followed by a side-by-side preview of the output directory.
    pub async fn prompt_once(&self, prompt: &str, options: &PromptOptions) -> Result<PromptOutcome> {
        let images = self.get_images(prompt, options).await?;
        let preview = write_preview(&self.config.output_dir)?;
        if options.show {
            if let Some(path) = &preview {
                show_image(path)?;
            }
        }
        Ok(PromptOutcome {
            prompt: prompt.to_string(),
            images,
            preview,
        })
    }

    /// Runs `prompt_once` for each non-blank line of `path`, stopping at the
    /// first failure.
    pub async fn prompt_from_file(&self, path: &Path, options: &PromptOptions) -> Result<Vec<PromptOutcome>> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read prompt file: {:?}", path))?;
        let prompts: Vec<&str> = text
            .lines()
            .map(str::trim_end)
            .filter(|line| !line.trim().is_empty())
            .collect();
        info!("Read {} prompts from {:?}", prompts.len(), path);

        let mut outcomes = Vec::with_capacity(prompts.len());
        for prompt in prompts {
            outcomes.push(self.prompt_once(prompt, options).await?);
            info!("----------------------------------------------------------------");
        }
        Ok(outcomes)
    }
}

fn validate_class_name(class_name: Option<String>) -> Result<String> {
    let class_name = class_name.ok_or_else(|| {
        ClientError::Configuration("a class name is required to create a train job".to_string())
    })?;
    let class_name = class_name.trim();
    if class_name.is_empty() || class_name.contains(['\n', '\r']) {
        return Err(ClientError::Validation(format!(
            "invalid class name {:?}",
            class_name
        ))
        .into());
    }
    Ok(class_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::api::{CreatedJob, InferStatus, MockImageModelApi, SubmittedInference};
    use crate::error::client_error;
    use image::{Rgb, RgbImage};
    use serde_json::json;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Fixture {
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            fs::create_dir(dir.path().join("input")).unwrap();
            Self { dir }
        }

        fn config(&self) -> SessionConfig {
            SessionConfig {
                input_dir: self.dir.path().join("input"),
                output_dir: self.dir.path().join("output"),
                record_path: self.dir.path().join("model_details.txt"),
                naming: ImageNaming::Indexed,
                train_poll: PollPolicy::new(Duration::from_millis(1), 5),
                infer_poll: PollPolicy::new(Duration::from_millis(1), 5),
            }
        }

        fn session(&self, api: MockImageModelApi) -> Session<MockImageModelApi> {
            Session::from_record(api, JobRecord::new("abc123", "dog"), self.config())
        }

        fn input_image(&self, name: &str) {
            RgbImage::from_pixel(2, 2, Rgb([0, 120, 0]))
                .save(self.dir.path().join("input").join(name))
                .unwrap();
        }
    }

    fn write_fake_jpeg(dest: &Path) -> u64 {
        RgbImage::from_pixel(2, 3, Rgb([90, 90, 200])).save(dest).unwrap();
        fs::metadata(dest).unwrap().len()
    }

    fn kind(err: &anyhow::Error) -> Option<&ClientError> {
        client_error(err)
    }

    #[tokio::test]
    async fn loads_existing_record_without_remote_calls() {
        let fixture = Fixture::new();
        fs::write(fixture.config().record_path, "train_id:abc123\nclass_name:dog").unwrap();

        let session = Session::initialize(MockImageModelApi::new(), fixture.config(), true, None)
            .await
            .unwrap();
        assert_eq!(session.train_id(), "abc123");
        assert_eq!(session.class_name(), "dog");
    }

    #[tokio::test]
    async fn missing_record_is_a_configuration_error() {
        let fixture = Fixture::new();
        let err = Session::initialize(MockImageModelApi::new(), fixture.config(), true, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(kind(&err), Some(ClientError::Configuration(_))));
    }

    #[tokio::test]
    async fn new_session_creates_and_persists_job() {
        let fixture = Fixture::new();
        let mut api = MockImageModelApi::new();
        api.expect_create_train_job().times(1).returning(|| {
            Ok(CreatedJob {
                train_id: "t-789".to_string(),
            })
        });

        let session = Session::initialize(api, fixture.config(), false, Some(" cat ".to_string()))
            .await
            .unwrap();
        assert_eq!(session.record(), &JobRecord::new("t-789", "cat"));
        assert_eq!(
            JobRecord::load(&fixture.config().record_path).unwrap(),
            JobRecord::new("t-789", "cat")
        );
    }

    #[tokio::test]
    async fn new_session_needs_a_class_name() {
        let fixture = Fixture::new();
        let err = Session::initialize(MockImageModelApi::new(), fixture.config(), false, None)
            .await
            .err()
            .unwrap();
        assert!(matches!(kind(&err), Some(ClientError::Configuration(_))));

        let err = Session::initialize(MockImageModelApi::new(), fixture.config(), false, Some("  ".into()))
            .await
            .err()
            .unwrap();
        assert!(matches!(kind(&err), Some(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn uploads_only_images() {
        let fixture = Fixture::new();
        fixture.input_image("a.png");
        fixture.input_image("b.jpg");
        fs::write(fixture.dir.path().join("input/notes.txt"), "remember the dog").unwrap();

        let mut api = MockImageModelApi::new();
        api.expect_upload_image()
            .withf(|train_id, image| train_id == "abc123" && image.file_name != "notes.txt")
            .times(2)
            .returning(|_, _| Ok(()));

        let uploaded = fixture.session(api).upload_images().await.unwrap();
        assert_eq!(uploaded, 2);
    }

    #[tokio::test]
    async fn upload_without_images_fails_before_any_request() {
        let fixture = Fixture::new();
        fs::write(fixture.dir.path().join("input/notes.txt"), "no pictures").unwrap();

        let err = fixture
            .session(MockImageModelApi::new())
            .upload_images()
            .await
            .unwrap_err();
        assert!(matches!(kind(&err), Some(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn train_polls_until_model_uri_then_downloads() {
        let fixture = Fixture::new();
        fixture.input_image("a.png");

        let mut api = MockImageModelApi::new();
        api.expect_upload_image().times(1).returning(|_, _| Ok(()));
        api.expect_run_training()
            .withf(|request| {
                request.train_id == "abc123"
                    && request.class_name == "dog"
                    && request.epochs == 800
                    && request.text_encoder_steps == 100
                    && request.callback_url.is_none()
            })
            .times(1)
            .returning(|_| Ok(()));
        let mut polls = 0;
        api.expect_train_status().times(3).returning(move |_| {
            polls += 1;
            Ok(TrainStatus {
                model_uri: (polls == 3).then(|| "https://cdn.example/dog.ckpt".to_string()),
            })
        });
        let model_dir = fixture.dir.path().join("img_model");
        let expected = model_dir.join("dog_img_model.ckpt");
        api.expect_download()
            .withf(move |url, dest| url == "https://cdn.example/dog.ckpt" && dest == expected)
            .times(1)
            .returning(|_, _| Ok(1024));

        let options = TrainOptions {
            epochs: 800,
            download_dir: model_dir.clone(),
            ..TrainOptions::default()
        };
        let outcome = fixture.session(api).train(&options).await.unwrap();
        assert_eq!(outcome.model_uri, "https://cdn.example/dog.ckpt");
        assert_eq!(outcome.model_path, Some(model_dir.join("dog_img_model.ckpt")));
        assert!(model_dir.is_dir());
    }

    #[tokio::test]
    async fn training_that_never_finishes_times_out() {
        let fixture = Fixture::new();
        fixture.input_image("a.png");

        let mut api = MockImageModelApi::new();
        api.expect_upload_image().returning(|_, _| Ok(()));
        api.expect_run_training().returning(|_| Ok(()));
        api.expect_train_status()
            .times(5)
            .returning(|_| Ok(TrainStatus::default()));

        let options = TrainOptions {
            download_model: false,
            ..TrainOptions::default()
        };
        let err = fixture.session(api).train(&options).await.unwrap_err();
        assert!(matches!(
            kind(&err),
            Some(ClientError::Timeout { attempts: 5, .. })
        ));
    }

    #[tokio::test]
    async fn download_before_training_completes_is_rejected() {
        let fixture = Fixture::new();
        let mut api = MockImageModelApi::new();
        api.expect_train_status()
            .returning(|_| Ok(TrainStatus::default()));

        let err = fixture
            .session(api)
            .download_model(&fixture.dir.path().join("img_model"))
            .await
            .unwrap_err();
        assert!(matches!(kind(&err), Some(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn prompt_without_class_name_makes_no_request() {
        let fixture = Fixture::new();
        let err = fixture
            .session(MockImageModelApi::new())
            .get_images("a cat on a skateboard", &PromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(kind(&err), Some(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn get_images_saves_indexed_files() {
        let fixture = Fixture::new();
        let mut api = MockImageModelApi::new();
        api.expect_infer()
            .withf(|request| request.prompt == "a dog on the moon" && request.num_samples == 2)
            .times(1)
            .returning(|_| {
                Ok(SubmittedInference {
                    infer_id: "inf-1".to_string(),
                })
            });
        let mut polls = 0;
        api.expect_inference_status()
            .withf(|infer_id| infer_id == "inf-1")
            .times(2)
            .returning(move |_| {
                polls += 1;
                Ok(InferStatus {
                    infer_uris: (polls == 2).then(|| {
                        vec![
                            "https://cdn.example/0.jpg".to_string(),
                            "https://cdn.example/1.jpg".to_string(),
                        ]
                    }),
                })
            });
        api.expect_download()
            .times(2)
            .returning(|_, dest| Ok(write_fake_jpeg(dest)));

        let options = PromptOptions {
            num_samples: 2,
            ..PromptOptions::default()
        };
        let paths = fixture
            .session(api)
            .get_images("a dog on the moon", &options)
            .await
            .unwrap();
        let output = fixture.dir.path().join("output");
        assert_eq!(
            paths,
            vec![output.join("output_img_0.jpg"), output.join("output_img_1.jpg")]
        );
        assert!(paths.iter().all(|p| p.is_file()));
    }

    #[tokio::test]
    async fn remote_failure_propagates() {
        let fixture = Fixture::new();
        let mut api = MockImageModelApi::new();
        api.expect_infer()
            .returning(|_| Err(ClientError::remote("/inference/infer", "500: boom").into()));

        let err = fixture
            .session(api)
            .get_images("dog portrait", &PromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(kind(&err), Some(ClientError::Remote { .. })));
    }

    #[tokio::test]
    async fn prompt_once_builds_preview() {
        let fixture = Fixture::new();
        let mut api = MockImageModelApi::new();
        api.expect_infer().returning(|_| {
            Ok(SubmittedInference {
                infer_id: "inf-2".to_string(),
            })
        });
        api.expect_inference_status().returning(|_| {
            Ok(InferStatus {
                infer_uris: Some(vec!["https://cdn.example/0.jpg".to_string()]),
            })
        });
        api.expect_download()
            .returning(|_, dest| Ok(write_fake_jpeg(dest)));

        let outcome = fixture
            .session(api)
            .prompt_once("dog in a hat", &PromptOptions::default())
            .await
            .unwrap();
        assert_eq!(outcome.images.len(), 1);
        let preview = outcome.preview.unwrap();
        assert!(preview.ends_with("combined_img_output/combined_img_output.jpg"));
        assert!(preview.is_file());
    }

    #[tokio::test]
    async fn prompt_file_runs_each_line_and_stops_on_bad_prompt() {
        let fixture = Fixture::new();
        let prompts = fixture.dir.path().join("prompts.txt");
        fs::write(&prompts, "a dog in the snow\n\nthe dog asleep\na cat alone\nlast dog\n").unwrap();

        let mut api = MockImageModelApi::new();
        api.expect_infer().times(2).returning(|request| {
            Ok(SubmittedInference {
                infer_id: format!("inf-{}", request.prompt.len()),
            })
        });
        api.expect_inference_status().times(2).returning(|_| {
            Ok(InferStatus {
                infer_uris: Some(vec!["https://cdn.example/0.jpg".to_string()]),
            })
        });
        api.expect_download()
            .times(2)
            .returning(|_, dest| Ok(write_fake_jpeg(dest)));

        let err = fixture
            .session(api)
            .prompt_from_file(&prompts, &PromptOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(kind(&err), Some(ClientError::Validation(_))));
    }

    #[tokio::test]
    async fn delete_returns_server_body() {
        let fixture = Fixture::new();
        let mut api = MockImageModelApi::new();
        api.expect_delete_train_job()
            .withf(|train_id| train_id == "abc123")
            .times(1)
            .returning(|_| Ok(json!({"deleted": true})));

        let body = fixture.session(api).delete_model().await.unwrap();
        assert_eq!(body, json!({"deleted": true}));
    }
}
