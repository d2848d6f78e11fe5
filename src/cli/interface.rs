use crate::adapters::meru::MeruClient;
use crate::adapters::output::ImageNaming;
use crate::core::session::{PromptOptions, Session, SessionConfig, TrainOptions};
use crate::utils::input::{input_api_key, input_class_name};
use crate::utils::lib::*;
use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use std::env;
use tokio::time::Duration;

pub async fn run_cli_interface() -> Result<()> {
    let args = Args::parse();

    let api_key = match resolve_api_key(args.api_key.clone(), env::var(LEGACY_API_KEY_ENV).ok()) {
        Some(key) => key,
        None => input_api_key().context("Failed to read API key")?,
    };
    let client = MeruClient::new(&api_key)?.with_base_url(args.base_url.clone());

    let create = args.new || matches!(args.command, Command::Create);
    let class_name = if create && args.class_name.is_none() {
        Some(input_class_name().context("Failed to read class name")?)
    } else {
        args.class_name.clone()
    };

    let session = Session::initialize(client, session_config(&args), !create, class_name)
        .await
        .context("Failed to initialize session")?;
    info!("Using train job {} ({})", session.train_id(), session.class_name());

    match args.command {
        Command::Create => {
            println!("train_id:{}", session.train_id());
        }
        Command::Upload => {
            session.upload_images().await.context("Failed to upload images")?;
        }
        Command::Train {
            epochs,
            text_enc,
            callback_url,
            skip_download,
            model_dir,
        } => {
            let options = TrainOptions {
                epochs,
                text_encoder_steps: text_enc,
                callback_url,
                download_model: !skip_download,
                download_dir: model_dir,
            };
            let outcome = session.train(&options).await.context("Failed to train model")?;
            println!("model_uri:{}", outcome.model_uri);
        }
        Command::Status => {
            let status = session.status().await?;
            match status.model_uri {
                Some(uri) => println!("trained: {}", uri),
                None => println!("training not finished"),
            }
        }
        Command::Download { model_dir } => {
            let path = session
                .download_model(&model_dir)
                .await
                .context("Failed to download model")?;
            println!("{}", path.display());
        }
        Command::Delete => {
            let response = session.delete_model().await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&response).context("Failed to format response")?
            );
        }
        Command::Prompt { prompt, options } => {
            let outcome = session
                .prompt_once(&prompt, &prompt_options(options))
                .await
                .context("Failed to run prompt")?;
            report_images(&outcome.images);
        }
        Command::PromptFile { path, options } => {
            let outcomes = session
                .prompt_from_file(&path, &prompt_options(options))
                .await
                .context("Failed to run prompt file")?;
            for outcome in outcomes {
                report_images(&outcome.images);
            }
        }
    }

    Ok(())
}

fn session_config(args: &Args) -> SessionConfig {
    SessionConfig {
        input_dir: args.input.clone(),
        output_dir: args.output.clone(),
        record_path: args.record.clone(),
        naming: if args.timestamped {
            ImageNaming::Timestamped
        } else {
            ImageNaming::Indexed
        },
        train_poll: PollPolicy::new(
            Duration::from_secs(args.train_poll_secs),
            args.train_poll_attempts,
        ),
        infer_poll: PollPolicy::new(
            Duration::from_secs(args.infer_poll_secs),
            args.infer_poll_attempts,
        ),
    }
}

fn prompt_options(args: PromptArgs) -> PromptOptions {
    PromptOptions {
        num_samples: args.num_samples,
        seed: args.seed,
        guidance_scale: args.guidance_scale,
        callback_url: args.callback_url,
        show: args.show,
    }
}

fn report_images(images: &[std::path::PathBuf]) {
    for image in images {
        println!("{}", image.display());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamped_flag_selects_naming() {
        let args = Args::try_parse_from(["meruassimilator", "--timestamped", "--infer-poll-secs", "5", "status"])
            .unwrap();
        let config = session_config(&args);
        assert_eq!(config.naming, ImageNaming::Timestamped);
        assert_eq!(config.infer_poll.interval, Duration::from_secs(5));
        assert_eq!(config.train_poll, PollPolicy::training());
    }

    #[test]
    fn prompt_args_map_across() {
        let options = prompt_options(PromptArgs {
            num_samples: 4,
            seed: 7,
            guidance_scale: 12,
            callback_url: Some("https://example.com/cb".to_string()),
            show: true,
        });
        assert_eq!(options.num_samples, 4);
        assert_eq!(options.seed, 7);
        assert_eq!(options.guidance_scale, 12);
        assert!(options.show);
    }
}
