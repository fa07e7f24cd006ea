use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use clap::{Parser, Subcommand};
use facegate_core::models::{self, MODELS};
use facegate_core::BURST_SIZE;
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facegate", about = "facegate face verification CLI")]
struct Cli {
    /// Base URL of the facegated HTTP API
    #[arg(long, global = true, default_value = "http://127.0.0.1:8080")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register an account with a reference face
    Register {
        #[arg(long)]
        email: String,
        #[arg(long)]
        first_name: String,
        #[arg(long)]
        last_name: String,
        /// JPEG file to upload as the reference image
        #[arg(long, conflicts_with = "image_url", required_unless_present = "image_url")]
        image: Option<PathBuf>,
        /// Remote reference image; fetched by the daemon on each verification
        #[arg(long)]
        image_url: Option<String>,
    },
    /// Verify a burst of five JPEG frames against a registered account
    Verify {
        #[arg(long)]
        email: String,
        /// Frame files, in capture order
        #[arg(num_args = BURST_SIZE, required = true)]
        frames: Vec<PathBuf>,
    },
    /// Show daemon status
    Status,
    /// Check that the ONNX models are present with the expected checksums
    CheckModels {
        /// Model directory (default: $XDG_DATA_HOME/facegate/models)
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = reqwest::Client::new();

    match cli.command {
        Commands::Register {
            email,
            first_name,
            last_name,
            image,
            image_url,
        } => {
            let mut body = json!({
                "email": email,
                "first_name": first_name,
                "last_name": last_name,
            });
            match (image, image_url) {
                (Some(path), _) => body["encoded_facial_image"] = json!(encode_jpeg_file(&path)?),
                (None, Some(url)) => body["facial_image_url"] = json!(url),
                (None, None) => bail!("one of --image or --image-url is required"),
            }

            let reply = post(&client, &cli.server, "/register", &body).await?;
            println!("{}", reply["message"].as_str().unwrap_or("registered"));
        }
        Commands::Verify { email, frames } => {
            let encoded = frames
                .iter()
                .map(|path| encode_jpeg_file(path))
                .collect::<Result<Vec<_>>>()?;

            let reply = post(
                &client,
                &cli.server,
                "/verify",
                &json!({ "email": email, "frames": encoded }),
            )
            .await?;
            println!(
                "verified: {} {} <{}>",
                reply["first_name"].as_str().unwrap_or_default(),
                reply["last_name"].as_str().unwrap_or_default(),
                reply["email"].as_str().unwrap_or_default(),
            );
        }
        Commands::Status => {
            let url = format!("{}/status", cli.server.trim_end_matches('/'));
            tracing::debug!(%url, "querying facegated status");
            let status: Value = client
                .get(&url)
                .send()
                .await
                .with_context(|| format!("failed to reach facegated at {url}"))?
                .error_for_status()?
                .json()
                .await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Commands::CheckModels { model_dir } => {
            let dir = model_dir.unwrap_or_else(models::default_model_dir);
            println!("checking models in {}", dir.display());
            for model in MODELS {
                println!("  {} ({})", model.name, model.size_display);
            }
            models::verify_models_dir(&dir)?;
            println!("all models present and verified");
        }
    }

    Ok(())
}

/// POST a JSON body and return the JSON reply, turning error statuses into
/// an error carrying the daemon's message.
async fn post(client: &reqwest::Client, server: &str, path: &str, body: &Value) -> Result<Value> {
    let url = format!("{}{path}", server.trim_end_matches('/'));
    tracing::debug!(%url, "posting to facegated");
    let response = client
        .post(&url)
        .json(body)
        .send()
        .await
        .with_context(|| format!("failed to reach facegated at {url}"))?;

    let status = response.status();
    let reply: Value = response.json().await.unwrap_or(Value::Null);
    if !status.is_success() {
        bail!("{status}: {}", error_message(&reply));
    }
    Ok(reply)
}

fn error_message(reply: &Value) -> &str {
    reply["error"].as_str().unwrap_or("no error message")
}

fn encode_jpeg_file(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if !bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        bail!("{} is not a JPEG file", path.display());
    }
    Ok(STANDARD.encode(bytes))
}
