//! Command-line client for the streaming endpoint.
//!
//! Resolves a prompt (directly or from a gesture name), opens
//! `/api/generate-stream`, reports every denoising step as it arrives and
//! writes the final PNG. Exits 0 on `complete`, 1 on `error`.
//!
//! # Usage
//!
//! ```sh
//! sd-stream-client --prompt "a castle in the clouds" --output /tmp/castle.png
//!
//! # Gesture → prompt, announcing the gesture first:
//! sd-stream-client --gesture Victory --recognize --output /tmp/city.png
//!
//! # Keep every intermediate frame:
//! sd-stream-client --gesture Open_Palm --frames-dir /tmp/frames
//! ```

use std::{path::PathBuf, time::Duration};

use anyhow::{Context, bail};
use clap::Parser;
use futures::StreamExt;
use sd_stream::{
    gestures,
    server::{ErrorBody, GestureEcho},
    streaming::{SseDecoder, StreamEvent},
    vae,
};
use serde_json::json;
use tokio::time::timeout;

#[derive(Parser)]
#[command(name = "sd-stream-client", about = "Stream a Stable Diffusion generation step by step")]
struct Args {
    /// Prompt to generate from.
    #[arg(long, conflicts_with = "gesture", required_unless_present = "gesture")]
    prompt: Option<String>,

    /// Gesture name (Thumb_Up, Victory, Open_Palm, Closed_Fist, Pointing_Up).
    #[arg(long)]
    gesture: Option<String>,

    /// Post the gesture to /api/recognize before generating.
    #[arg(long, requires = "gesture")]
    recognize: bool,

    #[arg(long)]
    negative_prompt: Option<String>,

    /// Where to write the final image.
    #[arg(long, short = 'o', default_value = "output.png")]
    output: PathBuf,

    /// Also write each intermediate frame as step_NN.png.
    #[arg(long)]
    frames_dir: Option<PathBuf>,

    /// Server base URL.
    #[arg(long, env = "SD_SERVER_URL", default_value = "http://localhost:8000")]
    server: String,

    /// Give up after this many seconds.
    #[arg(long, default_value = "600")]
    timeout_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let base = args.server.trim_end_matches('/').to_string();
    let client = reqwest::Client::new();

    let prompt = match (&args.prompt, &args.gesture) {
        (Some(prompt), _) => prompt.clone(),
        (None, Some(gesture)) => match gestures::prompt_for(gesture) {
            Some(prompt) => prompt.to_string(),
            None => bail!(
                "no prompt defined for gesture '{gesture}' (known: {})",
                gestures::gesture_names().collect::<Vec<_>>().join(", ")
            ),
        },
        (None, None) => bail!("either --prompt or --gesture is required"),
    };

    if args.recognize
        && let Some(gesture) = &args.gesture
    {
        let response = client
            .post(format!("{base}/api/recognize"))
            .json(&json!({ "gesture": gesture, "confidence": 1.0 }))
            .send()
            .await
            .context("recognize request failed")?;
        let status = response.status();
        if !status.is_success() {
            bail!("recognize failed ({status}): {}", error_detail(response).await);
        }
        let recognized: GestureEcho = response.json().await?;
        tracing::info!(confidence = recognized.confidence, "{}", recognized.message);
    }

    if let Some(dir) = &args.frames_dir {
        std::fs::create_dir_all(dir)?;
    }
    if let Some(parent) = args.output.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    tracing::info!(%prompt, "requesting stream");
    let outcome = timeout(
        Duration::from_secs(args.timeout_secs),
        stream_generation(&client, &base, &prompt, &args),
    )
    .await;

    match outcome {
        Ok(Ok(image_url)) => {
            println!(
                "{}",
                json!({ "path": args.output, "image_url": image_url, "prompt": prompt })
            );
            Ok(())
        }
        Ok(Err(e)) => {
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
        Err(_) => {
            eprintln!("error: timed out after {}s", args.timeout_secs);
            std::process::exit(1);
        }
    }
}

/// Consume the event stream. Returns the server URL of the saved image.
async fn stream_generation(
    client: &reqwest::Client,
    base: &str,
    prompt: &str,
    args: &Args,
) -> anyhow::Result<String> {
    let mut url = reqwest::Url::parse(&format!("{base}/api/generate-stream"))?;
    url.query_pairs_mut().append_pair("prompt", prompt);
    if let Some(negative) = &args.negative_prompt {
        url.query_pairs_mut().append_pair("negative_prompt", negative);
    }

    let response = client
        .get(url)
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await
        .context("stream request failed")?;
    let status = response.status();
    if !status.is_success() {
        bail!("server returned {status}: {}", error_detail(response).await);
    }

    let mut byte_stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();
    while let Some(chunk) = byte_stream.next().await {
        let chunk = chunk.context("stream read failed")?;
        for message in decoder.push(&chunk) {
            match StreamEvent::from_data(&message.data)? {
                StreamEvent::Step {
                    step,
                    total_steps,
                    image,
                } => {
                    tracing::info!("step {step}/{total_steps}");
                    if let Some(dir) = &args.frames_dir {
                        let path = dir.join(format!("step_{step:02}.png"));
                        std::fs::write(&path, vae::from_base64(&image)?)
                            .with_context(|| format!("failed to write {}", path.display()))?;
                    }
                }
                StreamEvent::Complete { image, image_url } => {
                    std::fs::write(&args.output, vae::from_base64(&image)?)
                        .with_context(|| format!("failed to write {}", args.output.display()))?;
                    tracing::info!(output = %args.output.display(), %image_url, "done");
                    return Ok(image_url);
                }
                StreamEvent::Error { message } => bail!("generation failed: {message}"),
            }
        }
    }

    bail!("stream ended without a complete event")
}

async fn error_detail(response: reqwest::Response) -> String {
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<failed to read body>".to_string());
    serde_json::from_str::<ErrorBody>(&body)
        .map(|error| error.detail)
        .unwrap_or(body)
}
