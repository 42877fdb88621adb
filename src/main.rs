//! Terminal driver for the Tamur engine.
//!
//! Thin by design — the real UI is a separate front-end. This binary
//! exists to exercise every engine path end to end: streaming chat,
//! live voice, image generation and video generation.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use base64::Engine;
use clap::{Parser, Subcommand};
use futures_util::StreamExt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use tamur::chat::{self, Chat, StreamedReply, Tool};
use tamur::live::LiveConversation;
use tamur::media;
use tamur::video;
use tamur::{EnvCredentials, GenAiClient, GenAiConfig};

#[derive(Parser)]
#[command(name = "tamur", version, about = "Tamur assistant engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Interactive streaming chat on stdin/stdout.
    Chat {
        /// Ground replies with web search and print citations.
        #[arg(long)]
        web_search: bool,
    },
    /// Live voice conversation until Ctrl+C.
    Voice,
    /// Generate an image and write it next to the working directory.
    Image { prompt: String },
    /// Generate a video from a conditioning image.
    Video {
        prompt: String,
        /// JPEG used to condition the generation.
        #[arg(long)]
        image: PathBuf,
        /// Where to keep the finished video.
        #[arg(long, default_value = "tamur-video.mp4")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tamur=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let config = GenAiConfig::from_env();
    let creds = Arc::new(EnvCredentials::default());
    let client = GenAiClient::new(config.clone(), creds.clone())?;

    match cli.command {
        Command::Chat { web_search } => run_chat(client, web_search).await,
        Command::Voice => run_voice(&config, creds).await,
        Command::Image { prompt } => run_image(client, &prompt).await,
        Command::Video {
            prompt,
            image,
            output,
        } => run_video(client, &prompt, &image, &output).await,
    }
}

async fn run_chat(client: GenAiClient, web_search: bool) -> anyhow::Result<()> {
    let tool = if web_search { Tool::WebSearch } else { Tool::Chat };
    let session = Chat::new(client.clone(), tool);
    let mut title: Option<String> = None;

    let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    stdout.write_all(b"> ").await?;
    stdout.flush().await?;
    while let Some(line) = lines.next_line().await? {
        let prompt = line.trim();
        if prompt.is_empty() {
            stdout.write_all(b"> ").await?;
            stdout.flush().await?;
            continue;
        }

        if title.is_none() {
            let generated = chat::generate_title(&client, prompt).await;
            if !generated.is_empty() {
                eprintln!("[{generated}]");
            }
            title = Some(generated);
        }

        let mut stream = session.send_message_stream(prompt).await?;
        let mut reply = StreamedReply::default();
        while let Some(item) = stream.next().await {
            let chunk = item?;
            let delta = chunk.text();
            stdout.write_all(delta.as_bytes()).await?;
            stdout.flush().await?;
            reply.apply(&chunk);
        }
        stdout.write_all(b"\n").await?;
        for source in &reply.sources {
            eprintln!("  [{}] {}", source.title, source.url);
        }
        stdout.write_all(b"> ").await?;
        stdout.flush().await?;
    }
    Ok(())
}

async fn run_voice(
    config: &GenAiConfig,
    creds: Arc<EnvCredentials>,
) -> anyhow::Result<()> {
    let on_transcript: tamur::live::TranscriptCallback = Arc::new(|text, is_final| {
        if is_final {
            println!("tamur: {text}");
        } else {
            eprint!("\r... {text}");
        }
    });
    let on_error: tamur::live::ErrorCallback = Arc::new(|err| {
        eprintln!("Ovozli suhbatda xatolik: {err}");
    });

    let mut conversation =
        LiveConversation::start(config, creds.as_ref(), on_transcript, on_error).await?;
    println!("[Mikrofon tinglanmoqda... Ctrl+C to'xtatadi]");

    tokio::signal::ctrl_c().await?;
    conversation.close();
    println!("\n[Ovozli suhbat tugadi]");
    Ok(())
}

async fn run_image(client: GenAiClient, prompt: &str) -> anyhow::Result<()> {
    let images = media::generate_image(&client, prompt).await?;
    if images.is_empty() {
        anyhow::bail!("service returned no images");
    }
    for (index, image) in images.iter().enumerate() {
        let b64 = image
            .data_uri
            .strip_prefix("data:image/jpeg;base64,")
            .context("unexpected data URI shape")?;
        let bytes = base64::engine::general_purpose::STANDARD.decode(b64)?;
        let path = format!("tamur-image-{index}.jpg");
        std::fs::write(&path, bytes)?;
        println!("{path}");
    }
    Ok(())
}

async fn run_video(
    client: GenAiClient,
    prompt: &str,
    image: &PathBuf,
    output: &PathBuf,
) -> anyhow::Result<()> {
    let image_bytes = std::fs::read(image)
        .with_context(|| format!("reading conditioning image {}", image.display()))?;
    let image_base64 = base64::engine::general_purpose::STANDARD.encode(image_bytes);

    // Ctrl+C abandons the poll cleanly instead of leaving it running.
    let cancel = CancellationToken::new();
    let watcher = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            watcher.cancel();
        }
    });

    let handle = video::generate_video(
        &client,
        prompt,
        &image_base64,
        "image/jpeg",
        |status, _| println!("{status}"),
        &cancel,
    )
    .await?;

    handle
        .persist(output)
        .with_context(|| format!("saving video to {}", output.display()))?;
    println!("{}", output.display());
    Ok(())
}
