//! `tandem media ...`: list and download media streams.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tandem_client::{ClientConfig, MediaClient};
use tokio::io::AsyncWriteExt;
use tracing::info;

use super::{disconnect, Endpoint};

/// Print the files the media server offers.
pub async fn run_list(endpoint: &Endpoint, config: ClientConfig) -> Result<()> {
    let client = endpoint.connect(config).await?;
    let media = MediaClient::new(client.clone());

    let result = media.list_media().await.context("failed to list media");
    disconnect(&client).await;

    let files = result?;
    if files.is_empty() {
        println!("No media available.");
        return Ok(());
    }
    for file in &files {
        println!("{file}");
    }
    println!("\n{} file(s) available.", files.len());
    Ok(())
}

/// Stream `file` to completion and write its frames to `output`.
pub async fn run_fetch(
    endpoint: &Endpoint,
    config: ClientConfig,
    file: &str,
    output: Option<&Path>,
) -> Result<()> {
    let output = output
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(file));

    let client = endpoint.connect(config).await?;
    let media = MediaClient::new(client.clone());

    let result = fetch(&media, file, &output).await;
    disconnect(&client).await;

    let (frames, bytes, frame_rate) = result?;
    println!(
        "{file}: {frames} frame(s), {bytes} byte(s) at {frame_rate} fps → {}",
        output.display()
    );
    Ok(())
}

async fn fetch(media: &MediaClient, file: &str, output: &Path) -> Result<(u64, u64, f64)> {
    let stream = media
        .start_stream(file)
        .await
        .with_context(|| format!("failed to start stream for {file}"))?;
    info!(stream_id = %stream.stream_id, frame_rate = stream.frame_rate, "stream started");

    let mut out = tokio::fs::File::create(output)
        .await
        .with_context(|| format!("failed to create {}", output.display()))?;

    let mut frames = 0u64;
    let mut bytes = 0u64;
    while let Some(frame) = media.next_frame(&stream.stream_id).await? {
        out.write_all(&frame).await?;
        frames += 1;
        bytes += frame.len() as u64;
    }
    out.flush().await?;

    media
        .close_stream(&stream.stream_id)
        .await
        .context("failed to close stream")?;
    Ok((frames, bytes, stream.frame_rate))
}
