//! Gzip helpers for payloads kept or sent by the client.

use async_compression::tokio::write::{GzipDecoder, GzipEncoder};
use color_eyre::{eyre::eyre, Result};
use serde::{de::DeserializeOwned, Serialize};
use tokio::io::AsyncWriteExt;

pub async fn compress(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut encoder = GzipEncoder::with_quality(Vec::new(), async_compression::Level::Default);
  encoder.write_all(data).await?;
  encoder.shutdown().await?;
  Ok(encoder.into_inner())
}

pub async fn decompress(data: &[u8]) -> std::io::Result<Vec<u8>> {
  let mut decoder = GzipDecoder::new(Vec::new());
  decoder.write_all(data).await?;
  decoder.shutdown().await?;
  Ok(decoder.into_inner())
}

/// Serialize `value` as JSON and gzip it.
pub async fn compress_json<T: Serialize>(value: &T) -> Result<Vec<u8>> {
  let json = serde_json::to_vec(value).map_err(|e| eyre!("Failed to serialize payload: {}", e))?;
  compress(&json)
    .await
    .map_err(|e| eyre!("Failed to compress payload: {}", e))
}

pub async fn decompress_json<T: DeserializeOwned>(data: &[u8]) -> Result<T> {
  let json = decompress(data)
    .await
    .map_err(|e| eyre!("Failed to decompress payload: {}", e))?;
  serde_json::from_slice(&json).map_err(|e| eyre!("Failed to parse payload: {}", e))
}
