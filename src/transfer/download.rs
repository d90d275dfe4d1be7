//! Chunked download engine.
//!
//! Downloads stream the file in progressive-plan chunks (capped at 1 MiB
//! by the plan itself), decrypting each range with AES-CTR at its offset
//! and folding a CBC-MAC per chunk. After the last byte the folded
//! meta-MAC must equal the 8 bytes stored in the file key; a mismatch
//! deletes the partial output and reports an integrity failure.

use std::path::Path;

use serde_json::json;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::config::Config;
use crate::crypto::aes::{aes128_ctr_xcrypt, chunk_mac, constant_time_eq, meta_mac};
use crate::error::{MegaError, Result};
use crate::fs::node::Node;
use crate::http::HttpClient;
use crate::progress::{ProgressCallback, TransferProgress};
use crate::transfer::chunks::chunk_plan;

pub(crate) struct DownloadContext<'a> {
    pub api: &'a ApiClient,
    pub http: &'a HttpClient,
    pub config: &'a Config,
}

/// Download a file node to `dest`, verifying its meta-MAC.
pub(crate) async fn download_node(
    ctx: &DownloadContext<'_>,
    node: &Node,
    dest: &Path,
    mut progress: Option<ProgressCallback>,
    cancel: Option<CancellationToken>,
) -> Result<()> {
    if !node.is_file() {
        return Err(MegaError::Argument(format!(
            "cannot download a folder: {}",
            node.name()
        )));
    }
    let (aes_key, nonce, stored_mac) = node
        .key()
        .and_then(|k| k.file_parts())
        .ok_or_else(|| MegaError::Crypto(format!("no usable key for {}", node.name())))?;

    let response = ctx
        .api
        .request(json!({"a": "g", "g": 1, "n": node.handle(), "ssl": 0}))
        .await?;
    let url = response
        .get("g")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Protocol("no download URL in `g` response".to_string()))?
        .to_string();
    let size = response
        .get("s")
        .and_then(|v| v.as_u64())
        .unwrap_or_else(|| node.size());

    let cancel = cancel.unwrap_or_default();
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    let temp_path = parent.join(format!(".megakit.{}", node.handle()));

    let result = stream_and_verify(
        ctx,
        &url,
        size,
        &aes_key,
        &nonce,
        &stored_mac,
        &temp_path,
        node.name(),
        progress.as_mut(),
        &cancel,
    )
    .await;

    match result {
        Ok(()) => {
            tokio::fs::rename(&temp_path, dest).await?;
            debug!(handle = node.handle(), "download complete");
            Ok(())
        }
        Err(err) => {
            // Never leave partial plaintext behind.
            let _ = tokio::fs::remove_file(&temp_path).await;
            Err(err)
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn stream_and_verify(
    ctx: &DownloadContext<'_>,
    url: &str,
    size: u64,
    aes_key: &[u8; 16],
    nonce: &[u8; 8],
    stored_mac: &[u8; 8],
    temp_path: &Path,
    file_name: &str,
    mut progress: Option<&mut ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut output = tokio::fs::File::create(temp_path).await?;
    let plan = chunk_plan(size);
    let retry = &ctx.config.retry;

    let mut chunk_macs: Vec<[u8; 16]> = Vec::with_capacity(plan.len());
    let mut transferred = 0u64;

    for chunk in &plan {
        if cancel.is_cancelled() {
            return Err(MegaError::Cancelled);
        }

        let mut attempt = 0u32;
        let encrypted = loop {
            match ctx
                .http
                .get_range(url, chunk.offset, chunk.offset + chunk.len)
                .await
            {
                Ok(bytes) => break bytes,
                Err(err) if err.is_transient() && attempt < retry.max_retries => {
                    let delay = retry.delay_for(attempt);
                    warn!(chunk = chunk.index, %err, ?delay, "chunk GET failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        };
        if encrypted.len() as u64 != chunk.len {
            return Err(MegaError::Protocol(format!(
                "range [{}, {}) answered with {} bytes",
                chunk.offset,
                chunk.offset + chunk.len,
                encrypted.len()
            )));
        }

        let plaintext = aes128_ctr_xcrypt(&encrypted, aes_key, nonce, chunk.offset);
        chunk_macs.push(chunk_mac(&plaintext, aes_key, nonce));
        output.write_all(&plaintext).await?;

        transferred += chunk.len;
        if let Some(callback) = progress.as_deref_mut() {
            let snapshot = TransferProgress {
                total_bytes: size,
                transferred_bytes: transferred,
                total_chunks: plan.len(),
                completed_chunks: chunk_macs.len(),
                filename: file_name.to_string(),
            };
            if !callback(&snapshot) {
                return Err(MegaError::Cancelled);
            }
        }
    }

    output.flush().await?;
    drop(output);

    let computed = meta_mac(&chunk_macs, aes_key);
    if !constant_time_eq(&computed, stored_mac) {
        return Err(MegaError::Integrity(format!(
            "meta-MAC mismatch for {file_name}"
        )));
    }

    Ok(())
}
