//! Chunked upload engine.
//!
//! The engine plans chunks with the progressive rule, encrypts and POSTs
//! up to `max_concurrent_uploads` chunks concurrently, and feeds each
//! chunk's plaintext to a dedicated MAC worker. AES-CTR encryption is
//! data-parallel, but the meta-MAC folds per-chunk MACs in index order,
//! so the worker holds a reorder buffer and only MACs the next expected
//! index. The final PUT returns the completion token; finalization folds
//! the meta-MAC, assembles the 32-byte file key, wraps it under the
//! master key and issues the `p` command (with `ov` when replacing an
//! existing file as a new version).

use std::collections::BTreeMap;
use std::path::Path;

use futures::stream::{self, StreamExt};
use serde_json::{json, Map, Value};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api::ApiClient;
use crate::attrs::codec::NodeAttributes;
use crate::attrs::fingerprint::fingerprint_file;
use crate::attrs::media::{encode_media_attributes, MediaInfo};
use crate::base64::base64url_encode;
use crate::config::Config;
use crate::crypto::aes::{aes128_cbc_encrypt, aes128_ctr_xcrypt, chunk_mac, meta_mac};
use crate::crypto::keys::{encrypt_key, merge_file_key};
use crate::crypto::random::make_upload_key_material;
use crate::error::{MegaError, Result};
use crate::fs::keys::ShareKeys;
use crate::fs::node::Node;
use crate::fs::tree::parse_node;
use crate::http::HttpClient;
use crate::progress::{ProgressCallback, TransferProgress};
use crate::transfer::chunks::{chunk_plan, Chunk};

/// Optional inputs for an upload.
#[derive(Default)]
pub struct UploadOptions {
    /// Remote name; defaults to the local file name.
    pub name: Option<String>,
    /// Modification time; defaults to the local file's mtime.
    pub mtime: Option<u64>,
    /// Existing file handle to replace, creating a new version (`ov`).
    pub replace_handle: Option<String>,
    /// Label color 0-7.
    pub label: Option<u8>,
    pub favorite: bool,
    /// Custom attribute sub-map (`e`).
    pub custom: Option<Map<String, Value>>,
    /// Pre-rendered JPEG thumbnail bytes.
    pub thumbnail: Option<Vec<u8>>,
    /// Pre-rendered JPEG preview bytes.
    pub preview: Option<Vec<u8>>,
    /// Media metadata from an external probe.
    pub media: Option<MediaInfo>,
    /// Progress callback, invoked in chunk order.
    pub progress: Option<ProgressCallback>,
    /// Cancellation token; aborting leaves no node behind.
    pub cancel: Option<CancellationToken>,
}

/// Everything the engine needs from the surrounding session.
pub(crate) struct UploadContext<'a> {
    pub api: &'a ApiClient,
    pub http: &'a HttpClient,
    pub config: &'a Config,
    pub master_key: &'a [u8; 16],
    pub user_handle: &'a str,
}

/// Upload a local file into `parent_handle`.
pub(crate) async fn upload_file(
    ctx: &UploadContext<'_>,
    path: &Path,
    parent_handle: &str,
    mut options: UploadOptions,
) -> Result<Node> {
    let metadata = tokio::fs::metadata(path).await.map_err(|_| {
        MegaError::NotFound(format!("local file not found: {}", path.display()))
    })?;
    if !metadata.is_file() {
        return Err(MegaError::Argument(format!(
            "not a regular file: {}",
            path.display()
        )));
    }
    let file_size = metadata.len();

    let file_name = match options.name.take() {
        Some(name) => name,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| MegaError::Argument("file name is not valid UTF-8".to_string()))?
            .to_string(),
    };
    let mtime = match options.mtime {
        Some(t) => t,
        None => metadata
            .modified()?
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0),
    };

    let fingerprint = fingerprint_file(path).ok();

    // Upload URL for this size.
    let response = ctx
        .api
        .request(json!({"a": "u", "s": file_size, "ssl": 0}))
        .await?;
    let upload_url = response
        .get("p")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Protocol("no upload URL in `u` response".to_string()))?
        .to_string();

    let (aes_key, nonce) = make_upload_key_material();
    let cancel = options.cancel.clone().unwrap_or_default();

    let plan = chunk_plan(file_size);
    let (chunk_macs, completion_token) = transfer_chunks(
        ctx,
        path,
        &upload_url,
        &plan,
        &aes_key,
        &nonce,
        file_size,
        &file_name,
        options.progress.as_mut(),
        &cancel,
    )
    .await?;

    // Empty files skip the chunk loop; the bare upload URL still yields a
    // completion token for a zero-length PUT.
    let completion_token = match completion_token {
        Some(token) => token,
        None if file_size == 0 => {
            let text = ctx
                .http
                .post_bytes(
                    &format!("{upload_url}/0"),
                    Vec::new(),
                    ctx.config.timeout.total,
                )
                .await?;
            parse_chunk_response(&text)?.ok_or_else(|| {
                MegaError::Protocol("no completion token for empty upload".to_string())
            })?
        }
        None => {
            return Err(MegaError::Protocol(
                "upload finished without a completion token".to_string(),
            ))
        }
    };

    // Meta-MAC and the wrapped 32-byte node key.
    let mac = meta_mac(&chunk_macs, &aes_key);
    let file_key = merge_file_key(&aes_key, &nonce, &mac);
    let key_b64 = base64url_encode(&encrypt_key(&file_key, ctx.master_key));

    let attributes = NodeAttributes {
        name: file_name.clone(),
        mtime: Some(mtime),
        label: options.label,
        favorite: options.favorite,
        fingerprint,
        custom: options.custom.take(),
        extra: Map::new(),
    };
    let attrs_b64 = attributes.encrypt(&aes_key)?;

    // Thumbnail/preview attributes ride along in the `fa` field.
    let mut fa_parts = Vec::new();
    if ctx.config.upload.auto_thumbnail {
        if let Some(data) = options.thumbnail.take() {
            match upload_file_attribute(ctx, &data, 0, &aes_key).await {
                Ok(fragment) => fa_parts.push(fragment),
                Err(err) => warn!(%err, "thumbnail attribute upload failed"),
            }
        }
    }
    if ctx.config.upload.auto_preview {
        if let Some(data) = options.preview.take() {
            match upload_file_attribute(ctx, &data, 1, &aes_key).await {
                Ok(fragment) => fa_parts.push(fragment),
                Err(err) => warn!(%err, "preview attribute upload failed"),
            }
        }
    }

    let mut node_record = json!({
        "h": completion_token,
        "t": 0,
        "a": attrs_b64,
        "k": format!("{}:{}", ctx.user_handle, key_b64),
    });
    if !fa_parts.is_empty() {
        node_record["fa"] = json!(fa_parts.join("/"));
    }
    if let Some(old) = &options.replace_handle {
        node_record["ov"] = json!(old);
    }

    let response = ctx
        .api
        .request(json!({"a": "p", "t": parent_handle, "n": [node_record]}))
        .await?;

    let created = response
        .get("f")
        .and_then(|v| v.as_array())
        .and_then(|nodes| nodes.first())
        .ok_or_else(|| MegaError::Protocol("`p` response carries no node".to_string()))?;
    let node = parse_node(created, ctx.user_handle, ctx.master_key, &ShareKeys::new())
        .ok_or_else(|| MegaError::Protocol("unparseable node in `p` response".to_string()))?;

    // Media attributes attach to the created node via `pfa`.
    if let Some(media) = &options.media {
        let fa = encode_media_attributes(media, &file_key);
        if let Err(err) = ctx
            .api
            .request(json!({"a": "pfa", "n": node.handle(), "fa": fa}))
            .await
        {
            warn!(%err, "media attribute publication failed");
        }
    }

    debug!(handle = node.handle(), "upload complete");
    Ok(node)
}

/// Drive the chunk pipeline. Returns the ordered chunk MACs and the
/// completion token from the final PUT.
#[allow(clippy::too_many_arguments)]
async fn transfer_chunks(
    ctx: &UploadContext<'_>,
    path: &Path,
    upload_url: &str,
    plan: &[Chunk],
    aes_key: &[u8; 16],
    nonce: &[u8; 8],
    file_size: u64,
    file_name: &str,
    mut progress: Option<&mut ProgressCallback>,
    cancel: &CancellationToken,
) -> Result<(Vec<[u8; 16]>, Option<String>)> {
    if plan.is_empty() {
        return Ok((Vec::new(), None));
    }

    // MAC worker: drains plaintext in chunk-index order through a reorder
    // buffer. The channel bound applies backpressure to the encryptors.
    let (mac_tx, mut mac_rx) = mpsc::channel::<(usize, Vec<u8>)>(
        ctx.config.upload.max_concurrent_uploads.max(1) * 2,
    );
    let worker_key = *aes_key;
    let worker_nonce = *nonce;
    let mac_worker = tokio::spawn(async move {
        let mut pending: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
        let mut next = 0usize;
        let mut macs: Vec<[u8; 16]> = Vec::new();

        while let Some((index, plaintext)) = mac_rx.recv().await {
            pending.insert(index, plaintext);
            while let Some(plaintext) = pending.remove(&next) {
                macs.push(chunk_mac(&plaintext, &worker_key, &worker_nonce));
                next += 1;
            }
        }
        macs
    });

    let concurrency = ctx.config.upload.max_concurrent_uploads.max(1);
    let retry = &ctx.config.retry;

    let chunk_tx = mac_tx.clone();
    let mut results = stream::iter(plan.iter().copied())
        .map(move |chunk| {
            let mac_tx = chunk_tx.clone();
            let path = path.to_path_buf();
            let upload_url = upload_url.to_string();
            let aes_key = *aes_key;
            let nonce = *nonce;
            let cancel = cancel.clone();

            async move {
                if cancel.is_cancelled() {
                    return Err(MegaError::Cancelled);
                }

                let mut file = tokio::fs::File::open(&path).await?;
                file.seek(std::io::SeekFrom::Start(chunk.offset)).await?;
                let mut plaintext = vec![0u8; chunk.len as usize];
                file.read_exact(&mut plaintext).await?;

                let ciphertext =
                    aes128_ctr_xcrypt(&plaintext, &aes_key, &nonce, chunk.offset);

                // Hand the plaintext to the MAC worker before the PUT so
                // MAC work overlaps the network round-trip.
                mac_tx
                    .send((chunk.index, plaintext))
                    .await
                    .map_err(|_| MegaError::Protocol("MAC worker stopped".to_string()))?;

                let chunk_url = format!("{}/{}", upload_url, chunk.offset);
                let mut attempt = 0u32;
                let token = loop {
                    if cancel.is_cancelled() {
                        return Err(MegaError::Cancelled);
                    }
                    match ctx
                        .http
                        .post_bytes(&chunk_url, ciphertext.clone(), ctx.config.timeout.total)
                        .await
                    {
                        Ok(text) => break parse_chunk_response(&text)?,
                        Err(err) if err.is_transient() && attempt < retry.max_retries => {
                            let delay = retry.delay_for(attempt);
                            warn!(chunk = chunk.index, %err, ?delay, "chunk PUT failed, retrying");
                            attempt += 1;
                            tokio::time::sleep(delay).await;
                        }
                        Err(err) => return Err(err),
                    }
                };

                Ok::<_, MegaError>((chunk, token))
            }
        })
        .buffered(concurrency);

    drop(mac_tx);

    // `buffered` preserves plan order, so progress stays monotonic in
    // chunk-index terms regardless of wire completion order.
    let mut completion_token = None;
    let mut transferred = 0u64;
    let mut completed = 0usize;
    let mut failure: Option<MegaError> = None;

    while let Some(result) = results.next().await {
        match result {
            Ok((chunk, token)) => {
                if let Some(token) = token {
                    completion_token = Some(token);
                }

                transferred += chunk.len;
                completed += 1;
                if let Some(callback) = progress.as_deref_mut() {
                    let snapshot = TransferProgress {
                        total_bytes: file_size,
                        transferred_bytes: transferred,
                        total_chunks: plan.len(),
                        completed_chunks: completed,
                        filename: file_name.to_string(),
                    };
                    if !callback(&snapshot) {
                        failure = Some(MegaError::Cancelled);
                    }
                }
            }
            Err(err) => failure = Some(err),
        }

        if failure.is_some() {
            // Abort in-flight chunks and let the worker drain out.
            cancel.cancel();
            break;
        }
    }
    drop(results);

    let chunk_macs = mac_worker
        .await
        .map_err(|_| MegaError::Protocol("MAC worker panicked".to_string()))?;
    if let Some(err) = failure {
        return Err(err);
    }
    if chunk_macs.len() != plan.len() {
        return Err(MegaError::Protocol(format!(
            "MAC worker processed {} of {} chunks",
            chunk_macs.len(),
            plan.len()
        )));
    }

    Ok((chunk_macs, completion_token))
}

/// Interpret a chunk PUT response: empty for intermediate chunks, the
/// base64url completion token for the final one, a negative integer on
/// server-side failure.
fn parse_chunk_response(text: &str) -> Result<Option<String>> {
    let text = text.trim();
    if text.is_empty() {
        return Ok(None);
    }
    if let Ok(code) = text.parse::<i64>() {
        if code < 0 {
            return Err(crate::api::ApiErrorCode::from(code).into_error());
        }
    }
    Ok(Some(text.to_string()))
}

/// Upload an encrypted thumbnail/preview blob via `ufa` and return the
/// `type*handle` fragment for the node's `fa` string.
pub(crate) async fn upload_file_attribute(
    ctx: &UploadContext<'_>,
    data: &[u8],
    attr_type: u32,
    aes_key: &[u8; 16],
) -> Result<String> {
    let mut padded = data.to_vec();
    let pad = (16 - padded.len() % 16) % 16;
    padded.extend(std::iter::repeat(0u8).take(pad));
    let encrypted = aes128_cbc_encrypt(&padded, aes_key);

    let response = ctx
        .api
        .request(json!({"a": "ufa", "s": encrypted.len(), "ssl": 0}))
        .await?;
    let url = response
        .get("p")
        .and_then(|v| v.as_str())
        .ok_or_else(|| MegaError::Protocol("no URL in `ufa` response".to_string()))?;

    let handle = ctx
        .http
        .post_octets(
            &format!("{url}/{attr_type}"),
            encrypted,
            ctx.config.timeout.total,
        )
        .await?;
    if handle.len() != 8 {
        return Err(MegaError::Protocol(format!(
            "attribute handle must be 8 bytes, got {}",
            handle.len()
        )));
    }

    Ok(format!("{}*{}", attr_type, base64url_encode(&handle)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::client::testing::MockTransport;
    use crate::attrs::fingerprint::parse_fingerprint;
    use crate::base64::base64url_decode;
    use crate::config::RetryConfig;
    use crate::crypto::aes::aes128_ecb_decrypt;
    use crate::crypto::keys::split_file_key;
    use crate::transfer::testserver::TestServer;
    use std::io::Write as _;
    use std::sync::Arc;

    const MASTER: [u8; 16] = [0x24u8; 16];
    const USER: &str = "me______";

    /// End-to-end upload against a local chunk server: verifies the chunk
    /// ciphertexts, the wrapped node key, the attribute blob and the
    /// versioning field of the `p` command.
    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn upload_flow_produces_consistent_key_and_attributes() {
        // 300 KB file: three progressive chunks (128K + 172K... the plan
        // decides; we only rely on its own invariants here).
        let data: Vec<u8> = (0..300_000u32).map(|i| (i % 249) as u8).collect();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("payload.bin");
        std::fs::File::create(&path)
            .unwrap()
            .write_all(&data)
            .unwrap();

        let plan = chunk_plan(data.len() as u64);
        let server = TestServer::upload(plan.last().unwrap().offset, "COMPTOKEN").await;

        // Scripted /cs: `u` hands out the local server, `p` echoes a node.
        let u_reply = format!(r#"[{{"p":"{}"}}]"#, server.base_url);
        let p_reply = r#"[{"f":[{"h":"NEWNODE0","p":"PARENT00","t":0,"s":300000,
            "a":"ignored","k":"me______:ignored","ts":5}]}]"#;
        let transport = MockTransport::scripted(vec![
            MockTransport::ok(&u_reply),
            MockTransport::ok(p_reply),
        ]);
        let api = ApiClient::new(
            transport.clone(),
            "https://g.api.mega.test/".to_string(),
            RetryConfig::default(),
        );

        let config = Config::default();
        let http = crate::http::HttpClient::from_config(&config).unwrap();
        let ctx = UploadContext {
            api: &api,
            http: &http,
            config: &config,
            master_key: &MASTER,
            user_handle: USER,
        };

        let progress_log = Arc::new(std::sync::Mutex::new(Vec::new()));
        let log = progress_log.clone();
        let options = UploadOptions {
            mtime: Some(1_700_000_000),
            replace_handle: Some("OLDNODE0".to_string()),
            progress: Some(Box::new(move |p: &TransferProgress| {
                log.lock().unwrap().push((p.completed_chunks, p.transferred_bytes));
                true
            })),
            ..Default::default()
        };

        let node = upload_file(&ctx, &path, "PARENT00", options).await.unwrap();
        assert_eq!(node.handle(), "NEWNODE0");

        // Every chunk PUT carried the CTR ciphertext for its offset.
        let posts = server.posts.lock().unwrap();
        assert_eq!(posts.len(), plan.len());
        for chunk in &plan {
            let (_, body) = posts
                .iter()
                .find(|(path, _)| *path == format!("/{}", chunk.offset))
                .expect("every planned offset was PUT");
            let expected_plain =
                &data[chunk.offset as usize..(chunk.offset + chunk.len) as usize];
            let aes_round_trip = aes128_ctr_xcrypt(body, &extract_aes_key(&transport), &extract_nonce(&transport), chunk.offset);
            assert_eq!(aes_round_trip, expected_plain, "chunk {}", chunk.index);
        }

        // The wrapped key in the `p` command unwraps to a consistent
        // (key, nonce, meta-MAC) triple for the uploaded content.
        let (aes_key, nonce, mac) = unwrapped_key_parts(&transport);
        let expected_macs: Vec<[u8; 16]> = plan
            .iter()
            .map(|c| {
                chunk_mac(
                    &data[c.offset as usize..(c.offset + c.len) as usize],
                    &aes_key,
                    &nonce,
                )
            })
            .collect();
        assert_eq!(mac, meta_mac(&expected_macs, &aes_key));

        // Attributes decrypt under the upload key: name, mtime, `ov`.
        let (_, bodies, _) = transport.call(1);
        let record = &bodies[0]["n"][0];
        assert_eq!(record["ov"], "OLDNODE0");
        let attrs =
            NodeAttributes::decrypt(record["a"].as_str().unwrap(), &aes_key).unwrap();
        assert_eq!(attrs.name, "payload.bin");
        assert_eq!(attrs.mtime, Some(1_700_000_000));
        let (_, fp_mtime) = parse_fingerprint(attrs.fingerprint.as_deref().unwrap()).unwrap();
        assert!(fp_mtime > 0);

        // Progress arrived once per chunk, monotonically.
        let progress = progress_log.lock().unwrap();
        assert_eq!(progress.len(), plan.len());
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last().unwrap().1, data.len() as u64);
    }

    fn unwrapped_key_parts(
        transport: &MockTransport,
    ) -> ([u8; 16], [u8; 8], [u8; 8]) {
        let (_, bodies, _) = transport.call(1);
        let k = bodies[0]["n"][0]["k"].as_str().unwrap();
        let (_, wrapped_b64) = k.split_once(':').unwrap();
        let wrapped = base64url_decode(wrapped_b64).unwrap();
        let full: [u8; 32] = aes128_ecb_decrypt(&wrapped, &MASTER).try_into().unwrap();
        split_file_key(&full)
    }

    fn extract_aes_key(transport: &MockTransport) -> [u8; 16] {
        unwrapped_key_parts(transport).0
    }

    fn extract_nonce(transport: &MockTransport) -> [u8; 8] {
        unwrapped_key_parts(transport).1
    }

    #[test]
    fn chunk_response_parsing() {
        assert_eq!(parse_chunk_response("").unwrap(), None);
        assert_eq!(parse_chunk_response("  \n").unwrap(), None);
        assert_eq!(
            parse_chunk_response("sQm2AbCdEf").unwrap(),
            Some("sQm2AbCdEf".to_string())
        );
        assert!(matches!(
            parse_chunk_response("-11"),
            Err(MegaError::Permission(_))
        ));
        assert!(matches!(
            parse_chunk_response("-3"),
            Err(MegaError::Transient(_))
        ));
    }

    #[tokio::test]
    async fn mac_worker_reorders_out_of_order_chunks() {
        // Feed chunk plaintexts out of order; the worker must still fold
        // them in index order.
        let key = [7u8; 16];
        let nonce = [9u8; 8];
        let parts: Vec<Vec<u8>> = vec![vec![1u8; 100], vec![2u8; 200], vec![3u8; 50]];

        let (tx, mut rx) = mpsc::channel::<(usize, Vec<u8>)>(8);
        let worker = tokio::spawn(async move {
            let mut pending: BTreeMap<usize, Vec<u8>> = BTreeMap::new();
            let mut next = 0usize;
            let mut macs: Vec<[u8; 16]> = Vec::new();
            while let Some((index, plaintext)) = rx.recv().await {
                pending.insert(index, plaintext);
                while let Some(plaintext) = pending.remove(&next) {
                    macs.push(chunk_mac(&plaintext, &key, &nonce));
                    next += 1;
                }
            }
            macs
        });

        tx.send((2, parts[2].clone())).await.unwrap();
        tx.send((0, parts[0].clone())).await.unwrap();
        tx.send((1, parts[1].clone())).await.unwrap();
        drop(tx);

        let macs = worker.await.unwrap();
        let expected: Vec<[u8; 16]> =
            parts.iter().map(|p| chunk_mac(p, &key, &nonce)).collect();
        assert_eq!(macs, expected);
    }

    #[test]
    fn final_key_assembly_matches_split() {
        use crate::crypto::keys::split_file_key;

        let aes_key = [0xAAu8; 16];
        let nonce = [0xBBu8; 8];
        let macs = vec![[1u8; 16], [2u8; 16]];
        let mac = meta_mac(&macs, &aes_key);

        let full = merge_file_key(&aes_key, &nonce, &mac);
        let (k, n, m) = split_file_key(&full);
        assert_eq!(k, aes_key);
        assert_eq!(n, nonce);
        assert_eq!(m, mac);
    }
}
