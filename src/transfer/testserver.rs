//! Minimal HTTP server for transfer tests.
//!
//! Speaks just enough HTTP/1.1 to stand in for MEGA's upload/download
//! hosts: it parses the request line, `Content-Length` and `Range`
//! headers, hands POST bodies to a recorder, and answers GETs with byte
//! ranges of a fixed blob.

#![cfg(test)]

use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

/// One recorded POST: the request path and its body.
pub(crate) type PostLog = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

pub(crate) struct TestServer {
    pub base_url: String,
    pub posts: PostLog,
}

enum Mode {
    /// Record POST bodies; answer with the token when the path matches
    /// `final_path`, empty otherwise.
    Upload { final_path: String, token: String },
    /// Serve ranges of the blob for GETs.
    Download { blob: Vec<u8> },
}

impl TestServer {
    pub async fn upload(final_offset: u64, token: &str) -> Self {
        Self::start(Mode::Upload {
            final_path: format!("/{final_offset}"),
            token: token.to_string(),
        })
        .await
    }

    pub async fn download(blob: Vec<u8>) -> Self {
        Self::start(Mode::Download { blob }).await
    }

    async fn start(mode: Mode) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base_url = format!("http://{}", listener.local_addr().unwrap());
        let posts: PostLog = Arc::new(Mutex::new(Vec::new()));

        let log = posts.clone();
        let mode = Arc::new(mode);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let log = log.clone();
                let mode = mode.clone();
                tokio::spawn(async move {
                    let _ = handle(socket, &mode, &log).await;
                });
            }
        });

        Self { base_url, posts }
    }
}

async fn handle(mut socket: TcpStream, mode: &Mode, log: &PostLog) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut tmp = [0u8; 8192];

    let header_end = loop {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&tmp[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let mut lines = head.lines();
    let request_line = lines.next().unwrap_or_default().to_string();
    let mut content_length = 0usize;
    let mut range: Option<(u64, u64)> = None;
    for line in lines {
        let Some((name, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-length") {
            content_length = value.parse().unwrap_or(0);
        } else if name.eq_ignore_ascii_case("range") {
            // "bytes=start-end" (inclusive end)
            if let Some(spec) = value.strip_prefix("bytes=") {
                if let Some((start, end)) = spec.split_once('-') {
                    if let (Ok(s), Ok(e)) = (start.parse(), end.parse()) {
                        range = Some((s, e));
                    }
                }
            }
        }
    }

    let mut body = buf[header_end..].to_vec();
    while body.len() < content_length {
        let n = socket.read(&mut tmp).await?;
        if n == 0 {
            break;
        }
        body.extend_from_slice(&tmp[..n]);
    }

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .to_string();

    let (status, response_body) = match mode {
        Mode::Upload { final_path, token } => {
            log.lock().unwrap().push((path.clone(), body));
            if path == *final_path {
                ("200 OK", token.clone().into_bytes())
            } else {
                ("200 OK", Vec::new())
            }
        }
        Mode::Download { blob } => match range {
            Some((start, end)) => {
                let end = (end + 1).min(blob.len() as u64);
                let slice = blob[start as usize..end as usize].to_vec();
                ("206 Partial Content", slice)
            }
            None => ("200 OK", blob.clone()),
        },
    };

    let response = format!(
        "HTTP/1.1 {status}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
        response_body.len()
    );
    socket.write_all(response.as_bytes()).await?;
    socket.write_all(&response_body).await?;
    socket.flush().await?;
    Ok(())
}
