//! Mock CDSE identity, catalog and download services.

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::TcpListener;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use cdse::{BaseUrls, ClientConfig, Credentials};
use httpmock::prelude::*;
use httpmock::Mock;
use md5::{Digest, Md5};
use serde_json::{Value, json};

pub const TOKEN_PATH: &str = "/auth/realms/CDSE/protocol/openid-connect/token";
pub const PRODUCTS_PATH: &str = "/odata/v1/Products";

pub fn download_path(id: &str) -> String {
    format!("/download/odata/v1/Products({id})/$value")
}

/// Client configuration with every endpoint on `server` and no backoff.
pub fn config(server: &MockServer) -> ClientConfig {
    config_with(BaseUrls::from_root(&server.base_url()))
}

pub fn config_with(urls: BaseUrls) -> ClientConfig {
    ClientConfig::new(Credentials::new("alice", "secret"))
        .with_urls(urls)
        .with_backoff(Duration::ZERO)
        .with_timeout(Duration::from_secs(10))
}

/// Identity endpoint issuing `access_token` for any grant.
pub fn token_mock<'a>(server: &'a MockServer, access_token: &str, expires_in: i64) -> Mock<'a> {
    server.mock(|when, then| {
        when.method(POST).path(TOKEN_PATH);
        then.status(200).json_body(token_json(access_token, expires_in));
    })
}

pub fn token_json(access_token: &str, expires_in: i64) -> Value {
    json!({
        "access_token": access_token,
        "expires_in": expires_in,
        "refresh_token": format!("refresh-{access_token}"),
        "refresh_expires_in": 3600,
        "token_type": "Bearer",
    })
}

pub fn md5_hex(bytes: &[u8]) -> String {
    format!("{:x}", Md5::digest(bytes))
}

/// Catalog entry for a product whose archive is `content`.
pub fn product_json(id: &str, name: &str, content: &[u8]) -> Value {
    json!({
        "Id": id,
        "Name": name,
        "ContentLength": content.len(),
        "Online": true,
        "Checksum": [{"Algorithm": "MD5", "Value": md5_hex(content)}],
        "ContentDate": {"Start": "2024-03-18T05:23:25.000Z", "End": "2024-03-18T05:23:50.000Z"},
        "Attributes": [
            {"Name": "orbitDirection", "Value": "ASCENDING"},
            {"Name": "relativeOrbitNumber", "Value": 117}
        ]
    })
}

/// Answers every request with `body`, except the first response, which
/// announces the full length, sends half and hangs up. Mock servers always
/// deliver complete bodies, so this one is plain sockets.
pub struct CutShortServer {
    url: String,
    hits: Arc<AtomicUsize>,
}

impl CutShortServer {
    pub fn start(content_type: &'static str, body: Vec<u8>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let url = format!("http://{}", listener.local_addr().expect("local addr"));
        let hits = Arc::new(AtomicUsize::new(0));

        let counter = Arc::clone(&hits);
        thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(mut stream) = stream else { continue };
                {
                    let mut reader = BufReader::new(&stream);
                    let mut line = String::new();
                    while reader.read_line(&mut line).map(|n| n > 0).unwrap_or(false) && line != "\r\n" {
                        line.clear();
                    }
                }
                let sent = match counter.fetch_add(1, Ordering::SeqCst) {
                    0 => &body[..body.len() / 2],
                    _ => &body[..],
                };
                let head = format!(
                    "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    body.len()
                );
                let _ = stream
                    .write_all(head.as_bytes())
                    .and_then(|_| stream.write_all(sent))
                    .and_then(|_| stream.flush());
            }
        });

        Self { url, hits }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }
}
