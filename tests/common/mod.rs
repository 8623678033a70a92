//! Minimal HTTP/1.1 server for integration tests.
//!
//! Every GET is answered by a caller-provided closure. The server records
//! each request's path and `Range` header and honours `Range: bytes=N-`
//! with `206 Partial Content` when the reply allows it.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

/// How the server answers one request.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: u16,
    pub body: Vec<u8>,
    /// Serve a suffix for `Range: bytes=N-` requests.
    pub support_ranges: bool,
    /// Hold the connection open after the headers instead of sending the body.
    pub stall: Option<Duration>,
}

impl Reply {
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        Self {
            status: 200,
            body: body.into(),
            support_ranges: true,
            stall: None,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            body: Vec::new(),
            support_ranges: false,
            stall: None,
        }
    }

    pub fn stalled(body: impl Into<Vec<u8>>, stall: Duration) -> Self {
        Self {
            stall: Some(stall),
            ..Self::ok(body)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Seen {
    pub path: String,
    pub range: Option<String>,
}

type Handler = dyn Fn(usize, &Seen) -> Reply + Send + Sync;

pub struct TestServer {
    pub base_url: String,
    requests: Arc<Mutex<Vec<Seen>>>,
}

impl TestServer {
    /// Starts a server in a background thread; `handler` receives the
    /// 0-based request index and the parsed request.
    pub fn start<F>(handler: F) -> Self
    where
        F: Fn(usize, &Seen) -> Reply + Send + Sync + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().unwrap().port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let handler: Arc<Handler> = Arc::new(handler);

        let seen = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                let seen = Arc::clone(&seen);
                let handler = Arc::clone(&handler);
                thread::spawn(move || handle(stream, &seen, handler.as_ref()));
            }
        });

        Self {
            base_url: format!("http://127.0.0.1:{}/", port),
            requests,
        }
    }

    /// Serves `body` for every request.
    pub fn serving(body: Vec<u8>) -> Self {
        Self::start(move |_, _| Reply::ok(body.clone()))
    }

    pub fn hits(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn requests(&self) -> Vec<Seen> {
        self.requests.lock().unwrap().clone()
    }
}

fn handle(mut stream: TcpStream, seen: &Mutex<Vec<Seen>>, handler: &Handler) {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(5)));
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    while !buf.windows(4).any(|w| w == b"\r\n\r\n") {
        match stream.read(&mut chunk) {
            Ok(0) | Err(_) => return,
            Ok(n) => buf.extend_from_slice(&chunk[..n]),
        }
    }
    let request = String::from_utf8_lossy(&buf).to_string();
    let request_seen = parse_request(&request);

    let index = {
        let mut all = seen.lock().unwrap();
        all.push(request_seen.clone());
        all.len() - 1
    };
    let reply = handler(index, &request_seen);

    let range_start = request_seen
        .range
        .as_deref()
        .and_then(|r| r.strip_prefix("bytes="))
        .and_then(|r| r.strip_suffix('-'))
        .and_then(|n| n.parse::<usize>().ok());

    let (status, body, extra) = match range_start {
        Some(start) if reply.status == 200 && reply.support_ranges => {
            if start >= reply.body.len() {
                (416, Vec::new(), format!("Content-Range: bytes */{}\r\n", reply.body.len()))
            } else {
                let total = reply.body.len();
                (
                    206,
                    reply.body[start..].to_vec(),
                    format!("Content-Range: bytes {}-{}/{}\r\n", start, total - 1, total),
                )
            }
        }
        _ => (reply.status, reply.body.clone(), String::new()),
    };

    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n{}Connection: close\r\n\r\n",
        status,
        reason(status),
        body.len(),
        extra
    );
    if stream.write_all(head.as_bytes()).is_err() {
        return;
    }
    if let Some(stall) = reply.stall {
        let _ = stream.flush();
        thread::sleep(stall);
        return;
    }
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

fn parse_request(request: &str) -> Seen {
    let mut lines = request.lines();
    let path = lines
        .next()
        .and_then(|l| l.split_whitespace().nth(1))
        .unwrap_or("/")
        .to_string();
    let range = lines.find_map(|line| {
        let (name, value) = line.split_once(':')?;
        name.trim()
            .eq_ignore_ascii_case("range")
            .then(|| value.trim().to_string())
    });
    Seen { path, range }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        500 => "Internal Server Error",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

/// MD5 of `bytes` as lowercase hex.
pub fn md5_hex(bytes: &[u8]) -> String {
    use md5::{Digest, Md5};
    format!("{:x}", Md5::digest(bytes))
}

/// Gzip-compresses `bytes`.
pub fn gzip(bytes: &[u8]) -> Vec<u8> {
    use flate2::write::GzEncoder;
    use flate2::Compression;
    let mut enc = GzEncoder::new(Vec::new(), Compression::default());
    enc.write_all(bytes).unwrap();
    enc.finish().unwrap()
}
