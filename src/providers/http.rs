//! Minimal blocking HTTP/1.1 client over std `TcpStream`: JSON POST with
//! per-call timeouts, Content-Length or chunked bodies, and line streaming
//! for NDJSON endpoints. Failures are classified for the retry layer.

use anyhow::Result;
use std::io::{self, BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::time::Duration;

use crate::cancel::CancelToken;
use crate::error::{ExternalClass, MemoryError};

#[derive(Debug, Clone)]
pub struct HttpClient {
    service: &'static str,
    /// `host:port`
    authority: String,
    timeout: Duration,
}

#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

fn external(service: &'static str, class: ExternalClass, msg: impl Into<String>) -> anyhow::Error {
    MemoryError::external(service, class, msg).into()
}

fn io_class(err: &io::Error) -> ExternalClass {
    match err.kind() {
        ErrorKind::TimedOut | ErrorKind::WouldBlock => ExternalClass::Timeout,
        ErrorKind::InvalidData | ErrorKind::UnexpectedEof => ExternalClass::Protocol,
        _ => ExternalClass::Network,
    }
}

impl HttpClient {
    /// Accepts `http://host:port`, `host:port` or bare `host` (port 80).
    pub fn new(service: &'static str, base_url: &str, timeout: Duration) -> Result<Self> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if trimmed.starts_with("https://") {
            return Err(MemoryError::validation(format!(
                "{service}: https endpoints are not supported ({trimmed})"
            ))
            .into());
        }
        let authority = trimmed.strip_prefix("http://").unwrap_or(trimmed);
        if authority.is_empty() || authority.contains('/') {
            return Err(MemoryError::validation(format!("{service}: invalid host '{base_url}'")).into());
        }
        let authority = if authority.contains(':') {
            authority.to_string()
        } else {
            format!("{authority}:80")
        };
        Ok(Self {
            service,
            authority,
            timeout,
        })
    }

    pub fn authority(&self) -> &str {
        &self.authority
    }

    fn connect(&self) -> Result<TcpStream> {
        let addrs: Vec<_> = self
            .authority
            .to_socket_addrs()
            .map_err(|e| external(self.service, ExternalClass::Network, format!("resolve {}: {e}", self.authority)))?
            .collect();
        let mut last_err = None;
        for addr in addrs {
            match TcpStream::connect_timeout(&addr, self.timeout) {
                Ok(stream) => {
                    stream
                        .set_read_timeout(Some(self.timeout))
                        .and_then(|_| stream.set_write_timeout(Some(self.timeout)))
                        .map_err(|e| external(self.service, ExternalClass::Network, e.to_string()))?;
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        let (class, msg) = match last_err {
            Some(e) => (io_class(&e), format!("connect {}: {e}", self.authority)),
            None => (ExternalClass::Network, format!("no address for {}", self.authority)),
        };
        Err(external(self.service, class, msg))
    }

    fn send(&self, path: &str, body: &str) -> Result<(u16, BufReader<BodyReader>)> {
        let mut stream = self.connect()?;
        let request = format!(
            "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nAccept: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
            host = self.authority,
            len = body.len(),
        );
        stream
            .write_all(request.as_bytes())
            .map_err(|e| external(self.service, io_class(&e), format!("send: {e}")))?;

        let mut reader = BufReader::new(stream);
        let head = read_head(&mut reader).map_err(|e| external(self.service, io_class(&e), format!("read head: {e}")))?;
        let body = if head.chunked {
            BodyReader::Chunked {
                inner: reader,
                remaining: 0,
                done: false,
            }
        } else if let Some(len) = head.content_length {
            BodyReader::Sized {
                inner: reader,
                remaining: len,
            }
        } else {
            BodyReader::UntilClose { inner: reader }
        };
        Ok((head.status, BufReader::new(body)))
    }

    /// POST a JSON body; non-2xx statuses become classified errors.
    pub fn post_json(&self, path: &str, body: &str) -> Result<HttpResponse> {
        let (status, mut reader) = self.send(path, body)?;
        let mut text = String::new();
        reader
            .read_to_string(&mut text)
            .map_err(|e| external(self.service, io_class(&e), format!("read body: {e}")))?;
        if let Some(class) = ExternalClass::from_status(status) {
            return Err(external(self.service, class, format!("HTTP {status}: {}", truncate(&text, 200))));
        }
        Ok(HttpResponse { status, body: text })
    }

    /// POST and hand each non-empty response line to `on_line` as it arrives.
    pub fn post_lines(
        &self,
        path: &str,
        body: &str,
        cancel: &CancelToken,
        mut on_line: impl FnMut(&str) -> Result<()>,
    ) -> Result<()> {
        let (status, mut reader) = self.send(path, body)?;
        if let Some(class) = ExternalClass::from_status(status) {
            let mut text = String::new();
            let _ = reader.read_to_string(&mut text);
            return Err(external(self.service, class, format!("HTTP {status}: {}", truncate(&text, 200))));
        }
        let mut line = String::new();
        loop {
            cancel.check()?;
            line.clear();
            let n = reader
                .read_line(&mut line)
                .map_err(|e| external(self.service, io_class(&e), format!("read stream: {e}")))?;
            if n == 0 {
                return Ok(());
            }
            let trimmed = line.trim();
            if !trimmed.is_empty() {
                on_line(trimmed)?;
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

// ── Response parsing ────────────────────────────────────────────────────────

struct Head {
    status: u16,
    chunked: bool,
    content_length: Option<u64>,
}

fn read_head<R: BufRead>(reader: &mut R) -> io::Result<Head> {
    let mut status_line = String::new();
    if reader.read_line(&mut status_line)? == 0 {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "empty response"));
    }
    let status = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse::<u16>().ok())
        .ok_or_else(|| io::Error::new(ErrorKind::InvalidData, format!("bad status line: {}", status_line.trim())))?;

    let mut chunked = false;
    let mut content_length = None;
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line)? == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated headers"));
        }
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            let name = name.trim().to_ascii_lowercase();
            let value = value.trim();
            if name == "transfer-encoding" && value.to_ascii_lowercase().contains("chunked") {
                chunked = true;
            } else if name == "content-length" {
                content_length = value.parse().ok();
            }
        }
    }
    Ok(Head {
        status,
        chunked,
        content_length,
    })
}

/// Body framing decoder.
enum BodyReader {
    Sized { inner: BufReader<TcpStream>, remaining: u64 },
    Chunked { inner: BufReader<TcpStream>, remaining: u64, done: bool },
    UntilClose { inner: BufReader<TcpStream> },
}

impl Read for BodyReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BodyReader::Sized { inner, remaining } => {
                if *remaining == 0 {
                    return Ok(0);
                }
                let cap = (*remaining).min(buf.len() as u64) as usize;
                let n = inner.read(&mut buf[..cap])?;
                *remaining -= n as u64;
                Ok(n)
            }
            BodyReader::Chunked {
                inner,
                remaining,
                done,
            } => read_chunked(inner, remaining, done, buf),
            BodyReader::UntilClose { inner } => inner.read(buf),
        }
    }
}

fn read_chunked<R: BufRead>(inner: &mut R, remaining: &mut u64, done: &mut bool, buf: &mut [u8]) -> io::Result<usize> {
    if *done {
        return Ok(0);
    }
    if *remaining == 0 {
        let mut size_line = String::new();
        if inner.read_line(&mut size_line)? == 0 {
            return Err(io::Error::new(ErrorKind::UnexpectedEof, "missing chunk size"));
        }
        let hex = size_line.trim().split(';').next().unwrap_or_default();
        let size = u64::from_str_radix(hex, 16)
            .map_err(|_| io::Error::new(ErrorKind::InvalidData, format!("bad chunk size '{hex}'")))?;
        if size == 0 {
            *done = true;
            // trailers end with an empty line; ignore them
            let mut trailer = String::new();
            while inner.read_line(&mut trailer)? > 0 && !trailer.trim().is_empty() {
                trailer.clear();
            }
            return Ok(0);
        }
        *remaining = size;
    }
    let cap = (*remaining).min(buf.len() as u64) as usize;
    let n = inner.read(&mut buf[..cap])?;
    if n == 0 {
        return Err(io::Error::new(ErrorKind::UnexpectedEof, "truncated chunk"));
    }
    *remaining -= n as u64;
    if *remaining == 0 {
        let mut crlf = [0u8; 2];
        inner.read_exact(&mut crlf)?;
    }
    Ok(n)
}

#[cfg(test)]
pub(crate) mod testserver {
    //! One-shot scripted HTTP server for provider tests.
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;
    use std::thread;

    /// Serve `responses` to successive connections; returns the base URL and
    /// a receiver of the request bodies seen.
    pub fn serve(responses: Vec<String>) -> (String, mpsc::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else { return };
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                let mut len = 0usize;
                loop {
                    let mut line = String::new();
                    if reader.read_line(&mut line).unwrap_or(0) == 0 {
                        break;
                    }
                    let l = line.trim_end().to_ascii_lowercase();
                    if l.is_empty() {
                        break;
                    }
                    if let Some(v) = l.strip_prefix("content-length:") {
                        len = v.trim().parse().unwrap_or(0);
                    }
                }
                let mut body = vec![0u8; len];
                let _ = reader.read_exact(&mut body);
                let _ = tx.send(String::from_utf8_lossy(&body).to_string());
                let _ = stream.write_all(response.as_bytes());
            }
        });
        (format!("http://{addr}"), rx)
    }

    pub fn json_response(status: u16, body: &str) -> String {
        format!(
            "HTTP/1.1 {status} X\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
            body.len()
        )
    }

    pub fn chunked_response(lines: &[&str]) -> String {
        let mut out = String::from("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nConnection: close\r\n\r\n");
        for line in lines {
            let chunk = format!("{line}\n");
            out.push_str(&format!("{:x}\r\n{chunk}\r\n", chunk.len()));
        }
        out.push_str("0\r\n\r\n");
        out
    }
}

#[cfg(test)]
mod tests {
    use super::testserver::*;
    use super::*;
    use crate::error::domain_error;

    fn client(url: &str) -> HttpClient {
        HttpClient::new("test", url, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn parses_sized_body() {
        let (url, rx) = serve(vec![json_response(200, r#"{"ok":true}"#)]);
        let resp = client(&url).post_json("/x", r#"{"q":1}"#).unwrap();
        assert_eq!(resp.status, 200);
        assert_eq!(resp.body, r#"{"ok":true}"#);
        assert_eq!(rx.recv().unwrap(), r#"{"q":1}"#);
    }

    #[test]
    fn streams_chunked_lines() {
        let (url, _rx) = serve(vec![chunked_response(&["{\"a\":1}", "{\"a\":2}"])]);
        let mut seen = Vec::new();
        client(&url)
            .post_lines("/s", "{}", &CancelToken::new(), |l| {
                seen.push(l.to_string());
                Ok(())
            })
            .unwrap();
        assert_eq!(seen, vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn status_codes_are_classified() {
        let (url, _rx) = serve(vec![json_response(429, "slow down"), json_response(400, "bad")]);
        let c = client(&url);
        let err = c.post_json("/x", "{}").unwrap_err();
        assert!(matches!(
            domain_error(&err),
            Some(MemoryError::External { class: ExternalClass::RateLimited, .. })
        ));
        let err = c.post_json("/x", "{}").unwrap_err();
        assert!(matches!(
            domain_error(&err),
            Some(MemoryError::External { class: ExternalClass::Client, .. })
        ));
    }

    #[test]
    fn refused_connection_is_network_class() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let err = client(&format!("http://{addr}")).post_json("/x", "{}").unwrap_err();
        match domain_error(&err) {
            Some(MemoryError::External { class, .. }) => assert!(class.is_transient()),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn https_is_rejected_up_front() {
        assert!(HttpClient::new("t", "https://example.com", Duration::from_secs(1)).is_err());
        assert_eq!(client("localhost").authority(), "localhost:80");
    }
}
