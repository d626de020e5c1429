//! Byte transports used by the source fetcher.
//!
//! HTTP(S) goes through the host's `curl`, the same tool the rest of the
//! build tooling already relies on for downloads. `file://` URLs and plain
//! paths are read directly, which is also what the tests use.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use std::time::Duration;

use log::debug;

use crate::fsutil::tmp_name;

/// What the server said about a completed transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseMeta {
    /// Final status after redirects.
    pub status: u16,
    /// Declared `Content-Length` of the final response, if any.
    pub content_length: Option<u64>,
}

/// Streams the body at `url` into `sink`.
///
/// Implementations must not interpret the status: a 404 body is still
/// streamed and reported, and the fetcher decides what counts as failure.
pub trait Transport: Send + Sync {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        timeout: Option<Duration>,
    ) -> io::Result<ResponseMeta>;
}

/// Local files, addressed as `file://<path>` or a bare path.
#[derive(Debug, Clone, Copy, Default)]
pub struct FileTransport;

impl Transport for FileTransport {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        _timeout: Option<Duration>,
    ) -> io::Result<ResponseMeta> {
        let path = local_path(url);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Ok(ResponseMeta {
                    status: 404,
                    content_length: None,
                });
            }
            Err(e) => return Err(e),
        };
        let len = f.metadata()?.len();
        io::copy(&mut f, sink)?;
        Ok(ResponseMeta {
            status: 200,
            content_length: Some(len),
        })
    }
}

/// Path named by a `file://` URL or a bare path.
pub fn local_path(url: &str) -> PathBuf {
    PathBuf::from(url.strip_prefix("file://").unwrap_or(url))
}

pub fn is_remote(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// HTTP(S) via the `curl` binary.
///
/// Response headers are dumped to a scratch file so the final status and
/// `Content-Length` can be read once the body has been streamed.
#[derive(Debug, Clone)]
pub struct CurlTransport {
    curl: PathBuf,
}

impl CurlTransport {
    pub fn new(curl: PathBuf) -> Self {
        Self { curl }
    }

    /// Find `curl` on `PATH`.
    pub fn locate() -> io::Result<Self> {
        which::which("curl")
            .map(Self::new)
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, format!("curl not found: {e}")))
    }
}

impl Transport for CurlTransport {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        timeout: Option<Duration>,
    ) -> io::Result<ResponseMeta> {
        let header_file = std::env::temp_dir().join(tmp_name("curl-headers"));
        let result = run_curl(&self.curl, url, sink, timeout, &header_file);
        let _ = fs::remove_file(&header_file);
        result
    }
}

fn run_curl(
    curl: &Path,
    url: &str,
    sink: &mut dyn Write,
    timeout: Option<Duration>,
    header_file: &Path,
) -> io::Result<ResponseMeta> {
    let mut cmd = Command::new(curl);
    cmd.args(curl_args(url, timeout, header_file))
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    debug!("running {:?}", cmd);

    let mut child = cmd.spawn()?;
    let copied = match child.stdout.take() {
        Some(mut stdout) => io::copy(&mut stdout, sink),
        None => Err(io::Error::other("curl stdout was not captured")),
    };
    let mut stderr = String::new();
    if let Some(mut err) = child.stderr.take() {
        let _ = err.read_to_string(&mut stderr);
    }
    let status = child.wait()?;
    copied?;

    if !status.success() {
        return Err(io::Error::other(format!(
            "curl exited with {status}: {}",
            stderr.trim()
        )));
    }

    let headers = fs::read_to_string(header_file)?;
    parse_final_headers(&headers).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("no HTTP status line in response headers for {url}"),
        )
    })
}

/// Give up on a connection that is not established within this long.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// A transfer slower than one byte per second for this long is stalled.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(60);

fn curl_args(url: &str, timeout: Option<Duration>, header_file: &Path) -> Vec<OsString> {
    let mut args: Vec<OsString> = ["--silent", "--show-error", "--location"]
        .into_iter()
        .map(OsString::from)
        .collect();
    args.push("--user-agent".into());
    args.push(concat!("debugger-bundler/", env!("CARGO_PKG_VERSION")).into());
    args.push("--dump-header".into());
    args.push(header_file.as_os_str().to_os_string());

    let connect = timeout.map_or(CONNECT_TIMEOUT, |t| t.min(CONNECT_TIMEOUT));
    args.push("--connect-timeout".into());
    args.push(connect.as_secs().max(1).to_string().into());
    args.push("--speed-limit".into());
    args.push("1".into());
    args.push("--speed-time".into());
    args.push(STALL_TIMEOUT.as_secs().to_string().into());
    if let Some(t) = timeout {
        args.push("--max-time".into());
        args.push(t.as_secs().max(1).to_string().into());
    }
    args.push(url.into());
    args
}

/// Status and `Content-Length` of the last response in a header dump.
///
/// With `--location`, curl writes one header block per hop; only the final
/// block describes the body that was streamed.
pub(crate) fn parse_final_headers(dump: &str) -> Option<ResponseMeta> {
    let mut meta = None;
    for line in dump.lines() {
        let line = line.trim_end();
        if line.starts_with("HTTP/") {
            let status = line.split_whitespace().nth(1)?.parse().ok()?;
            meta = Some(ResponseMeta {
                status,
                content_length: None,
            });
        } else if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                if let Some(m) = meta.as_mut() {
                    m.content_length = value.trim().parse().ok();
                }
            }
        }
    }
    meta
}

/// Routes `http(s)://` to curl and everything else to the local filesystem.
#[derive(Debug, Default)]
pub struct SystemTransport {
    curl: OnceLock<Option<CurlTransport>>,
}

impl SystemTransport {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Transport for SystemTransport {
    fn download(
        &self,
        url: &str,
        sink: &mut dyn Write,
        timeout: Option<Duration>,
    ) -> io::Result<ResponseMeta> {
        if !is_remote(url) {
            return FileTransport.download(url, sink, timeout);
        }
        match self.curl.get_or_init(|| CurlTransport::locate().ok()) {
            Some(curl) => curl.download(url, sink, timeout),
            None => Err(io::Error::new(
                io::ErrorKind::NotFound,
                "curl is required for http(s) sources but was not found on PATH",
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn final_header_block_wins() {
        let dump = "HTTP/1.1 302 Found\r\nLocation: https://cdn/x\r\nContent-Length: 0\r\n\r\n\
                    HTTP/2 200\r\ncontent-length: 1234\r\n\r\n";
        let meta = parse_final_headers(dump).unwrap();
        assert_eq!(meta.status, 200);
        assert_eq!(meta.content_length, Some(1234));
    }

    #[test]
    fn missing_length_is_none() {
        let meta = parse_final_headers("HTTP/1.1 404 Not Found\r\n\r\n").unwrap();
        assert_eq!(meta.status, 404);
        assert_eq!(meta.content_length, None);
        assert!(parse_final_headers("garbage").is_none());
    }

    #[test]
    fn file_transport_reads_local_paths_and_reports_404() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("x.tar.xz");
        fs::write(&path, b"payload").unwrap();

        let mut sink = Vec::new();
        let url = format!("file://{}", path.display());
        let meta = FileTransport.download(&url, &mut sink, None).unwrap();
        assert_eq!(meta.status, 200);
        assert_eq!(meta.content_length, Some(7));
        assert_eq!(sink, b"payload");

        let meta = FileTransport
            .download(&temp.path().join("nope").display().to_string(), &mut Vec::new(), None)
            .unwrap();
        assert_eq!(meta.status, 404);
    }

    fn value_after<'a>(args: &'a [OsString], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .and_then(|v| v.to_str())
    }

    #[test]
    fn curl_is_always_bounded() {
        let headers = Path::new("/tmp/headers");
        let args = curl_args("https://example.invalid/x", None, headers);
        assert_eq!(value_after(&args, "--connect-timeout"), Some("30"));
        assert_eq!(value_after(&args, "--speed-time"), Some("60"));
        assert_eq!(value_after(&args, "--max-time"), None);
        assert_eq!(args.last().and_then(|a| a.to_str()), Some("https://example.invalid/x"));

        let args = curl_args(
            "https://example.invalid/x",
            Some(Duration::from_secs(5)),
            headers,
        );
        assert_eq!(value_after(&args, "--connect-timeout"), Some("5"));
        assert_eq!(value_after(&args, "--max-time"), Some("5"));
    }

    #[test]
    fn remote_detection() {
        assert!(is_remote("https://github.com/llvm/llvm-project/releases/x.tar.xz"));
        assert!(!is_remote("file:///tmp/x"));
        assert!(!is_remote("/tmp/x"));
    }
}
