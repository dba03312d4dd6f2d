//! 单个条目的传输执行器。
//!
//! 响应体按块直接写入目标文件，内存占用与条目大小无关；任何失败都会删除写了一半的文件，
//! 保证重试不会在旧字节后追加。

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use reqwest::StatusCode;
use reqwest::blocking::{Client, ClientBuilder};
use reqwest::header::{ACCEPT, HeaderMap, HeaderValue, RETRY_AFTER, USER_AGENT};
use time::OffsetDateTime;
use tracing::{debug, warn};

use super::error::TransferError;
use super::models::DownloadTask;

const CHUNK_SIZE: usize = 64 * 1024;

pub trait TransferExecutor: Send + Sync {
    /// 下载 `task` 到 `task.destination`，返回写入的字节数。
    fn fetch(
        &self,
        task: &DownloadTask,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<u64, TransferError>;
}

pub struct HttpTransfer {
    client: Client,
    token: Option<String>,
}

impl HttpTransfer {
    pub fn new(token: Option<String>, connect_timeout: Duration) -> Result<Self, TransferError> {
        let client = client_builder(connect_timeout)
            .build()
            .map_err(|e| TransferError::Network(format!("http client init failed: {e}")))?;

        Ok(Self { client, token })
    }

    fn fetch_url(
        &self,
        url: &str,
        destination: &Path,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<u64, TransferError> {
        let deadline = Instant::now() + timeout;
        let mut req = self.client.get(url).timeout(timeout);
        if let Some(token) = self.token.as_deref() {
            req = req.bearer_auth(token);
        }

        let resp = req.send().map_err(|e| {
            if e.is_timeout() {
                TransferError::Timeout(timeout)
            } else {
                TransferError::Network(e.without_url().to_string())
            }
        })?;
        classify_status(resp.status(), resp.headers())?;

        stream_to_file(resp, destination, deadline, timeout, cancel)
    }
}

impl TransferExecutor for HttpTransfer {
    fn fetch(
        &self,
        task: &DownloadTask,
        timeout: Duration,
        cancel: &AtomicBool,
    ) -> Result<u64, TransferError> {
        let mut last_missing = None;
        for url in task.descriptor.candidate_urls() {
            if cancel.load(Ordering::Relaxed) {
                return Err(TransferError::Interrupted);
            }
            match self.fetch_url(url, &task.destination, timeout, cancel) {
                Err(TransferError::NotFound(msg)) => {
                    debug!(target: "transfer", id = task.id(), "地址不存在，尝试下一个: {msg}");
                    last_missing = Some(msg);
                }
                other => return other,
            }
        }
        Err(TransferError::NotFound(
            last_missing.unwrap_or_else(|| format!("no archive url for {}", task.id())),
        ))
    }
}

fn client_builder(connect_timeout: Duration) -> ClientBuilder {
    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("*/*"));
    headers.insert(
        USER_AGENT,
        HeaderValue::from_static(concat!("gh-vault/", env!("CARGO_PKG_VERSION"))),
    );
    Client::builder()
        .default_headers(headers)
        .connect_timeout(connect_timeout)
}

/// HTTP 状态码 → 错误分类。
pub(crate) fn classify_status(status: StatusCode, headers: &HeaderMap) -> Result<(), TransferError> {
    if status.is_success() {
        return Ok(());
    }
    let rate_exhausted = headers
        .get("x-ratelimit-remaining")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim() == "0")
        .unwrap_or(false);

    match status {
        StatusCode::TOO_MANY_REQUESTS => Err(TransferError::RateLimited {
            retry_after: suggested_wait(headers),
        }),
        StatusCode::FORBIDDEN if rate_exhausted => Err(TransferError::RateLimited {
            retry_after: suggested_wait(headers),
        }),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(TransferError::Unauthorized(format!("HTTP {status}")))
        }
        StatusCode::NOT_FOUND | StatusCode::GONE => {
            Err(TransferError::NotFound(format!("HTTP {status}")))
        }
        _ => Err(TransferError::Network(format!("HTTP {status}"))),
    }
}

/// `Retry-After`（秒）优先，其次 `x-ratelimit-reset`（epoch 秒）。
fn suggested_wait(headers: &HeaderMap) -> Option<Duration> {
    let header_u64 = |name: &str| -> Option<u64> {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
    };
    if let Some(secs) = header_u64(RETRY_AFTER.as_str()) {
        return Some(Duration::from_secs(secs));
    }
    let reset = header_u64("x-ratelimit-reset")?;
    let now = OffsetDateTime::now_utc().unix_timestamp().max(0) as u64;
    Some(Duration::from_secs(reset.saturating_sub(now).max(1)))
}

pub(crate) fn stream_to_file<R: Read>(
    mut body: R,
    destination: &Path,
    deadline: Instant,
    timeout: Duration,
    cancel: &AtomicBool,
) -> Result<u64, TransferError> {
    let result = (|| -> Result<u64, TransferError> {
        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent).map_err(|e| TransferError::fs(parent, e))?;
        }
        let mut file = File::create(destination).map_err(|e| TransferError::fs(destination, e))?;
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut written = 0u64;
        loop {
            if cancel.load(Ordering::Relaxed) {
                return Err(TransferError::Interrupted);
            }
            if Instant::now() >= deadline {
                return Err(TransferError::Timeout(timeout));
            }
            let n = match body.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                // reqwest 的 blocking reader 在总超时到期时返回 Other，需要看内层错误
                Err(e) if Instant::now() >= deadline || is_timeout(&e) => {
                    return Err(TransferError::Timeout(timeout));
                }
                Err(e) => return Err(TransferError::Network(e.to_string())),
            };
            file.write_all(&buf[..n])
                .map_err(|e| TransferError::fs(destination, e))?;
            written += n as u64;
        }
        file.flush().map_err(|e| TransferError::fs(destination, e))?;
        Ok(written)
    })();

    if result.is_err() {
        discard_partial(destination);
    }
    result
}

fn is_timeout(e: &io::Error) -> bool {
    if e.kind() == io::ErrorKind::TimedOut {
        return true;
    }
    let mut source = e
        .get_ref()
        .map(|inner| inner as &(dyn std::error::Error + 'static));
    while let Some(err) = source {
        if let Some(re) = err.downcast_ref::<reqwest::Error>()
            && re.is_timeout()
        {
            return true;
        }
        if let Some(io) = err.downcast_ref::<io::Error>()
            && io.kind() == io::ErrorKind::TimedOut
        {
            return true;
        }
        source = err.source();
    }
    false
}

/// 删除残留的目标文件（不存在时忽略）。
pub(crate) fn discard_partial(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!(target: "transfer", path = %path.display(), "已删除残留文件"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(target: "transfer", path = %path.display(), "删除残留文件失败: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::models::{ItemDescriptor, ItemKind};
    use crate::download::verify::tests::write_zip;
    use std::io::{BufRead, BufReader, Cursor};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;

    struct FailingReader {
        served: usize,
        kind: io::ErrorKind,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.served > 0 {
                return Err(io::Error::new(self.kind, "connection dropped"));
            }
            let n = buf.len().min(1024);
            buf[..n].fill(b'x');
            self.served += n;
            Ok(n)
        }
    }

    fn far_deadline() -> Instant {
        Instant::now() + Duration::from_secs(60)
    }

    #[test]
    fn streams_whole_body() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("repositories").join("a.zip");
        let body = vec![7u8; CHUNK_SIZE * 3 + 17];
        let cancel = AtomicBool::new(false);

        let n = stream_to_file(
            Cursor::new(body.clone()),
            &dest,
            far_deadline(),
            Duration::from_secs(60),
            &cancel,
        )
        .unwrap();
        assert_eq!(n, body.len() as u64);
        assert_eq!(fs::read(&dest).unwrap(), body);
    }

    #[test]
    fn broken_stream_removes_partial_file() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let cancel = AtomicBool::new(false);
        let reader = FailingReader {
            served: 0,
            kind: io::ErrorKind::ConnectionReset,
        };

        let err = stream_to_file(reader, &dest, far_deadline(), Duration::from_secs(60), &cancel)
            .unwrap_err();
        assert!(matches!(err, TransferError::Network(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn read_timeout_maps_to_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let cancel = AtomicBool::new(false);
        let reader = FailingReader {
            served: 0,
            kind: io::ErrorKind::TimedOut,
        };

        let err = stream_to_file(reader, &dest, far_deadline(), Duration::from_secs(5), &cancel)
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn expired_deadline_is_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let cancel = AtomicBool::new(false);

        let err = stream_to_file(
            Cursor::new(vec![1u8; 10]),
            &dest,
            Instant::now(),
            Duration::from_millis(1),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)));
        assert!(!dest.exists());
    }

    #[test]
    fn cancel_interrupts_and_discards() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.zip");
        let cancel = AtomicBool::new(true);

        let err = stream_to_file(
            Cursor::new(vec![1u8; 10]),
            &dest,
            far_deadline(),
            Duration::from_secs(60),
            &cancel,
        )
        .unwrap_err();
        assert!(matches!(err, TransferError::Interrupted));
        assert!(!dest.exists());
    }

    #[test]
    fn status_mapping() {
        let empty = HeaderMap::new();
        assert!(classify_status(StatusCode::OK, &empty).is_ok());
        assert!(matches!(
            classify_status(StatusCode::UNAUTHORIZED, &empty),
            Err(TransferError::Unauthorized(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::FORBIDDEN, &empty),
            Err(TransferError::Unauthorized(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::NOT_FOUND, &empty),
            Err(TransferError::NotFound(_))
        ));
        assert!(matches!(
            classify_status(StatusCode::BAD_GATEWAY, &empty),
            Err(TransferError::Network(_))
        ));
    }

    #[test]
    fn rate_limit_signals_carry_wait() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("42"));
        match classify_status(StatusCode::TOO_MANY_REQUESTS, &headers) {
            Err(TransferError::RateLimited { retry_after }) => {
                assert_eq!(retry_after, Some(Duration::from_secs(42)))
            }
            other => panic!("unexpected {other:?}"),
        }

        let mut headers = HeaderMap::new();
        headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
        let reset = OffsetDateTime::now_utc().unix_timestamp() + 120;
        headers.insert(
            "x-ratelimit-reset",
            HeaderValue::from_str(&reset.to_string()).unwrap(),
        );
        match classify_status(StatusCode::FORBIDDEN, &headers) {
            Err(TransferError::RateLimited {
                retry_after: Some(wait),
            }) => assert!(wait <= Duration::from_secs(120) && wait >= Duration::from_secs(100)),
            other => panic!("unexpected {other:?}"),
        }
    }

    enum Reply {
        Body(Vec<u8>),
        /// 声明 `declared` 字节，只发出 `sent` 字节后停住
        Stall { sent: usize, declared: usize },
    }

    /// 本地 HTTP 服务；未登记的路径一律 404。
    fn serve(routes: Vec<(&'static str, Reply)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let routes = Arc::new(routes);
        std::thread::spawn(move || {
            for stream in listener.incoming() {
                let Ok(stream) = stream else { break };
                let routes = Arc::clone(&routes);
                std::thread::spawn(move || respond(stream, &routes));
            }
        });
        format!("http://{addr}")
    }

    fn respond(mut stream: TcpStream, routes: &[(&'static str, Reply)]) {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request_line = String::new();
        if reader.read_line(&mut request_line).is_err() {
            return;
        }
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).unwrap_or(0) <= 2 {
                break;
            }
        }
        let path = request_line.split_whitespace().nth(1).unwrap_or("/");

        let _ = match routes.iter().find(|(p, _)| *p == path).map(|(_, r)| r) {
            Some(Reply::Body(body)) => write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            )
            .and_then(|()| stream.write_all(body)),
            Some(Reply::Stall { sent, declared }) => write!(
                stream,
                "HTTP/1.1 200 OK\r\nContent-Length: {declared}\r\nConnection: close\r\n\r\n"
            )
            .and_then(|()| stream.write_all(&vec![b'P'; *sent]))
            .and_then(|()| stream.flush())
            .map(|()| std::thread::sleep(Duration::from_secs(3))),
            None => stream.write_all(
                b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
            ),
        };
    }

    fn local_transfer() -> HttpTransfer {
        HttpTransfer {
            client: client_builder(Duration::from_secs(5))
                .no_proxy()
                .build()
                .unwrap(),
            token: None,
        }
    }

    fn task_for(dir: &Path, source_url: String, fallback_urls: Vec<String>) -> DownloadTask {
        let descriptor = ItemDescriptor {
            id: "7".into(),
            display_name: "me/tools".into(),
            source_url,
            fallback_urls,
            size_hint: None,
            updated_at: None,
            kind: ItemKind::Repository,
        };
        DownloadTask::new(descriptor, dir.join("repositories").join("tools.zip"))
    }

    fn zip_bytes(dir: &Path) -> Vec<u8> {
        let path = dir.join("fixture.zip");
        write_zip(&path, 2);
        fs::read(path).unwrap()
    }

    #[test]
    fn falls_back_when_primary_url_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let body = zip_bytes(dir.path());
        let base = serve(vec![("/master.zip", Reply::Body(body.clone()))]);
        let task = task_for(
            dir.path(),
            format!("{base}/main.zip"),
            vec![format!("{base}/master.zip")],
        );
        let cancel = AtomicBool::new(false);

        let n = local_transfer()
            .fetch(&task, Duration::from_secs(5), &cancel)
            .unwrap();
        assert_eq!(n, body.len() as u64);
        assert_eq!(fs::read(&task.destination).unwrap(), body);
    }

    #[test]
    fn not_found_only_when_every_url_is_missing() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(Vec::new());
        let task = task_for(
            dir.path(),
            format!("{base}/main.zip"),
            vec![format!("{base}/master.zip")],
        );
        let cancel = AtomicBool::new(false);

        let err = local_transfer()
            .fetch(&task, Duration::from_secs(5), &cancel)
            .unwrap_err();
        assert!(matches!(err, TransferError::NotFound(_)), "got {err:?}");
        assert!(!task.destination.exists());
    }

    #[test]
    fn stalled_body_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let base = serve(vec![(
            "/slow.zip",
            Reply::Stall {
                sent: 10,
                declared: 100_000,
            },
        )]);
        let task = task_for(dir.path(), format!("{base}/slow.zip"), Vec::new());
        let cancel = AtomicBool::new(false);

        let err = local_transfer()
            .fetch(&task, Duration::from_secs(1), &cancel)
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout(_)), "got {err:?}");
        assert!(!task.destination.exists());
    }
}
