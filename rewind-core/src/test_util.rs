use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    thread,
    thread::JoinHandle,
};

use url::Url;

/// In-process HTTP server for exercising the ranged fetcher and the cache
/// end-to-end.  Serves one blob, honoring `Range: bytes=start-end` with
/// `206 Partial Content`.
pub struct RangedServer {
    server: Arc<tiny_http::Server>,
    addr: SocketAddr,
    range_requests: Arc<AtomicUsize>,
    thread: Option<JoinHandle<()>>,
}

pub struct RangedServerBuilder {
    data: Vec<u8>,
    ranges: bool,
    etag: bool,
}

impl RangedServer {
    pub fn new(data: Vec<u8>) -> RangedServer {
        Self::builder(data).start()
    }

    pub fn builder(data: Vec<u8>) -> RangedServerBuilder {
        RangedServerBuilder {
            data,
            ranges: true,
            etag: true,
        }
    }

    pub fn url(&self) -> Url {
        Url::parse(&format!("http://{}/recording", self.addr)).unwrap()
    }

    /// Number of ranged requests answered so far.
    pub fn range_requests(&self) -> usize {
        self.range_requests.load(Ordering::SeqCst)
    }
}

impl RangedServerBuilder {
    pub fn no_ranges(mut self) -> Self {
        self.ranges = false;
        self
    }

    pub fn no_etag(mut self) -> Self {
        self.etag = false;
        self
    }

    pub fn start(self) -> RangedServer {
        let server = Arc::new(tiny_http::Server::http("127.0.0.1:0").unwrap());
        let addr = server.server_addr().to_ip().unwrap();
        let range_requests = Arc::new(AtomicUsize::new(0));

        let thread = thread::spawn({
            let server = Arc::clone(&server);
            let range_requests = Arc::clone(&range_requests);
            let RangedServerBuilder { data, ranges, etag } = self;
            move || {
                for request in server.incoming_requests() {
                    let requested = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Range"))
                        .and_then(|h| parse_range(h.value.as_str()));

                    let mut response = match requested {
                        Some((start, end)) if ranges && start < data.len() as u64 => {
                            range_requests.fetch_add(1, Ordering::SeqCst);
                            let end = end.min(data.len() as u64);
                            let body = data[start as usize..end as usize].to_vec();
                            tiny_http::Response::from_data(body)
                                .with_status_code(206)
                                .with_header(header(
                                    "Content-Range",
                                    &format!("bytes {}-{}/{}", start, end - 1, data.len()),
                                ))
                        }
                        _ => tiny_http::Response::from_data(data.clone()),
                    };

                    if ranges {
                        response = response.with_header(header("Accept-Ranges", "bytes"));
                    }
                    response = if etag {
                        response.with_header(header("ETag", "\"ranged-0\""))
                    } else {
                        response
                            .with_header(header("Last-Modified", "Thu, 01 Jan 1970 00:00:00 GMT"))
                    };

                    let _ = request.respond(response);
                }
            }
        });

        RangedServer {
            server,
            addr,
            range_requests,
            thread: Some(thread),
        }
    }
}

impl Drop for RangedServer {
    fn drop(&mut self) {
        self.server.unblock();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn header(field: &str, value: &str) -> tiny_http::Header {
    tiny_http::Header::from_bytes(field.as_bytes(), value.as_bytes()).unwrap()
}

/// Parses `bytes=start-end` (inclusive end) into a half-open range.
fn parse_range(value: &str) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = end.trim().parse().ok()?;
    Some((start, end + 1))
}
