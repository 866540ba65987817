use std::{
    fs,
    io::{Read, Seek, SeekFrom},
    path::PathBuf,
};

use url::Url;

use crate::{error::Error, util};

/// Identity of the remote file at open time, strongest available first.
/// Lets callers detect that a remote recording changed under them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteTag {
    ETag(String),
    LastModified(String),
    None,
}

#[derive(Debug, Clone)]
pub struct RemoteInfo {
    pub size: u64,
    pub identifier: RemoteTag,
}

/// Byte-range access to a remote file.  `fetch` returns a blocking stream of
/// the requested bytes; dropping the reader cancels the transfer and is
/// always safe to do mid-body.
pub trait RangeFetcher: Send {
    fn open(&mut self) -> Result<RemoteInfo, Error>;

    fn fetch(&mut self, offset: u64, length: u64) -> Result<Box<dyn Read + Send>, Error>;
}

/// Ranged HTTP fetcher.  The remote must advertise `Accept-Ranges: bytes`
/// and report a positive `Content-Length`; ranged reads must answer with
/// `206 Partial Content`.
pub struct HttpFetcher {
    agent: ureq::Agent,
    url: Url,
}

impl HttpFetcher {
    pub fn new(url: Url) -> HttpFetcher {
        Self::with_agent(util::default_agent(), url)
    }

    pub fn with_agent(agent: ureq::Agent, url: Url) -> HttpFetcher {
        HttpFetcher { agent, url }
    }
}

impl RangeFetcher for HttpFetcher {
    fn open(&mut self) -> Result<RemoteInfo, Error> {
        // Probe the headers with a plain GET and drop the response before
        // consuming the body.
        let response = self
            .agent
            .get(self.url.as_str())
            .set("Cache-Control", "no-store")
            .call()?;

        let accepts_ranges = response
            .header("Accept-Ranges")
            .map(|v| v.trim().eq_ignore_ascii_case("bytes"))
            .unwrap_or(false);
        if !accepts_ranges {
            return Err(Error::RangesNotSupported);
        }

        let size: u64 = response
            .header("Content-Length")
            .and_then(|v| v.trim().parse().ok())
            .filter(|&len| len > 0)
            .ok_or(Error::UnexpectedResponse)?;

        let identifier = if let Some(etag) = response.header("ETag") {
            RemoteTag::ETag(etag.to_string())
        } else if let Some(modified) = response.header("Last-Modified") {
            RemoteTag::LastModified(modified.to_string())
        } else {
            RemoteTag::None
        };

        log::debug!("opened {}: {} bytes, {:?}", self.url, size, identifier);
        Ok(RemoteInfo { size, identifier })
    }

    fn fetch(&mut self, offset: u64, length: u64) -> Result<Box<dyn Read + Send>, Error> {
        let response = self
            .agent
            .get(self.url.as_str())
            .set("Range", &range_header(offset, length))
            .set("Cache-Control", "no-store")
            .call()?;

        if response.status() != 206 {
            log::warn!(
                "expected partial content for {}..{}, got {}",
                offset,
                offset + length,
                response.status()
            );
            return Err(Error::UnexpectedResponse);
        }
        Ok(Box::new(response.into_reader()))
    }
}

/// Constructs a Range header value for given offset and length.  The upper
/// bound is inclusive on the wire.
fn range_header(offset: u64, length: u64) -> String {
    let last_byte = offset + length - 1;
    format!("bytes={}-{}", offset, last_byte)
}

/// The same contract over a local file, so recordings on disk play through
/// the identical pipeline.
pub struct FileFetcher {
    path: PathBuf,
}

impl FileFetcher {
    pub fn new(path: impl Into<PathBuf>) -> FileFetcher {
        FileFetcher { path: path.into() }
    }
}

impl RangeFetcher for FileFetcher {
    fn open(&mut self) -> Result<RemoteInfo, Error> {
        let meta = fs::metadata(&self.path)?;
        let identifier = meta
            .modified()
            .map(|mtime| RemoteTag::LastModified(format!("{mtime:?}")))
            .unwrap_or(RemoteTag::None);
        Ok(RemoteInfo {
            size: meta.len(),
            identifier,
        })
    }

    fn fetch(&mut self, offset: u64, length: u64) -> Result<Box<dyn Read + Send>, Error> {
        // Open a fresh handle per range, so concurrent streams never share a
        // seek position.
        let mut file = fs::File::open(&self.path)?;
        file.seek(SeekFrom::Start(offset))?;
        Ok(Box::new(file.take(length)))
    }
}
