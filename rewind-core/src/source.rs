use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use serde::Serialize;

use crate::{
    cache::{CacheConfig, RemoteFileCache},
    error::Error,
    fetch::RangeFetcher,
    format::{self, IndexEntry, FIXED_HEADER_LEN, INDEX_ENTRY_LEN},
    time::Timestamp,
    util::CancelToken,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicInfo {
    pub name: String,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub receive_time: Timestamp,
    pub size_bytes: u64,
    pub payload: Vec<u8>,
    pub schema: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warn,
    Error,
}

/// One step of a message iteration.  Problems are per-message decoder
/// complaints that do not end the stream; a stamp marks the window boundary
/// when the iterator runs dry.
#[derive(Debug, Clone)]
pub enum IterItem {
    Message(Message),
    Problem {
        connection_id: u64,
        severity: Severity,
        message: String,
    },
    Stamp(Timestamp),
}

#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub start: Timestamp,
    pub end: Timestamp,
    pub topics: Vec<TopicInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct IterateRequest {
    pub topics: Vec<String>,
    pub start: Option<Timestamp>,
    pub end: Option<Timestamp>,
    pub reverse: bool,
}

#[derive(Clone, Default)]
pub struct BackfillRequest {
    pub topics: Vec<String>,
    pub time: Timestamp,
    pub cancel: Option<CancelToken>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LoadedRange {
    pub start: f64,
    pub end: f64,
}

/// Downloaded share of the backing file, as fractions of its size.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Progress {
    pub loaded: Vec<LoadedRange>,
}

impl Progress {
    pub fn complete() -> Progress {
        Progress {
            loaded: vec![LoadedRange { start: 0.0, end: 1.0 }],
        }
    }
}

pub type MessageIter = Box<dyn Iterator<Item = Result<IterItem, Error>> + Send>;

/// Typed message access over a recording.  Iteration is lazy and restarted
/// only by creating a new iterator; dropping one releases its cache
/// references.
pub trait MessageSource: Send {
    fn initialize(&mut self) -> Result<SourceInfo, Error>;

    fn iterate(&self, request: IterateRequest) -> Result<MessageIter, Error>;

    /// Latest message at or before `time`, per topic, sorted by receive
    /// time.
    fn backfill(&self, request: BackfillRequest) -> Result<Vec<Message>, Error>;

    fn progress(&self) -> Progress;

    fn terminate(&mut self);
}

/// [`MessageSource`] over a remote recording, reading through a
/// [`RemoteFileCache`].  The whole message index is held in memory; payloads
/// are fetched lazily.
pub struct BagSource {
    cache: Arc<RemoteFileCache>,
    read_chunk: u64,
    details: Option<Arc<BagDetails>>,
    iter_ids: AtomicU64,
}

struct BagDetails {
    info: SourceInfo,
    entries: Vec<IndexEntry>,
    // Entry indices per topic id, ascending in time.  Makes backfill a
    // binary search instead of a reverse scan of the recording.
    by_topic: Vec<Vec<u32>>,
}

impl BagDetails {
    fn topic_id(&self, name: &str) -> Option<u32> {
        self.info
            .topics
            .iter()
            .position(|t| t.name == name)
            .map(|i| i as u32)
    }
}

const INDEX_READ_CHUNK: u64 = 8 * 1024 * 1024;

impl BagSource {
    pub fn new(fetcher: Box<dyn RangeFetcher>, config: CacheConfig) -> BagSource {
        let read_chunk = config.budget.min(INDEX_READ_CHUNK).max(1);
        BagSource {
            cache: Arc::new(RemoteFileCache::new(fetcher, config)),
            read_chunk,
            details: None,
            iter_ids: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<RemoteFileCache> {
        &self.cache
    }

    fn read_all(&self, offset: u64, length: u64) -> Result<Vec<u8>, Error> {
        let mut out = Vec::with_capacity(length as usize);
        let mut pos = offset;
        let end = offset + length;
        while pos < end {
            let step = self.read_chunk.min(end - pos);
            out.extend_from_slice(&self.cache.read(pos, step)?);
            pos += step;
        }
        Ok(out)
    }
}

impl MessageSource for BagSource {
    fn initialize(&mut self) -> Result<SourceInfo, Error> {
        if let Some(details) = &self.details {
            return Ok(details.info.clone());
        }

        let remote = self.cache.open()?;
        if remote.size < FIXED_HEADER_LEN {
            return Err(Error::BadFormat("file too small for a header".into()));
        }
        let header = format::parse_header(&self.cache.read(0, FIXED_HEADER_LEN)?)?;
        let table = self
            .cache
            .read(FIXED_HEADER_LEN, header.topic_table_len as u64)?;
        let topics = format::parse_topic_table(&table, header.topic_count)?;

        let index_len = header
            .index_count
            .checked_mul(INDEX_ENTRY_LEN)
            .ok_or_else(|| Error::BadFormat("index count overflows".into()))?;
        let index_end = header
            .index_offset
            .checked_add(index_len)
            .ok_or_else(|| Error::BadFormat("index length overflows".into()))?;
        if index_end > remote.size {
            return Err(Error::BadFormat("index is out of bounds".into()));
        }

        let index_bytes = self.read_all(header.index_offset, index_len)?;
        let entries = format::parse_index(&index_bytes, header.index_count, header.topic_count)?;

        let payload_start = FIXED_HEADER_LEN + header.topic_table_len as u64;
        for entry in &entries {
            let end = entry
                .offset
                .checked_add(entry.length as u64)
                .ok_or_else(|| Error::BadFormat("message range overflows".into()))?;
            if entry.offset < payload_start || end > header.index_offset {
                return Err(Error::BadFormat(format!(
                    "message payload {}..{} is outside the payload region",
                    entry.offset, end
                )));
            }
        }

        let mut by_topic = vec![Vec::new(); topics.len()];
        for (i, entry) in entries.iter().enumerate() {
            by_topic[entry.topic as usize].push(i as u32);
        }

        let info = SourceInfo {
            start: header.start,
            end: header.end,
            topics: topics
                .into_iter()
                .map(|t| TopicInfo {
                    name: t.name,
                    schema: t.schema,
                })
                .collect(),
        };
        let details = Arc::new(BagDetails {
            info: info.clone(),
            entries,
            by_topic,
        });
        self.details = Some(details);
        Ok(info)
    }

    fn iterate(&self, request: IterateRequest) -> Result<MessageIter, Error> {
        let details = self.details.clone().ok_or(Error::NotOpen)?;
        let topic_ids: HashSet<u32> = request
            .topics
            .iter()
            .filter_map(|name| details.topic_id(name))
            .collect();
        let start = request.start.unwrap_or(details.info.start);
        let end = request.end.unwrap_or(details.info.end);
        let pos = if request.reverse {
            details.entries.partition_point(|e| e.time <= end)
        } else {
            details.entries.partition_point(|e| e.time < start)
        };
        Ok(Box::new(BagIter {
            cache: Arc::clone(&self.cache),
            details,
            topic_ids,
            pos,
            start,
            end,
            reverse: request.reverse,
            connection_id: self.iter_ids.fetch_add(1, Ordering::Relaxed),
            done: false,
        }))
    }

    fn backfill(&self, request: BackfillRequest) -> Result<Vec<Message>, Error> {
        let details = self.details.clone().ok_or(Error::NotOpen)?;
        let mut out = Vec::new();
        for name in &request.topics {
            if let Some(cancel) = &request.cancel {
                if cancel.is_cancelled() {
                    return Err(Error::Aborted);
                }
            }
            let Some(id) = details.topic_id(name) else {
                continue;
            };
            let list = &details.by_topic[id as usize];
            let idx =
                list.partition_point(|&ei| details.entries[ei as usize].time <= request.time);
            if idx == 0 {
                continue;
            }
            let entry = details.entries[list[idx - 1] as usize];
            out.push(read_message(&self.cache, &details, &entry)?);
        }
        out.sort_by_key(|m| m.receive_time);
        Ok(out)
    }

    fn progress(&self) -> Progress {
        let Ok(size) = self.cache.size() else {
            return Progress::default();
        };
        if size == 0 {
            return Progress::complete();
        }
        Progress {
            loaded: self
                .cache
                .loaded_ranges()
                .into_iter()
                .map(|r| LoadedRange {
                    start: r.start as f64 / size as f64,
                    end: r.end as f64 / size as f64,
                })
                .collect(),
        }
    }

    fn terminate(&mut self) {
        self.cache.close();
        self.details = None;
    }
}

fn read_message(
    cache: &RemoteFileCache,
    details: &BagDetails,
    entry: &IndexEntry,
) -> Result<Message, Error> {
    let payload = cache.read(entry.offset, entry.length as u64)?;
    let topic = &details.info.topics[entry.topic as usize];
    Ok(Message {
        topic: topic.name.clone(),
        receive_time: entry.time,
        size_bytes: entry.length as u64,
        payload,
        schema: topic.schema.clone(),
    })
}

struct BagIter {
    cache: Arc<RemoteFileCache>,
    details: Arc<BagDetails>,
    topic_ids: HashSet<u32>,
    pos: usize,
    start: Timestamp,
    end: Timestamp,
    reverse: bool,
    connection_id: u64,
    done: bool,
}

impl Iterator for BagIter {
    type Item = Result<IterItem, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        loop {
            let entry = if self.reverse {
                if self.pos == 0 {
                    break;
                }
                let entry = self.details.entries[self.pos - 1];
                if entry.time < self.start {
                    break;
                }
                self.pos -= 1;
                entry
            } else {
                if self.pos >= self.details.entries.len() {
                    break;
                }
                let entry = self.details.entries[self.pos];
                if entry.time > self.end {
                    break;
                }
                self.pos += 1;
                entry
            };
            if !self.topic_ids.contains(&entry.topic) {
                continue;
            }
            match read_message(&self.cache, &self.details, &entry) {
                Ok(message) => return Some(Ok(IterItem::Message(message))),
                Err(Error::InvalidArg(message)) => {
                    // Payload the cache refuses to hold; report it inline and
                    // keep the stream alive.
                    return Some(Ok(IterItem::Problem {
                        connection_id: self.connection_id,
                        severity: Severity::Warn,
                        message,
                    }));
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
        // Window exhausted; close with a stamp at the boundary.
        self.done = true;
        let bound = if self.reverse { self.start } else { self.end };
        Some(Ok(IterItem::Stamp(bound)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FileFetcher;
    use crate::format::BagWriter;
    use std::io::Write;

    fn t(sec: i64) -> Timestamp {
        Timestamp { sec, nsec: 0 }
    }

    fn write_sample_bag(path: &std::path::Path) {
        let file = std::fs::File::create(path).unwrap();
        let mut writer = BagWriter::new(file).unwrap();
        let t1 = writer.add_topic("/t1", "schema1").unwrap();
        let t2 = writer.add_topic("/t2", "schema2").unwrap();
        for sec in [10, 20, 30, 40, 50] {
            writer
                .write_message(t1, t(sec), format!("t1@{sec}").as_bytes())
                .unwrap();
        }
        writer.write_message(t2, t(25), b"t2@25").unwrap();
        writer.finish().unwrap().flush().unwrap();
    }

    fn open_sample() -> (tempfile::TempDir, BagSource, SourceInfo) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.rwb");
        write_sample_bag(&path);
        let mut source = BagSource::new(
            Box::new(FileFetcher::new(&path)),
            CacheConfig::default(),
        );
        let info = source.initialize().unwrap();
        (dir, source, info)
    }

    fn messages(iter: MessageIter) -> (Vec<Message>, Vec<Timestamp>) {
        let mut msgs = Vec::new();
        let mut stamps = Vec::new();
        for item in iter {
            match item.unwrap() {
                IterItem::Message(m) => msgs.push(m),
                IterItem::Stamp(t) => stamps.push(t),
                IterItem::Problem { message, .. } => panic!("problem: {message}"),
            }
        }
        (msgs, stamps)
    }

    #[test]
    fn initialize_reports_the_recording_bounds() {
        let (_dir, _source, info) = open_sample();
        assert_eq!(info.start, t(10));
        assert_eq!(info.end, t(50));
        assert_eq!(
            info.topics.iter().map(|t| t.name.as_str()).collect::<Vec<_>>(),
            vec!["/t1", "/t2"]
        );
    }

    #[test]
    fn iterates_a_window_filtered_by_topic() {
        let (_dir, source, _info) = open_sample();
        let iter = source
            .iterate(IterateRequest {
                topics: vec!["/t1".into()],
                start: Some(t(20)),
                end: Some(t(40)),
                ..IterateRequest::default()
            })
            .unwrap();
        let (msgs, stamps) = messages(iter);
        assert_eq!(
            msgs.iter().map(|m| m.receive_time).collect::<Vec<_>>(),
            vec![t(20), t(30), t(40)]
        );
        assert_eq!(msgs[0].payload, b"t1@20");
        assert_eq!(msgs[0].schema, "schema1");
        assert_eq!(stamps, vec![t(40)]);
    }

    #[test]
    fn interleaves_topics_in_time_order() {
        let (_dir, source, info) = open_sample();
        let iter = source
            .iterate(IterateRequest {
                topics: info.topics.iter().map(|t| t.name.clone()).collect(),
                ..IterateRequest::default()
            })
            .unwrap();
        let (msgs, _) = messages(iter);
        let times: Vec<_> = msgs.iter().map(|m| m.receive_time).collect();
        assert_eq!(times, vec![t(10), t(20), t(25), t(30), t(40), t(50)]);
        assert!(times.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn iterates_in_reverse() {
        let (_dir, source, _info) = open_sample();
        let iter = source
            .iterate(IterateRequest {
                topics: vec!["/t1".into(), "/t2".into()],
                start: Some(t(20)),
                end: Some(t(40)),
                reverse: true,
                ..IterateRequest::default()
            })
            .unwrap();
        let (msgs, stamps) = messages(iter);
        assert_eq!(
            msgs.iter().map(|m| m.receive_time).collect::<Vec<_>>(),
            vec![t(40), t(30), t(25), t(20)]
        );
        assert_eq!(stamps, vec![t(20)]);
    }

    #[test]
    fn unknown_topics_are_ignored() {
        let (_dir, source, _info) = open_sample();
        let iter = source
            .iterate(IterateRequest {
                topics: vec!["/nope".into()],
                ..IterateRequest::default()
            })
            .unwrap();
        let (msgs, stamps) = messages(iter);
        assert!(msgs.is_empty());
        assert_eq!(stamps, vec![t(50)]);
    }

    #[test]
    fn backfill_returns_the_latest_message_per_topic() {
        let (_dir, source, _info) = open_sample();
        let msgs = source
            .backfill(BackfillRequest {
                topics: vec!["/t2".into(), "/t1".into()],
                time: t(26),
                cancel: None,
            })
            .unwrap();
        // Sorted ascending by receive time: /t1@20, /t2@25.
        assert_eq!(
            msgs.iter()
                .map(|m| (m.topic.as_str(), m.receive_time))
                .collect::<Vec<_>>(),
            vec![("/t1", t(20)), ("/t2", t(25))]
        );

        // A time before the first message yields nothing for the topic.
        let msgs = source
            .backfill(BackfillRequest {
                topics: vec!["/t1".into()],
                time: t(9),
                cancel: None,
            })
            .unwrap();
        assert!(msgs.is_empty());

        // Exactly at a message time includes it.
        let msgs = source
            .backfill(BackfillRequest {
                topics: vec!["/t1".into()],
                time: t(30),
                cancel: None,
            })
            .unwrap();
        assert_eq!(msgs[0].receive_time, t(30));
    }

    #[test]
    fn backfill_honors_cancellation() {
        let (_dir, source, _info) = open_sample();
        let cancel = CancelToken::new();
        cancel.cancel();
        let result = source.backfill(BackfillRequest {
            topics: vec!["/t1".into()],
            time: t(30),
            cancel: Some(cancel),
        });
        assert!(matches!(result, Err(Error::Aborted)));
    }

    #[test]
    fn terminate_releases_the_file() {
        let (_dir, mut source, _info) = open_sample();
        source.terminate();
        assert!(matches!(
            source.iterate(IterateRequest::default()),
            Err(Error::NotOpen)
        ));
        assert!(matches!(
            source.backfill(BackfillRequest::default()),
            Err(Error::NotOpen)
        ));
    }
}
