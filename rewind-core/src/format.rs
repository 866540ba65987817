//! On-disk layout of a recording.
//!
//! A fixed header carries the time range and the location of the message
//! index; the topic table follows it, then the message payloads, and the
//! index sits at the tail so a writer can produce the file in one pass:
//!
//! ```text
//! | header (56 B) | topic table | payloads ... | index entries |
//! ```
//!
//! Index entries are sorted by receive time, which makes time windows a
//! binary search and keeps per-topic iteration monotonic.

use std::io::{Cursor, Read, Seek, SeekFrom, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{error::Error, time::Timestamp};

pub const MAGIC: [u8; 8] = *b"RWNDBAG1";
pub const FIXED_HEADER_LEN: u64 = 56;
pub const INDEX_ENTRY_LEN: u64 = 28;

const NANOS_PER_SEC: u32 = 1_000_000_000;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDef {
    pub name: String,
    pub schema: String,
}

#[derive(Debug, Clone)]
pub struct BagHeader {
    pub start: Timestamp,
    pub end: Timestamp,
    pub topic_table_len: u32,
    pub topic_count: u32,
    pub index_offset: u64,
    pub index_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    pub topic: u32,
    pub time: Timestamp,
    pub offset: u64,
    pub length: u32,
}

fn truncated(what: &str) -> Error {
    Error::BadFormat(format!("truncated {what}"))
}

fn read_timestamp(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<Timestamp, Error> {
    let sec = cursor.read_i64::<LittleEndian>().map_err(|_| truncated(what))?;
    let nsec = cursor.read_u32::<LittleEndian>().map_err(|_| truncated(what))?;
    if nsec >= NANOS_PER_SEC {
        return Err(Error::BadFormat(format!("{what} has {nsec} nanoseconds")));
    }
    Ok(Timestamp { sec, nsec })
}

pub fn parse_header(bytes: &[u8]) -> Result<BagHeader, Error> {
    if bytes.len() < FIXED_HEADER_LEN as usize {
        return Err(truncated("header"));
    }
    if bytes[..8] != MAGIC {
        return Err(Error::BadFormat("bad magic".into()));
    }
    let mut cursor = Cursor::new(&bytes[8..]);
    let start = read_timestamp(&mut cursor, "start time")?;
    let end = read_timestamp(&mut cursor, "end time")?;
    let topic_table_len = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| truncated("header"))?;
    let topic_count = cursor
        .read_u32::<LittleEndian>()
        .map_err(|_| truncated("header"))?;
    let index_offset = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| truncated("header"))?;
    let index_count = cursor
        .read_u64::<LittleEndian>()
        .map_err(|_| truncated("header"))?;
    if end < start {
        return Err(Error::BadFormat("end time before start time".into()));
    }
    Ok(BagHeader {
        start,
        end,
        topic_table_len,
        topic_count,
        index_offset,
        index_count,
    })
}

pub fn parse_topic_table(bytes: &[u8], count: u32) -> Result<Vec<TopicDef>, Error> {
    let mut cursor = Cursor::new(bytes);
    let mut topics = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let name = read_string(&mut cursor)?;
        let schema = read_string(&mut cursor)?;
        topics.push(TopicDef { name, schema });
    }
    if cursor.position() != bytes.len() as u64 {
        return Err(Error::BadFormat("trailing bytes after topic table".into()));
    }
    Ok(topics)
}

fn read_string(cursor: &mut Cursor<&[u8]>) -> Result<String, Error> {
    let len = cursor
        .read_u16::<LittleEndian>()
        .map_err(|_| truncated("topic table"))?;
    let mut buf = vec![0u8; len as usize];
    cursor
        .read_exact(&mut buf)
        .map_err(|_| truncated("topic table"))?;
    String::from_utf8(buf).map_err(|_| Error::BadFormat("topic table is not UTF-8".into()))
}

pub fn parse_index(bytes: &[u8], count: u64, topic_count: u32) -> Result<Vec<IndexEntry>, Error> {
    let needed = count
        .checked_mul(INDEX_ENTRY_LEN)
        .ok_or_else(|| Error::BadFormat("index count overflows".into()))?;
    if (bytes.len() as u64) < needed {
        return Err(truncated("index"));
    }
    let mut cursor = Cursor::new(bytes);
    let mut entries: Vec<IndexEntry> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let topic = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("index"))?;
        let time = read_timestamp(&mut cursor, "index entry time")?;
        let offset = cursor
            .read_u64::<LittleEndian>()
            .map_err(|_| truncated("index"))?;
        let length = cursor
            .read_u32::<LittleEndian>()
            .map_err(|_| truncated("index"))?;
        if topic >= topic_count {
            return Err(Error::BadFormat(format!("index references topic {topic}")));
        }
        if let Some(prev) = entries.last() {
            if time < prev.time {
                return Err(Error::BadFormat("index is not sorted by time".into()));
            }
        }
        entries.push(IndexEntry {
            topic,
            time,
            offset,
            length,
        });
    }
    Ok(entries)
}

/// One-pass recording writer.  Topics are declared up front, messages may
/// arrive in any time order and are index-sorted at `finish`.
pub struct BagWriter<W: Write + Seek> {
    sink: W,
    topics: Vec<TopicDef>,
    entries: Vec<IndexEntry>,
    topic_table_len: u32,
    payload_started: bool,
}

impl<W: Write + Seek> BagWriter<W> {
    pub fn new(mut sink: W) -> Result<BagWriter<W>, Error> {
        // Header placeholder, patched in `finish`.
        sink.write_all(&[0u8; FIXED_HEADER_LEN as usize])?;
        Ok(BagWriter {
            sink,
            topics: Vec::new(),
            entries: Vec::new(),
            topic_table_len: 0,
            payload_started: false,
        })
    }

    pub fn add_topic(&mut self, name: &str, schema: &str) -> Result<u32, Error> {
        if self.payload_started {
            return Err(Error::InvalidArg(
                "topics must be declared before the first message".into(),
            ));
        }
        if name.len() > u16::MAX as usize || schema.len() > u16::MAX as usize {
            return Err(Error::InvalidArg("topic name or schema too long".into()));
        }
        self.topics.push(TopicDef {
            name: name.into(),
            schema: schema.into(),
        });
        Ok(self.topics.len() as u32 - 1)
    }

    pub fn write_message(
        &mut self,
        topic: u32,
        time: Timestamp,
        payload: &[u8],
    ) -> Result<(), Error> {
        if topic as usize >= self.topics.len() {
            return Err(Error::InvalidArg(format!("unknown topic id {topic}")));
        }
        if payload.len() > u32::MAX as usize {
            return Err(Error::InvalidArg("payload too large".into()));
        }
        if !self.payload_started {
            self.write_topic_table()?;
            self.payload_started = true;
        }
        let offset = self.sink.stream_position()?;
        self.sink.write_all(payload)?;
        self.entries.push(IndexEntry {
            topic,
            time,
            offset,
            length: payload.len() as u32,
        });
        Ok(())
    }

    pub fn finish(mut self) -> Result<W, Error> {
        if !self.payload_started {
            self.write_topic_table()?;
        }
        self.entries.sort_by_key(|e| e.time);

        let index_offset = self.sink.stream_position()?;
        for entry in &self.entries {
            self.sink.write_u32::<LittleEndian>(entry.topic)?;
            write_timestamp(&mut self.sink, entry.time)?;
            self.sink.write_u64::<LittleEndian>(entry.offset)?;
            self.sink.write_u32::<LittleEndian>(entry.length)?;
        }

        let start = self.entries.first().map(|e| e.time).unwrap_or(Timestamp::ZERO);
        let end = self.entries.last().map(|e| e.time).unwrap_or(Timestamp::ZERO);

        self.sink.seek(SeekFrom::Start(0))?;
        self.sink.write_all(&MAGIC)?;
        write_timestamp(&mut self.sink, start)?;
        write_timestamp(&mut self.sink, end)?;
        self.sink.write_u32::<LittleEndian>(self.topic_table_len)?;
        self.sink.write_u32::<LittleEndian>(self.topics.len() as u32)?;
        self.sink.write_u64::<LittleEndian>(index_offset)?;
        self.sink.write_u64::<LittleEndian>(self.entries.len() as u64)?;
        self.sink.flush()?;
        Ok(self.sink)
    }

    fn write_topic_table(&mut self) -> Result<(), Error> {
        let before = self.sink.stream_position()?;
        for topic in &self.topics {
            self.sink.write_u16::<LittleEndian>(topic.name.len() as u16)?;
            self.sink.write_all(topic.name.as_bytes())?;
            self.sink
                .write_u16::<LittleEndian>(topic.schema.len() as u16)?;
            self.sink.write_all(topic.schema.as_bytes())?;
        }
        self.topic_table_len = (self.sink.stream_position()? - before) as u32;
        Ok(())
    }
}

fn write_timestamp<W: Write>(sink: &mut W, time: Timestamp) -> Result<(), Error> {
    sink.write_i64::<LittleEndian>(time.sec)?;
    sink.write_u32::<LittleEndian>(time.nsec)?;
    Ok(())
}
