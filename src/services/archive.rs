//! Streams several inputs into one ZIP archive.
//!
//! The archive is produced incrementally: each local header is emitted as
//! soon as its entry starts, compressed data follows chunk by chunk, and
//! sizes and CRCs go into a data descriptor after the entry (general purpose
//! flag bit 3). Only the current input's chunk and the deflate state are
//! held in memory, plus one small central-directory record per finished
//! entry.
//!
//! Names are stored as UTF-8 (flag bit 11) and written as given, so
//! duplicates stay duplicates. ZIP64 is not produced: an entry or archive
//! that outgrows the classic 32-bit fields fails the stream instead.

use crate::models::ByteStream;
use bytes::{BufMut, Bytes, BytesMut};
use chrono::{Datelike, NaiveDateTime, Timelike, Utc};
use flate2::{Compression, write::DeflateEncoder};
use futures::{StreamExt, stream};
use std::{fmt, io, io::Write, mem};

const LOCAL_HEADER_SIG: u32 = 0x0403_4b50;
const DATA_DESCRIPTOR_SIG: u32 = 0x0807_4b50;
const CENTRAL_HEADER_SIG: u32 = 0x0201_4b50;
const END_OF_CENTRAL_DIR_SIG: u32 = 0x0605_4b50;

const VERSION: u16 = 20;
const FLAGS: u16 = 0x0008 | 0x0800;
const METHOD_DEFLATE: u16 = 8;
const MAX_ENTRIES: usize = u16::MAX as usize;

/// One named input of a bundle.
pub struct BundleEntry {
    pub name: String,
    pub source: ByteStream<'static>,
}

impl BundleEntry {
    pub fn new(name: impl Into<String>, source: ByteStream<'static>) -> Self {
        Self {
            name: name.into(),
            source,
        }
    }
}

impl fmt::Debug for BundleEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BundleEntry")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

/// Combine `entries`, in order, into a single deflated ZIP stream.
///
/// A read error on any input ends the stream with that error; whatever was
/// emitted before it is not a usable archive.
pub fn bundle<I>(entries: I) -> ByteStream<'static>
where
    I: IntoIterator<Item = BundleEntry>,
    I::IntoIter: Send + 'static,
{
    let writer = ZipWriter::new(entries.into_iter(), Utc::now().naive_utc());
    stream::try_unfold(writer, |mut writer| async move {
        let next = writer.next_chunk().await?;
        Ok::<_, io::Error>(next.map(|chunk| (chunk, writer)))
    })
    .boxed()
}

struct CentralRecord {
    name: Vec<u8>,
    crc: u32,
    compressed: u32,
    uncompressed: u32,
    header_offset: u32,
}

struct OpenEntry {
    name: Vec<u8>,
    source: ByteStream<'static>,
    encoder: DeflateEncoder<Vec<u8>>,
    crc: crc32fast::Hasher,
    compressed: u64,
    uncompressed: u64,
    header_offset: u64,
}

struct ZipWriter<I> {
    entries: I,
    current: Option<OpenEntry>,
    central: Vec<CentralRecord>,
    offset: u64,
    dos_time: u16,
    dos_date: u16,
    finished: bool,
}

impl<I> ZipWriter<I>
where
    I: Iterator<Item = BundleEntry>,
{
    fn new(entries: I, modified: NaiveDateTime) -> Self {
        let (dos_time, dos_date) = dos_datetime(modified);
        Self {
            entries,
            current: None,
            central: Vec::new(),
            offset: 0,
            dos_time,
            dos_date,
            finished: false,
        }
    }

    /// The next piece of archive, or `None` once the end record is out.
    async fn next_chunk(&mut self) -> io::Result<Option<Bytes>> {
        loop {
            if self.finished {
                return Ok(None);
            }

            let Some(entry) = self.current.as_mut() else {
                let chunk = match self.entries.next() {
                    Some(next) => self.start_entry(next)?,
                    None => self.finish_archive()?,
                };
                return Ok(Some(self.emit(chunk)));
            };

            match entry.source.next().await {
                Some(chunk) => {
                    let chunk = chunk?;
                    entry.crc.update(&chunk);
                    entry.uncompressed += chunk.len() as u64;
                    entry.encoder.write_all(&chunk)?;
                    let out = mem::take(entry.encoder.get_mut());
                    if out.is_empty() {
                        continue;
                    }
                    entry.compressed += out.len() as u64;
                    return Ok(Some(self.emit(out)));
                }
                None => {
                    let tail = self.finish_entry()?;
                    return Ok(Some(self.emit(tail)));
                }
            }
        }
    }

    fn emit(&mut self, chunk: impl Into<Bytes>) -> Bytes {
        let chunk = chunk.into();
        self.offset += chunk.len() as u64;
        chunk
    }

    fn start_entry(&mut self, entry: BundleEntry) -> io::Result<BytesMut> {
        if self.central.len() >= MAX_ENTRIES {
            return Err(limit_error(format!("more than {} entries", MAX_ENTRIES)));
        }
        let name = entry.name.into_bytes();
        let name_len = u16::try_from(name.len())
            .map_err(|_| limit_error(format!("entry name of {} bytes", name.len())))?;

        let mut header = BytesMut::with_capacity(30 + name.len());
        header.put_u32_le(LOCAL_HEADER_SIG);
        header.put_u16_le(VERSION);
        header.put_u16_le(FLAGS);
        header.put_u16_le(METHOD_DEFLATE);
        header.put_u16_le(self.dos_time);
        header.put_u16_le(self.dos_date);
        // crc and sizes follow in the data descriptor
        header.put_u32_le(0);
        header.put_u32_le(0);
        header.put_u32_le(0);
        header.put_u16_le(name_len);
        header.put_u16_le(0);
        header.put_slice(&name);

        self.current = Some(OpenEntry {
            name,
            source: entry.source,
            encoder: DeflateEncoder::new(Vec::new(), Compression::default()),
            crc: crc32fast::Hasher::new(),
            compressed: 0,
            uncompressed: 0,
            header_offset: self.offset,
        });
        Ok(header)
    }

    fn finish_entry(&mut self) -> io::Result<BytesMut> {
        let Some(entry) = self.current.take() else {
            return Ok(BytesMut::new());
        };
        let rest = entry.encoder.finish()?;
        let compressed = entry.compressed + rest.len() as u64;
        let crc = entry.crc.finalize();

        let compressed = to_u32(compressed, "compressed entry size")?;
        let uncompressed = to_u32(entry.uncompressed, "entry size")?;
        let header_offset = to_u32(entry.header_offset, "archive offset")?;

        let mut tail = BytesMut::with_capacity(rest.len() + 16);
        tail.put_slice(&rest);
        tail.put_u32_le(DATA_DESCRIPTOR_SIG);
        tail.put_u32_le(crc);
        tail.put_u32_le(compressed);
        tail.put_u32_le(uncompressed);

        self.central.push(CentralRecord {
            name: entry.name,
            crc,
            compressed,
            uncompressed,
            header_offset,
        });
        Ok(tail)
    }

    fn finish_archive(&mut self) -> io::Result<BytesMut> {
        self.finished = true;
        let directory_offset = to_u32(self.offset, "central directory offset")?;

        let mut out = BytesMut::new();
        for record in &self.central {
            out.put_u32_le(CENTRAL_HEADER_SIG);
            out.put_u16_le(VERSION);
            out.put_u16_le(VERSION);
            out.put_u16_le(FLAGS);
            out.put_u16_le(METHOD_DEFLATE);
            out.put_u16_le(self.dos_time);
            out.put_u16_le(self.dos_date);
            out.put_u32_le(record.crc);
            out.put_u32_le(record.compressed);
            out.put_u32_le(record.uncompressed);
            out.put_u16_le(record.name.len() as u16);
            out.put_u16_le(0); // extra
            out.put_u16_le(0); // comment
            out.put_u16_le(0); // disk
            out.put_u16_le(0); // internal attributes
            out.put_u32_le(0); // external attributes
            out.put_u32_le(record.header_offset);
            out.put_slice(&record.name);
        }
        let directory_size = to_u32(out.len() as u64, "central directory size")?;
        let count = self.central.len() as u16;

        out.put_u32_le(END_OF_CENTRAL_DIR_SIG);
        out.put_u16_le(0);
        out.put_u16_le(0);
        out.put_u16_le(count);
        out.put_u16_le(count);
        out.put_u32_le(directory_size);
        out.put_u32_le(directory_offset);
        out.put_u16_le(0);
        Ok(out)
    }
}

fn to_u32(value: u64, what: &str) -> io::Result<u32> {
    u32::try_from(value).map_err(|_| limit_error(format!("{} of {} bytes", what, value)))
}

fn limit_error(detail: String) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidInput,
        format!("archive exceeds ZIP limits: {}", detail),
    )
}

/// MS-DOS time and date words; years before 1980 clamp to 1980.
fn dos_datetime(at: NaiveDateTime) -> (u16, u16) {
    let time = (at.hour() << 11) | (at.minute() << 5) | (at.second() / 2);
    let year = at.year().clamp(1980, 2107) as u32 - 1980;
    let date = (year << 9) | (at.month() << 5) | at.day();
    (time as u16, date as u16)
}
