//! Raw sample capture files
//!
//! Little-endian binary log, one file per channel:
//!
//! ```text
//! header  : "PPGL" | version u8 | channel u8 | bundle u8 | reserved u8
//! record  : timestamp_ms i32 | bundle x sample i32
//! ```
//!
//! A zero bundle byte means the default bundle of five samples.

pub mod recorder;

pub use recorder::{CaptureRecorder, RecorderSnapshot, RecorderStats};

use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::Path;

use crate::channel::ChannelId;
use crate::constants::DEFAULT_BUNDLE_SIZE;
use crate::error::CaptureError;
use crate::protocol::SampleBatch;

pub const MAGIC: &[u8; 4] = b"PPGL";
pub const VERSION: u8 = 1;
pub const HEADER_SIZE: usize = 8;

/// Capture file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CaptureHeader {
    pub channel: ChannelId,
    pub bundle_size: usize,
}

impl CaptureHeader {
    /// Bytes per record
    pub fn record_size(&self) -> usize {
        4 * (1 + self.bundle_size)
    }

    fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let bundle = if self.bundle_size == DEFAULT_BUNDLE_SIZE {
            0
        } else {
            self.bundle_size as u8
        };
        let mut out = [0u8; HEADER_SIZE];
        out[..4].copy_from_slice(MAGIC);
        out[4] = VERSION;
        out[5] = self.channel.as_u8();
        out[6] = bundle;
        out
    }

    fn from_bytes(raw: &[u8; HEADER_SIZE]) -> Result<Self, CaptureError> {
        if &raw[..4] != MAGIC {
            return Err(CaptureError::BadMagic);
        }
        if raw[4] != VERSION {
            return Err(CaptureError::UnsupportedVersion(raw[4]));
        }
        let channel = ChannelId::new(raw[5]).ok_or_else(|| {
            CaptureError::Io(io::Error::new(
                ErrorKind::InvalidData,
                format!("channel {} out of range", raw[5]),
            ))
        })?;
        let bundle_size = match raw[6] {
            0 => DEFAULT_BUNDLE_SIZE,
            n => n as usize,
        };
        Ok(Self { channel, bundle_size })
    }
}

/// One recorded bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub timestamp_ms: i32,
    pub samples: Vec<i32>,
}

impl CaptureRecord {
    /// Ingest batch for this record, timestamps shifted by `offset_ms`
    pub fn to_batch(&self, channel: ChannelId, offset_ms: i64, interval_ms: f64) -> SampleBatch {
        SampleBatch {
            channel,
            timestamp_ms: self.timestamp_ms as i64 + offset_ms,
            values: self.samples.clone(),
            interval_ms,
        }
    }
}

/// Streaming capture writer
#[derive(Debug)]
pub struct CaptureWriter<W: Write> {
    inner: W,
    header: CaptureHeader,
    records: u64,
}

impl CaptureWriter<BufWriter<File>> {
    pub fn create(path: impl AsRef<Path>, header: CaptureHeader) -> Result<Self, CaptureError> {
        let file = File::create(path)?;
        Self::new(BufWriter::new(file), header)
    }
}

impl<W: Write> CaptureWriter<W> {
    /// Wrap a writer and emit the header
    pub fn new(mut inner: W, header: CaptureHeader) -> Result<Self, CaptureError> {
        inner.write_all(&header.to_bytes())?;
        Ok(Self {
            inner,
            header,
            records: 0,
        })
    }

    /// Append one bundle; its length must match the header
    pub fn write_record(&mut self, timestamp_ms: i32, samples: &[i32]) -> Result<(), CaptureError> {
        if samples.len() != self.header.bundle_size {
            return Err(CaptureError::Io(io::Error::new(
                ErrorKind::InvalidInput,
                format!(
                    "bundle of {} samples, file expects {}",
                    samples.len(),
                    self.header.bundle_size
                ),
            )));
        }
        let mut record = Vec::with_capacity(self.header.record_size());
        record.extend_from_slice(&timestamp_ms.to_le_bytes());
        for s in samples {
            record.extend_from_slice(&s.to_le_bytes());
        }
        self.inner.write_all(&record)?;
        self.records += 1;
        Ok(())
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn flush(&mut self) -> Result<(), CaptureError> {
        self.inner.flush()?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

/// Sequential capture reader; iterates records
#[derive(Debug)]
pub struct CaptureReader<R: Read> {
    inner: R,
    header: CaptureHeader,
    offset: u64,
    done: bool,
}

impl CaptureReader<BufReader<File>> {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CaptureError> {
        let file = File::open(path)?;
        Self::new(BufReader::new(file))
    }
}

impl<R: Read> CaptureReader<R> {
    /// Read and validate the header
    pub fn new(mut inner: R) -> Result<Self, CaptureError> {
        let mut raw = [0u8; HEADER_SIZE];
        inner.read_exact(&mut raw).map_err(|e| match e.kind() {
            ErrorKind::UnexpectedEof => CaptureError::BadMagic,
            _ => CaptureError::Io(e),
        })?;
        let header = CaptureHeader::from_bytes(&raw)?;
        Ok(Self {
            inner,
            header,
            offset: HEADER_SIZE as u64,
            done: false,
        })
    }

    pub fn header(&self) -> CaptureHeader {
        self.header
    }

    fn read_record(&mut self) -> Result<Option<CaptureRecord>, CaptureError> {
        let mut raw = vec![0u8; self.header.record_size()];
        let mut filled = 0;
        while filled < raw.len() {
            match self.inner.read(&mut raw[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == 0 {
            return Ok(None);
        }
        if filled < raw.len() {
            return Err(CaptureError::Truncated(self.offset));
        }

        let mut words = raw
            .chunks_exact(4)
            .map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]));
        let timestamp_ms = words.next().unwrap_or_default();
        let samples = words.collect();
        self.offset += raw.len() as u64;
        Ok(Some(CaptureRecord { timestamp_ms, samples }))
    }
}

impl<R: Read> Iterator for CaptureReader<R> {
    type Item = Result<CaptureRecord, CaptureError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header(channel: u8) -> CaptureHeader {
        CaptureHeader {
            channel: ChannelId::new(channel).unwrap(),
            bundle_size: DEFAULT_BUNDLE_SIZE,
        }
    }

    #[test]
    fn test_default_layout() {
        let mut w = CaptureWriter::new(Vec::new(), header(2)).unwrap();
        w.write_record(1000, &[1, 2, 3, 4, 5]).unwrap();
        let bytes = w.into_inner();

        assert_eq!(bytes.len(), HEADER_SIZE + 24);
        assert_eq!(&bytes[..8], b"PPGL\x01\x02\x00\x00");
        assert_eq!(&bytes[8..12], &1000i32.to_le_bytes());
        assert_eq!(&bytes[28..32], &5i32.to_le_bytes());
    }

    #[test]
    fn test_reader_yields_written_records() {
        let mut w = CaptureWriter::new(Vec::new(), header(1)).unwrap();
        w.write_record(0, &[10, 20, 30, 40, 50]).unwrap();
        w.write_record(100, &[11, 21, 31, 41, 51]).unwrap();
        let reader = CaptureReader::new(Cursor::new(w.into_inner())).unwrap();

        assert_eq!(reader.header(), header(1));
        let records: Vec<_> = reader.collect::<Result<_, _>>().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].timestamp_ms, 100);
        assert_eq!(records[1].samples, vec![11, 21, 31, 41, 51]);
    }

    #[test]
    fn test_custom_bundle_size() {
        let h = CaptureHeader {
            channel: ChannelId::new(0).unwrap(),
            bundle_size: 2,
        };
        let mut w = CaptureWriter::new(Vec::new(), h).unwrap();
        w.write_record(5, &[7, 8]).unwrap();
        assert!(w.write_record(6, &[1, 2, 3]).is_err());
        let reader = CaptureReader::new(Cursor::new(w.into_inner())).unwrap();
        assert_eq!(reader.header().bundle_size, 2);
        assert_eq!(reader.count(), 1);
    }

    #[test]
    fn test_bad_magic_and_version() {
        let err = CaptureReader::new(Cursor::new(b"RIFF\x01\x00\x00\x00".to_vec())).unwrap_err();
        assert!(matches!(err, CaptureError::BadMagic));
        let err = CaptureReader::new(Cursor::new(b"PPGL\x02\x00\x00\x00".to_vec())).unwrap_err();
        assert!(matches!(err, CaptureError::UnsupportedVersion(2)));
        assert!(CaptureReader::new(Cursor::new(b"PP".to_vec())).is_err());
    }

    #[test]
    fn test_truncated_tail_reported() {
        let mut w = CaptureWriter::new(Vec::new(), header(0)).unwrap();
        w.write_record(0, &[1, 2, 3, 4, 5]).unwrap();
        let mut bytes = w.into_inner();
        bytes.extend_from_slice(&[0, 0, 0]);

        let mut reader = CaptureReader::new(Cursor::new(bytes)).unwrap();
        assert!(reader.next().unwrap().is_ok());
        assert!(matches!(reader.next(), Some(Err(CaptureError::Truncated(32)))));
        assert!(reader.next().is_none());
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ppg.bin");
        let mut w = CaptureWriter::create(&path, header(3)).unwrap();
        for i in 0..10 {
            w.write_record(i * 100, &[i; 5]).unwrap();
        }
        w.flush().unwrap();
        drop(w);

        let reader = CaptureReader::open(&path).unwrap();
        assert_eq!(reader.header().channel.as_u8(), 3);
        assert_eq!(reader.filter_map(|r| r.ok()).count(), 10);
    }

    #[test]
    fn test_record_to_batch_offsets_timestamps() {
        let record = CaptureRecord {
            timestamp_ms: 500,
            samples: vec![1, 2, 3, 4, 5],
        };
        let batch = record.to_batch(ChannelId::new(4).unwrap(), 10_000, 20.0);
        assert_eq!(batch.timestamp_ms, 10_500);
        assert_eq!(batch.channel.as_u8(), 4);
    }
}
