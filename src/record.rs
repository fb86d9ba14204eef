//! Line records and their newline framing.

use std::fmt;
use std::io::{self, prelude::*};

use crate::sort::SortError;

/// Record delimiter.
pub const DELIMITER: u8 = b'\n';

/// A single line without its delimiter.
/// Records are compared byte-wise in lexicographic order.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Record(Vec<u8>);

impl Record {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Size of the record once written, delimiter included.
    pub fn encoded_len(&self) -> u64 {
        self.0.len() as u64 + 1
    }
}

impl From<&str> for Record {
    fn from(s: &str) -> Self {
        Record(s.as_bytes().to_vec())
    }
}

impl From<String> for Record {
    fn from(s: String) -> Self {
        Record(s.into_bytes())
    }
}

impl From<Vec<u8>> for Record {
    fn from(bytes: Vec<u8>) -> Self {
        Record(bytes)
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", String::from_utf8_lossy(&self.0))
    }
}

impl serde::Serialize for Record {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&self.0)
    }
}

impl<'de> serde::Deserialize<'de> for Record {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        deserializer.deserialize_byte_buf(RecordVisitor)
    }
}

struct RecordVisitor;

impl<'de> serde::de::Visitor<'de> for RecordVisitor {
    type Value = Record;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("a byte string")
    }

    fn visit_bytes<E: serde::de::Error>(self, v: &[u8]) -> Result<Self::Value, E> {
        Ok(Record(v.to_vec()))
    }

    fn visit_byte_buf<E: serde::de::Error>(self, v: Vec<u8>) -> Result<Self::Value, E> {
        Ok(Record(v))
    }

    fn visit_str<E: serde::de::Error>(self, v: &str) -> Result<Self::Value, E> {
        Ok(Record::from(v))
    }

    fn visit_seq<A: serde::de::SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
        let mut bytes = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(byte) = seq.next_element()? {
            bytes.push(byte);
        }

        return Ok(Record(bytes));
    }
}

/// Reads the next newline-delimited record from the reader.
/// Returns `None` at the end of the stream. A trailing line without a delimiter is still a record.
pub fn read_record<R: BufRead + ?Sized>(reader: &mut R) -> io::Result<Option<Record>> {
    let mut buf = Vec::new();
    if reader.read_until(DELIMITER, &mut buf)? == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&DELIMITER) {
        buf.pop();
    }

    return Ok(Some(Record(buf)));
}

/// Writes a record followed by the delimiter.
pub fn write_record<W: Write + ?Sized>(writer: &mut W, record: &Record) -> io::Result<()> {
    writer.write_all(record.as_bytes())?;
    writer.write_all(&[DELIMITER])
}

/// Lazy, non-restartable stream of records read from a buffered source.
pub struct LineReader<R> {
    reader: R,
    limit: Option<u64>,
    done: bool,
}

impl<R: BufRead> LineReader<R> {
    pub fn new(reader: R) -> Self {
        LineReader {
            reader,
            limit: None,
            done: false,
        }
    }

    /// Creates a reader refusing records larger than `limit` bytes (delimiter included).
    /// At most `limit` bytes of an oversized record are read before
    /// [`SortError::RecordTooLarge`] is returned.
    pub fn with_limit(reader: R, limit: Option<u64>) -> Self {
        LineReader {
            reader,
            limit,
            done: false,
        }
    }

    fn read_next(&mut self) -> Result<Option<Record>, SortError> {
        if self.reader.fill_buf().map_err(SortError::InputError)?.is_empty() {
            return Ok(None);
        }

        let mut buf = Vec::new();
        let read = match self.limit {
            Some(limit) => self.reader.by_ref().take(limit).read_until(DELIMITER, &mut buf),
            None => self.reader.read_until(DELIMITER, &mut buf),
        }
        .map_err(SortError::InputError)?;

        if buf.last() == Some(&DELIMITER) {
            buf.pop();
        } else if let Some(limit) = self.limit {
            // no delimiter within the limit, the record can't fit even if the stream ends here
            if read as u64 >= limit {
                return Err(SortError::RecordTooLarge { limit });
            }
        }

        return Ok(Some(Record(buf)));
    }
}

impl<R: BufRead> Iterator for LineReader<R> {
    type Item = Result<Record, SortError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        match self.read_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                self.done = true;
                Some(Err(err))
            }
        }
    }
}

/// Record sink writing newline-delimited records.
pub struct LineWriter<W: Write> {
    writer: W,
    bytes: u64,
}

impl<W: Write> LineWriter<W> {
    pub fn new(writer: W) -> Self {
        LineWriter { writer, bytes: 0 }
    }

    pub fn write(&mut self, record: &Record) -> io::Result<()> {
        write_record(&mut self.writer, record)?;
        self.bytes += record.encoded_len();

        return Ok(());
    }

    /// Number of bytes written so far.
    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Flushes the writer and returns the underlying sink.
    pub fn finish(mut self) -> io::Result<W> {
        self.writer.flush()?;
        Ok(self.writer)
    }
}
