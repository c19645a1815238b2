//! Record stream framing for push, checkout and log transfers
//!
//! A stream is a sequence of records. Each record is a header line
//! `TYPE:objectId:byteLength\n` followed by exactly `byteLength` payload
//! bytes. Payloads are bincode for model objects and raw bytes for
//! `LARGE_FILE_CONTENTS`, which is the only record type allowed to exceed
//! [`MAX_RECORD_LEN`] and is streamed rather than buffered.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::object::{BinaryCodec, LARGE_FILE_SIZE_THRESHOLD};

/// Longest accepted header line, excluding the newline.
pub const MAX_HEADER_LEN: usize = 256;

/// Largest payload accepted for anything but large file contents.
pub const MAX_RECORD_LEN: u64 = 2 * LARGE_FILE_SIZE_THRESHOLD;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ObjectType {
    PushSpec,
    File,
    Folder,
    Commit,
    LargeFileContents,
    MergeResult,
}

impl ObjectType {
    pub fn as_str(self) -> &'static str {
        match self {
            ObjectType::PushSpec => "PUSH_SPEC",
            ObjectType::File => "FILE",
            ObjectType::Folder => "FOLDER",
            ObjectType::Commit => "COMMIT",
            ObjectType::LargeFileContents => "LARGE_FILE_CONTENTS",
            ObjectType::MergeResult => "MERGE_RESULT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PUSH_SPEC" => Some(ObjectType::PushSpec),
            "FILE" => Some(ObjectType::File),
            "FOLDER" => Some(ObjectType::Folder),
            "COMMIT" => Some(ObjectType::Commit),
            "LARGE_FILE_CONTENTS" => Some(ObjectType::LargeFileContents),
            "MERGE_RESULT" => Some(ObjectType::MergeResult),
            _ => None,
        }
    }
}

impl std::fmt::Display for ObjectType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordHeader {
    pub object_type: ObjectType,
    pub object_id: String,
    pub len: u64,
}

impl RecordHeader {
    /// Parse `TYPE:objectId:byteLength`. The id may itself contain `:`.
    pub fn parse(line: &str) -> Result<Self> {
        let (type_str, rest) = line
            .split_once(':')
            .ok_or_else(|| Error::Protocol(format!("Malformed record header: {:?}", line)))?;
        let (object_id, len_str) = rest
            .rsplit_once(':')
            .ok_or_else(|| Error::Protocol(format!("Malformed record header: {:?}", line)))?;
        let object_type = ObjectType::parse(type_str)
            .ok_or_else(|| Error::Protocol(format!("Unknown record type: {}", type_str)))?;
        let len = len_str
            .parse::<u64>()
            .map_err(|_| Error::Protocol(format!("Bad record length: {:?}", len_str)))?;
        Ok(Self {
            object_type,
            object_id: object_id.to_string(),
            len,
        })
    }

    pub fn to_line(&self) -> String {
        format!("{}:{}:{}\n", self.object_type, self.object_id, self.len)
    }
}

fn eof_as_protocol(e: std::io::Error, what: String) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Protocol(what)
    } else {
        Error::Io(e)
    }
}

/// Reads records one at a time. Every header's payload must be consumed
/// (via [`read_payload`](Self::read_payload), [`read_object`](Self::read_object)
/// or [`payload_reader`](Self::payload_reader)) before the next header.
pub struct ObjectReader<R> {
    inner: R,
    unread: u64,
}

impl<R: AsyncBufRead + Unpin> ObjectReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner, unread: 0 }
    }

    /// Next record header, or `None` at a clean end of stream.
    pub async fn next_header(&mut self) -> Result<Option<RecordHeader>> {
        if self.unread != 0 {
            return Err(Error::Protocol(
                "Previous record payload was not consumed".to_string(),
            ));
        }
        let mut line = Vec::new();
        let n = (&mut self.inner)
            .take(MAX_HEADER_LEN as u64 + 1)
            .read_until(b'\n', &mut line)
            .await?;
        if n == 0 {
            return Ok(None);
        }
        if line.last() != Some(&b'\n') {
            return Err(Error::Protocol(if line.len() > MAX_HEADER_LEN {
                "Record header is too long".to_string()
            } else {
                "Unexpected EOF reading record header".to_string()
            }));
        }
        line.pop();
        let text = std::str::from_utf8(&line)
            .map_err(|_| Error::Protocol("Record header is not UTF-8".to_string()))?;
        let header = RecordHeader::parse(text)?;
        if header.object_type != ObjectType::LargeFileContents && header.len > MAX_RECORD_LEN {
            return Err(Error::Protocol(format!(
                "{} record {} is {} bytes, over the {} byte limit",
                header.object_type, header.object_id, header.len, MAX_RECORD_LEN
            )));
        }
        self.unread = header.len;
        Ok(Some(header))
    }

    /// Buffer the current record's payload.
    pub async fn read_payload(&mut self) -> Result<Vec<u8>> {
        let len = self.unread;
        if len > MAX_RECORD_LEN {
            return Err(Error::Protocol(format!(
                "Refusing to buffer a {} byte payload",
                len
            )));
        }
        let mut buf = vec![0u8; len as usize];
        self.inner
            .read_exact(&mut buf)
            .await
            .map_err(|e| eof_as_protocol(e, format!("Unexpected EOF reading {} bytes", len)))?;
        self.unread = 0;
        Ok(buf)
    }

    pub async fn read_object<T: BinaryCodec>(&mut self) -> Result<T> {
        let payload = self.read_payload().await?;
        Ok(T::from_bytes(&payload)?)
    }

    /// Stream the current record's payload. The caller must read it to the
    /// end and check the byte count; a short read leaves the stream unusable.
    pub fn payload_reader(&mut self) -> tokio::io::Take<&mut R> {
        let len = self.unread;
        self.unread = 0;
        (&mut self.inner).take(len)
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

pub struct ObjectWriter<W> {
    inner: W,
}

impl<W: AsyncWrite + Unpin> ObjectWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner }
    }

    pub async fn write_record(
        &mut self,
        object_type: ObjectType,
        object_id: &str,
        payload: &[u8],
    ) -> Result<()> {
        let header = RecordHeader {
            object_type,
            object_id: object_id.to_string(),
            len: payload.len() as u64,
        };
        self.inner.write_all(header.to_line().as_bytes()).await?;
        self.inner.write_all(payload).await?;
        Ok(())
    }

    pub async fn write_object<T: BinaryCodec>(
        &mut self,
        object_type: ObjectType,
        object_id: &str,
        value: &T,
    ) -> Result<()> {
        self.write_record(object_type, object_id, &value.to_bytes()?).await
    }

    /// Copy exactly `len` bytes from `reader` as one record.
    pub async fn write_stream<Rd: AsyncRead + Unpin>(
        &mut self,
        object_type: ObjectType,
        object_id: &str,
        len: u64,
        reader: Rd,
    ) -> Result<()> {
        let header = RecordHeader {
            object_type,
            object_id: object_id.to_string(),
            len,
        };
        self.inner.write_all(header.to_line().as_bytes()).await?;
        let copied = tokio::io::copy(&mut reader.take(len), &mut self.inner).await?;
        if copied != len {
            return Err(Error::Protocol(format!(
                "Record {} ended after {} of {} bytes",
                object_id, copied, len
            )));
        }
        Ok(())
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.inner.flush().await?;
        Ok(())
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
