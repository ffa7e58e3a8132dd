//! Frame envelope: `[kind][timestamp][length]` followed by `length` bytes.
//!
//! The three header integers use msgpack's positive-integer encoding
//! (positive fixnum or `uint8`/`uint16`/`uint32`/`uint64`). The payload is one
//! complete msgpack value, decoded separately by [`crate::codec`].

use std::io::{
  self,
  Read,
  Write,
};

use rmp::{
  Marker,
  decode::{
    RmpRead,
    ValueReadError,
  },
  encode,
};

use crate::{
  Timestamp,
  entry::Kind,
  error::{
    Error,
    Result,
  },
};

/// A raw frame as read from disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
  pub kind:      u64,
  pub timestamp: Timestamp,
  pub payload:   Vec<u8>,
  /// Byte offset of the frame start within the stream.
  pub offset:    u64,
}

/// Sequential frame reader.
///
/// A `Format` error leaves the reader in an undefined position: the declared
/// lengths can no longer be trusted, so callers must stop reading.
pub struct FrameReader<R> {
  inner:  R,
  offset: u64,
}

impl<R> FrameReader<R> {
  pub fn new(inner: R) -> Self {
    Self { inner, offset: 0 }
  }

  /// Number of bytes consumed so far.
  pub fn offset(&self) -> u64 {
    self.offset
  }
}

impl<R: Read> FrameReader<R> {
  /// Reads the next frame, or `None` on a clean end of stream.
  pub fn read_frame(&mut self) -> Result<Option<Frame>> {
    let start = self.offset;
    let Some(kind) = self.read_uint("kind", true)? else {
      return Ok(None);
    };
    if Kind::from_id(kind).is_none() {
      return Err(Error::format(
        start,
        "entry kind 0 is reserved and never written",
      ));
    }
    let timestamp = self.expect_uint("timestamp")?;
    let length = self.expect_uint("payload length")?;

    let mut payload = Vec::new();
    let result = (&mut self.inner).take(length).read_to_end(&mut payload);
    let read = result.map_err(|err| self.io_error(err))?;
    self.offset += read as u64;
    if (read as u64) < length {
      return Err(Error::format(
        start,
        format!("entry declares {length} payload bytes but only {read} remain"),
      ));
    }

    Ok(Some(Frame {
      kind,
      timestamp,
      payload,
      offset: start,
    }))
  }

  fn expect_uint(&mut self, field: &str) -> Result<u64> {
    self.read_uint(field, false)?.ok_or_else(|| {
      Error::format(
        self.offset,
        format!("unexpected end of file while reading entry {field}"),
      )
    })
  }

  /// Reads one msgpack positive integer, `None` on a clean end of stream.
  fn read_uint(&mut self, field: &str, at_frame_start: bool) -> Result<Option<u64>> {
    let marker_offset = self.offset;
    let Some(marker) = self.read_byte()? else {
      if at_frame_start {
        return Ok(None);
      }
      return Err(Error::format(
        marker_offset,
        format!("unexpected end of file while reading entry {field}"),
      ));
    };

    let (value, width) = match Marker::from_u8(marker) {
      Marker::FixPos(value) => return Ok(Some(u64::from(value))),
      Marker::U8 => (self.inner.read_data_u8().map(u64::from), 1),
      Marker::U16 => (self.inner.read_data_u16().map(u64::from), 2),
      Marker::U32 => (self.inner.read_data_u32().map(u64::from), 4),
      Marker::U64 => (self.inner.read_data_u64(), 8),
      _ => {
        return Err(Error::format(
          marker_offset,
          format!("expected positive integer for entry {field}, found byte 0x{marker:02x}"),
        ));
      },
    };

    match value {
      Ok(value) => {
        self.offset += width;
        Ok(Some(value))
      },
      Err(ValueReadError::InvalidMarkerRead(err) | ValueReadError::InvalidDataRead(err))
        if err.kind() != io::ErrorKind::UnexpectedEof =>
      {
        Err(self.io_error(err))
      },
      Err(_) => {
        Err(Error::format(
          marker_offset,
          format!("unexpected end of file while reading entry {field}"),
        ))
      },
    }
  }

  fn read_byte(&mut self) -> Result<Option<u8>> {
    let mut byte = [0u8; 1];
    loop {
      match self.inner.read(&mut byte) {
        Ok(0) => return Ok(None),
        Ok(_) => {
          self.offset += 1;
          return Ok(Some(byte[0]));
        },
        Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
        Err(err) => return Err(self.io_error(err)),
      }
    }
  }

  fn io_error(&self, err: io::Error) -> Error {
    Error::system(format!("failed to read ShaDa data at byte {}", self.offset), err)
  }
}

/// Writes one frame envelope followed by the payload bytes.
pub fn write_frame<W: Write>(
  out: &mut W,
  kind: u64,
  timestamp: Timestamp,
  payload: &[u8],
) -> Result<()> {
  let mut envelope = Vec::with_capacity(27);
  for value in [kind, timestamp, payload.len() as u64] {
    encode::write_uint(&mut envelope, value)
      .map_err(|err| Error::system("failed to encode ShaDa entry header", err.into()))?;
  }
  out
    .write_all(&envelope)
    .and_then(|()| out.write_all(payload))
    .map_err(|err| Error::system("failed to write ShaDa entry", err))
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame_bytes(kind: u64, timestamp: u64, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    write_frame(&mut out, kind, timestamp, payload).unwrap();
    out
  }

  #[test]
  fn integers_use_the_smallest_encoding() {
    let cases: [(u64, &[u8]); 5] = [
      (5, &[0x05]),
      (200, &[0xcc, 200]),
      (0x1234, &[0xcd, 0x12, 0x34]),
      (0x1234_5678, &[0xce, 0x12, 0x34, 0x56, 0x78]),
      (
        0x1_0000_0000,
        &[0xcf, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00],
      ),
    ];
    for (value, expected) in cases {
      let bytes = frame_bytes(1, value, &[]);
      assert_eq!(&bytes[1..bytes.len() - 1], expected, "encoding of {value}");
    }
  }

  #[test]
  fn reads_back_written_frames() {
    let mut bytes = frame_bytes(1, 1_700_000_000, &[0x80]);
    bytes.extend(frame_bytes(200, 3, b"opaque"));

    let mut reader = FrameReader::new(bytes.as_slice());
    let first = reader.read_frame().unwrap().unwrap();
    assert_eq!(first.kind, 1);
    assert_eq!(first.timestamp, 1_700_000_000);
    assert_eq!(first.payload, vec![0x80]);
    assert_eq!(first.offset, 0);

    let second = reader.read_frame().unwrap().unwrap();
    assert_eq!(second.kind, 200);
    assert_eq!(second.payload, b"opaque".to_vec());
    assert_eq!(second.offset, 8);

    assert!(reader.read_frame().unwrap().is_none());
    assert_eq!(reader.offset(), bytes.len() as u64);
  }

  #[test]
  fn kind_zero_is_a_format_error() {
    let bytes = frame_bytes(0, 1, &[0xc0]);
    let err = FrameReader::new(bytes.as_slice()).read_frame().unwrap_err();
    assert!(matches!(err, Error::Format { offset: 0, .. }), "{err}");
  }

  #[test]
  fn short_payload_is_a_format_error() {
    let mut bytes = vec![7, 1, 50];
    bytes.extend([0u8; 10]);
    let err = FrameReader::new(bytes.as_slice()).read_frame().unwrap_err();
    assert!(matches!(err, Error::Format { .. }), "{err}");
  }

  #[test]
  fn truncated_header_is_a_format_error() {
    let bytes = [7u8, 0xcd, 0x01];
    let err = FrameReader::new(&bytes[..]).read_frame().unwrap_err();
    assert!(matches!(err, Error::Format { .. }), "{err}");
  }

  #[test]
  fn non_integer_marker_is_a_format_error() {
    let bytes = [0xa3u8, b'a', b'b', b'c'];
    let err = FrameReader::new(&bytes[..]).read_frame().unwrap_err();
    assert!(matches!(err, Error::Format { offset: 0, .. }), "{err}");
  }

  #[test]
  fn empty_stream_is_a_clean_end() {
    assert!(FrameReader::new(&[][..]).read_frame().unwrap().is_none());
  }
}
