//! The protocol codec: splitting a byte stream into complete top-level
//! frames (`split`) and walking a single frame with a visitor (`parse`).
//! Pure, no I/O — grounded on the same split-vs-walk separation as
//! `neutronium::net::frame::Frame`/`channel::Channel::read_unpack`, but for
//! the RESP-style wire grammar in spec.md §4.1 instead of a binary header.

use std::ops::Range;

/// Anything a `parse` walk can report a frame to.
pub trait Visitor {
    fn on_integer(&mut self, value: i64);
    fn on_simple_string(&mut self, bytes: &[u8]);
    fn on_bulk_string(&mut self, bytes: &[u8]);
    fn on_error(&mut self, bytes: &[u8]);
    /// Called before the `len` children of an array are walked. A nil array
    /// is reported via `on_nil`, not `on_array(0)`.
    fn on_array(&mut self, len: usize);
    fn on_nil(&mut self);
}

#[derive(Debug)]
pub struct ProtocolError;

/// Result of splitting a buffer into top-level frames.
pub struct SplitResult {
    /// One range per complete top-level frame, in order. Arrays are a
    /// single range covering the whole array including its children.
    pub frames: Vec<Range<usize>>,
    /// Offset of the first incomplete frame, or `buf.len()` if every byte
    /// up to the end of the buffer was consumed by a complete frame.
    pub interrupt_point: usize,
}

impl SplitResult {
    pub fn finished(&self, buf_len: usize) -> bool {
        self.interrupt_point == buf_len
    }
}

/// Splits `buf` into complete top-level frames. Never consumes a partial
/// frame: on a malformed byte stream this returns `Err` rather than
/// misinterpreting the rest of the buffer.
pub fn split(buf: &[u8]) -> Result<SplitResult, ProtocolError> {
    let mut frames = Vec::new();
    let mut pos = 0;

    while let Some(end) = frame_extent(buf, pos)? {
        frames.push(pos..end);
        pos = end;
    }

    Ok(SplitResult {
        frames,
        interrupt_point: pos,
    })
}

/// Walks the single frame occupying `range`, invoking `visitor` along the
/// way, and returns the offset just past the frame. `range` must be a
/// complete frame as produced by `split` — an incomplete range is a
/// programmer error, reported as `ProtocolError` rather than panicking.
pub fn parse(buf: &[u8], range: Range<usize>, visitor: &mut dyn Visitor) -> Result<usize, ProtocolError> {
    walk(buf, range.start, visitor)
}

fn walk(buf: &[u8], pos: usize, visitor: &mut dyn Visitor) -> Result<usize, ProtocolError> {
    let prefix = *buf.get(pos).ok_or(ProtocolError)?;

    match prefix {
        b'+' => {
            let (line, end) = read_line(buf, pos + 1)?;
            visitor.on_simple_string(line);
            Ok(end)
        }
        b'-' => {
            let (line, end) = read_line(buf, pos + 1)?;
            visitor.on_error(line);
            Ok(end)
        }
        b':' => {
            let (line, end) = read_line(buf, pos + 1)?;
            visitor.on_integer(parse_i64(line)?);
            Ok(end)
        }
        b'$' => {
            let (line, after_len) = read_line(buf, pos + 1)?;
            let len = parse_i64(line)?;
            if len < 0 {
                visitor.on_nil();
                return Ok(after_len);
            }
            let len = len as usize;
            let content_end = after_len + len;
            let terminator_end = content_end + 2;
            if buf.len() < terminator_end {
                return Err(ProtocolError);
            }
            visitor.on_bulk_string(&buf[after_len..content_end]);
            Ok(terminator_end)
        }
        b'*' => {
            let (line, after_len) = read_line(buf, pos + 1)?;
            let len = parse_i64(line)?;
            if len < 0 {
                visitor.on_nil();
                return Ok(after_len);
            }
            visitor.on_array(len as usize);
            let mut cursor = after_len;
            for _ in 0..len {
                cursor = walk(buf, cursor, visitor)?;
            }
            Ok(cursor)
        }
        _ => Err(ProtocolError),
    }
}

/// Finds the end offset of one complete top-level frame starting at `pos`,
/// without invoking a visitor. `Ok(None)` means the buffer ends before the
/// frame completes; `Err` means the bytes present are not a valid frame.
fn frame_extent(buf: &[u8], pos: usize) -> Result<Option<usize>, ProtocolError> {
    let prefix = match buf.get(pos) {
        Some(b) => *b,
        None => return Ok(None),
    };

    match prefix {
        b'+' | b'-' | b':' => match find_crlf(buf, pos + 1) {
            Some(end) => Ok(Some(end)),
            None => Ok(None),
        },
        b'$' => {
            let (line, after_len) = match try_read_line(buf, pos + 1) {
                Some(v) => v,
                None => return Ok(None),
            };
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok(Some(after_len));
            }
            let terminator_end = after_len + len as usize + 2;
            if buf.len() < terminator_end {
                Ok(None)
            } else {
                Ok(Some(terminator_end))
            }
        }
        b'*' => {
            let (line, after_len) = match try_read_line(buf, pos + 1) {
                Some(v) => v,
                None => return Ok(None),
            };
            let len = parse_i64(line)?;
            if len < 0 {
                return Ok(Some(after_len));
            }
            let mut cursor = after_len;
            for _ in 0..len {
                match frame_extent(buf, cursor)? {
                    Some(end) => cursor = end,
                    None => return Ok(None),
                }
            }
            Ok(Some(cursor))
        }
        _ => Err(ProtocolError),
    }
}

/// Finds the offset just past the next `\r\n` at or after `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    let rest = buf.get(from..)?;
    rest.windows(2).position(|w| w == b"\r\n").map(|i| from + i + 2)
}

fn try_read_line(buf: &[u8], from: usize) -> Option<(&[u8], usize)> {
    let end = find_crlf(buf, from)?;
    Some((&buf[from..end - 2], end))
}

fn read_line(buf: &[u8], from: usize) -> Result<(&[u8], usize), ProtocolError> {
    try_read_line(buf, from).ok_or(ProtocolError)
}

/// Signed decimal: optional leading `-`, decimal digits, no leading `+`,
/// no whitespace.
fn parse_i64(bytes: &[u8]) -> Result<i64, ProtocolError> {
    let (neg, digits) = match bytes.first() {
        Some(b'-') => (true, &bytes[1..]),
        _ => (false, bytes),
    };

    if digits.is_empty() {
        return Err(ProtocolError);
    }

    let mut value: i64 = 0;
    for &b in digits {
        if !b.is_ascii_digit() {
            return Err(ProtocolError);
        }
        value = value * 10 + (b - b'0') as i64;
    }

    Ok(if neg { -value } else { value })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    enum Recorded {
        #[default]
        None,
        Integer(i64),
        Simple(Vec<u8>),
        Bulk(Vec<u8>),
        Error(Vec<u8>),
        Array(usize),
        Nil,
    }

    #[derive(Default)]
    struct Recorder(Vec<Recorded>);

    impl Visitor for Recorder {
        fn on_integer(&mut self, value: i64) {
            self.0.push(Recorded::Integer(value));
        }
        fn on_simple_string(&mut self, bytes: &[u8]) {
            self.0.push(Recorded::Simple(bytes.to_vec()));
        }
        fn on_bulk_string(&mut self, bytes: &[u8]) {
            self.0.push(Recorded::Bulk(bytes.to_vec()));
        }
        fn on_error(&mut self, bytes: &[u8]) {
            self.0.push(Recorded::Error(bytes.to_vec()));
        }
        fn on_array(&mut self, len: usize) {
            self.0.push(Recorded::Array(len));
        }
        fn on_nil(&mut self) {
            self.0.push(Recorded::Nil);
        }
    }

    #[test]
    fn split_of_truncated_simple_string() {
        let buf = b"+OK\r";
        let result = split(buf).unwrap();
        assert!(result.frames.is_empty());
        assert!(!result.finished(buf.len()));
        assert_eq!(result.interrupt_point, 0);
    }

    #[test]
    fn split_stops_at_first_incomplete_frame() {
        let buf = b"+PONG\r\n:";
        let result = split(buf).unwrap();
        assert_eq!(result.frames, vec![0..7]);
        assert!(!result.finished(buf.len()));
        assert_eq!(result.interrupt_point, 7);
    }

    #[test]
    fn split_handles_nil_bulk_and_array() {
        let buf = b"$-1\r\n*-1\r\n";
        let result = split(buf).unwrap();
        assert_eq!(result.frames, vec![0..5, 5..10]);
        assert!(result.finished(buf.len()));
    }

    #[test]
    fn split_concatenation_equals_prefix() {
        let buf = b"*1\r\n$3\r\nfoo\r\n+ok\r\n$9\r\npartial";
        let result = split(buf).unwrap();
        let mut rebuilt = Vec::new();
        for r in &result.frames {
            rebuilt.extend_from_slice(&buf[r.clone()]);
        }
        assert_eq!(&rebuilt[..], &buf[..result.interrupt_point]);
    }

    #[test]
    fn parse_negative_integer() {
        let buf = b":-1234\r\n";
        let mut rec = Recorder::default();
        let consumed = parse(buf, 0..buf.len(), &mut rec).unwrap();
        assert_eq!(consumed, 8);
        assert_eq!(rec.0, vec![Recorded::Integer(-1234)]);
    }

    #[test]
    fn parse_nested_array() {
        let buf = b"*2\r\n*3\r\n:1\r\n:2\r\n:3\r\n*2\r\n+Foo\r\n-Bar\r\n";
        let result = split(buf).unwrap();
        assert_eq!(result.frames.len(), 1);
        assert_eq!(result.frames[0], 0..36);

        let mut rec = Recorder::default();
        let consumed = parse(buf, result.frames[0].clone(), &mut rec).unwrap();
        assert_eq!(consumed, 36);
        assert_eq!(
            rec.0,
            vec![
                Recorded::Array(2),
                Recorded::Array(3),
                Recorded::Integer(1),
                Recorded::Integer(2),
                Recorded::Integer(3),
                Recorded::Array(2),
                Recorded::Simple(b"Foo".to_vec()),
                Recorded::Error(b"Bar".to_vec()),
            ]
        );
    }

    #[test]
    fn roundtrip_every_frame_kind() {
        let frames: &[&[u8]] = &[
            b"+OK\r\n",
            b"-ERR bad\r\n",
            b":42\r\n",
            b"$3\r\nfoo\r\n",
            b"$-1\r\n",
            b"*-1\r\n",
            b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n",
        ];

        for &encoded in frames {
            let result = split(encoded).unwrap();
            assert_eq!(result.frames.len(), 1, "{:?}", encoded);
            assert!(result.finished(encoded.len()));

            let mut rec = Recorder::default();
            let consumed = parse(encoded, result.frames[0].clone(), &mut rec).unwrap();
            assert_eq!(consumed, encoded.len());
        }
    }

    #[test]
    fn rejects_bad_prefix() {
        assert!(split(b"!nope\r\n").is_err());
    }

    #[test]
    fn rejects_non_digit_length() {
        assert!(split(b"$3x\r\nfoo\r\n").is_err());
    }
}
