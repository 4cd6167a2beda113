//! Streaming `multipart/*` body scanner.
//!
//! Input can arrive in chunks of any size, including one byte at a time.
//! Part data is handed to the callbacks as slices of the caller's buffer.
//! Bytes that looked like the start of a delimiter but were not are replayed
//! from the delimiter itself, so nothing is copied on the hot path.
//!
//! ```text
//! FindingBoundary ─► FindingFirstCr ─┬─► FindingFirstLf ─► FindingNextChar ─┬─► FindingHeaderName
//!      ▲   │                         │                                      │        │ ':'
//!      │   ▼ mismatch                │                                      │   FindingColon
//!      │ FindingData ◄─ FindingSecondLf ◄─ FindingSecondCr ◄────────────────┘        │
//!      └─────┘ '\r'                  │                               FindingSpaceAfterColon
//!                                    │                                               │
//!                                    │      FindingFirstCr ◄─ '\r' ─ FindingHeaderValue
//!                                    └─ '-' ─► StreamAlmostOver ─ '-' ─► StreamOver
//! ```

use std::ops::ControlFlow;

use tracing::debug;

use crate::error::MultipartError;

/// Longest header name or value accepted.
pub const MAX_HEADER_LEN: usize = 8 * 1024;

const MAX_BOUNDARY_LEN: usize = 70;

/// Receives parse events. Every method may return `ControlFlow::Break(())`
/// to stop the parser.
pub trait MultipartCallbacks {
    fn part_begin(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn header_name(&mut self, _name: &[u8]) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn header_value(&mut self, _value: &[u8]) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn headers_complete(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// A slice of part body. One part may arrive in many slices.
    fn data(&mut self, chunk: &[u8]) -> ControlFlow<()>;

    fn part_end(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    /// The closing `--boundary--` was seen.
    fn body_end(&mut self) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanState {
    FindingData,
    FindingBoundary,
    FindingHeaderName,
    FindingHeaderValue,
    FindingFirstCr,
    FindingFirstLf,
    FindingSecondCr,
    FindingSecondLf,
    FindingNextChar,
    FindingColon,
    FindingSpaceAfterColon,
    StreamAlmostOver,
    StreamOver,
}

impl ScanState {
    pub fn name(self) -> &'static str {
        match self {
            ScanState::FindingData => "data",
            ScanState::FindingBoundary => "boundary",
            ScanState::FindingHeaderName => "header name",
            ScanState::FindingHeaderValue => "header value",
            ScanState::FindingFirstCr => "line end",
            ScanState::FindingFirstLf => "line feed",
            ScanState::FindingSecondCr => "blank line",
            ScanState::FindingSecondLf => "blank line feed",
            ScanState::FindingNextChar => "header start",
            ScanState::FindingColon => "colon",
            ScanState::FindingSpaceAfterColon => "header spacing",
            ScanState::StreamAlmostOver => "closing delimiter",
            ScanState::StreamOver => "epilogue",
        }
    }
}

pub struct MultipartParser {
    /// `\r\n--` followed by the boundary.
    delimiter: Vec<u8>,
    state: ScanState,
    matched: usize,
    in_part: bool,
    in_body: bool,
    header: Vec<u8>,
    consumed: usize,
}

impl MultipartParser {
    pub fn new(boundary: &str) -> Result<Self, MultipartError> {
        let len = boundary.len();
        if len == 0 || len > MAX_BOUNDARY_LEN || boundary.contains(['\r', '\n']) {
            return Err(MultipartError::InvalidBoundary(len));
        }
        let mut delimiter = b"\r\n--".to_vec();
        delimiter.extend_from_slice(boundary.as_bytes());
        Ok(Self {
            delimiter,
            state: ScanState::FindingBoundary,
            // The first delimiter may open the body without a leading CRLF.
            matched: 2,
            in_part: false,
            in_body: false,
            header: Vec::new(),
            consumed: 0,
        })
    }

    /// Build a parser from a `Content-Type` such as
    /// `multipart/related; boundary="abc"`.
    pub fn from_content_type(content_type: &str) -> Result<Self, MultipartError> {
        let boundary = content_type
            .split(';')
            .skip(1)
            .filter_map(|param| param.split_once('='))
            .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
            .map(|(_, value)| value.trim().trim_matches('"'))
            .ok_or(MultipartError::InvalidBoundary(0))?;
        Self::new(boundary)
    }

    pub fn state(&self) -> ScanState {
        self.state
    }

    pub fn is_done(&self) -> bool {
        self.state == ScanState::StreamOver
    }

    /// Bytes fed so far.
    pub fn consumed(&self) -> usize {
        self.consumed
    }

    /// Scan `input`. Returns the number of bytes consumed, which is all of
    /// them unless an error is returned. Bytes after the closing delimiter
    /// are epilogue and are skipped.
    pub fn feed<C>(&mut self, input: &[u8], cb: &mut C) -> Result<usize, MultipartError>
    where
        C: MultipartCallbacks + ?Sized,
    {
        let base = self.consumed;
        let mut run: Option<usize> = None;
        let mut i = 0;

        while i < input.len() {
            let b = input[i];
            let at = base + i;
            match self.state {
                ScanState::FindingData => {
                    if b == self.delimiter[0] {
                        if let Some(start) = run.take() {
                            self.emit_data(&input[start..i], cb, at)?;
                        }
                        self.matched = 1;
                        self.state = ScanState::FindingBoundary;
                    } else if run.is_none() {
                        run = Some(i);
                    }
                }
                ScanState::FindingBoundary => {
                    if b == self.delimiter[self.matched] {
                        self.matched += 1;
                        if self.matched == self.delimiter.len() {
                            self.matched = 0;
                            if self.in_part {
                                self.in_part = false;
                                self.in_body = false;
                                check(cb.part_end(), at)?;
                            }
                            self.state = ScanState::FindingFirstCr;
                        }
                    } else {
                        // The held prefix was ordinary data. Re-scan `b`.
                        if self.in_body {
                            check(cb.data(&self.delimiter[..self.matched]), at)?;
                        }
                        self.matched = 0;
                        self.state = ScanState::FindingData;
                        continue;
                    }
                }
                ScanState::FindingFirstCr => match b {
                    b'\r' => {
                        if !self.in_part {
                            self.in_part = true;
                            check(cb.part_begin(), at)?;
                        }
                        self.state = ScanState::FindingFirstLf;
                    }
                    b'-' if !self.in_part => self.state = ScanState::StreamAlmostOver,
                    // Transport padding after a delimiter.
                    b' ' | b'\t' if !self.in_part => {}
                    _ => return Err(self.malformed(at, b)),
                },
                ScanState::FindingFirstLf => {
                    if b != b'\n' {
                        return Err(self.malformed(at, b));
                    }
                    self.state = ScanState::FindingNextChar;
                }
                ScanState::FindingNextChar => {
                    self.state = if b == b'\r' {
                        ScanState::FindingSecondCr
                    } else {
                        self.header.clear();
                        ScanState::FindingHeaderName
                    };
                    continue;
                }
                ScanState::FindingHeaderName => match b {
                    b':' => {
                        check(cb.header_name(&self.header), at)?;
                        self.header.clear();
                        self.state = ScanState::FindingColon;
                        continue;
                    }
                    b'\r' | b'\n' => return Err(self.malformed(at, b)),
                    _ => self.push_header(b)?,
                },
                ScanState::FindingColon => {
                    self.state = ScanState::FindingSpaceAfterColon;
                }
                ScanState::FindingSpaceAfterColon => {
                    if b != b' ' && b != b'\t' {
                        self.state = ScanState::FindingHeaderValue;
                        continue;
                    }
                }
                ScanState::FindingHeaderValue => {
                    if b == b'\r' {
                        check(cb.header_value(&self.header), at)?;
                        self.header.clear();
                        self.state = ScanState::FindingFirstCr;
                        continue;
                    }
                    self.push_header(b)?;
                }
                ScanState::FindingSecondCr => {
                    if b != b'\r' {
                        return Err(self.malformed(at, b));
                    }
                    self.state = ScanState::FindingSecondLf;
                }
                ScanState::FindingSecondLf => {
                    if b != b'\n' {
                        return Err(self.malformed(at, b));
                    }
                    self.in_body = true;
                    self.state = ScanState::FindingData;
                    check(cb.headers_complete(), at)?;
                }
                ScanState::StreamAlmostOver => {
                    if b != b'-' {
                        return Err(self.malformed(at, b));
                    }
                    self.state = ScanState::StreamOver;
                    debug!(bytes = at + 1, "multipart body complete");
                    check(cb.body_end(), at)?;
                }
                ScanState::StreamOver => {
                    i = input.len();
                    break;
                }
            }
            i += 1;
        }

        if let Some(start) = run {
            let end = base + input.len();
            self.emit_data(&input[start..], cb, end)?;
        }
        self.consumed += input.len();
        Ok(i)
    }

    /// Check that the closing delimiter has been seen.
    pub fn finish(&self) -> Result<(), MultipartError> {
        if self.is_done() {
            Ok(())
        } else {
            Err(MultipartError::Truncated {
                state: self.state.name(),
            })
        }
    }

    fn emit_data<C>(&self, chunk: &[u8], cb: &mut C, at: usize) -> Result<(), MultipartError>
    where
        C: MultipartCallbacks + ?Sized,
    {
        if self.in_body && !chunk.is_empty() {
            check(cb.data(chunk), at)?;
        }
        Ok(())
    }

    fn push_header(&mut self, b: u8) -> Result<(), MultipartError> {
        if self.header.len() >= MAX_HEADER_LEN {
            return Err(MultipartError::HeaderTooLong {
                limit: MAX_HEADER_LEN,
            });
        }
        self.header.push(b);
        Ok(())
    }

    fn malformed(&self, offset: usize, byte: u8) -> MultipartError {
        MultipartError::Malformed {
            offset,
            byte,
            state: self.state.name(),
        }
    }
}

fn check(flow: ControlFlow<()>, offset: usize) -> Result<(), MultipartError> {
    match flow {
        ControlFlow::Continue(()) => Ok(()),
        ControlFlow::Break(()) => Err(MultipartError::Aborted(offset)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default, PartialEq)]
    struct Part {
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    }

    #[derive(Default)]
    struct Collect {
        parts: Vec<Part>,
        name: String,
        ended: bool,
        stop_after_data: bool,
    }

    impl MultipartCallbacks for Collect {
        fn part_begin(&mut self) -> ControlFlow<()> {
            self.parts.push(Part::default());
            ControlFlow::Continue(())
        }

        fn header_name(&mut self, name: &[u8]) -> ControlFlow<()> {
            self.name = String::from_utf8_lossy(name).into_owned();
            ControlFlow::Continue(())
        }

        fn header_value(&mut self, value: &[u8]) -> ControlFlow<()> {
            let name = std::mem::take(&mut self.name);
            let value = String::from_utf8_lossy(value).into_owned();
            if let Some(part) = self.parts.last_mut() {
                part.headers.push((name, value));
            }
            ControlFlow::Continue(())
        }

        fn data(&mut self, chunk: &[u8]) -> ControlFlow<()> {
            if let Some(part) = self.parts.last_mut() {
                part.body.extend_from_slice(chunk);
            }
            if self.stop_after_data {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        }

        fn body_end(&mut self) -> ControlFlow<()> {
            self.ended = true;
            ControlFlow::Continue(())
        }
    }

    const BODY: &[u8] = b"preamble\r\n--xyz\r\n\
Content-Type: application/json\r\n\
Content-Id:  <meta>\r\n\
\r\n\
{\"a\":1}\r\n\
--xyz\r\n\
Content-Type: application/octet-stream\r\n\
\r\n\
\r\n--xy\r\n-\x00\x01\r\n\
--xyz--\r\nepilogue";

    fn expected() -> Vec<Part> {
        vec![
            Part {
                headers: vec![
                    ("Content-Type".into(), "application/json".into()),
                    ("Content-Id".into(), "<meta>".into()),
                ],
                body: b"{\"a\":1}".to_vec(),
            },
            Part {
                headers: vec![("Content-Type".into(), "application/octet-stream".into())],
                body: b"\r\n--xy\r\n-\x00\x01".to_vec(),
            },
        ]
    }

    fn parse_in_chunks(size: usize) -> Collect {
        let mut parser = MultipartParser::new("xyz").unwrap();
        let mut collect = Collect::default();
        for chunk in BODY.chunks(size) {
            parser.feed(chunk, &mut collect).unwrap();
        }
        parser.finish().unwrap();
        collect
    }

    #[test]
    fn parses_parts_whole() {
        let c = parse_in_chunks(BODY.len());
        assert_eq!(c.parts, expected());
        assert!(c.ended);
    }

    #[test]
    fn chunking_does_not_change_result() {
        for size in [1, 2, 3, 5, 7, 16] {
            let c = parse_in_chunks(size);
            assert_eq!(c.parts, expected(), "chunk size {size}");
        }
    }

    #[test]
    fn body_may_start_with_delimiter() {
        let mut parser = MultipartParser::new("b").unwrap();
        let mut c = Collect::default();
        parser
            .feed(b"--b\r\nX: y\r\n\r\nhi\r\n--b--", &mut c)
            .unwrap();
        assert_eq!(c.parts.len(), 1);
        assert_eq!(c.parts[0].body, b"hi");
        assert!(parser.is_done());
    }

    #[test]
    fn garbage_after_delimiter_is_malformed() {
        let mut parser = MultipartParser::new("b").unwrap();
        let err = parser.feed(b"--bX", &mut Collect::default()).unwrap_err();
        assert_eq!(
            err,
            MultipartError::Malformed {
                offset: 3,
                byte: b'X',
                state: "line end"
            }
        );
    }

    #[test]
    fn callback_can_abort() {
        let mut parser = MultipartParser::new("xyz").unwrap();
        let mut c = Collect {
            stop_after_data: true,
            ..Collect::default()
        };
        assert!(matches!(
            parser.feed(BODY, &mut c),
            Err(MultipartError::Aborted(_))
        ));
    }

    #[test]
    fn boundary_from_content_type() {
        let parser =
            MultipartParser::from_content_type("multipart/related; type=x; boundary=\"abc\"").unwrap();
        assert_eq!(parser.delimiter, b"\r\n--abc");
        assert_eq!(
            MultipartParser::from_content_type("multipart/related").err(),
            Some(MultipartError::InvalidBoundary(0))
        );
        assert!(MultipartParser::new(&"x".repeat(71)).is_err());
    }

    #[test]
    fn truncated_body_is_reported() {
        let mut parser = MultipartParser::new("b").unwrap();
        parser.feed(b"--b\r\nX: y\r\n\r\npartial", &mut Collect::default()).unwrap();
        assert_eq!(
            parser.finish(),
            Err(MultipartError::Truncated { state: "data" })
        );
    }
}
