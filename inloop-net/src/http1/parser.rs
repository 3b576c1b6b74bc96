use super::types::{
    Header, HttpVersion, Limits, ParseError, ParseErrorKind, Request, RequestLine, Response,
    StatusLine,
};

const CRLF: &[u8] = b"\r\n";
const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseStatus<T> {
    NeedMore,
    Complete { message: T },
    Error { error: ParseError },
}

#[derive(Debug, Default)]
pub struct RequestParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Request> {
        self.buffer.extend_from_slice(bytes);
        match parse_request(&self.buffer, self.limits) {
            Ok(Some((message, consumed))) => {
                self.buffer.drain(..consumed);
                ParseStatus::Complete { message }
            }
            Ok(None) => ParseStatus::NeedMore,
            Err(error) => ParseStatus::Error { error },
        }
    }
}

#[derive(Debug, Default)]
pub struct ResponseParser {
    buffer: Vec<u8>,
    limits: Limits,
}

impl ResponseParser {
    pub fn new() -> Self {
        Self::with_limits(Limits::default())
    }

    pub fn with_limits(limits: Limits) -> Self {
        Self {
            buffer: Vec::new(),
            limits,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) -> ParseStatus<Response> {
        self.buffer.extend_from_slice(bytes);
        match parse_response(&self.buffer, self.limits) {
            Ok(ResponseProgress::Complete { message, consumed }) => {
                self.buffer.drain(..consumed);
                ParseStatus::Complete { message }
            }
            Ok(ResponseProgress::NeedMore) | Ok(ResponseProgress::AwaitClose) => {
                ParseStatus::NeedMore
            }
            Err(error) => ParseStatus::Error { error },
        }
    }

    // Bytes retained past the end of the last complete message.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    // Completes a close-delimited response once the peer has shut down the
    // stream: whatever followed the headers is the body.
    pub fn finish(&mut self) -> Option<Response> {
        let head = parse_head(&self.buffer, self.limits).ok()??;
        let body = self.buffer[head.body_start..].to_vec();
        self.buffer.clear();
        Some(Response {
            line: head.status?,
            headers: head.headers,
            body,
        })
    }
}

struct Head {
    request: Option<RequestLine>,
    status: Option<StatusLine>,
    headers: Vec<Header>,
    body_start: usize,
}

enum ResponseProgress {
    NeedMore,
    AwaitClose,
    Complete { message: Response, consumed: usize },
}

fn parse_request(buffer: &[u8], limits: Limits) -> Result<Option<(Request, usize)>, ParseError> {
    let Some(head) = parse_head(buffer, limits)? else {
        return Ok(None);
    };
    let line = head.request.ok_or(ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset: 0,
    })?;

    let body_end = if let Some(length) = content_length(&head.headers, head.body_start, limits)? {
        match buffer.len().checked_sub(head.body_start + length) {
            Some(_) => head.body_start + length,
            None => return Ok(None),
        }
    } else if is_chunked(&head.headers) {
        match parse_chunked(buffer, head.body_start, limits)? {
            Some((body, consumed)) => {
                return Ok(Some((
                    Request {
                        line,
                        headers: head.headers,
                        body,
                    },
                    head.body_start + consumed,
                )));
            }
            None => return Ok(None),
        }
    } else {
        head.body_start
    };

    let body = buffer[head.body_start..body_end].to_vec();
    Ok(Some((
        Request {
            line,
            headers: head.headers,
            body,
        },
        body_end,
    )))
}

fn parse_response(buffer: &[u8], limits: Limits) -> Result<ResponseProgress, ParseError> {
    let Some(head) = parse_head(buffer, limits)? else {
        return Ok(ResponseProgress::NeedMore);
    };
    let line = head.status.ok_or(ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: 0,
    })?;

    if bodyless_status(line.status_code) {
        return Ok(ResponseProgress::Complete {
            message: Response {
                line,
                headers: head.headers,
                body: Vec::new(),
            },
            consumed: head.body_start,
        });
    }

    if let Some(length) = content_length(&head.headers, head.body_start, limits)? {
        let total = head.body_start + length;
        if buffer.len() < total {
            return Ok(ResponseProgress::NeedMore);
        }
        return Ok(ResponseProgress::Complete {
            message: Response {
                line,
                headers: head.headers,
                body: buffer[head.body_start..total].to_vec(),
            },
            consumed: total,
        });
    }

    if is_chunked(&head.headers) {
        return match parse_chunked(buffer, head.body_start, limits)? {
            Some((body, consumed)) => Ok(ResponseProgress::Complete {
                message: Response {
                    line,
                    headers: head.headers,
                    body,
                },
                consumed: head.body_start + consumed,
            }),
            None => Ok(ResponseProgress::NeedMore),
        };
    }

    // No framing headers: the body runs until the peer closes the stream.
    Ok(ResponseProgress::AwaitClose)
}

fn parse_head(buffer: &[u8], limits: Limits) -> Result<Option<Head>, ParseError> {
    let headers_end = match twoway::find_bytes(buffer, HEADER_TERMINATOR) {
        Some(index) if index > limits.max_header_bytes => {
            return Err(ParseError {
                kind: ParseErrorKind::HeaderTooLarge,
                offset: limits.max_header_bytes,
            });
        }
        Some(index) => index,
        None if buffer.len() > limits.max_header_bytes => {
            return Err(ParseError {
                kind: ParseErrorKind::HeaderTooLarge,
                offset: limits.max_header_bytes,
            });
        }
        None => return Ok(None),
    };

    let line_end = twoway::find_bytes(buffer, CRLF).unwrap_or(headers_end);
    let start_line = std::str::from_utf8(&buffer[..line_end]).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset: 0,
    })?;

    let (request, status) = if start_line.starts_with("HTTP/") {
        (None, Some(parse_status_line(start_line)?))
    } else {
        (Some(parse_request_line(start_line)?), None)
    };

    let headers = parse_headers(
        &buffer[(line_end + CRLF.len()).min(headers_end)..headers_end],
        line_end,
    )?;

    Ok(Some(Head {
        request,
        status,
        headers,
        body_start: headers_end + HEADER_TERMINATOR.len(),
    }))
}

fn parse_request_line(line: &str) -> Result<RequestLine, ParseError> {
    let error = ParseError {
        kind: ParseErrorKind::InvalidStartLine,
        offset: 0,
    };
    let mut parts = line.split_whitespace();
    let method = parts.next().ok_or(error.clone())?;
    let target = parts.next().ok_or(error.clone())?;
    let version = parse_version(parts.next().unwrap_or("HTTP/1.1"));
    if parts.next().is_some() {
        return Err(error);
    }
    Ok(RequestLine {
        method: method.to_string(),
        target: target.to_string(),
        version,
    })
}

fn parse_status_line(line: &str) -> Result<StatusLine, ParseError> {
    let error = ParseError {
        kind: ParseErrorKind::InvalidStatusLine,
        offset: 0,
    };
    let mut parts = line.splitn(3, ' ');
    let version = parse_version(parts.next().unwrap_or("HTTP/1.1"));
    let status_code = parts
        .next()
        .and_then(|raw| raw.parse::<u16>().ok())
        .ok_or(error)?;
    let reason = parts.next().unwrap_or("").to_string();
    Ok(StatusLine {
        version,
        status_code,
        reason,
    })
}

fn parse_version(raw: &str) -> HttpVersion {
    match raw {
        "HTTP/1.0" => HttpVersion::Http10,
        "HTTP/1.1" => HttpVersion::Http11,
        other => HttpVersion::Other(other.to_string()),
    }
}

fn parse_headers(bytes: &[u8], base_offset: usize) -> Result<Vec<Header>, ParseError> {
    if bytes.is_empty() {
        return Ok(Vec::new());
    }

    let text = std::str::from_utf8(bytes).map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeader,
        offset: base_offset,
    })?;

    let mut headers: Vec<Header> = Vec::new();
    for line in text.split("\r\n") {
        if line.is_empty() {
            continue;
        }

        // Obsolete line folding: continuation of the previous header value.
        if line.starts_with(' ') || line.starts_with('\t') {
            if let Some(last) = headers.last_mut() {
                last.value.push(' ');
                last.value.push_str(line.trim());
                continue;
            }
        }

        let (raw_name, value) = line.split_once(':').ok_or(ParseError {
            kind: ParseErrorKind::InvalidHeader,
            offset: base_offset,
        })?;
        headers.push(Header {
            name: raw_name.trim().to_ascii_lowercase(),
            value: value.trim().to_string(),
            raw_name: raw_name.to_string(),
        });
    }

    Ok(headers)
}

fn content_length(
    headers: &[Header],
    offset: usize,
    limits: Limits,
) -> Result<Option<usize>, ParseError> {
    let Some(header) = headers.iter().find(|header| header.is("content-length")) else {
        return Ok(None);
    };
    let length = header.value.parse::<usize>().map_err(|_| ParseError {
        kind: ParseErrorKind::InvalidHeader,
        offset,
    })?;
    if length > limits.max_body_bytes {
        return Err(ParseError {
            kind: ParseErrorKind::BodyTooLarge,
            offset,
        });
    }
    Ok(Some(length))
}

fn is_chunked(headers: &[Header]) -> bool {
    headers
        .iter()
        .filter(|header| header.is("transfer-encoding"))
        .any(|header| {
            header
                .value
                .split(',')
                .any(|encoding| encoding.trim().eq_ignore_ascii_case("chunked"))
        })
}

fn bodyless_status(status_code: u16) -> bool {
    matches!(status_code, 100..=199 | 204 | 304)
}

type ChunkedBody = Option<(Vec<u8>, usize)>;

fn parse_chunked(
    buffer: &[u8],
    body_start: usize,
    limits: Limits,
) -> Result<ChunkedBody, ParseError> {
    let mut cursor = body_start;
    let mut body = Vec::new();

    loop {
        let Some(line_end) = twoway::find_bytes(&buffer[cursor..], CRLF).map(|at| cursor + at)
        else {
            return Ok(None);
        };
        let line = std::str::from_utf8(&buffer[cursor..line_end]).map_err(|_| ParseError {
            kind: ParseErrorKind::InvalidChunkSize,
            offset: cursor,
        })?;
        let size_text = line.split(';').next().unwrap_or("").trim();
        let size = usize::from_str_radix(size_text, 16).map_err(|_| ParseError {
            kind: ParseErrorKind::InvalidChunkSize,
            offset: cursor,
        })?;
        cursor = line_end + CRLF.len();

        if size == 0 {
            if buffer.len() < cursor + CRLF.len() {
                return Ok(None);
            }
            cursor += CRLF.len();
            return Ok(Some((body, cursor - body_start)));
        }

        if body.len() + size > limits.max_body_bytes {
            return Err(ParseError {
                kind: ParseErrorKind::BodyTooLarge,
                offset: cursor,
            });
        }
        if buffer.len() < cursor + size + CRLF.len() {
            return Ok(None);
        }
        body.extend_from_slice(&buffer[cursor..cursor + size]);
        cursor += size;
        if &buffer[cursor..cursor + CRLF.len()] != CRLF {
            return Err(ParseError {
                kind: ParseErrorKind::InvalidChunkTerminator,
                offset: cursor,
            });
        }
        cursor += CRLF.len();
    }
}

#[cfg(test)]
mod tests {
    use super::{ParseStatus, RequestParser, ResponseParser};
    use crate::http1::{Limits, ParseErrorKind};

    #[test]
    fn parses_connect_request() {
        let mut parser = RequestParser::new();
        let status = parser.push(b"CONNECT issues.example.com:443 HTTP/1.1\r\nHost: issues.example.com:443\r\n\r\n");

        match status {
            ParseStatus::Complete { message } => {
                assert_eq!(message.line.method, "CONNECT");
                assert_eq!(message.line.target, "issues.example.com:443");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn parses_request_across_buffers() {
        let mut parser = RequestParser::new();
        let status = parser.push(b"GET /rest/gadgets/feed HTTP/1.1\r\nHost:");
        assert!(matches!(status, ParseStatus::NeedMore));

        let status = parser.push(b" example.com\r\nUser-Agent: test\r\n\r\n");
        match status {
            ParseStatus::Complete { message } => {
                assert_eq!(message.line.target, "/rest/gadgets/feed");
                assert_eq!(message.headers.len(), 2);
                assert_eq!(message.header("host"), Some("example.com"));
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn parses_content_length_body() {
        let mut parser = RequestParser::new();
        let status = parser.push(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello");

        match status {
            ParseStatus::Complete { message } => assert_eq!(message.body, b"hello"),
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn parses_chunked_response() {
        let mut parser = ResponseParser::new();
        let status =
            parser.push(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n");

        match status {
            ParseStatus::Complete { message } => {
                assert_eq!(message.line.status_code, 200);
                assert_eq!(message.body, b"hello");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn close_delimited_response_completes_on_finish() {
        let mut parser = ResponseParser::new();
        let status = parser.push(b"HTTP/1.1 200 OK\r\n\r\npartial body");
        assert!(matches!(status, ParseStatus::NeedMore));

        let status = parser.push(b" and the rest");
        assert!(matches!(status, ParseStatus::NeedMore));

        let message = parser.finish().expect("close-delimited response");
        assert_eq!(message.body, b"partial body and the rest");
    }

    #[test]
    fn no_content_response_needs_no_body() {
        let mut parser = ResponseParser::new();
        let status = parser.push(b"HTTP/1.1 204 No Content\r\n\r\n");
        assert!(matches!(status, ParseStatus::Complete { .. }));
    }

    #[test]
    fn rejects_oversized_headers() {
        let mut parser = RequestParser::with_limits(Limits {
            max_header_bytes: 10,
            max_body_bytes: 1024,
        });
        let status = parser.push(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n");

        match status {
            ParseStatus::Error { error } => {
                assert_eq!(error.kind, ParseErrorKind::HeaderTooLarge);
            }
            other => panic!("unexpected status {other:?}"),
        }
    }

    #[test]
    fn parses_absolute_form_target() {
        let mut parser = RequestParser::new();
        let status = parser.push(b"GET http://example.com/path HTTP/1.1\r\nHost: example.com\r\n\r\n");

        match status {
            ParseStatus::Complete { message } => {
                assert_eq!(message.line.target, "http://example.com/path");
            }
            other => panic!("unexpected status {other:?}"),
        }
    }
}
