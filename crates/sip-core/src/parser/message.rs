//! # SIP message parser
//!
//! [`Parser`] turns raw bytes into [`Message`]s in one of two modes:
//!
//! - **datagram** (UDP): every [`Parser::write`] carries exactly one message.
//!   The body is whatever follows the blank line that ends the headers.
//! - **streamed** (TCP, TLS, WebSocket): writes are arbitrary chunks of a
//!   byte stream. Messages may be split across writes or packed into one,
//!   and `Content-Length` is the only way to find where a body ends.
//!
//! Results are queued in input order and drained with
//! [`Parser::next_message`]. A bad message never poisons the parser: a bad
//! start line is reported and skipped, and in streamed mode the parser
//! resynchronises on the next line that looks like a start line.
//!
//! ```rust
//! use sipflow_sip_core::parser::Parser;
//!
//! let mut parser = Parser::new(true);
//! parser.write(b"OPTIONS sip:carol@chicago.com SIP/2.0\r\nCall-ID: abc\r\n").unwrap();
//! assert!(parser.next_message().is_none());
//!
//! parser.write(b"Content-Length: 0\r\n\r\n").unwrap();
//! let message = parser.next_message().unwrap().unwrap();
//! assert_eq!(message.call_id(), Some("abc"));
//! ```

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::parser::headers::HeaderParsers;
use crate::parser::start_line::{is_request_line, is_status_line, parse_request_line, parse_status_line};
use crate::types::header::Header;
use crate::types::message::{Message, Request, Response, TransportInfo};
use crate::types::headers::Headers;

/// Maximum length of a single start or header line
pub const MAX_LINE_LENGTH: usize = 8192;
/// Maximum size of a SIP message body
pub const MAX_BODY_SIZE: usize = 16 * 1024 * 1024; // 16 MB

enum Line {
    Complete(String),
    Partial,
    Overflow,
}

enum ParseState {
    StartLine,
    Headers {
        message: Message,
        pending: Option<String>,
    },
    Body {
        message: Message,
        length: usize,
    },
}

/// Incremental SIP parser for one connection.
pub struct Parser {
    streamed: bool,
    header_parsers: Arc<HeaderParsers>,
    buffer: BytesMut,
    state: ParseState,
    skip_streamed_err: bool,
    stopped: bool,
    output: VecDeque<Result<Message>>,
}

impl Parser {
    /// Creates a parser with the default header table.
    pub fn new(streamed: bool) -> Self {
        Self::with_header_parsers(streamed, Arc::new(HeaderParsers::default()))
    }

    pub fn with_header_parsers(streamed: bool, header_parsers: Arc<HeaderParsers>) -> Self {
        Parser {
            streamed,
            header_parsers,
            buffer: BytesMut::new(),
            state: ParseState::StartLine,
            skip_streamed_err: false,
            stopped: false,
            output: VecDeque::new(),
        }
    }

    pub fn is_streamed(&self) -> bool {
        self.streamed
    }

    /// Feeds bytes into the parser.
    ///
    /// In datagram mode the data must hold a complete header section,
    /// otherwise [`Error::InvalidMessageFormat`] is returned and nothing is queued.
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.stopped {
            return Err(Error::ParserStopped);
        }

        if self.streamed {
            self.buffer.extend_from_slice(data);
            self.process_stream();
        } else {
            let head_end = find_header_end(data).ok_or_else(|| {
                Error::InvalidMessageFormat(
                    "message has no blank line terminating its headers".to_string(),
                )
            })?;
            let result = self.parse_datagram(data, head_end);
            self.output.push_back(result);
        }

        Ok(data.len())
    }

    /// Next parsed message or parse error, in input order.
    pub fn next_message(&mut self) -> Option<Result<Message>> {
        self.output.pop_front()
    }

    /// Number of queued results.
    pub fn pending(&self) -> usize {
        self.output.len()
    }

    /// Rejects further writes and drops buffered input.
    pub fn stop(&mut self) {
        self.stopped = true;
        self.buffer.clear();
        self.state = ParseState::StartLine;
    }

    /// Returns the parser to its initial state.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.state = ParseState::StartLine;
        self.skip_streamed_err = false;
        self.stopped = false;
        self.output.clear();
    }

    fn process_stream(&mut self) {
        loop {
            match std::mem::replace(&mut self.state, ParseState::StartLine) {
                ParseState::StartLine => {
                    let Line::Complete(line) = self.take_line() else {
                        return;
                    };
                    // CRLF keep-alives between messages
                    if line.is_empty() {
                        continue;
                    }
                    match parse_start_line(&line) {
                        Ok(message) => {
                            self.skip_streamed_err = false;
                            self.state = ParseState::Headers {
                                message,
                                pending: None,
                            };
                        }
                        Err(err) => {
                            if self.skip_streamed_err {
                                trace!("skipping line while resynchronising: {}", line);
                            } else {
                                self.skip_streamed_err = true;
                                self.output.push_back(Err(err));
                            }
                        }
                    }
                }
                ParseState::Headers {
                    mut message,
                    mut pending,
                } => {
                    let line = match self.take_line() {
                        Line::Complete(line) => line,
                        Line::Partial => {
                            self.state = ParseState::Headers { message, pending };
                            return;
                        }
                        Line::Overflow => return,
                    };

                    if line.starts_with([' ', '\t']) {
                        if let Some(pending) = pending.as_mut() {
                            pending.push(' ');
                            pending.push_str(line.trim_start());
                        }
                        self.state = ParseState::Headers { message, pending };
                        continue;
                    }

                    if let Some(header) = pending.take() {
                        self.apply_header(&mut message, &header);
                    }

                    if line.is_empty() {
                        self.finish_stream_headers(message);
                    } else {
                        self.state = ParseState::Headers {
                            message,
                            pending: Some(line),
                        };
                    }
                }
                ParseState::Body { message, length } => {
                    if self.buffer.len() < length {
                        self.state = ParseState::Body { message, length };
                        return;
                    }
                    let body = self.buffer.split_to(length).freeze();
                    self.emit(message, body);
                }
            }
        }
    }

    fn finish_stream_headers(&mut self, message: Message) {
        let lengths: Vec<u32> = message
            .headers()
            .get("content-length")
            .iter()
            .filter_map(|h| match h {
                Header::ContentLength(n) => Some(*n),
                Header::Generic { value, .. } => value.trim().parse().ok(),
                _ => None,
            })
            .collect();

        let reason = match lengths.as_slice() {
            [length] if (*length as usize) <= MAX_BODY_SIZE => {
                self.state = ParseState::Body {
                    message,
                    length: *length as usize,
                };
                return;
            }
            [length] => format!("'Content-Length' {} exceeds maximum body size", length),
            [] => "missing required 'Content-Length' header".to_string(),
            _ => "multiple 'Content-Length' headers".to_string(),
        };

        self.output
            .push_back(Err(Error::malformed(reason, message.to_string())));
        self.skip_streamed_err = true;
        self.state = ParseState::StartLine;
    }

    fn take_line(&mut self) -> Line {
        if let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let raw = self.buffer.split_to(pos + 1);
            let mut line = &raw[..pos];
            if let Some(stripped) = line.strip_suffix(b"\r") {
                line = stripped;
            }
            return Line::Complete(String::from_utf8_lossy(line).into_owned());
        }

        if self.buffer.len() <= MAX_LINE_LENGTH {
            return Line::Partial;
        }

        let dropped = self.buffer.split().freeze();
        warn!("dropping {} bytes without line terminator", dropped.len());
        if !self.skip_streamed_err {
            self.output.push_back(Err(Error::malformed(
                "line exceeds maximum length",
                String::from_utf8_lossy(&dropped[..MAX_LINE_LENGTH]).into_owned(),
            )));
        }
        self.skip_streamed_err = true;
        self.state = ParseState::StartLine;
        Line::Overflow
    }

    fn parse_datagram(&self, data: &[u8], head_end: (usize, usize)) -> Result<Message> {
        let (head_len, marker_len) = head_end;
        let head = String::from_utf8_lossy(&data[..head_len]);
        let mut body = &data[head_len + marker_len..];

        let mut lines = head
            .split('\n')
            .map(|l| l.strip_suffix('\r').unwrap_or(l))
            .skip_while(|l| l.is_empty());

        let start_line = lines.next().unwrap_or_default();
        let mut message = parse_start_line(start_line)?;

        let mut pending: Option<String> = None;
        for line in lines {
            if line.starts_with([' ', '\t']) {
                if let Some(pending) = pending.as_mut() {
                    pending.push(' ');
                    pending.push_str(line.trim_start());
                }
                continue;
            }
            if let Some(header) = pending.take() {
                self.apply_header(&mut message, &header);
            }
            pending = Some(line.to_string());
        }
        if let Some(header) = pending.take() {
            self.apply_header(&mut message, &header);
        }

        if let Some(length) = message.headers().content_length() {
            let length = length as usize;
            if length > body.len() {
                return Err(Error::broken("incomplete message body", message.to_string()));
            }
            body = &body[..length];
        }

        set_body(&mut message, Bytes::copy_from_slice(body));
        Ok(message)
    }

    fn apply_header(&self, message: &mut Message, line: &str) {
        match self.header_parsers.parse_line(line) {
            Ok(headers) => {
                for header in headers {
                    let single = matches!(header, Header::To(_) | Header::From(_));
                    if single && message.headers().contains(header.name()) {
                        warn!("skip repeated '{}' header in message {}", header.name(), message.short());
                        continue;
                    }
                    message.headers_mut().append(header);
                }
            }
            Err(err) => {
                warn!("skip header '{}' due to error: {}", line, err);
            }
        }
    }

    fn emit(&mut self, mut message: Message, body: Bytes) {
        set_body(&mut message, body);
        self.output.push_back(Ok(message));
    }
}

/// Whitespace-only bodies are discarded.
fn set_body(message: &mut Message, body: Bytes) {
    if body.iter().any(|b| !b.is_ascii_whitespace()) {
        message.set_body(body, false);
    }
}

/// Returns the header section length and the blank-line marker length.
fn find_header_end(data: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    data.windows(2).position(|w| w == b"\n\n").map(|pos| (pos, 2))
}

fn parse_start_line(line: &str) -> Result<Message> {
    if is_request_line(line) {
        let (method, recipient, sip_version) = parse_request_line(line)?;
        Ok(Message::Request(Request {
            method,
            recipient,
            sip_version,
            headers: Headers::new(),
            body: Bytes::new(),
            transport_info: TransportInfo::default(),
        }))
    } else if is_status_line(line) {
        let (sip_version, status_code, reason) = parse_status_line(line)?;
        Ok(Message::Response(Response {
            sip_version,
            status_code,
            reason,
            headers: Headers::new(),
            body: Bytes::new(),
            transport_info: TransportInfo::default(),
        }))
    } else {
        Err(Error::InvalidStartLine(format!(
            "transmission beginning '{}' is not a SIP message",
            line
        )))
    }
}

/// Parses a single complete message, as received in one datagram.
pub fn parse_message(data: &[u8]) -> Result<Message> {
    let mut parser = Parser::new(false);
    parser.write(data)?;
    parser
        .next_message()
        .unwrap_or_else(|| Err(Error::InvalidMessageFormat("no message parsed".to_string())))
}
