//! STOMP 1.2 wire framing: parsing a byte stream into `Frame`s and
//! serializing `Frame`s back to bytes.
//!
//! Generalizes the teacher crate's `communication::message` module (a
//! fixed-size binary `Header` read in one shot via `read_exact`) into a
//! streaming, variable-length text frame parser fed by partial reads.

use std::collections::VecDeque;

use crate::error::ProtocolError;

/// Default maximum size, in bytes, of the command line plus header
/// section of a frame.
pub const DEFAULT_MAX_HEADER_BYTES: usize = 65_536;
/// Default maximum size, in bytes, of a frame body.
pub const DEFAULT_MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const NUL: u8 = 0;
const LF: u8 = b'\n';
const CR: u8 = b'\r';

/// The eight STOMP 1.2 commands this relay speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Connect,
    Connected,
    Send,
    Message,
    Receipt,
    Error,
    Disconnect,
}

impl Command {
    fn parse(s: &str) -> Option<Command> {
        Some(match s {
            "CONNECT" => Command::Connect,
            "CONNECTED" => Command::Connected,
            "SEND" => Command::Send,
            "MESSAGE" => Command::Message,
            "RECEIPT" => Command::Receipt,
            "ERROR" => Command::Error,
            "DISCONNECT" => Command::Disconnect,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Command::Connect => "CONNECT",
            Command::Connected => "CONNECTED",
            Command::Send => "SEND",
            Command::Message => "MESSAGE",
            Command::Receipt => "RECEIPT",
            Command::Error => "ERROR",
            Command::Disconnect => "DISCONNECT",
        }
    }
}

/// A decoded unit of the byte stream: either a real STOMP frame, or a
/// bare heartbeat newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Command {
        command: Command,
        headers: Vec<(String, String)>,
        body: Vec<u8>,
    },
    Heartbeat,
}

impl Frame {
    pub fn new(command: Command, headers: Vec<(String, String)>, body: Vec<u8>) -> Frame {
        Frame::Command { command, headers, body }
    }

    /// The first occurrence of header `name`, per STOMP's
    /// first-occurrence-wins duplicate rule.
    pub fn header(&self, name: &str) -> Option<&str> {
        match self {
            Frame::Command { headers, .. } => headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str()),
            Frame::Heartbeat => None,
        }
    }

    pub fn command(&self) -> Option<Command> {
        match self {
            Frame::Command { command, .. } => Some(*command),
            Frame::Heartbeat => None,
        }
    }

    /// Serialize this frame into its wire form. `content-length` is
    /// added automatically whenever the body is non-empty.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Frame::Heartbeat => vec![LF],
            Frame::Command { command, headers, body } => {
                let mut out = Vec::with_capacity(64 + body.len());
                out.extend_from_slice(command.as_str().as_bytes());
                out.push(LF);
                for (name, value) in headers {
                    out.extend_from_slice(escape(name).as_bytes());
                    out.push(b':');
                    out.extend_from_slice(escape(value).as_bytes());
                    out.push(LF);
                }
                if !body.is_empty() {
                    out.extend_from_slice(format!("content-length:{}", body.len()).as_bytes());
                    out.push(LF);
                }
                out.push(LF);
                out.extend_from_slice(body);
                out.push(NUL);
                out
            }
        }
    }
}

fn escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\r' => out.push_str("\\r"),
            '\n' => out.push_str("\\n"),
            ':' => out.push_str("\\c"),
            _ => out.push(c),
        }
    }
    out
}

fn unescape(s: &str) -> Result<String, ProtocolError> {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('r') => out.push('\r'),
            Some('n') => out.push('\n'),
            Some('c') => out.push(':'),
            Some('\\') => out.push('\\'),
            _ => {
                return Err(ProtocolError::BadEscape { header: s.to_owned() });
            }
        }
    }
    Ok(out)
}

/// A streaming STOMP frame parser. Feed it bytes as they arrive off the
/// socket; pull decoded frames out one at a time with `poll_frame`.
pub struct FrameCodec {
    buf: Vec<u8>,
    max_header_bytes: usize,
    max_body_bytes: usize,
}

impl Default for FrameCodec {
    fn default() -> Self {
        FrameCodec::new(DEFAULT_MAX_HEADER_BYTES, DEFAULT_MAX_BODY_BYTES)
    }
}

impl FrameCodec {
    pub fn new(max_header_bytes: usize, max_body_bytes: usize) -> Self {
        FrameCodec { buf: Vec::new(), max_header_bytes, max_body_bytes }
    }

    /// Append freshly-read bytes to the internal buffer.
    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Decode as many frames as are currently available, stopping at
    /// the first incomplete frame (left buffered for the next `feed`).
    pub fn drain_frames(&mut self) -> Result<VecDeque<Frame>, ProtocolError> {
        let mut out = VecDeque::new();
        while let Some(frame) = self.poll_frame()? {
            out.push_back(frame);
        }
        Ok(out)
    }

    /// Try to decode a single frame from the buffer. Returns `Ok(None)`
    /// when more bytes are needed.
    pub fn poll_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        // Resynchronization: leading NULs are stray frame terminators;
        // skip them before looking for the next command/heartbeat.
        let mut skip = 0;
        while self.buf.get(skip) == Some(&NUL) {
            skip += 1;
        }
        if skip > 0 {
            self.buf.drain(..skip);
        }

        if self.buf.is_empty() {
            return Ok(None);
        }

        // A bare `\n` or `\r\n` standing where a command line would
        // start is a heartbeat.
        if self.buf[0] == LF {
            self.buf.drain(..1);
            return Ok(Some(Frame::Heartbeat));
        }
        if self.buf[0] == CR {
            if self.buf.len() < 2 {
                return Ok(None);
            }
            if self.buf[1] == LF {
                self.buf.drain(..2);
                return Ok(Some(Frame::Heartbeat));
            }
            return Err(ProtocolError::UnknownCommand("\\r".to_owned()));
        }

        let header_limit = self.max_header_bytes;

        // Command line.
        let cmd_end = match find_byte(&self.buf, LF, header_limit) {
            FindResult::Found(i) => i,
            FindResult::NotFound => return Ok(None),
            FindResult::ExceededLimit => {
                return Err(ProtocolError::HeaderTooLarge { limit: header_limit });
            }
        };
        let cmd_line = strip_cr(&self.buf[..cmd_end]);
        let cmd_str = std::str::from_utf8(cmd_line)
            .map_err(|_| ProtocolError::UnknownCommand("<invalid utf8>".to_owned()))?;
        let command = Command::parse(cmd_str)
            .ok_or_else(|| ProtocolError::UnknownCommand(cmd_str.to_owned()))?;

        // Header lines, up to the blank line.
        let mut pos = cmd_end + 1;
        let mut headers: Vec<(String, String)> = Vec::new();
        loop {
            if pos > header_limit {
                return Err(ProtocolError::HeaderTooLarge { limit: header_limit });
            }
            let line_end = match find_byte(&self.buf[pos..], LF, header_limit - pos) {
                FindResult::Found(i) => pos + i,
                FindResult::NotFound => return Ok(None),
                FindResult::ExceededLimit => {
                    return Err(ProtocolError::HeaderTooLarge { limit: header_limit });
                }
            };
            let line = strip_cr(&self.buf[pos..line_end]);
            if line.is_empty() {
                pos = line_end + 1;
                break;
            }
            let line_str = std::str::from_utf8(line)
                .map_err(|_| ProtocolError::BadEscape { header: "<invalid utf8>".to_owned() })?;
            let colon = line_str
                .find(':')
                .ok_or_else(|| ProtocolError::BadEscape { header: line_str.to_owned() })?;
            let name = unescape(&line_str[..colon])?;
            let value = unescape(&line_str[colon + 1..])?;
            headers.push((name, value));
            pos = line_end + 1;
        }

        // Body.
        let content_length = headers
            .iter()
            .find(|(n, _)| n == "content-length")
            .map(|(_, v)| v.as_str());

        let (body_end, terminator_at) = if let Some(len_str) = content_length {
            let len: usize = len_str
                .parse()
                .map_err(|_| ProtocolError::BadContentLength(len_str.to_owned()))?;
            if len > self.max_body_bytes {
                return Err(ProtocolError::BodyTooLarge { limit: self.max_body_bytes });
            }
            let body_end = pos + len;
            if self.buf.len() <= body_end {
                return Ok(None);
            }
            if self.buf[body_end] != NUL {
                return Err(ProtocolError::MissingTerminator);
            }
            (body_end, body_end)
        } else {
            match find_byte(&self.buf[pos..], NUL, self.max_body_bytes) {
                FindResult::Found(i) => (pos + i, pos + i),
                FindResult::NotFound => return Ok(None),
                FindResult::ExceededLimit => {
                    return Err(ProtocolError::BodyTooLarge { limit: self.max_body_bytes });
                }
            }
        };

        let body = self.buf[pos..body_end].to_vec();
        self.buf.drain(..terminator_at + 1);

        Ok(Some(Frame::new(command, headers, body)))
    }
}

fn strip_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&CR) {
        &line[..line.len() - 1]
    } else {
        line
    }
}

enum FindResult {
    Found(usize),
    NotFound,
    ExceededLimit,
}

fn find_byte(haystack: &[u8], needle: u8, limit: usize) -> FindResult {
    let bound = haystack.len().min(limit.saturating_add(1));
    match haystack[..bound].iter().position(|&b| b == needle) {
        Some(i) => FindResult::Found(i),
        None if haystack.len() > limit => FindResult::ExceededLimit,
        None => FindResult::NotFound,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(data: &[u8]) -> Vec<Frame> {
        let mut codec = FrameCodec::default();
        codec.feed(data);
        codec.drain_frames().unwrap().into_iter().collect()
    }

    #[test]
    fn roundtrip_connect_frame() {
        let frame = Frame::new(
            Command::Connect,
            vec![
                ("accept-version".into(), "1.2".into()),
                ("host".into(), "my".into()),
                ("heart-beat".into(), "1000,90".into()),
            ],
            Vec::new(),
        );
        let encoded = frame.encode();
        assert_eq!(
            encoded,
            b"CONNECT\naccept-version:1.2\nhost:my\nheart-beat:1000,90\n\n\x00"
        );
        let decoded = decode_all(&encoded);
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0], frame);
    }

    #[test]
    fn roundtrip_send_with_body() {
        let frame = Frame::new(
            Command::Send,
            vec![
                ("destination".into(), "dest".into()),
                ("content-type".into(), "text/plain".into()),
                ("receipt".into(), "m1".into()),
            ],
            b"1".to_vec(),
        );
        let encoded = frame.encode();
        assert_eq!(
            encoded,
            b"SEND\ndestination:dest\ncontent-type:text/plain\nreceipt:m1\ncontent-length:1\n\n1\x00"
        );
    }

    #[test]
    fn bare_newline_is_heartbeat() {
        let frames = decode_all(b"\n");
        assert_eq!(frames, vec![Frame::Heartbeat]);
    }

    #[test]
    fn leading_nul_and_crlf_are_skipped_between_frames() {
        let mut codec = FrameCodec::default();
        codec.feed(b"\x00\x00RECEIPT\nreceipt-id:m1\n\n\x00");
        let frames = codec.drain_frames().unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].header("receipt-id"), Some("m1"));
    }

    #[test]
    fn partial_frame_yields_none_until_complete() {
        let mut codec = FrameCodec::default();
        codec.feed(b"SEND\ndestination:d\ncontent-length:3\n\n");
        assert!(codec.poll_frame().unwrap().is_none());
        codec.feed(b"ab");
        assert!(codec.poll_frame().unwrap().is_none());
        codec.feed(b"c\x00");
        let frame = codec.poll_frame().unwrap().unwrap();
        match frame {
            Frame::Command { body, .. } => assert_eq!(body, b"abc"),
            _ => panic!("expected a command frame"),
        }
    }

    #[test]
    fn unknown_command_is_protocol_error() {
        let mut codec = FrameCodec::default();
        codec.feed(b"BOGUS\n\n\x00");
        assert!(matches!(codec.poll_frame(), Err(ProtocolError::UnknownCommand(_))));
    }

    #[test]
    fn malformed_escape_is_protocol_error() {
        let mut codec = FrameCodec::default();
        codec.feed(b"SEND\nfoo:bar\\xbaz\n\n\x00");
        assert!(matches!(codec.poll_frame(), Err(ProtocolError::BadEscape { .. })));
    }

    #[test]
    fn missing_terminator_after_content_length() {
        let mut codec = FrameCodec::default();
        codec.feed(b"SEND\ncontent-length:3\n\nabcX");
        assert!(matches!(codec.poll_frame(), Err(ProtocolError::MissingTerminator)));
    }

    #[test]
    fn escape_roundtrip_for_special_chars() {
        let frame = Frame::new(
            Command::Error,
            vec![("message".into(), "a:b\\c\r\nd".into())],
            Vec::new(),
        );
        let encoded = frame.encode();
        let decoded = decode_all(&encoded);
        assert_eq!(decoded[0].header("message"), Some("a:b\\c\r\nd"));
    }

    #[test]
    fn duplicate_headers_first_wins() {
        let mut codec = FrameCodec::default();
        codec.feed(b"RECEIPT\nreceipt-id:first\nreceipt-id:second\n\n\x00");
        let frame = codec.poll_frame().unwrap().unwrap();
        assert_eq!(frame.header("receipt-id"), Some("first"));
    }

    #[test]
    fn oversize_header_section_is_rejected() {
        let mut codec = FrameCodec::new(16, DEFAULT_MAX_BODY_BYTES);
        codec.feed(b"SEND\nreallylongheadernamethatoverflows:1\n\n\x00");
        assert!(matches!(codec.poll_frame(), Err(ProtocolError::HeaderTooLarge { .. })));
    }
}
