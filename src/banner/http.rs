//! The HTTP probe stream and its editable request template.
//!
//! The hello is an ordinary HTTP request kept as raw bytes. Configuration
//! can swap out the request line piecewise (method, URL, version), replace
//! or add header fields, and substitute the body. Editing happens before
//! the scan starts; the built request is then frozen for the lifetime of
//! the process.
use super::{AppProto, BannerOutput, NetSend, ProtocolStream, StreamState};

/// What to do with a header field edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldAction {
    /// Replace the field value, appending the field if absent.
    Replace,
    /// Append another instance of the field.
    Add,
    /// Delete the field.
    Remove,
}

/// Which part of the request line (or body) to substitute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPart {
    Method,
    Url,
    Version,
    Payload,
}

const DEFAULT_HELLO: &[u8] = b"GET / HTTP/1.0\r\n\
User-Agent: scanstack/0.1\r\n\
Accept: */*\r\n\
\r\n";

/// The HTTP banner probe.
pub struct HttpStream {
    hello: &'static [u8],
}

impl HttpStream {
    pub fn new() -> HttpStream {
        HttpStream { hello: DEFAULT_HELLO }
    }

    /// Edit a header field of the request template.
    ///
    /// `name` may be given with or without the trailing colon and is matched
    /// case-insensitively.
    pub fn set_field(&mut self, name: &str, value: &[u8], action: FieldAction) {
        let (mut head, body) = split_message(self.hello);
        let name = name.trim_end_matches(':');

        match action {
            FieldAction::Replace => {
                let mut replaced = false;
                for line in &mut head {
                    if field_matches(line, name) {
                        *line = field_line(name, value);
                        replaced = true;
                        break;
                    }
                }
                if !replaced {
                    head.push(field_line(name, value));
                }
            }
            FieldAction::Add => head.push(field_line(name, value)),
            FieldAction::Remove => head.retain(|line| !field_matches(line, name)),
        }

        self.install(&head, body);
    }

    /// Substitute one part of the request line, or the message body.
    pub fn set_request_part(&mut self, part: RequestPart, value: &[u8]) {
        let (mut head, body) = split_message(self.hello);
        if part == RequestPart::Payload {
            self.install(&head, value);
            return;
        }

        let request = head.first().cloned().unwrap_or_default();
        let mut tokens: Vec<&[u8]> = request.splitn(3, |&b| b == b' ').collect();
        while tokens.len() < 3 {
            tokens.push(&[]);
        }
        let index = match part {
            RequestPart::Method => 0,
            RequestPart::Url => 1,
            RequestPart::Version => 2,
            RequestPart::Payload => unreachable!(),
        };
        tokens[index] = value;
        let line = tokens.join(&b' ');
        if head.is_empty() {
            head.push(line);
        } else {
            head[0] = line;
        }

        self.install(&head, body);
    }

    /// The frozen request bytes.
    pub fn request(&self) -> &'static [u8] {
        self.hello
    }

    fn install(&mut self, head: &[Vec<u8>], body: &[u8]) {
        let mut message = Vec::new();
        for line in head {
            message.extend_from_slice(line);
            message.extend_from_slice(b"\r\n");
        }
        message.extend_from_slice(b"\r\n");
        message.extend_from_slice(body);
        self.hello = Box::leak(message.into_boxed_slice());
    }
}

impl Default for HttpStream {
    fn default() -> HttpStream {
        HttpStream::new()
    }
}

impl ProtocolStream for HttpStream {
    fn name(&self) -> &'static str {
        "http"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Http
    }

    fn hello(&self) -> &'static [u8] {
        self.hello
    }

    fn parse(
        &self,
        state: &mut StreamState,
        payload: &[u8],
        banout: &mut BannerOutput,
        _net: &mut dyn NetSend,
    ) {
        state.app_proto = AppProto::Http;
        banout.append(AppProto::Http, payload);
    }
}

/// Split a request into header lines and body.
fn split_message(message: &[u8]) -> (Vec<Vec<u8>>, &[u8]) {
    let (head, body) = match find(message, b"\r\n\r\n") {
        Some(at) => (&message[..at], &message[at + 4..]),
        None => (message, &[][..]),
    };
    let lines = head
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line).to_vec())
        .filter(|line| !line.is_empty())
        .collect();
    (lines, body)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

fn field_matches(line: &[u8], name: &str) -> bool {
    let colon = match line.iter().position(|&b| b == b':') {
        Some(at) => at,
        None => return false,
    };
    line[..colon].eq_ignore_ascii_case(name.as_bytes())
}

fn field_line(name: &str, value: &[u8]) -> Vec<u8> {
    let mut line = Vec::with_capacity(name.len() + 2 + value.len());
    line.extend_from_slice(name.as_bytes());
    line.extend_from_slice(b": ");
    line.extend_from_slice(value);
    line
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn replace_user_agent() {
        let mut stream = HttpStream::new();
        stream.set_field("User-Agent", b"probe/1.0", FieldAction::Replace);
        let text = stream.request();
        assert!(find(text, b"User-Agent: probe/1.0\r\n").is_some());
        assert!(find(text, b"scanstack").is_none());
    }

    #[test]
    fn add_and_remove_host() {
        let mut stream = HttpStream::new();
        stream.set_field("Host:", b"example.com", FieldAction::Replace);
        assert!(find(stream.request(), b"Host: example.com\r\n").is_some());

        stream.set_field("host", b"", FieldAction::Remove);
        assert!(find(stream.request(), b"Host:").is_none());
    }

    #[test]
    fn rewrite_request_line() {
        let mut stream = HttpStream::new();
        stream.set_request_part(RequestPart::Method, b"HEAD");
        stream.set_request_part(RequestPart::Url, b"/robots.txt");
        stream.set_request_part(RequestPart::Version, b"HTTP/1.1");
        assert!(stream.request().starts_with(b"HEAD /robots.txt HTTP/1.1\r\n"));
    }

    #[test]
    fn payload_keeps_headers() {
        let mut stream = HttpStream::new();
        stream.set_request_part(RequestPart::Payload, b"a=1");
        let text = stream.request();
        assert!(text.ends_with(b"\r\n\r\na=1"));
        assert!(find(text, b"Accept: */*").is_some());
    }
}
