//! TLS client hello templates and record reassembly scratch.
//!
//! The probe does not negotiate anything; it fires a fixed ClientHello and
//! records whatever the server answers. Several hello variants exist for
//! vulnerability probing: one negotiating the heartbeat extension, one with
//! a primed session ticket, and an SSLv3 hello for downgrade testing. The
//! variants are built once during configuration and frozen.
use byteorder::{ByteOrder, NetworkEndian};

use super::{AppProto, BannerOutput, NetSend, ProtocolStream, Scratch, StreamId, StreamState};

/// Which ClientHello flavor to build.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HelloTemplate {
    /// Plain TLS 1.2 hello.
    Tls12,
    /// TLS 1.2 hello negotiating the heartbeat extension.
    Heartbeat,
    /// TLS 1.2 hello with a non-empty session id and a primed session
    /// ticket extension.
    Ticketbleed,
    /// SSL 3.0 hello without extensions.
    Sslv3,
}

const CIPHERS: [u16; 8] = [
    0xc02b, 0xc02f, 0x009e, 0x0033, 0x0039, 0x002f, 0x0035, 0x000a,
];

const CONTENT_HANDSHAKE: u8 = 22;
const HANDSHAKE_CLIENT_HELLO: u8 = 1;

/// Build one of the canned ClientHello variants.
pub fn client_hello(template: HelloTemplate) -> Vec<u8> {
    let version: u16 = match template {
        HelloTemplate::Sslv3 => 0x0300,
        _ => 0x0303,
    };

    let mut body = Vec::new();
    NetworkEndian::write_u16(extend(&mut body, 2), version);
    // A fixed "random"; the probe carries no secrets worth protecting and
    // identical probes compress well in captures.
    body.extend_from_slice(&[0x5c; 32]);
    match template {
        HelloTemplate::Ticketbleed => {
            body.push(32);
            body.extend_from_slice(&[0x51; 32]);
        }
        _ => body.push(0),
    }
    NetworkEndian::write_u16(extend(&mut body, 2), (CIPHERS.len() * 2) as u16);
    for cipher in CIPHERS {
        NetworkEndian::write_u16(extend(&mut body, 2), cipher);
    }
    // Null compression only.
    body.push(1);
    body.push(0);

    let extensions = build_extensions(template);
    if !extensions.is_empty() {
        NetworkEndian::write_u16(extend(&mut body, 2), extensions.len() as u16);
        body.extend_from_slice(&extensions);
    }

    let mut hello = Vec::with_capacity(body.len() + 9);
    hello.push(CONTENT_HANDSHAKE);
    NetworkEndian::write_u16(extend(&mut hello, 2), version);
    NetworkEndian::write_u16(extend(&mut hello, 2), (body.len() + 4) as u16);
    hello.push(HANDSHAKE_CLIENT_HELLO);
    let len24 = body.len() as u32;
    hello.push((len24 >> 16) as u8);
    hello.push((len24 >> 8) as u8);
    hello.push(len24 as u8);
    hello.extend_from_slice(&body);
    hello
}

fn build_extensions(template: HelloTemplate) -> Vec<u8> {
    let mut extensions = Vec::new();
    match template {
        HelloTemplate::Sslv3 => {}
        HelloTemplate::Tls12 => {}
        HelloTemplate::Heartbeat => {
            // heartbeat(15): peer_allowed_to_send
            push_extension(&mut extensions, 0x000f, &[0x01]);
        }
        HelloTemplate::Ticketbleed => {
            push_extension(&mut extensions, 0x0023, &[0xa5; 16]);
        }
    }
    extensions
}

fn push_extension(out: &mut Vec<u8>, kind: u16, data: &[u8]) {
    NetworkEndian::write_u16(extend(out, 2), kind);
    NetworkEndian::write_u16(extend(out, 2), data.len() as u16);
    out.extend_from_slice(data);
}

fn extend(vec: &mut Vec<u8>, by: usize) -> &mut [u8] {
    let at = vec.len();
    vec.resize(at + by, 0);
    &mut vec[at..]
}

/// Append a cipher suite to a built hello, patching the three length fields
/// that cover it (record, handshake, and cipher list).
pub fn add_cipherspec(hello: Vec<u8>, cipher: u16) -> Vec<u8> {
    let mut hello = hello;
    // record(5) + handshake(4) + version(2) + random(32)
    let sid_at = 5 + 4 + 2 + 32;
    let sid_len = usize::from(hello[sid_at]);
    let ciphers_at = sid_at + 1 + sid_len;
    let cipher_list_len = usize::from(NetworkEndian::read_u16(&hello[ciphers_at..]));
    let insert_at = ciphers_at + 2 + cipher_list_len;

    let mut suite = [0u8; 2];
    NetworkEndian::write_u16(&mut suite, cipher);
    hello.splice(insert_at..insert_at, suite);

    let record_len = NetworkEndian::read_u16(&hello[3..5]) + 2;
    NetworkEndian::write_u16(&mut hello[3..5], record_len);
    let handshake_len =
        u32::from(hello[6]) << 16 | u32::from(hello[7]) << 8 | u32::from(hello[8]);
    let handshake_len = handshake_len + 2;
    hello[6] = (handshake_len >> 16) as u8;
    hello[7] = (handshake_len >> 8) as u8;
    hello[8] = handshake_len as u8;
    NetworkEndian::write_u16(&mut hello[ciphers_at..ciphers_at + 2], (cipher_list_len + 2) as u16);
    hello
}

/// Reassembly scratch for the TLS record layer.
///
/// Server responses arrive as TCP payload cut at arbitrary points; records
/// are only surfaced to the banner once complete.
#[derive(Debug, Default)]
pub struct TlsFragments {
    pending: Vec<u8>,
}

impl TlsFragments {
    /// Feed payload bytes; complete records are passed to `sink`.
    pub fn feed(&mut self, payload: &[u8], mut sink: impl FnMut(u8, &[u8])) {
        self.pending.extend_from_slice(payload);
        loop {
            if self.pending.len() < 5 {
                return;
            }
            let length = usize::from(NetworkEndian::read_u16(&self.pending[3..5]));
            if self.pending.len() < 5 + length {
                return;
            }
            let record: Vec<u8> = self.pending.drain(..5 + length).collect();
            sink(record[0], &record[5..]);
        }
    }
}

/// The alternate-variant TLS probe, reached over a follow-up connection.
#[derive(Debug)]
pub struct TlsAltStream {
    hello: &'static [u8],
}

/// The TLS banner probe.
pub struct TlsStream {
    hello: &'static [u8],
    alt: Option<TlsAltStream>,
}

impl TlsStream {
    pub fn new() -> TlsStream {
        TlsStream {
            hello: Box::leak(client_hello(HelloTemplate::Tls12).into_boxed_slice()),
            alt: None,
        }
    }

    /// Replace the hello, as the vulnerability probes do.
    pub fn set_hello(&mut self, hello: Vec<u8>) {
        self.hello = Box::leak(hello.into_boxed_slice());
    }

    /// Configure an alternate hello probed over a second connection to the
    /// same target.
    pub fn set_alt_hello(&mut self, hello: Vec<u8>) {
        self.alt = Some(TlsAltStream {
            hello: Box::leak(hello.into_boxed_slice()),
        });
    }

    pub fn alt(&self) -> Option<&TlsAltStream> {
        self.alt.as_ref()
    }
}

impl Default for TlsStream {
    fn default() -> TlsStream {
        TlsStream::new()
    }
}

fn parse_tls(state: &mut StreamState, payload: &[u8], banout: &mut BannerOutput) {
    state.app_proto = AppProto::Tls;
    if !matches!(state.scratch, Scratch::Tls(_)) {
        state.scratch = Scratch::Tls(TlsFragments::default());
    }
    if let Scratch::Tls(fragments) = &mut state.scratch {
        fragments.feed(payload, |_content_type, record| {
            banout.append(AppProto::Tls, record);
        });
    }
}

impl ProtocolStream for TlsStream {
    fn name(&self) -> &'static str {
        "ssl"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Tls
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
        parse_tls(state, payload, banout);
    }

    fn next(&self) -> Option<StreamId> {
        self.alt.as_ref().map(|_| StreamId::TlsAlt)
    }

    fn is_tls(&self) -> bool {
        true
    }
}

impl ProtocolStream for TlsAltStream {
    fn name(&self) -> &'static str {
        "ssl-alt"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Tls
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
        parse_tls(state, payload, banout);
    }

    fn is_tls(&self) -> bool {
        true
    }
}
