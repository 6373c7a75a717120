//! Application-protocol streams and banner collection.
//!
//! The connection engine does not understand HTTP or TLS; it understands
//! *streams*. A [`ProtocolStream`] supplies the hello bytes to probe a
//! service with, consumes whatever payload the service answers, and deposits
//! the evidence it extracted into a per-connection [`BannerOutput`]. The
//! accumulated banners are flushed to a [`Reporter`] when the connection is
//! torn down.
//!
//! The built-in streams implement only as much of their protocols as a
//! banner probe needs; anything deeper belongs to an out-of-crate parser
//! plugged in through the same trait.
//!
//! Stream-to-port bindings and the hello templates themselves live in the
//! process-wide [`BannerRegistry`]. They are mutated during configuration
//! only; once the receive thread runs, the registry is a read-only snapshot.
//! Built templates are deliberately leaked to `&'static [u8]` so connections
//! can queue them as borrowed segments without copies.
use core::fmt;
use std::collections::BTreeMap;

use crate::layer::tcp::SendBuf;
use crate::wire::Address;

pub mod http;
pub mod smb;
pub mod ssl;

pub use self::http::HttpStream;
pub use self::smb::SmbStream;
pub use self::ssl::TlsStream;

/// The application protocol a piece of banner evidence belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AppProto {
    /// Nothing recognized yet. Blocks tagged like this are never reported.
    Unknown,
    /// A raw banner from a user-supplied hello with no protocol attached.
    Banner,
    Http,
    Tls,
    Smb,
    Ssh,
}

impl Default for AppProto {
    fn default() -> AppProto {
        AppProto::Unknown
    }
}

impl fmt::Display for AppProto {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            AppProto::Unknown => "unknown",
            AppProto::Banner => "banner",
            AppProto::Http => "http",
            AppProto::Tls => "ssl",
            AppProto::Smb => "smb",
            AppProto::Ssh => "ssh",
        };
        write!(f, "{}", name)
    }
}

/// One protocol's worth of collected banner bytes.
#[derive(Debug, Default, Clone)]
pub struct BannerBlock {
    pub proto: AppProto,
    pub bytes: Vec<u8>,
}

/// Per-connection accumulator of banner evidence.
///
/// A connection can yield several banners: a web server produces both an
/// HTTP header banner and page content, a TLS endpoint both a protocol
/// banner and certificates. Fragments for the same protocol concatenate.
#[derive(Debug, Default)]
pub struct BannerOutput {
    blocks: Vec<BannerBlock>,
}

impl BannerOutput {
    pub fn new() -> BannerOutput {
        BannerOutput::default()
    }

    /// Append bytes to the block for `proto`, creating it if necessary.
    pub fn append(&mut self, proto: AppProto, bytes: &[u8]) {
        if let Some(block) = self.blocks.iter_mut().find(|block| block.proto == proto) {
            block.bytes.extend_from_slice(bytes);
        } else {
            self.blocks.push(BannerBlock {
                proto,
                bytes: bytes.to_vec(),
            });
        }
    }

    pub fn blocks(&self) -> impl Iterator<Item = &BannerBlock> {
        self.blocks.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.iter().all(|block| block.bytes.is_empty())
    }
}

/// The sink that completed banners are flushed into.
///
/// Implementations must be callable from the receive thread; the usual one
/// serializes into the scan's output file.
pub trait Reporter {
    fn report_banner(
        &self,
        ip_them: Address,
        port_them: u16,
        app_proto: AppProto,
        ttl: u8,
        banner: &[u8],
    );
}

/// Per-connection scratch owned by whichever stream the connection runs.
#[derive(Debug, Default)]
pub enum Scratch {
    #[default]
    None,
    Tls(ssl::TlsFragments),
    Smb(smb::SmbScratch),
}

/// Mutable per-connection parser state, embedded in the connection record.
#[derive(Debug, Default)]
pub struct StreamState {
    /// The remote port the connection probes.
    pub port: u16,

    /// Protocol recognized so far; starts out unknown.
    pub app_proto: AppProto,

    /// Whether the TLS client hello went out on this connection.
    pub is_sent_tls_hello: bool,

    pub scratch: Scratch,
}

/// Handle through which a stream reaches back into its connection.
///
/// Sending queues application data on the connection's segment queue; the
/// engine takes care of segmentation, retransmission, and the state machine
/// consequences.
pub trait NetSend {
    fn send(&mut self, buf: SendBuf<'_>, is_fin: bool);

    /// Whether the connection is already being wound down.
    fn is_closing(&self) -> bool;
}

/// Identifies a stream within the [`BannerRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StreamId {
    Http,
    Tls,
    /// The alternate TLS hello variant, probed over a follow-up connection.
    TlsAlt,
    Smb,
    Ssh,
    /// A user-supplied hello bound to one port.
    Custom(u16),
    /// An externally implemented stream added with
    /// [`BannerRegistry::register_stream`].
    Plugin(u16),
}

/// An application protocol handler.
///
/// Stateless by itself; all per-connection state lives in the
/// [`StreamState`] passed back on every call.
pub trait ProtocolStream {
    fn name(&self) -> &'static str;

    /// The protocol tag banner fragments from this stream carry by default.
    fn app_proto(&self) -> AppProto;

    /// Canned probe bytes, sent verbatim when the service stays silent.
    fn hello(&self) -> &'static [u8] {
        &[]
    }

    /// Craft and send a custom hello instead of the canned bytes.
    ///
    /// Returns false when the stream has no crafting logic, in which case
    /// the engine falls back to [`ProtocolStream::hello`].
    fn transmit_hello(&self, net: &mut dyn NetSend) -> bool {
        let _ = net;
        false
    }

    /// Consume service payload, accumulating evidence into `banout`.
    fn parse(
        &self,
        state: &mut StreamState,
        payload: &[u8],
        banout: &mut BannerOutput,
        net: &mut dyn NetSend,
    );

    /// Tear down protocol scratch when the connection dies.
    fn cleanup(&self, state: &mut StreamState) {
        let _ = state;
    }

    /// A follow-up stream to probe the same target with over a fresh
    /// connection, tried as soon as this connection establishes.
    fn next(&self) -> Option<StreamId> {
        None
    }

    /// Whether this stream speaks TLS, which tags the connection state so
    /// heartbeat probing can tell hello from reply.
    fn is_tls(&self) -> bool {
        false
    }
}

/// A stream waiting for the server to speak first, as SSH servers do.
///
/// It has no hello at all: the receive timeout passes without a transmit and
/// the connection simply keeps listening.
#[derive(Debug, Default)]
pub struct SshStream;

impl ProtocolStream for SshStream {
    fn name(&self) -> &'static str {
        "ssh"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Ssh
    }

    fn parse(
        &self,
        state: &mut StreamState,
        payload: &[u8],
        banout: &mut BannerOutput,
        _net: &mut dyn NetSend,
    ) {
        state.app_proto = AppProto::Ssh;
        banout.append(AppProto::Ssh, payload);
    }
}

/// A user-configured hello probe for one port.
#[derive(Debug)]
pub struct CustomStream {
    hello: &'static [u8],
    next: Option<StreamId>,
}

impl CustomStream {
    pub fn new(hello: &'static [u8]) -> CustomStream {
        CustomStream { hello, next: None }
    }

    /// Chain a follow-up stream probed over a second connection.
    pub fn set_next(&mut self, next: Option<StreamId>) {
        self.next = next;
    }
}

impl ProtocolStream for CustomStream {
    fn name(&self) -> &'static str {
        "(custom)"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Banner
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
        state.app_proto = AppProto::Banner;
        banout.append(AppProto::Banner, payload);
    }

    fn next(&self) -> Option<StreamId> {
        self.next
    }
}

/// Flags selecting which TLS evidence parsers should capture.
#[derive(Debug, Default, Clone, Copy)]
pub struct CaptureFlags {
    pub cert: bool,
    pub servername: bool,
    pub html: bool,
    pub heartbleed: bool,
    pub ticketbleed: bool,
}

/// The process-wide registry of protocol streams and port bindings.
pub struct BannerRegistry {
    pub http: HttpStream,
    pub tls: TlsStream,
    pub smb: SmbStream,
    pub ssh: SshStream,
    custom: BTreeMap<u16, CustomStream>,
    plugins: Vec<Box<dyn ProtocolStream>>,
    ports: Box<[Option<StreamId>]>,

    /// The active TLS hello negotiates the heartbeat extension; established
    /// connections shrink their advertised window so the leaked reply
    /// arrives in small segments.
    pub is_heartbleed: bool,
    pub is_ticketbleed: bool,
    pub is_poodle_sslv3: bool,
    pub capture: CaptureFlags,
}

impl BannerRegistry {
    pub fn new() -> BannerRegistry {
        let mut registry = BannerRegistry {
            http: HttpStream::new(),
            tls: TlsStream::new(),
            smb: SmbStream::new(),
            ssh: SshStream,
            custom: BTreeMap::new(),
            plugins: Vec::new(),
            ports: vec![None; 65536].into_boxed_slice(),
            is_heartbleed: false,
            is_ticketbleed: false,
            is_poodle_sslv3: false,
            capture: CaptureFlags::default(),
        };
        for port in [80, 8080] {
            registry.bind_port(port, StreamId::Http);
        }
        for port in [443, 8443] {
            registry.bind_port(port, StreamId::Tls);
        }
        for port in [139, 445] {
            registry.bind_port(port, StreamId::Smb);
        }
        registry.bind_port(22, StreamId::Ssh);
        registry
    }

    /// Resolve a stream id to its handler.
    pub fn stream(&self, id: StreamId) -> &dyn ProtocolStream {
        match id {
            StreamId::Http => &self.http,
            StreamId::Tls => &self.tls,
            StreamId::TlsAlt => match self.tls.alt() {
                Some(alt) => alt,
                None => &self.tls,
            },
            StreamId::Smb => &self.smb,
            StreamId::Ssh => &self.ssh,
            StreamId::Custom(port) => match self.custom.get(&port) {
                Some(stream) => stream,
                None => &self.ssh,
            },
            StreamId::Plugin(index) => match self.plugins.get(usize::from(index)) {
                Some(stream) => &**stream,
                None => &self.ssh,
            },
        }
    }

    /// Register an out-of-crate protocol stream and return its id, to be
    /// bound to ports or attached to connections directly.
    pub fn register_stream(&mut self, stream: Box<dyn ProtocolStream>) -> StreamId {
        let id = StreamId::Plugin(self.plugins.len() as u16);
        self.plugins.push(stream);
        id
    }

    /// The stream a connection to `port` runs by default.
    pub fn stream_for_port(&self, port: u16) -> Option<StreamId> {
        self.ports[usize::from(port)]
    }

    /// Bind one port to a stream.
    pub fn bind_port(&mut self, port: u16, id: StreamId) {
        self.ports[usize::from(port)] = Some(id);
    }

    /// Force every port onto one stream, as `hello=ssl` and friends do.
    pub fn bind_all(&mut self, id: StreamId) {
        for slot in self.ports.iter_mut() {
            *slot = Some(id);
        }
    }

    /// Install a user-supplied hello for one port.
    pub fn add_custom(&mut self, port: u16, hello: Vec<u8>) -> &mut CustomStream {
        let hello: &'static [u8] = Box::leak(hello.into_boxed_slice());
        self.custom.insert(port, CustomStream::new(hello));
        self.bind_port(port, StreamId::Custom(port));
        self.custom.get_mut(&port).expect("just inserted")
    }
}

impl Default for BannerRegistry {
    fn default() -> BannerRegistry {
        BannerRegistry::new()
    }
}
