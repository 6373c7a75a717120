//! End-to-end exercises of the connection engine against recorded output.
//!
//! Each test drives the table with classified events exactly as the packet
//! ingress would, then parses the packets the engine queued for transmit.
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex};

use crate::banner::ssl::{client_hello, HelloTemplate};
use crate::banner::{AppProto, Reporter, StreamId};
use crate::stack::template::{self, WINDOW_SMALL};
use crate::stack::{PacketBuffer, Stack, StackSource, TemplatePacket};
use crate::time::Instant;
use crate::wire::{Address, Flags, SeqNumber, TcpPacket};

use super::{AppState, ConnectionTable, Key, SendBuf, TcpEvent, TcpState};

const IP_ME: Address = Address::v4(10, 0, 0, 1);
const IP_THEM: Address = Address::v4(1, 2, 3, 4);
const PORT_ME: u16 = 41005;

/// Their ISN; the first data byte is at 1001.
const THEIR_SEQ: u32 = 1000;
/// Our cookie-derived send position after the handshake.
const OUR_SEQ: u32 = 7777;

#[derive(Debug, Clone)]
struct Sent {
    flags: Flags,
    seq: SeqNumber,
    ack: SeqNumber,
    window: u16,
    payload: Vec<u8>,
}

#[derive(Default)]
struct CollectReporter {
    banners: Mutex<Vec<(Address, u16, AppProto, Vec<u8>)>>,
}

impl Reporter for Arc<CollectReporter> {
    fn report_banner(
        &self,
        ip_them: Address,
        port_them: u16,
        app_proto: AppProto,
        _ttl: u8,
        banner: &[u8],
    ) {
        self.banners
            .lock()
            .unwrap()
            .push((ip_them, port_them, app_proto, banner.to_vec()));
    }
}

struct Harness {
    table: ConnectionTable,
    stack: Arc<Stack>,
    rx: Receiver<PacketBuffer>,
    reporter: Arc<CollectReporter>,
}

fn t(secs: u32) -> Instant {
    Instant::from_tv(secs, 0)
}

impl Harness {
    fn new() -> Harness {
        let (stack, rx) = Stack::new(StackSource::default(), 64, 2048);
        let stack = Arc::new(stack);
        let reporter = Arc::new(CollectReporter::default());
        let table = ConnectionTable::new(
            1024,
            stack.clone(),
            TemplatePacket::new(),
            Box::new(reporter.clone()),
            0,
            0xfeed_beef_1234_5678,
        );
        Harness {
            table,
            stack,
            rx,
            reporter,
        }
    }

    /// Drain, parse, and recycle everything queued for transmit.
    fn sent(&mut self) -> Vec<Sent> {
        let mut out = Vec::new();
        while let Ok(buffer) = self.rx.try_recv() {
            let packet = buffer.payload().to_vec();
            self.stack.recycle(buffer);
            let (_, tcp) = template::split_ip(&packet).expect("well-formed ip packet");
            let tcp = TcpPacket::new_checked(tcp).expect("well-formed tcp segment");
            out.push(Sent {
                flags: tcp.flags(),
                seq: tcp.seq_number(),
                ack: tcp.ack_number(),
                window: tcp.window_len(),
                payload: tcp.payload_slice().to_vec(),
            });
        }
        out
    }

    /// Create the record for a validated SYN-ACK and run the handshake.
    fn establish(&mut self, port_them: u16) -> Key {
        let key = self.table.create_tcb(
            IP_ME,
            IP_THEM,
            PORT_ME,
            port_them,
            SeqNumber(OUR_SEQ),
            SeqNumber(THEIR_SEQ + 1),
            64,
            None,
            t(0),
        );
        self.table.incoming(
            key,
            TcpEvent::SynAck,
            &[],
            SeqNumber(THEIR_SEQ + 1),
            SeqNumber(OUR_SEQ),
            t(0),
        );
        key
    }

    fn state(&self, key: Key) -> TcpState {
        self.table.tcb(key).expect("live connection").state
    }
}

#[test]
fn happy_path_http_banner() {
    let mut h = Harness::new();
    let key = h.establish(80);

    // The handshake is completed with a bare ACK.
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::ACK);
    assert_eq!(sent[0].seq, SeqNumber(OUR_SEQ));
    assert_eq!(sent[0].ack, SeqNumber(THEIR_SEQ + 1));
    assert_eq!(h.state(key), TcpState::EstablishedRecv);

    // Two seconds of server silence make the hello go out, FIN-terminated.
    h.table.process_timeouts(t(2));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let hello = &sent[0];
    assert_eq!(hello.flags, Flags::PSH | Flags::ACK | Flags::FIN);
    assert_eq!(hello.seq, SeqNumber(OUR_SEQ));
    assert!(hello.payload.starts_with(b"GET / HTTP/1.0\r\n"));
    assert_eq!(hello.window, 65535);
    assert_eq!(h.state(key), TcpState::EstablishedSend);
    let hello_len = hello.payload.len();

    // The peer acknowledges hello and FIN in one go.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + hello_len + 1,
        t(2),
    );
    assert_eq!(h.state(key), TcpState::EstablishedRecv);

    // The response payload is parsed and acknowledged.
    let payload = b"HTTP/1.1 200 OK\r\n\r\nhi";
    h.table.incoming(
        key,
        TcpEvent::Data,
        payload,
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + hello_len + 1,
        t(2),
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::ACK);
    assert_eq!(sent[0].ack, SeqNumber(THEIR_SEQ + 1) + payload.len());

    // Their FIN after the data closes their direction.
    h.table.incoming(
        key,
        TcpEvent::Fin,
        &[],
        SeqNumber(THEIR_SEQ + 1) + payload.len(),
        SeqNumber(OUR_SEQ) + hello_len + 1,
        t(3),
    );
    assert_eq!(h.state(key), TcpState::CloseWait);

    // Nothing reported yet; the flush happens on teardown.
    assert!(h.reporter.banners.lock().unwrap().is_empty());
    h.table.incoming(
        key,
        TcpEvent::Timeout,
        &[],
        SeqNumber(THEIR_SEQ + 1) + payload.len(),
        SeqNumber(OUR_SEQ) + hello_len + 1,
        t(31),
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::RST);
    assert_eq!(h.table.active_count(), 0);

    let banners = h.reporter.banners.lock().unwrap();
    assert_eq!(banners.len(), 1);
    let (them, port, proto, bytes) = &banners[0];
    assert_eq!(*them, IP_THEM);
    assert_eq!(*port, 80);
    assert_eq!(*proto, AppProto::Http);
    assert_eq!(bytes, payload);
    assert!(bytes.windows(2).any(|w| w == b"hi"));
}

#[test]
fn out_of_order_data_is_dropped() {
    let mut h = Harness::new();
    let key = h.establish(80);
    h.sent();

    h.table.incoming(
        key,
        TcpEvent::Data,
        b"abcde",
        SeqNumber(THEIR_SEQ + 1) + 10,
        SeqNumber(OUR_SEQ),
        t(1),
    );

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::ACK);
    // The ACK re-asserts the expected position, not the arrived one.
    assert_eq!(sent[0].ack, SeqNumber(THEIR_SEQ + 1));
    assert!(sent[0].payload.is_empty());

    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.seqno_them, SeqNumber(THEIR_SEQ + 1));
    assert!(tcb.banout.is_empty());
}

#[test]
fn overlapping_prefix_is_trimmed() {
    let mut h = Harness::new();
    let key = h.establish(80);
    h.sent();

    // Three already-seen bytes in front of five new ones.
    h.table.incoming(
        key,
        TcpEvent::Data,
        b"xxx73ab\n",
        SeqNumber(THEIR_SEQ + 1) - 3,
        SeqNumber(OUR_SEQ),
        t(1),
    );

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::ACK);
    assert_eq!(sent[0].ack, SeqNumber(THEIR_SEQ + 1) + 5);

    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.seqno_them, SeqNumber(THEIR_SEQ + 1) + 5);
    let blocks: Vec<_> = tcb.banout.blocks().collect();
    assert_eq!(blocks.len(), 1);
    assert_eq!(blocks[0].bytes, b"73ab\n");
}

#[test]
fn oversized_hello_splits_and_retransmits_identically() {
    let mut h = Harness::new();
    let big_hello = vec![0x41; 1500];
    h.table.banners_mut().add_custom(9999, big_hello.clone());

    let key = h.establish(9999);
    h.sent();

    // Hello timer: 1500 bytes split at mss=1400; only the head goes out.
    h.table.process_timeouts(t(2));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    let first = sent[0].clone();
    assert_eq!(first.payload.len(), 1400);
    assert_eq!(first.seq, SeqNumber(OUR_SEQ));
    assert_eq!(first.flags, Flags::PSH | Flags::ACK);

    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.segments.len(), 2);
    assert_eq!(tcb.segments[1].len(), 100);
    assert!(tcb.segments[1].is_fin);
    assert!(!tcb.segments[0].is_fin);

    // No acknowledgement; the retransmit must be byte-identical.
    h.table.process_timeouts(t(3));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, first.flags);
    assert_eq!(sent[0].seq, first.seq);
    assert_eq!(sent[0].payload, first.payload);
}

#[test]
fn fin_queue_stays_singular() {
    let mut h = Harness::new();
    h.table.banners_mut().add_custom(9999, vec![0x41; 1500]);
    let key = h.establish(9999);
    h.table.process_timeouts(t(2));
    h.sent();

    // Acknowledge the head; the FIN tail becomes the head and the state
    // machine notices the pending close.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + 1400,
        t(2),
    );
    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.segments.len(), 1);
    let fins = tcb.segments.iter().filter(|seg| seg.is_fin).count();
    assert_eq!(fins, 1);
    assert!(tcb.segments.back().unwrap().is_fin);
    assert_eq!(tcb.seqno_me, SeqNumber(OUR_SEQ) + 1400);
    assert_eq!(h.state(key), TcpState::FinWait1);
}

#[test]
fn stale_and_future_acks_are_filtered() {
    let mut h = Harness::new();
    h.table.banners_mut().add_custom(9999, vec![0x42; 1500]);

    // Use a send position that makes the scenario numbers exact.
    let key = h.table.create_tcb(
        IP_ME,
        IP_THEM,
        PORT_ME,
        9999,
        SeqNumber(0x0001_0000),
        SeqNumber(THEIR_SEQ + 1),
        64,
        None,
        t(0),
    );
    h.table.incoming(
        key,
        TcpEvent::SynAck,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(0x0001_0000),
        t(0),
    );
    h.table.process_timeouts(t(2));
    h.sent();
    assert_eq!(h.state(key), TcpState::EstablishedSend);

    // An acknowledgement from nearly a full wrap behind.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(0xfffe_0000),
        t(2),
    );
    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.seqno_me, SeqNumber(0x0001_0000));
    assert_eq!(tcb.segments.len(), 2);
    assert_eq!(h.state(key), TcpState::EstablishedSend);

    // Slightly behind the send position is likewise dropped as stale.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(0x0001_0000) - 50_000,
        t(2),
    );
    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.seqno_me, SeqNumber(0x0001_0000));
    assert_eq!(tcb.segments.len(), 2);
}

#[test]
fn connection_timeout_resets_and_reaps() {
    let mut h = Harness::new();
    let key = h.establish(80);
    h.sent();
    assert_eq!(h.table.active_count(), 1);

    h.table.incoming(
        key,
        TcpEvent::Timeout,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ),
        t(31),
    );

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::RST);
    assert_eq!(sent[0].seq, SeqNumber(OUR_SEQ));
    assert_eq!(h.table.active_count(), 0);
    assert_eq!(h.table.lookup_tcb(IP_ME, IP_THEM, PORT_ME, 80), None);
    // An empty banner set is a valid flush.
    assert!(h.reporter.banners.lock().unwrap().is_empty());
}

#[test]
fn rst_destroys_immediately() {
    let mut h = Harness::new();
    let key = h.establish(80);
    h.sent();

    h.table.incoming(
        key,
        TcpEvent::Rst,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ),
        t(1),
    );
    assert_eq!(h.table.active_count(), 0);
    assert!(h.sent().is_empty());
}

#[test]
fn graceful_close_choreography() {
    let mut h = Harness::new();
    let key = h.establish(80);
    h.sent();

    h.table.process_timeouts(t(2));
    let hello_len = h.sent()[0].payload.len();

    // Data acked but not the FIN: half-way into our close.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + hello_len,
        t(3),
    );
    assert_eq!(h.state(key), TcpState::FinWait1);

    // FIN acked too.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + hello_len + 1,
        t(3),
    );
    assert_eq!(h.state(key), TcpState::FinWait2);
    h.sent();

    // Their FIN consumes one sequence step and gets acknowledged.
    h.table.incoming(
        key,
        TcpEvent::Fin,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + hello_len + 1,
        t(4),
    );
    assert_eq!(h.state(key), TcpState::TimeWait);
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::ACK);
    assert_eq!(sent[0].ack, SeqNumber(THEIR_SEQ + 2));

    // TIME-WAIT expires into teardown.
    h.table.process_timeouts(t(9));
    assert_eq!(h.table.active_count(), 0);
}

#[test]
fn server_first_banner_without_hello() {
    let mut h = Harness::new();
    let key = h.establish(22);
    h.sent();

    let banner = b"SSH-2.0-OpenSSH_9.6\r\n";
    h.table.incoming(
        key,
        TcpEvent::Data,
        banner,
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ),
        t(1),
    );
    h.sent();

    h.table.destroy();
    let banners = h.reporter.banners.lock().unwrap();
    assert_eq!(banners.len(), 1);
    assert_eq!(banners[0].2, AppProto::Ssh);
    assert_eq!(banners[0].3, banner);
}

#[test]
fn heartbleed_probe_shrinks_window() {
    let mut h = Harness::new();
    h.table.set_parameter("heartbleed", b"");

    let key = h.establish(443);
    h.sent();
    h.table.process_timeouts(t(2));

    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].window, WINDOW_SMALL);
    assert_eq!(sent[0].payload, client_hello(HelloTemplate::Heartbeat));

    let tcb = h.table.tcb(key).unwrap();
    assert!(tcb.is_small_window);
    assert!(tcb.banner_state.is_sent_tls_hello);
}

#[test]
fn alternate_protocol_reconnects_from_rotated_tuple() {
    let mut h = Harness::new();
    h.table
        .banners_mut()
        .tls
        .set_alt_hello(client_hello(HelloTemplate::Sslv3));

    let key = h.establish(443);
    h.sent();
    assert_eq!(h.table.active_count(), 2);

    // The follow-up probes the same target from the next source port.
    let follow_up = h
        .table
        .lookup_tcb(IP_ME, IP_THEM, PORT_ME + 1, 443)
        .expect("follow-up connection exists");
    assert_ne!(follow_up, key);
    let tcb = h.table.tcb(follow_up).unwrap();
    assert_eq!(tcb.stream, Some(StreamId::TlsAlt));
    assert_eq!(tcb.state, TcpState::SynSent);
    assert!(tcb.timer.is_some());
    assert_eq!(tcb.ttl, 255);
}

#[test]
fn synack_retransmit_is_reacked() {
    let mut h = Harness::new();
    let key = h.establish(80);
    h.sent();

    h.table.incoming(
        key,
        TcpEvent::SynAck,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ),
        t(1),
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::ACK);
    assert_eq!(h.state(key), TcpState::EstablishedRecv);
}

#[test]
fn syn_sent_timeout_backs_off() {
    let mut h = Harness::new();
    let key = h.table.create_tcb(
        IP_ME,
        IP_THEM,
        PORT_ME,
        80,
        SeqNumber(OUR_SEQ),
        SeqNumber(0),
        64,
        None,
        t(0),
    );

    // First retry after the initial timer.
    h.table.process_timeouts(t(1));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::SYN);
    // A SYN spends the sequence number before our first payload byte.
    assert_eq!(sent[0].seq, SeqNumber(OUR_SEQ) - 1);

    let tcb = h.table.tcb(key).unwrap();
    assert_eq!(tcb.syns_sent, 1);
    // Linear backoff: the second retry sits two seconds out.
    assert_eq!(
        tcb.timer.unwrap().when(),
        t(1) + crate::time::Duration::from_secs(1)
    );
}

/// A line-oriented request/response probe, as an out-of-crate parser would
/// implement it: the hello is crafted through the net handle rather than
/// taken from a canned template, and the parser answers the first reply.
struct PingStream;

impl crate::banner::ProtocolStream for PingStream {
    fn name(&self) -> &'static str {
        "ping"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Banner
    }

    fn transmit_hello(&self, net: &mut dyn crate::banner::NetSend) -> bool {
        net.send(SendBuf::Copy(b"PING\r\n"), false);
        true
    }

    fn parse(
        &self,
        state: &mut crate::banner::StreamState,
        payload: &[u8],
        banout: &mut crate::banner::BannerOutput,
        net: &mut dyn crate::banner::NetSend,
    ) {
        state.app_proto = AppProto::Banner;
        banout.append(AppProto::Banner, payload);
        if payload.starts_with(b"PONG") && !net.is_closing() {
            net.send(SendBuf::Static(b"QUIT\r\n"), true);
        }
    }
}

#[test]
fn crafted_hello_and_send_next_dialogue() {
    let mut h = Harness::new();
    let id = h.table.banners_mut().register_stream(Box::new(PingStream));
    h.table.banners_mut().bind_port(7777, id);

    let key = h.establish(7777);
    h.sent();

    // The hello timer invokes the stream's own transmit callback.
    h.table.process_timeouts(t(2));
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::PSH | Flags::ACK);
    assert_eq!(sent[0].payload, b"PING\r\n");
    assert_eq!(h.table.tcb(key).unwrap().app, AppState::SendNext);
    assert_eq!(h.state(key), TcpState::EstablishedSend);

    // Once the hello is acknowledged the dialogue turns back to listening.
    h.table.incoming(
        key,
        TcpEvent::Ack,
        &[],
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + 6,
        t(2),
    );
    assert_eq!(h.table.tcb(key).unwrap().app, AppState::ReceiveNext);
    assert_eq!(h.state(key), TcpState::EstablishedRecv);

    // The reply is recorded and answered with a FIN-terminated quit.
    h.table.incoming(
        key,
        TcpEvent::Data,
        b"PONG v1\r\n",
        SeqNumber(THEIR_SEQ + 1),
        SeqNumber(OUR_SEQ) + 6,
        t(3),
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[0].flags, Flags::PSH | Flags::ACK | Flags::FIN);
    assert_eq!(sent[0].payload, b"QUIT\r\n");
    assert_eq!(sent[1].flags, Flags::ACK);

    h.table.destroy();
    let banners = h.reporter.banners.lock().unwrap();
    assert_eq!(banners.len(), 1);
    assert_eq!(banners[0].2, AppProto::Banner);
    assert_eq!(banners[0].3, b"PONG v1\r\n");
}

#[test]
fn send_rst_uses_peer_sequence_numbers() {
    let mut h = Harness::new();
    h.table.send_rst(
        IP_ME,
        IP_THEM,
        PORT_ME,
        80,
        SeqNumber(5000),
        SeqNumber(6000),
    );
    let sent = h.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].flags, Flags::RST);
    assert_eq!(sent[0].seq, SeqNumber(6000));
    assert_eq!(sent[0].ack, SeqNumber(5001));
}
