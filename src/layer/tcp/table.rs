//! The TCP connection table.
//!
//! A bounded, power-of-two-bucketed set of connection records. Records live
//! in a slab and are chained into buckets by stable keys; the bucket index
//! comes from a symmetric hash of the four-tuple, so packets of either
//! direction of one connection land in the same chain. Destroyed records
//! flush their banners, release their segments, drop their timer entry, and
//! return to the slab's free list for reuse.
use std::sync::Arc;

use base64::Engine as _;

use crate::banner::http::{FieldAction, RequestPart};
use crate::banner::ssl::{add_cipherspec, client_hello, HelloTemplate};
use crate::banner::{AppProto, BannerRegistry, CaptureFlags, Reporter, StreamId};
use crate::managed::{Key, Slab};
use crate::stack::{Stack, TemplatePacket};
use crate::time::{Duration, Expiration, Instant};
use crate::wire::{Address, Flags, SeqNumber};

use super::app;
use super::machine::{self, Ctx, Disposition, Reconnect, TcpEvent};
use super::siphash::SynCookie;
use super::tcb::{DestroyReason, Tcb};
use super::timer::TimerWheel;

const BUCKETS_MIN: usize = 1 << 10;
const BUCKETS_MAX: usize = 1 << 24;

/// The set of all live connections, plus everything they collectively need:
/// the timer wheel, the packet template, the transmit stack, the stream
/// registry, and the banner sink.
pub struct ConnectionTable {
    buckets: Vec<Option<Key>>,
    mask: usize,
    conns: Slab<Tcb>,
    timers: TimerWheel,
    cookie: SynCookie,
    active_count: u64,

    /// Seconds a connection may exist before it is reset and reaped.
    timeout_connection: u32,
    /// Seconds to wait for a server banner before transmitting our hello.
    timeout_hello: u32,

    template: TemplatePacket,
    stack: Arc<Stack>,
    banners: BannerRegistry,
    reporter: Box<dyn Reporter>,
}

impl ConnectionTable {
    /// Create a table with room for roughly `capacity` concurrent
    /// connections.
    ///
    /// The bucket count is the next power of two, clamped to
    /// [2^10, 2^24]; if that much memory is not available the request is
    /// halved until it is. A `connection_timeout` of zero selects the
    /// 30-second default.
    pub fn new(
        capacity: usize,
        stack: Arc<Stack>,
        template: TemplatePacket,
        reporter: Box<dyn Reporter>,
        connection_timeout: u32,
        entropy: u64,
    ) -> ConnectionTable {
        let timeout_connection = if connection_timeout == 0 {
            30
        } else {
            connection_timeout
        };

        let mut count = capacity
            .next_power_of_two()
            .clamp(BUCKETS_MIN, BUCKETS_MAX);
        let buckets = loop {
            let mut buckets: Vec<Option<Key>> = Vec::new();
            match buckets.try_reserve_exact(count) {
                Ok(()) => {
                    buckets.resize(count, None);
                    break buckets;
                }
                Err(_) if count > 1 => {
                    net_debug!("connection table: shrinking to {} buckets", count / 2);
                    count /= 2;
                }
                Err(_) => {
                    break vec![None];
                }
            }
        };
        let count = buckets.len();

        ConnectionTable {
            mask: count - 1,
            buckets,
            conns: Slab::new(),
            timers: TimerWheel::new(),
            cookie: SynCookie::new(entropy),
            active_count: 0,
            timeout_connection,
            timeout_hello: 2,
            template,
            stack,
            banners: BannerRegistry::new(),
            reporter,
        }
    }

    /// The number of live connections.
    pub fn active_count(&self) -> u64 {
        self.active_count
    }

    /// The stream registry, for configuration before the scan starts.
    pub fn banners(&self) -> &BannerRegistry {
        &self.banners
    }

    pub fn banners_mut(&mut self) -> &mut BannerRegistry {
        &mut self.banners
    }

    /// The SYN cookie generator keyed to this table's entropy.
    pub fn cookie(&self) -> &SynCookie {
        &self.cookie
    }

    /// When the next connection timer is due, for ingress pacing.
    pub fn next_expiry(&self) -> Expiration {
        self.timers.next_expiry()
    }

    /// Inspect a connection record.
    pub fn tcb(&self, key: Key) -> Option<&Tcb> {
        self.conns.get(key)
    }

    /// Find the connection owning a four-tuple.
    pub fn lookup_tcb(
        &self,
        ip_me: Address,
        ip_them: Address,
        port_me: u16,
        port_them: u16,
    ) -> Option<Key> {
        let index = self.bucket_index(ip_me, ip_them, port_me, port_them);
        net_trace!(
            "tcb_hash({:#010x}) = {} {} {} {}",
            index,
            ip_me,
            port_me,
            ip_them,
            port_them
        );
        self.bucket_find(index, ip_me, ip_them, port_me, port_them)
    }

    /// Instantiate a connection for a cookie-validated SYN-ACK.
    ///
    /// If the four-tuple already has a record, that record is returned
    /// unchanged. Otherwise a slab slot is (re)used, sequence baselines are
    /// seeded, the port's default stream is attached unless the caller
    /// supplies one, and the retransmit timer is armed.
    #[allow(clippy::too_many_arguments)]
    pub fn create_tcb(
        &mut self,
        ip_me: Address,
        ip_them: Address,
        port_me: u16,
        port_them: u16,
        seqno_me: SeqNumber,
        seqno_them: SeqNumber,
        ttl: u8,
        stream: Option<StreamId>,
        now: Instant,
    ) -> Key {
        debug_assert!(!ip_me.is_unspecified() && !ip_them.is_unspecified());

        let index = self.bucket_index(ip_me, ip_them, port_me, port_them);
        if let Some(existing) = self.bucket_find(index, ip_me, ip_them, port_me, port_them) {
            return existing;
        }

        let mut tcb = Tcb::new(ip_me, ip_them, port_me, port_them);
        tcb.seqno_them_first = seqno_them;
        tcb.seqno_me_first = seqno_me;
        tcb.seqno_me = seqno_me;
        tcb.seqno_them = seqno_them;
        tcb.ackno_me = seqno_them;
        tcb.ackno_them = seqno_me;
        tcb.when_created = now;
        tcb.ttl = ttl;
        tcb.banner_state.port = port_them;
        tcb.stream = stream.or_else(|| self.banners.stream_for_port(port_them));
        tcb.is_active = true;

        let head = self.buckets[index];
        let key = self.conns.insert(tcb);
        {
            let tcb = self.conns.get_mut(key).expect("slot was just filled");
            tcb.next_in_bucket = head;
            self.timers
                .arm(&mut tcb.timer, key, now + Duration::from_secs(1));
        }
        self.buckets[index] = Some(key);
        self.active_count += 1;
        key
    }

    /// Tear a connection down and release every resource it owns.
    ///
    /// Banners flush to the reporter before anything else is released.
    /// Being asked to destroy a record that is not in its bucket chain is a
    /// bookkeeping bug on the caller's side; it is logged and ignored.
    pub fn destroy_tcb(&mut self, key: Key, reason: DestroyReason) {
        let (ip_me, ip_them, port_me, port_them) = match self.conns.get(key) {
            Some(tcb) => (tcb.ip_me, tcb.ip_them, tcb.port_me, tcb.port_them),
            None => {
                net_debug!("tcb: double free");
                return;
            }
        };

        net_debug!(
            "[{}]:{} closing (reason={}) (me={})",
            ip_them,
            port_them,
            reason,
            port_me
        );

        let index = self.bucket_index(ip_me, ip_them, port_me, port_them);
        if !self.bucket_unlink(index, key) {
            net_debug!("tcb: double free");
            return;
        }

        let mut tcb = match self.conns.remove(key) {
            Some(tcb) => tcb,
            None => return,
        };

        flush_banners(&*self.reporter, &tcb);
        tcb.segments.clear();
        if let Some(id) = tcb.stream {
            self.banners.stream(id).cleanup(&mut tcb.banner_state);
        }
        self.timers.unlink(&mut tcb.timer);

        tcb.ip_me = Address::Unspecified;
        tcb.ip_them = Address::Unspecified;
        tcb.port_me = u16::MAX;
        tcb.port_them = u16::MAX;
        tcb.is_active = false;

        self.active_count -= 1;
    }

    /// Gracefully destroy every connection, flushing all pending banners.
    pub fn destroy(&mut self) {
        for index in 0..self.buckets.len() {
            while let Some(key) = self.buckets[index] {
                self.destroy_tcb(key, DestroyReason::Shutdown);
            }
        }
    }

    /// Drain and dispatch every timer due at or before `now`.
    pub fn process_timeouts(&mut self, now: Instant) {
        loop {
            let (token, key) = match self.timers.remove_expired(now) {
                Some(due) => due,
                None => break,
            };

            let (seqno_them, ackno_them) = match self.conns.get_mut(key) {
                Some(tcb) => {
                    if tcb.timer == Some(token) {
                        tcb.timer = None;
                    }
                    (tcb.seqno_them, tcb.ackno_them)
                }
                None => continue,
            };

            self.incoming(key, TcpEvent::Timeout, &[], seqno_them, ackno_them, now);

            // There must ALWAYS be a timeout associated with a live
            // connection, or the table leaks it. The transitions are meant
            // to guarantee that on their own; this catch-all re-arms anyone
            // that slipped through.
            if let Some(tcb) = self.conns.get_mut(key) {
                if tcb.is_active && tcb.timer.is_none() {
                    self.timers
                        .arm(&mut tcb.timer, key, now + Duration::from_secs(2));
                }
            }
        }
    }

    /// Dispatch one classified packet event (or timer expiry) against a
    /// connection. Returns false if the key no longer resolves.
    pub fn incoming(
        &mut self,
        key: Key,
        event: TcpEvent,
        payload: &[u8],
        seqno_them: SeqNumber,
        ackno_them: SeqNumber,
        now: Instant,
    ) -> bool {
        let (disposition, reconnect) = {
            let tcb = match self.conns.get_mut(key) {
                Some(tcb) => tcb,
                None => return false,
            };
            let mut ctx = Ctx {
                template: &self.template,
                stack: &self.stack,
                timers: &mut self.timers,
                banners: &self.banners,
                timeout_connection: self.timeout_connection,
                timeout_hello: self.timeout_hello,
                now,
                key,
                reconnect: None,
            };
            let disposition =
                machine::process(tcb, &mut ctx, event, payload, seqno_them, ackno_them);
            (disposition, ctx.reconnect)
        };

        if let Disposition::Destroy(reason) = disposition {
            self.destroy_tcb(key, reason);
        }
        if let Some(request) = reconnect {
            self.reconnect(request, now);
        }
        true
    }

    /// Send a bare RST for a four-tuple without instantiating state, e.g.
    /// to refuse a connection the scanner no longer wants.
    pub fn send_rst(
        &self,
        ip_me: Address,
        ip_them: Address,
        port_me: u16,
        port_them: u16,
        seqno_them: SeqNumber,
        ackno_them: SeqNumber,
    ) {
        let mut tcb = Tcb::new(ip_me, ip_them, port_me, port_them);
        tcb.seqno_me = ackno_them;
        tcb.ackno_me = seqno_them + 1;
        tcb.seqno_them = seqno_them + 1;
        tcb.ackno_them = ackno_them;
        net_debug!("{} send RST", tcb.trace());
        machine::send_packet(&self.template, &self.stack, &tcb, Flags::RST, &[]);
    }

    /// Launch the follow-up connection a stream's `next` asked for.
    fn reconnect(&mut self, request: Reconnect, now: Instant) {
        let mut ip_me = request.ip_me;
        let mut port_me = request.port_me;
        app::next_ip_port(self.stack.source(), &mut ip_me, &mut port_me);

        net_debug!("[{}]:{} create new connection", ip_me, port_me);

        let cookie = self
            .cookie
            .cookie(request.ip_them, request.port_them, ip_me, port_me);
        self.create_tcb(
            ip_me,
            request.ip_them,
            port_me,
            request.port_them,
            SeqNumber(cookie.wrapping_add(1)),
            SeqNumber(0),
            255,
            Some(request.stream),
            now,
        );
    }

    /// Edit a header field of the HTTP hello template.
    pub fn set_http_header(&mut self, name: &str, value: &[u8], action: FieldAction) {
        self.banners.http.set_field(name, value, action);
    }

    /// Record which TLS evidence parsers should capture.
    pub fn set_banner_flags(&mut self, capture: CaptureFlags) {
        self.banners.capture = capture;
    }

    /// Apply one named configuration parameter.
    ///
    /// Names match loosely: `-`, `.` and `_` are interchangeable and
    /// ignorable, and a `[index]` suffix selects an array element, as in
    /// `hello-string[25]`.
    pub fn set_parameter(&mut self, name: &str, value: &[u8]) {
        if name_eq(name, "http-payload") {
            self.banners.http.set_request_part(RequestPart::Payload, value);
            let length = value.len().to_string();
            self.banners
                .http
                .set_field("Content-Length", length.as_bytes(), FieldAction::Replace);
            return;
        }
        if name_eq(name, "http-user-agent") {
            self.banners.http.set_field("User-Agent", value, FieldAction::Replace);
            return;
        }
        if name_eq(name, "http-host") {
            self.banners.http.set_field("Host", value, FieldAction::Replace);
            return;
        }
        if name_eq(name, "http-method") {
            self.banners.http.set_request_part(RequestPart::Method, value);
            return;
        }
        if name_eq(name, "http-url") {
            self.banners.http.set_request_part(RequestPart::Url, value);
            return;
        }
        if name_eq(name, "http-version") {
            self.banners.http.set_request_part(RequestPart::Version, value);
            return;
        }

        if name_eq(name, "timeout") || name_eq(name, "connection-timeout") {
            self.timeout_connection = parse_int(value) as u32;
            net_debug!("TCP connection-timeout = {}", self.timeout_connection);
            return;
        }
        if name_eq(name, "hello-timeout") {
            self.timeout_hello = parse_int(value) as u32;
            net_debug!("TCP hello-timeout = {}", self.timeout_hello);
            return;
        }

        let value_name = String::from_utf8_lossy(value);
        if name_eq(name, "hello") && name_eq(&value_name, "ssl") {
            net_debug!("HELLO: setting SSL hello message");
            self.banners.bind_all(StreamId::Tls);
            return;
        }
        if name_eq(name, "hello") && name_eq(&value_name, "http") {
            net_debug!("HELLO: setting HTTP hello message");
            self.banners.bind_all(StreamId::Http);
            return;
        }
        if name_eq(name, "hello") && name_eq(&value_name, "smbv1") {
            self.banners.smb.set_hello_v1();
            return;
        }

        if name_eq(name, "heartbleed") {
            self.banners.tls.set_hello(client_hello(HelloTemplate::Heartbeat));
            self.banners.is_heartbleed = true;
            self.banners.bind_all(StreamId::Tls);
            return;
        }
        if name_eq(name, "ticketbleed") {
            self.banners.tls.set_hello(client_hello(HelloTemplate::Ticketbleed));
            self.banners.is_ticketbleed = true;
            self.banners.bind_all(StreamId::Tls);
            return;
        }
        if name_eq(name, "poodle") || name_eq(name, "sslv3") {
            let hello = add_cipherspec(client_hello(HelloTemplate::Sslv3), 0x5600);
            self.banners.tls.set_hello(hello);
            self.banners.is_poodle_sslv3 = true;
            self.banners.bind_all(StreamId::Tls);
            return;
        }

        if name_eq(name, "hello-string") {
            let port = match array_index(name) {
                Some(port) => port,
                None => {
                    net_debug!("tcpcon: parameter: expected array []: {}", name);
                    return;
                }
            };
            let decoded = match base64::engine::general_purpose::STANDARD.decode(value) {
                Ok(decoded) => decoded,
                Err(err) => {
                    net_debug!("hello-string[{}]: invalid base64: {}", port, err);
                    return;
                }
            };
            self.banners.add_custom(port, decoded);
            return;
        }

        net_debug!("tcpcon: unknown parameter: {}", name);
    }

    fn bucket_index(
        &self,
        ip_me: Address,
        ip_them: Address,
        port_me: u16,
        port_them: u16,
    ) -> usize {
        let hash = self
            .cookie
            .symmetric_hash(ip_me, port_me, ip_them, port_them);
        hash as usize & self.mask
    }

    fn bucket_find(
        &self,
        index: usize,
        ip_me: Address,
        ip_them: Address,
        port_me: u16,
        port_them: u16,
    ) -> Option<Key> {
        let mut cursor = self.buckets[index];
        while let Some(key) = cursor {
            let tcb = self.conns.get(key)?;
            if tcb.tuple_equals(ip_me, ip_them, port_me, port_them) {
                return Some(key);
            }
            cursor = tcb.next_in_bucket;
        }
        None
    }

    fn bucket_unlink(&mut self, index: usize, key: Key) -> bool {
        let mut prev: Option<Key> = None;
        let mut cursor = self.buckets[index];
        while let Some(current) = cursor {
            let next = self.conns.get(current).and_then(|tcb| tcb.next_in_bucket);
            if current == key {
                match prev {
                    None => self.buckets[index] = next,
                    Some(prev) => {
                        if let Some(tcb) = self.conns.get_mut(prev) {
                            tcb.next_in_bucket = next;
                        }
                    }
                }
                return true;
            }
            prev = cursor;
            cursor = next;
        }
        false
    }
}

fn flush_banners(reporter: &dyn Reporter, tcb: &Tcb) {
    for block in tcb.banout.blocks() {
        if block.bytes.is_empty() || block.proto == AppProto::Unknown {
            continue;
        }
        reporter.report_banner(tcb.ip_them, tcb.port_them, block.proto, tcb.ttl, &block.bytes);
    }
}

/// Loose parameter-name comparison: separator characters are skipped on
/// both sides, and a name ending where the other side opens a `[...]`
/// subscript counts as equal.
fn name_eq(lhs: &str, rhs: &str) -> bool {
    let mut lhs = lhs
        .bytes()
        .filter(|&b| !matches!(b, b'-' | b'.' | b'_'));
    let mut rhs = rhs
        .bytes()
        .filter(|&b| !matches!(b, b'-' | b'.' | b'_'));
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return true,
            (None, Some(b'[')) | (Some(b'['), None) => return true,
            (Some(a), Some(b)) if a.eq_ignore_ascii_case(&b) => continue,
            _ => return false,
        }
    }
}

/// The config layer's relaxed integer parse.
fn parse_int(value: &[u8]) -> u64 {
    value.iter().fold(0u64, |acc, &b| {
        acc.wrapping_mul(10).wrapping_add(u64::from(b.wrapping_sub(b'0')))
    })
}

/// Extract the `[index]` subscript of a parameter name.
fn array_index(name: &str) -> Option<u16> {
    let open = name.find('[')?;
    let tail = &name[open + 1..];
    let digits = tail.split(|c: char| !c.is_ascii_digit()).next()?;
    digits.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::StackSource;
    use std::sync::Mutex;

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
            ttl: u8,
            banner: &[u8],
        ) {
            let _ = ttl;
            self.banners
                .lock()
                .unwrap()
                .push((ip_them, port_them, app_proto, banner.to_vec()));
        }
    }

    fn table() -> (ConnectionTable, Arc<CollectReporter>) {
        let (stack, _rx) = Stack::new(StackSource::default(), 8, 2048);
        let reporter = Arc::new(CollectReporter::default());
        let table = ConnectionTable::new(
            1000,
            Arc::new(stack),
            TemplatePacket::new(),
            Box::new(reporter.clone()),
            0,
            0x1234,
        );
        (table, reporter)
    }

    fn quad(n: u8) -> (Address, Address, u16, u16) {
        (
            Address::v4(10, 0, 0, 1),
            Address::v4(1, 2, 3, n),
            40000 + u16::from(n),
            80,
        )
    }

    #[test]
    fn create_lookup_destroy() {
        let (mut table, _) = table();
        let now = Instant::from_secs(0);

        let (me, them, port_me, port_them) = quad(1);
        let key = table.create_tcb(
            me,
            them,
            port_me,
            port_them,
            SeqNumber(1000),
            SeqNumber(2000),
            64,
            None,
            now,
        );
        assert_eq!(table.active_count(), 1);
        assert_eq!(table.lookup_tcb(me, them, port_me, port_them), Some(key));
        assert!(table.tcb(key).unwrap().is_active);
        assert_eq!(table.tcb(key).unwrap().mss, 1400);

        // Creating the same tuple again yields the existing record.
        let again = table.create_tcb(
            me,
            them,
            port_me,
            port_them,
            SeqNumber(1),
            SeqNumber(2),
            64,
            None,
            now,
        );
        assert_eq!(again, key);
        assert_eq!(table.active_count(), 1);

        table.destroy_tcb(key, DestroyReason::Shutdown);
        assert_eq!(table.active_count(), 0);
        assert_eq!(table.lookup_tcb(me, them, port_me, port_them), None);
        assert!(table.tcb(key).is_none());
    }

    #[test]
    fn table_integrity_over_churn() {
        let (mut table, _) = table();
        let now = Instant::from_secs(0);

        let mut keys = Vec::new();
        for n in 1..=20 {
            let (me, them, port_me, port_them) = quad(n);
            keys.push(table.create_tcb(
                me,
                them,
                port_me,
                port_them,
                SeqNumber(1000),
                SeqNumber(2000),
                64,
                None,
                now,
            ));
        }
        for key in keys.iter().step_by(2) {
            table.destroy_tcb(*key, DestroyReason::Shutdown);
        }

        let reachable = (1..=20)
            .filter(|&n| {
                let (me, them, port_me, port_them) = quad(n);
                table.lookup_tcb(me, them, port_me, port_them).is_some()
            })
            .count();
        assert_eq!(reachable as u64, table.active_count());
        assert_eq!(reachable, 10);

        // Every reachable record is live and every record has one timer.
        for &key in &keys {
            if let Some(tcb) = table.tcb(key) {
                assert!(tcb.is_active);
                assert!(tcb.timer.is_some());
            }
        }
    }

    #[test]
    fn double_free_is_harmless() {
        let (mut table, _) = table();
        let (me, them, port_me, port_them) = quad(3);
        let key = table.create_tcb(
            me,
            them,
            port_me,
            port_them,
            SeqNumber(1),
            SeqNumber(2),
            64,
            None,
            Instant::from_secs(0),
        );
        table.destroy_tcb(key, DestroyReason::Shutdown);
        table.destroy_tcb(key, DestroyReason::Shutdown);
        assert_eq!(table.active_count(), 0);
    }

    #[test]
    fn destroy_flushes_banners() {
        let (mut table, reporter) = table();
        let (me, them, port_me, port_them) = quad(4);
        let key = table.create_tcb(
            me,
            them,
            port_me,
            port_them,
            SeqNumber(1),
            SeqNumber(2),
            64,
            None,
            Instant::from_secs(0),
        );

        {
            // Reach in as the parser would.
            let tcb = table.conns.get_mut(key).unwrap();
            tcb.banout.append(AppProto::Http, b"HTTP/1.1 200 OK");
        }
        table.destroy_tcb(key, DestroyReason::Shutdown);

        let banners = reporter.banners.lock().unwrap();
        assert_eq!(banners.len(), 1);
        assert_eq!(banners[0].0, them);
        assert_eq!(banners[0].2, AppProto::Http);
        assert_eq!(banners[0].3, b"HTTP/1.1 200 OK");
    }

    #[test]
    fn shutdown_destroys_everything() {
        let (mut table, reporter) = table();
        for n in 1..=5 {
            let (me, them, port_me, port_them) = quad(n);
            let key = table.create_tcb(
                me,
                them,
                port_me,
                port_them,
                SeqNumber(1),
                SeqNumber(2),
                64,
                None,
                Instant::from_secs(0),
            );
            table
                .conns
                .get_mut(key)
                .unwrap()
                .banout
                .append(AppProto::Ssh, b"SSH-2.0");
        }
        table.destroy();
        assert_eq!(table.active_count(), 0);
        assert_eq!(reporter.banners.lock().unwrap().len(), 5);
    }

    #[test]
    fn missing_timer_is_rearmed() {
        let (mut table, _) = table();
        let (me, them, port_me, port_them) = quad(6);
        let now = Instant::from_secs(0);
        let key = table.create_tcb(
            me,
            them,
            port_me,
            port_them,
            SeqNumber(1),
            SeqNumber(2),
            64,
            None,
            now,
        );

        // A receive timeout with no stream attached transitions nothing and
        // arms nothing; only the catch-all keeps the connection tracked.
        {
            let tcb = table.conns.get_mut(key).unwrap();
            tcb.change_state(super::super::TcpState::EstablishedRecv);
            tcb.app = super::super::AppState::ReceiveHello;
            tcb.stream = None;
        }
        let later = Instant::from_secs(1);
        table.process_timeouts(later);

        let tcb = table.conns.get(key).unwrap();
        let token = tcb.timer.expect("catch-all must re-arm");
        assert_eq!(token.when(), later + Duration::from_secs(2));
        assert_eq!(table.timers.len(), 1);
    }

    #[test]
    fn parameter_names_match_loosely() {
        assert!(name_eq("connection_timeout", "connection-timeout"));
        assert!(name_eq("Connection.Timeout", "connection-timeout"));
        assert!(name_eq("hello-string[80]", "hello-string"));
        assert!(!name_eq("hello-time", "hello-timeout"));
        assert!(!name_eq("hello-timeout2", "hello-timeout"));
    }

    #[test]
    fn parameters_apply() {
        let (mut table, _) = table();

        table.set_parameter("connection-timeout", b"60");
        assert_eq!(table.timeout_connection, 60);
        table.set_parameter("hello-timeout", b"5");
        assert_eq!(table.timeout_hello, 5);

        table.set_parameter("hello", b"ssl");
        assert_eq!(table.banners.stream_for_port(25), Some(StreamId::Tls));

        table.set_parameter("heartbleed", b"");
        assert!(table.banners.is_heartbleed);

        // "c3RhdHMNCg==" is "stats\r\n"
        table.set_parameter("hello-string[11211]", b"c3RhdHMNCg==");
        assert_eq!(
            table.banners.stream_for_port(11211),
            Some(StreamId::Custom(11211))
        );
        assert_eq!(
            table.banners.stream(StreamId::Custom(11211)).hello(),
            b"stats\r\n"
        );
    }

    #[test]
    fn http_header_setter() {
        let (mut table, _) = table();
        table.set_http_header("User-Agent", b"x/1", FieldAction::Replace);
        let hello = table.banners.http.request();
        assert!(hello
            .windows(b"User-Agent: x/1\r\n".len())
            .any(|w| w == b"User-Agent: x/1\r\n"));
    }
}
