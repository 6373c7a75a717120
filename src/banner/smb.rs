//! The SMB negotiate probe.
//!
//! A single Negotiate Protocol Request elicits a dialect announcement from
//! both SMB1-era and SMB2/3 servers; the default hello offers the SMB1
//! dialect alongside the SMB2 wildcards, and can be downgraded to offer the
//! SMB1 dialect alone for scanning legacy-only exposure.
use byteorder::{ByteOrder, LittleEndian, NetworkEndian};

use super::{AppProto, BannerOutput, NetSend, ProtocolStream, Scratch, StreamState};

const DIALECTS_V1_V2: &[&str] = &["NT LM 0.12", "SMB 2.002", "SMB 2.???"];
const DIALECTS_V1_ONLY: &[&str] = &["NT LM 0.12"];

const SMB1_COMMAND_NEGOTIATE: u8 = 0x72;

/// Build a NetBIOS-framed SMB1 Negotiate Protocol Request offering the given
/// dialect strings.
pub fn negotiate_request(dialects: &[&str]) -> Vec<u8> {
    let mut message = Vec::with_capacity(96);
    // NetBIOS session service header, length patched below.
    message.extend_from_slice(&[0x00, 0, 0, 0]);

    // SMB1 header.
    message.extend_from_slice(b"\xffSMB");
    message.push(SMB1_COMMAND_NEGOTIATE);
    message.extend_from_slice(&[0; 4]); // status
    message.push(0x18); // flags: canonical paths, case insensitive
    let mut flags2 = [0u8; 2];
    LittleEndian::write_u16(&mut flags2, 0xc803);
    message.extend_from_slice(&flags2);
    message.extend_from_slice(&[0; 12]); // pid-high, signature, reserved
    message.extend_from_slice(&[0; 2]); // tid
    message.extend_from_slice(&[0xfe, 0xff]); // pid
    message.extend_from_slice(&[0; 2]); // uid
    message.extend_from_slice(&[0; 2]); // mid

    // Parameter block: zero words; data block: the dialect list.
    message.push(0);
    let mut data = Vec::new();
    for dialect in dialects {
        data.push(0x02);
        data.extend_from_slice(dialect.as_bytes());
        data.push(0x00);
    }
    let mut count = [0u8; 2];
    LittleEndian::write_u16(&mut count, data.len() as u16);
    message.extend_from_slice(&count);
    message.extend_from_slice(&data);

    let netbios_len = (message.len() - 4) as u32;
    let mut framed_len = [0u8; 4];
    NetworkEndian::write_u32(&mut framed_len, netbios_len);
    message[1..4].copy_from_slice(&framed_len[1..4]);
    message
}

/// Per-connection SMB scratch, torn down by the cleanup hook.
#[derive(Debug, Default)]
pub struct SmbScratch {
    /// Partial NetBIOS frame carried between payload deliveries.
    pending: Vec<u8>,
}

/// The SMB banner probe.
pub struct SmbStream {
    hello: &'static [u8],
}

impl SmbStream {
    pub fn new() -> SmbStream {
        SmbStream {
            hello: Box::leak(negotiate_request(DIALECTS_V1_V2).into_boxed_slice()),
        }
    }

    /// Downgrade the negotiate to offer the SMB1 dialect only.
    pub fn set_hello_v1(&mut self) {
        self.hello = Box::leak(negotiate_request(DIALECTS_V1_ONLY).into_boxed_slice());
    }
}

impl Default for SmbStream {
    fn default() -> SmbStream {
        SmbStream::new()
    }
}

impl ProtocolStream for SmbStream {
    fn name(&self) -> &'static str {
        "smb"
    }

    fn app_proto(&self) -> AppProto {
        AppProto::Smb
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
        state.app_proto = AppProto::Smb;
        if !matches!(state.scratch, Scratch::Smb(_)) {
            state.scratch = Scratch::Smb(SmbScratch::default());
        }
        if let Scratch::Smb(scratch) = &mut state.scratch {
            scratch.pending.extend_from_slice(payload);
            // Surface complete NetBIOS frames, keep the tail buffered.
            while scratch.pending.len() >= 4 {
                let length = usize::from(scratch.pending[1]) << 16
                    | usize::from(scratch.pending[2]) << 8
                    | usize::from(scratch.pending[3]);
                if scratch.pending.len() < 4 + length {
                    break;
                }
                let frame: Vec<u8> = scratch.pending.drain(..4 + length).collect();
                banout.append(AppProto::Smb, &frame[4..]);
            }
        }
    }

    fn cleanup(&self, state: &mut StreamState) {
        if matches!(state.scratch, Scratch::Smb(_)) {
            state.scratch = Scratch::None;
        }
    }
}
