//! TCP wire utilities: header and option codecs, sequence arithmetic,
//! state encoding.
//!
//! Pure protocol helpers with no connection state; the endpoint engine
//! lives in [`tcp_pcb`](crate::tcp_pcb).

use bitflags::bitflags;

use crate::buf::BufRef;
use crate::checksum::{ChecksumAccum, add_chain};
use crate::config::MIN_ALLOWED_MSS;
use crate::types::{Ipv4Addr, Port};
use crate::{TCP_HEADER_LEN, TCP_HEADER_MAX_LEN};

// =============================================================================
// Sequence arithmetic
// =============================================================================

/// TCP sequence number (wrapping 32-bit space).
pub type SeqNum = u32;

#[inline]
pub const fn seq_add(a: SeqNum, b: SeqNum) -> SeqNum {
    a.wrapping_add(b)
}

#[inline]
pub const fn seq_diff(a: SeqNum, b: SeqNum) -> SeqNum {
    a.wrapping_sub(b)
}

/// Saturating add within one wrap.
#[inline]
pub const fn seq_add_sat(a: SeqNum, b: SeqNum) -> SeqNum {
    match a.checked_add(b) {
        Some(sum) => sum,
        None => SeqNum::MAX,
    }
}

/// `a <= b` relative to the reference point `ref_`.
#[inline]
pub const fn seq_lte(a: SeqNum, b: SeqNum, ref_: SeqNum) -> bool {
    seq_diff(a, ref_) <= seq_diff(b, ref_)
}

/// `a < b` relative to the reference point `ref_`.
#[inline]
pub const fn seq_lt(a: SeqNum, b: SeqNum, ref_: SeqNum) -> bool {
    seq_diff(a, ref_) < seq_diff(b, ref_)
}

/// `a < b` with `a` assumed within half a wrap of `b`.
#[inline]
pub const fn seq_lt2(a: SeqNum, b: SeqNum) -> bool {
    seq_diff(a, b) >= 1 << 31
}

/// Whether `x` lies in the half-open interval `(start, start + length]`
/// in modular arithmetic.
#[inline]
pub const fn in_open_closed_interval(start: SeqNum, length: SeqNum, x: SeqNum) -> bool {
    x.wrapping_add(!start) < length
}

// =============================================================================
// Flags
// =============================================================================

bitflags! {
    /// TCP header flag bits (low 6 bits of header byte 13).
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct TcpFlags: u8 {
        const FIN = 0x01;
        const SYN = 0x02;
        const RST = 0x04;
        const PSH = 0x08;
        const ACK = 0x10;
        const URG = 0x20;
    }
}

/// Sequence length of a segment: data plus one for SYN or FIN.
#[inline]
pub fn tcp_seq_len(flags: TcpFlags, data_len: usize) -> usize {
    data_len + (flags.intersects(TcpFlags::SYN | TcpFlags::FIN)) as usize
}

// =============================================================================
// States
// =============================================================================

/// TCP connection states.
///
/// The discriminants are bit patterns chosen so the predicates below are
/// single mask/shift tests.  `FinWait2TimeWait` is not a standard state:
/// it is occupied transiently after a FIN arrives in FinWait2, while user
/// callbacks still have to run, and decays to TimeWait immediately after.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum TcpState {
    Closed = 0b0101,
    SynSent = 0b1101,
    SynRcvd = 0b1100,
    Established = 0b0000,
    CloseWait = 0b0001,
    LastAck = 0b1000,
    FinWait1 = 0b0010,
    FinWait2 = 0b0100,
    FinWait2TimeWait = 0b1111,
    Closing = 0b1011,
    TimeWait = 0b1110,
}

impl TcpState {
    /// Neither closed, opening, nor lingering.
    #[inline]
    pub const fn is_active(self) -> bool {
        !matches!(
            self,
            Self::Closed | Self::SynSent | Self::SynRcvd | Self::TimeWait
        )
    }

    /// SynSent or SynRcvd, as one shift-and-compare.
    #[inline]
    pub const fn is_synsent_or_synrcvd(self) -> bool {
        (self as u8) >> 1 == 0b110
    }

    /// States in which incoming data is accepted: Established, FinWait1,
    /// FinWait2.
    #[inline]
    pub const fn accepting_data(self) -> bool {
        (self as u8) & 0b1001 == 0
    }

    /// States in which we may transmit data or FIN: Established, FinWait1,
    /// Closing, CloseWait, LastAck.
    #[inline]
    pub const fn can_output(self) -> bool {
        (self as u8) & 0b0100 == 0
    }

    /// States in which the send direction is still open: Established,
    /// CloseWait.
    #[inline]
    pub const fn snd_open(self) -> bool {
        (self as u8) >> 1 == 0
    }

    pub const fn name(self) -> &'static str {
        match self {
            Self::Closed => "CLOSED",
            Self::SynSent => "SYN_SENT",
            Self::SynRcvd => "SYN_RCVD",
            Self::Established => "ESTABLISHED",
            Self::CloseWait => "CLOSE_WAIT",
            Self::LastAck => "LAST_ACK",
            Self::FinWait1 => "FIN_WAIT_1",
            Self::FinWait2 => "FIN_WAIT_2",
            Self::FinWait2TimeWait => "FIN_WAIT_2_TIME_WAIT",
            Self::Closing => "CLOSING",
            Self::TimeWait => "TIME_WAIT",
        }
    }
}

// =============================================================================
// Header codec
// =============================================================================

/// Parsed TCP header, multi-byte fields in host order.
#[derive(Clone, Copy, Debug)]
pub struct TcpHeader {
    pub src_port: Port,
    pub dst_port: Port,
    pub seq_num: SeqNum,
    pub ack_num: SeqNum,
    /// Header length in bytes (20..=60).
    pub header_len: usize,
    pub flags: TcpFlags,
    pub window_size: u16,
    pub urgent_ptr: u16,
}

/// Parse a TCP header from the start of a contiguous slice.
///
/// Returns `None` if the slice is short or the data offset invalid.
pub fn parse_header(data: &[u8]) -> Option<TcpHeader> {
    if data.len() < TCP_HEADER_LEN {
        return None;
    }
    let data_offset = (data[12] >> 4) as usize;
    let header_len = data_offset * 4;
    if !(TCP_HEADER_LEN..=TCP_HEADER_MAX_LEN).contains(&header_len) || data.len() < header_len {
        return None;
    }
    Some(TcpHeader {
        src_port: Port::from_network_bytes([data[0], data[1]]),
        dst_port: Port::from_network_bytes([data[2], data[3]]),
        seq_num: u32::from_be_bytes([data[4], data[5], data[6], data[7]]),
        ack_num: u32::from_be_bytes([data[8], data[9], data[10], data[11]]),
        header_len,
        flags: TcpFlags::from_bits_truncate(data[13]),
        window_size: u16::from_be_bytes([data[14], data[15]]),
        urgent_ptr: u16::from_be_bytes([data[18], data[19]]),
    })
}

/// Write a TCP header into `out[..header_len]`, checksum field zero.
pub fn write_header(out: &mut [u8], hdr: &TcpHeader) {
    debug_assert!(hdr.header_len >= TCP_HEADER_LEN && hdr.header_len % 4 == 0);
    debug_assert!(out.len() >= hdr.header_len);
    out[0..2].copy_from_slice(&hdr.src_port.to_network_bytes());
    out[2..4].copy_from_slice(&hdr.dst_port.to_network_bytes());
    out[4..8].copy_from_slice(&hdr.seq_num.to_be_bytes());
    out[8..12].copy_from_slice(&hdr.ack_num.to_be_bytes());
    out[12] = ((hdr.header_len / 4) as u8) << 4;
    out[13] = hdr.flags.bits();
    out[14..16].copy_from_slice(&hdr.window_size.to_be_bytes());
    out[16..18].copy_from_slice(&[0, 0]);
    out[18..20].copy_from_slice(&hdr.urgent_ptr.to_be_bytes());
}

// =============================================================================
// Options
// =============================================================================

pub const TCP_OPT_END: u8 = 0;
pub const TCP_OPT_NOP: u8 = 1;
pub const TCP_OPT_MSS: u8 = 2;
pub const TCP_OPT_WND_SCALE: u8 = 3;

bitflags! {
    /// Which options were seen / should be written.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct OptionFlags: u8 {
        const MSS = 1 << 0;
        const WND_SCALE = 1 << 1;
    }
}

/// The TCP options the stack cares about.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpOptions {
    pub options: OptionFlags,
    pub wnd_scale: u8,
    pub mss: u16,
}

/// Bytes the MSS option occupies when written.
pub const OPT_WRITE_LEN_MSS: usize = 4;
/// Bytes the window-scale option occupies when written (NOP-padded).
pub const OPT_WRITE_LEN_WND_SCALE: usize = 4;
/// Upper bound for written options.
pub const MAX_OPTIONS_WRITE_LEN: usize = OPT_WRITE_LEN_MSS + OPT_WRITE_LEN_WND_SCALE;

/// Parse the options region of a received segment.
///
/// Unknown options are skipped by their length byte; malformed regions
/// terminate parsing with whatever was recognized so far.
pub fn parse_options(mut buf: BufRef, out: &mut TcpOptions) {
    out.options = OptionFlags::empty();

    while buf.total_len() > 0 {
        let kind = buf.take_byte();

        if kind == TCP_OPT_END {
            break;
        }
        if kind == TCP_OPT_NOP {
            continue;
        }

        if buf.total_len() == 0 {
            break;
        }
        let length = buf.take_byte();
        if length < 2 {
            break;
        }
        let opt_data_len = (length - 2) as usize;
        if buf.total_len() < opt_data_len {
            break;
        }

        match kind {
            TCP_OPT_MSS => {
                if opt_data_len != 2 {
                    buf.skip_bytes(opt_data_len);
                    continue;
                }
                let mut b = [0u8; 2];
                buf.take_bytes(2, &mut b);
                out.options |= OptionFlags::MSS;
                out.mss = u16::from_be_bytes(b);
            }
            TCP_OPT_WND_SCALE => {
                if opt_data_len != 1 {
                    buf.skip_bytes(opt_data_len);
                    continue;
                }
                out.options |= OptionFlags::WND_SCALE;
                out.wnd_scale = buf.take_byte();
            }
            _ => {
                buf.skip_bytes(opt_data_len);
            }
        }
    }
}

/// Bytes [`write_options`] will produce; always a multiple of 4.
pub fn calc_options_len(opts: &TcpOptions) -> usize {
    let mut len = 0;
    if opts.options.contains(OptionFlags::MSS) {
        len += OPT_WRITE_LEN_MSS;
    }
    if opts.options.contains(OptionFlags::WND_SCALE) {
        len += OPT_WRITE_LEN_WND_SCALE;
    }
    debug_assert!(len % 4 == 0);
    len
}

/// Serialize options, 4-byte aligned (window scale is NOP-padded).
pub fn write_options(opts: &TcpOptions, out: &mut [u8]) {
    let mut at = 0;
    if opts.options.contains(OptionFlags::MSS) {
        out[at] = TCP_OPT_MSS;
        out[at + 1] = 4;
        out[at + 2..at + 4].copy_from_slice(&opts.mss.to_be_bytes());
        at += OPT_WRITE_LEN_MSS;
    }
    if opts.options.contains(OptionFlags::WND_SCALE) {
        out[at] = TCP_OPT_NOP;
        out[at + 1] = TCP_OPT_WND_SCALE;
        out[at + 2] = 3;
        out[at + 3] = opts.wnd_scale;
        at += OPT_WRITE_LEN_WND_SCALE;
    }
    debug_assert!(at <= out.len());
}

// =============================================================================
// Derived connection parameters
// =============================================================================

/// Negotiated send MSS: the interface limit capped by what the peer
/// announced (536 if it announced nothing).  `None` if below the floor —
/// the connection must be refused rather than run with a degenerate MSS.
pub fn calc_snd_mss(iface_mss: u16, opts: &TcpOptions) -> Option<u16> {
    let req_mss = if opts.options.contains(OptionFlags::MSS) {
        opts.mss
    } else {
        536
    };
    let mss = iface_mss.min(req_mss);
    if mss < MIN_ALLOWED_MSS {
        return None;
    }
    Some(mss)
}

/// Initial congestion window per RFC 5681.
pub fn calc_initial_cwnd(snd_mss: u16) -> u32 {
    let mss = snd_mss as u32;
    if snd_mss > 2190 {
        2 * mss
    } else if snd_mss > 1095 {
        3 * mss
    } else {
        4 * mss
    }
}

// =============================================================================
// Checksum
// =============================================================================

/// Checksum of a TCP segment (pseudo-header plus `seg_len` bytes of the
/// chain).  Computed over a built segment with a zero checksum field this
/// yields the value to store; over a received segment it yields 0 iff
/// intact.
pub fn segment_checksum(src: Ipv4Addr, dst: Ipv4Addr, seg: BufRef, seg_len: usize) -> u16 {
    let mut acc = ChecksumAccum::new();
    acc.add_pseudo_header(src, dst, crate::types::IpProtocol::Tcp.as_u8(), seg_len);
    add_chain(&mut acc, seg, seg_len);
    acc.finish()
}

// =============================================================================
// PCB lookup key
// =============================================================================

/// Connection 4-tuple.
///
/// The `Ord` implementation compares `remote_port, remote_addr,
/// local_port, local_addr` — the order needing the fewest comparisons for
/// typical server workloads, where local port and address are shared by
/// many connections.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct PcbKey {
    pub local_addr: Ipv4Addr,
    pub remote_addr: Ipv4Addr,
    pub local_port: Port,
    pub remote_port: Port,
}

impl Ord for PcbKey {
    fn cmp(&self, other: &Self) -> core::cmp::Ordering {
        self.remote_port
            .cmp(&other.remote_port)
            .then_with(|| self.remote_addr.cmp(&other.remote_addr))
            .then_with(|| self.local_port.cmp(&other.local_port))
            .then_with(|| self.local_addr.cmp(&other.local_addr))
    }
}

impl PartialOrd for PcbKey {
    fn partial_cmp(&self, other: &Self) -> Option<core::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
