//! Static stack configuration.
//!
//! Every pool in the stack is sized here at compile time; there is no
//! dynamic allocation on the datapath.  The numbers below suit a small
//! microcontroller deployment with a handful of connections; scale them up
//! for larger targets.

use fathom_lib::clock::ticks_from_secs;
use static_assertions::const_assert;

// =============================================================================
// ARP
// =============================================================================

/// Number of entries in the ARP cache.
pub const NUM_ARP_ENTRIES: usize = 8;

/// Number of cache slots protected for hard (actively resolved) entries.
/// The remainder is the budget for weak (passively learned) entries.
pub const ARP_PROTECT_COUNT: usize = 4;

/// Seconds a Query entry keeps broadcasting before giving up.
pub const ARP_QUERY_TIMEOUT_SECS: u8 = 3;

/// Seconds a Valid entry stays fresh before a use triggers a refresh.
pub const ARP_VALID_TIMEOUT_SECS: u8 = 60;

/// Seconds a Refreshing entry keeps unicasting before falling back to
/// a broadcast Query.
pub const ARP_REFRESH_TIMEOUT_SECS: u8 = 3;

// =============================================================================
// IPv4 / reassembly / PMTU
// =============================================================================

/// Floor for any path MTU the stack will accept or report.
pub const MIN_MTU: u16 = 576;

/// Default TTL for locally originated datagrams.
pub const DEFAULT_TTL: u8 = 64;

/// Number of concurrent reassembly contexts.
pub const NUM_REASM_CONTEXTS: usize = 4;

/// Largest reassembled datagram the stack accepts, in bytes of IP payload.
pub const MAX_REASM_SIZE: usize = 1480;

/// Maximum tracked holes per reassembly context.
pub const NUM_REASM_HOLES: usize = 8;

/// Seconds an incomplete reassembly context stays alive.
pub const REASM_TIMEOUT_SECS: u8 = 15;

/// Number of entries in the path-MTU cache.
pub const NUM_MTU_ENTRIES: usize = 8;

/// Minutes before a PMTU entry times out (Unused entries invalidate,
/// Referenced entries reset to the interface MTU).
pub const MTU_TIMEOUT_MINUTES: u8 = 10;

// =============================================================================
// TCP
// =============================================================================

/// Maximum number of simultaneous connections (PCB slab size).
pub const NUM_TCP_PCBS: usize = 16;

/// Maximum number of listeners.
pub const NUM_TCP_LISTENERS: usize = 4;

/// Out-of-sequence segments tracked per connection.
pub const NUM_OOS_SEGS: usize = 4;

/// Connections a queueing listener can hold before accept.
pub const LISTEN_QUEUE_SIZE: usize = 4;

/// Receive buffer owned by each queued (not yet accepted) connection.
pub const LISTEN_QUEUE_BUF_SIZE: usize = 1024;

/// Connections announcing an MSS below this floor are refused.
pub const MIN_ALLOWED_MSS: u16 = 536;

/// Initial retransmission timeout (RFC 6298 recommends 1 s).
pub const TCP_INITIAL_RTO_TICKS: u32 = ticks_from_secs(1);

/// Lower bound on the retransmission timeout.
pub const TCP_MIN_RTO_TICKS: u32 = ticks_from_secs(1) / 4;

/// Upper bound on the (backed-off) retransmission timeout.
pub const TCP_MAX_RTO_TICKS: u32 = ticks_from_secs(60);

/// Retransmission attempts before the connection is aborted.
pub const TCP_MAX_RETRANSMITS: u8 = 8;

/// TIME_WAIT linger (2 x MSL).
pub const TCP_TIME_WAIT_TICKS: u32 = ticks_from_secs(60);

/// Zero-window probe interval.
pub const TCP_PERSIST_TICKS: u32 = ticks_from_secs(5);

// =============================================================================
// Timers
// =============================================================================

/// Capacity of the shared timer queue: one per PCB, one per listener,
/// plus the three periodic cache sweeps.
pub const NUM_TIMERS: usize = NUM_TCP_PCBS + NUM_TCP_LISTENERS + 3;

const_assert!(ARP_PROTECT_COUNT <= NUM_ARP_ENTRIES);
const_assert!(NUM_ARP_ENTRIES > 0);
const_assert!(NUM_OOS_SEGS > 0);
const_assert!(NUM_MTU_ENTRIES > 0);
const_assert!(MTU_TIMEOUT_MINUTES > 0);
const_assert!(MAX_REASM_SIZE % 8 == 0);
const_assert!(MIN_ALLOWED_MSS as usize <= MAX_REASM_SIZE);
