//! Listen queue: holding area for handshake-complete connections that the
//! application has not accepted yet.
//!
//! A queued listener parks each fresh connection in a [`QueueEntry`] with
//! a statically sized receive buffer, so the peer can start streaming
//! immediately.  The entry is *not ready* until the first non-empty data
//! delivery; a FIN arriving before any data aborts the queued connection
//! (a peer that connects and immediately closes has nothing to accept).
//! An aging timer per listener resets the oldest not-ready connection
//! after the configured timeout, bounding how long a silent peer can sit
//! on a slot.
//!
//! On accept the oldest ready connection is handed to the application
//! together with the buffered in-order bytes, which are copied out
//! immediately — the entry buffer is recycled by the handover.  Ranges
//! that had arrived out of order are forgotten (they were never
//! acknowledged; retransmission recovers them), and the application must
//! attach its own receive buffer before the peer's window reopens.

use fathom_lib::clock::Instant;
use log::{debug, trace};

use crate::buf::{BufNode, BufRef};
use crate::config::{LISTEN_QUEUE_BUF_SIZE, LISTEN_QUEUE_SIZE, NUM_TCP_LISTENERS};
use crate::eth::EthDriver;
use crate::stack::TimerKind;
use crate::tcp_pcb::{ConnId, ListenerId, TcpCtx, TcpEvents};
use crate::tcp_stack::{TcpStack, abort_pcb};
use crate::types::NetError;

/// Total queue entries, shared by all listeners with a per-listener cap.
const NUM_QUEUE_ENTRIES: usize = NUM_TCP_LISTENERS * LISTEN_QUEUE_SIZE;

// =============================================================================
// Entries
// =============================================================================

struct QueueEntry {
    used: bool,
    listener: u8,
    conn: ConnId,
    /// Flips on the first non-empty data delivery.
    ready: bool,
    arrival: Instant,
    /// Node describing `buf`; the connection's receive reference points
    /// through it while queued.
    node: BufNode,
    buf: [u8; LISTEN_QUEUE_BUF_SIZE],
}

impl QueueEntry {
    const fn unused() -> Self {
        Self {
            used: false,
            listener: 0,
            conn: ConnId { idx: 0, generation: 0 },
            ready: false,
            arrival: Instant::ZERO,
            node: BufNode::empty(),
            buf: [0; LISTEN_QUEUE_BUF_SIZE],
        }
    }
}

pub(crate) struct ListenQueue {
    entries: [QueueEntry; NUM_QUEUE_ENTRIES],
}

impl ListenQueue {
    pub(crate) fn new() -> Self {
        Self {
            entries: [const { QueueEntry::unused() }; NUM_QUEUE_ENTRIES],
        }
    }

    /// Whether `listener` may park another connection.
    pub(crate) fn has_room(&self, listener: usize) -> bool {
        self.entries
            .iter()
            .filter(|e| e.used && e.listener == listener as u8)
            .count()
            < LISTEN_QUEUE_SIZE
    }

    fn oldest(&self, listener: usize, ready: bool) -> Option<usize> {
        self.entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.used && e.listener == listener as u8 && e.ready == ready)
            .min_by_key(|(_, e)| e.arrival.0)
            .map(|(i, _)| i)
    }
}

// =============================================================================
// Attach / release
// =============================================================================

/// Park a freshly established connection in the queue.  Returns `false`
/// when no entry is free (the SYN-time reservation check raced out).
pub(crate) fn attach<D: EthDriver>(tcp: &mut TcpStack, ctx: &mut TcpCtx<'_, D>, idx: usize) -> bool {
    let listener = match tcp.pcbs[idx].listener {
        Some(l) => l,
        None => return false,
    };
    let Some(e) = tcp.queue.entries.iter().position(|e| !e.used) else {
        return false;
    };
    if !tcp.queue.has_room(listener as usize) {
        return false;
    }

    let conn = tcp.pcbs[idx].id;
    {
        let entry = &mut tcp.queue.entries[e];
        entry.used = true;
        entry.listener = listener;
        entry.conn = conn;
        entry.ready = false;
        entry.arrival = ctx.now;
        entry.node = BufNode::from_slice_mut(&mut entry.buf);
    }
    {
        let pcb = &mut tcp.pcbs[idx];
        pcb.queue_entry = e as u8;
        pcb.rcv.buf = BufRef::new(&tcp.queue.entries[e].node, 0, LISTEN_QUEUE_BUF_SIZE);
    }
    trace!("tcp: connection parked in listen queue (entry {})", e);

    // A new not-ready connection changes the aging deadline.
    update_timeout(tcp, ctx, listener as usize);
    true
}

/// Return a queue entry to the pool and refresh the aging timer.
pub(crate) fn release_entry<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    entry: usize,
) {
    if !tcp.queue.entries[entry].used {
        return;
    }
    let listener = tcp.queue.entries[entry].listener as usize;
    let was_ready = tcp.queue.entries[entry].ready;
    tcp.queue.entries[entry].used = false;
    if !was_ready {
        update_timeout(tcp, ctx, listener);
    }
}

// =============================================================================
// Data-arrival hook
// =============================================================================

/// Receive-side delivery for a queued connection.  `amount == 0` is the
/// peer's FIN.  Returns `false` when the connection was torn down.
pub(crate) fn on_queued_data<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    idx: usize,
    amount: usize,
) -> bool {
    let entry = tcp.pcbs[idx].queue_entry as usize;
    debug_assert!(tcp.queue.entries[entry].used);

    if amount == 0 {
        let buffered = LISTEN_QUEUE_BUF_SIZE - tcp.pcbs[idx].rcv.buf.total_len();
        if buffered == 0 {
            // FIN before any data: nothing worth accepting.
            debug!("tcp: queued connection closed before data, dropping");
            abort_pcb(tcp, ctx, events, idx, NetError::ConnectionClosed, true);
            return false;
        }
        // FIN after data: the connection stays acceptable, EOF included.
        return true;
    }

    if !tcp.queue.entries[entry].ready {
        let listener = tcp.queue.entries[entry].listener;
        tcp.queue.entries[entry].ready = true;
        update_timeout(tcp, ctx, listener as usize);
        events.listen_ready(ListenerId(listener));
    }
    true
}

// =============================================================================
// Aging
// =============================================================================

/// (Re)arm the listener's aging timer for its oldest not-ready entry, or
/// disarm it when none remains.
pub(crate) fn update_timeout<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    listener: usize,
) {
    match tcp.queue.oldest(listener, false) {
        Some(e) => {
            let timeout = tcp.listeners[listener].queue_timeout;
            let age = ctx.now.since(tcp.queue.entries[e].arrival);
            let remaining = timeout.saturating_sub(age).max(1);
            ctx.timers
                .arm(ctx.now, remaining, TimerKind::ListenQueue, listener as u32);
        }
        None => ctx.timers.disarm(TimerKind::ListenQueue, listener as u32),
    }
}

/// Aging expiry: reset the oldest not-ready connection of this listener.
pub(crate) fn on_queue_timer<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    events: &mut dyn TcpEvents<D>,
    listener: u32,
) {
    let listener = listener as usize;
    if listener >= NUM_TCP_LISTENERS {
        return;
    }
    let Some(e) = tcp.queue.oldest(listener, false) else {
        return;
    };
    let conn = tcp.queue.entries[e].conn;
    let Some(idx) = tcp.conn_slot(conn) else {
        // Stale entry; drop it.
        release_entry(tcp, ctx, e);
        return;
    };
    debug!("tcp: listen-queue entry timed out, resetting connection");
    abort_pcb(tcp, ctx, events, idx, NetError::Timeout, true);
}

// =============================================================================
// Accept
// =============================================================================

/// Hand the oldest ready connection of `listener` to the application.
///
/// The buffered in-order bytes are copied into `initial_data`, which must
/// be at least [`LISTEN_QUEUE_BUF_SIZE`] long — acknowledged data cannot
/// be dropped.  The connection's receive buffer is detached; the caller
/// must attach its own via the connection handle before the peer can make
/// progress.
pub(crate) fn accept_into<D: EthDriver>(
    tcp: &mut TcpStack,
    ctx: &mut TcpCtx<'_, D>,
    listener: ListenerId,
    initial_data: &mut [u8],
) -> Result<(ConnId, usize), NetError> {
    let li = listener.0 as usize;
    if li >= NUM_TCP_LISTENERS || !tcp.listeners[li].active {
        return Err(NetError::InvalidArgument);
    }
    let Some(e) = tcp.queue.oldest(li, true) else {
        return Err(NetError::WouldBlock);
    };
    let conn = tcp.queue.entries[e].conn;
    let Some(idx) = tcp.conn_slot(conn) else {
        release_entry(tcp, ctx, e);
        return Err(NetError::WouldBlock);
    };

    let buffered = LISTEN_QUEUE_BUF_SIZE - tcp.pcbs[idx].rcv.buf.total_len();
    if initial_data.len() < buffered {
        return Err(NetError::InvalidArgument);
    }
    initial_data[..buffered].copy_from_slice(&tcp.queue.entries[e].buf[..buffered]);

    {
        let pcb = &mut tcp.pcbs[idx];
        pcb.queued = false;
        pcb.rcv.buf = BufRef::empty();
        // Out-of-order ranges lived in the entry buffer; they were never
        // acknowledged, so forgetting them is safe.
        pcb.ooseq.init();
    }
    tcp.queue.entries[e].used = false;

    debug!("tcp: accepted queued connection with {} initial bytes", buffered);
    Ok((conn, buffered))
}
