use std::cmp::min;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use tokio::sync::RwLock;
use tracing::{trace, warn};

use crate::messaging::message::Message;
use crate::messaging::node_addr::NodeAddr;
use crate::nak::interval::Interval;
use crate::nak::retransmit_table::{RetransmitTable, XmitTableConfig};
use crate::nak::retransmitter::{RetransmitCommand, Retransmitter};
use crate::util::scheduler::TimeScheduler;

/// Observer of gap events on a [NakWindow].
///
/// Callbacks are invoked strictly outside the window's lock, so a listener may call back into
///  the window (e.g. to take a digest) without deadlocking.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NakWindowListener: Send + Sync + 'static {
    /// a seqno that was registered as missing has finally arrived
    async fn missing_message_received(&self, seqno: u64, original_sender: NodeAddr);
    /// a message arrived ahead of the expected next seqno; `[from..to)` is now known missing
    async fn message_gap_detected(&self, from: u64, to: u64, src: NodeAddr);
}

/// Snapshot of a window's progress: all seqnos <= `low` are stable and purged, all seqnos <=
///  `highest_delivered` were consumed by the application, `highest_received` is the highest
///  seqno ever inserted. `low <= highest_delivered <= highest_received` always holds.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Digest {
    pub low: u64,
    pub highest_delivered: u64,
    pub highest_received: u64,
}

/// Per-sender receive window ordering a stream of multicast messages by seqno.
///
/// Messages can be added out of order and with gaps. When a gap is detected, the missing
///  seqnos are handed to a [Retransmitter] that keeps requesting them on an escalating timer
///  until they arrive. [NakWindow::remove] and [NakWindow::remove_many] deliver messages
///  strictly in seqno order starting at `highest_delivered + 1`; [NakWindow::stable] reclaims
///  messages that every group member has delivered.
///
/// The first seqno a sender assigns is 1; seqno 0 means "none".
///
/// All operations are safe under concurrent invocation: state lives behind one read/write
///  lock, with digest and getters taking the read side. Listener callbacks are dispatched
///  after the write guard is dropped.
pub struct NakWindow {
    sender: NodeAddr,
    /// Drain coordination flag for the upper layer: whoever flips it false->true drains the
    ///  window. The window itself only clears it when a drain comes up empty.
    processing: AtomicBool,
    inner: RwLock<WindowInner>,
}

struct WindowInner {
    running: bool,

    /// everything <= low is stable and purged; advances on stable()
    low: u64,
    /// the highest seqno consumed by the application; the next deliverable seqno is
    ///  highest_delivered + 1
    highest_delivered: u64,
    /// the highest seqno ever inserted, gaps notwithstanding
    highest_received: u64,
    /// high-water mark of stability notices
    highest_stability_seqno: u64,

    smoothed_loss_rate: f64,

    xmit_table: RetransmitTable,
    /// absent if the upper protocol does its own retransmission
    retransmitter: Option<Retransmitter>,
    listener: Option<Arc<dyn NakWindowListener>>,
}

enum ListenerNotification {
    MissingMessageReceived(Arc<dyn NakWindowListener>, u64),
    MessageGapDetected(Arc<dyn NakWindowListener>, u64, u64),
}

impl NakWindow {
    /// Creates a window for `sender`, initialized from a digest position: the next seqno to
    ///  deliver is `highest_delivered_seqno + 1`, everything at or below `lowest_seqno` is
    ///  already stable.
    ///
    /// Without a `retransmit_command` no retransmitter is run. The scheduler is required;
    ///  construction fails without one.
    pub fn new(
        sender: NodeAddr,
        retransmit_command: Option<Arc<dyn RetransmitCommand>>,
        highest_delivered_seqno: u64,
        lowest_seqno: u64,
        scheduler: Option<Arc<TimeScheduler>>,
        use_range_based_retransmitter: bool,
        table_config: &XmitTableConfig,
    ) -> anyhow::Result<NakWindow> {
        let Some(scheduler) = scheduler else {
            bail!("a time scheduler has to be provided");
        };

        let low = min(lowest_seqno, highest_delivered_seqno);

        let retransmitter = retransmit_command.map(|cmd| {
            if use_range_based_retransmitter {
                Retransmitter::new_range_based(sender, cmd, scheduler.clone())
            }
            else {
                Retransmitter::new_default(sender, cmd, scheduler.clone())
            }
        });

        Ok(NakWindow {
            sender,
            processing: AtomicBool::new(false),
            inner: RwLock::new(WindowInner {
                running: true,
                low,
                highest_delivered: highest_delivered_seqno,
                highest_received: highest_delivered_seqno,
                highest_stability_seqno: 0,
                smoothed_loss_rate: 0.0,
                xmit_table: RetransmitTable::new(table_config, low),
                retransmitter,
                listener: None,
            }),
        })
    }

    pub fn sender(&self) -> NodeAddr {
        self.sender
    }

    /// the upper layer's "one drainer at a time" flag; see [NakWindow::remove_many]
    pub fn processing(&self) -> &AtomicBool {
        &self.processing
    }

    pub async fn set_listener(&self, listener: Option<Arc<dyn NakWindowListener>>) {
        self.inner.write().await.listener = listener;
    }

    /// installs the backoff sequence used for missing seqnos registered from now on
    pub async fn set_retransmit_timeouts(&self, timeouts: Interval) {
        if let Some(retransmitter) = &mut self.inner.write().await.retransmitter {
            retransmitter.set_retransmit_timeouts(timeouts);
        }
    }

    /// Inserts a received message at its seqno. There are four cases:
    ///
    /// 1. the expected next seqno: stored, `highest_received` advances
    /// 2. a seqno that was already delivered: discarded, returns false
    /// 3. a seqno filling a known gap: stored unless a duplicate beat it to the slot, and
    ///    deregistered from the retransmitter
    /// 4. a seqno ahead of the expected next: stored, and the skipped range is registered with
    ///    the retransmitter as missing
    ///
    /// Returns true if the message was inserted. Once the window is destroyed, all adds are
    ///  refused.
    pub async fn add(&self, seqno: u64, msg: Message) -> bool {
        let src = msg.src();
        let notification;

        {
            let mut inner = self.inner.write().await;
            if !inner.running {
                return false;
            }

            let next_to_add = inner.highest_received + 1;

            if seqno == next_to_add {
                // case 1: the expected seqno, by far the most common path
                inner.xmit_table.put(seqno, msg);
                inner.highest_received = seqno;
                inner.update_smoothed_loss_rate();
                return true;
            }

            if seqno <= inner.highest_delivered {
                // case 2: already delivered
                trace!("seqno {} was already delivered - discarding", seqno);
                return false;
            }

            if seqno < next_to_add {
                // case 3: fills a known gap. Case 2 handled seqno <= highest_delivered, so the
                //  slot exists and is null unless a duplicate won the race for it.
                if inner.xmit_table.put_if_absent(seqno, msg).is_some() {
                    trace!("seqno {} is already buffered - discarding duplicate", seqno);
                    return false;
                }
                if let Some(retransmitter) = &mut inner.retransmitter {
                    retransmitter.remove(seqno);
                }
                trace!("added missing message {:?}#{}", src, seqno);
                inner.update_smoothed_loss_rate();
                notification = inner.listener.clone()
                    .map(|listener| ListenerNotification::MissingMessageReceived(listener, seqno));
            }
            else {
                // case 4: ahead of the expected seqno; all slots in [next_to_add..seqno) are
                //  null and become the retransmitter's business
                inner.xmit_table.put(seqno, msg);
                if let Some(retransmitter) = &mut inner.retransmitter {
                    retransmitter.add(next_to_add, seqno - 1);
                }
                inner.highest_received = seqno;
                inner.update_smoothed_loss_rate();
                notification = inner.listener.clone()
                    .map(|listener| ListenerNotification::MessageGapDetected(listener, next_to_add, seqno));
            }
        }

        // listener callbacks happen outside the lock so they can call back into the window
        match notification {
            Some(ListenerNotification::MissingMessageReceived(listener, seqno)) => {
                listener.missing_message_received(seqno, src).await;
            }
            Some(ListenerNotification::MessageGapDetected(listener, from, to)) => {
                listener.message_gap_detected(from, to, src).await;
            }
            None => {}
        }
        true
    }

    /// Returns the message at `highest_delivered + 1` and advances `highest_delivered`, or
    ///  `None` if that slot is null or missing. The message stays in the table until it becomes
    ///  stable; use [NakWindow::remove_many] with `discard_msgs` to drop messages on delivery.
    pub async fn remove(&self) -> Option<Message> {
        self.inner.write().await.remove_next(false)
    }

    /// like [NakWindow::remove], but `discard_msg` chooses whether the slot is physically
    ///  removed from the table or merely read
    pub async fn remove_with(&self, discard_msg: bool) -> Option<Message> {
        self.inner.write().await.remove_next(discard_msg)
    }

    /// Greedily drains deliverable messages in seqno order, stopping at the first null slot or
    ///  after `max_results` messages (0 = unbounded). Returns `None` rather than an empty list
    ///  when nothing is deliverable, clearing `processing` (if provided) in the same breath so
    ///  a racing adder knows the drainer is gone.
    pub async fn remove_many(&self, processing: Option<&AtomicBool>, discard_msgs: bool, max_results: usize) -> Option<Vec<Message>> {
        let mut inner = self.inner.write().await;

        let mut result = Vec::new();
        while let Some(msg) = inner.remove_next(discard_msgs) {
            result.push(msg);
            if max_results > 0 && result.len() >= max_results {
                break;
            }
        }

        if result.is_empty() {
            if let Some(flag) = processing {
                flag.store(false, Ordering::SeqCst);
            }
            return None;
        }
        Some(result)
    }

    /// Marks all seqnos <= `seqno` as globally delivered: they are purged from the table and
    ///  deregistered from the retransmitter, and `low` advances. Stability cannot outrun local
    ///  delivery; a seqno above `highest_delivered` is a caller bug and is ignored.
    pub async fn stable(&self, seqno: u64) {
        let mut inner = self.inner.write().await;

        if seqno > inner.highest_delivered {
            warn!("stability seqno {} is > highest_delivered ({}) - ignoring stability message",
                seqno, inner.highest_delivered);
            return;
        }

        inner.xmit_table.purge(seqno);

        let low = inner.low;
        if let Some(retransmitter) = &mut inner.retransmitter {
            for s in low..=seqno {
                retransmitter.remove(s);
            }
        }

        inner.highest_stability_seqno = inner.highest_stability_seqno.max(seqno);
        inner.low = inner.low.max(seqno);
    }

    /// Terminal shutdown. Further adds are refused; all retransmit requests are cancelled and
    ///  all buffered messages dropped. Idempotent.
    pub async fn destroy(&self) {
        let mut inner = self.inner.write().await;

        inner.running = false;
        if let Some(retransmitter) = &mut inner.retransmitter {
            retransmitter.reset();
        }
        inner.xmit_table.clear();
        inner.low = 0;
        inner.highest_delivered = 0;
        inner.highest_received = 0;
        inner.highest_stability_seqno = 0;
    }

    pub async fn get_digest(&self) -> Digest {
        let inner = self.inner.read().await;
        Digest {
            low: inner.low,
            highest_delivered: inner.highest_delivered,
            highest_received: inner.highest_received,
        }
    }

    pub async fn get_lowest_seen(&self) -> u64 {
        self.inner.read().await.low
    }

    pub async fn get_highest_delivered(&self) -> u64 {
        self.inner.read().await.highest_delivered
    }

    pub async fn get_highest_received(&self) -> u64 {
        self.inner.read().await.highest_received
    }

    /// Unconditionally overwrites `highest_delivered`, returning the previous value. Used by
    ///  protocol bootstrap to position the window from a received digest; `low` and
    ///  `highest_received` are untouched.
    pub async fn set_highest_delivered(&self, new_value: u64) -> u64 {
        let mut inner = self.inner.write().await;
        std::mem::replace(&mut inner.highest_delivered, new_value)
    }

    pub async fn get(&self, seqno: u64) -> Option<Message> {
        self.inner.read().await.xmit_table.get(seqno).cloned()
    }

    /// all buffered messages in `[from..=to]`, in seqno order, or `None` if there are none
    pub async fn get_range(&self, from: u64, to: u64) -> Option<Vec<Message>> {
        self.inner.read().await.xmit_table.get_range(from, to)
    }

    /// the number of buffered messages
    pub async fn size(&self) -> usize {
        self.inner.read().await.xmit_table.size()
    }

    /// the number of distinct missing seqnos currently registered for retransmission
    pub async fn get_pending_xmits(&self) -> usize {
        self.inner.read().await.pending_xmits()
    }

    /// pending retransmit requests relative to the number of buffered messages, 0.0 if either
    ///  is zero
    pub async fn get_loss_rate(&self) -> f64 {
        self.inner.read().await.loss_rate()
    }

    /// exponentially weighted loss rate: 70% of the latest sample, 30% of the previous value
    pub async fn get_smoothed_loss_rate(&self) -> f64 {
        self.inner.read().await.smoothed_loss_rate
    }

    pub async fn compact(&self) {
        self.inner.write().await.xmit_table.compact();
    }

    pub async fn retransmit_table_size(&self) -> usize {
        self.inner.read().await.xmit_table.size()
    }

    pub async fn retransmit_table_capacity(&self) -> usize {
        self.inner.read().await.xmit_table.capacity()
    }

    pub async fn retransmit_table_fill_factor(&self) -> f64 {
        self.inner.read().await.xmit_table.fill_factor()
    }

    pub async fn print(&self) -> String {
        let inner = self.inner.read().await;

        let mut result = format!("[{} : {} ({})", inner.low, inner.highest_delivered, inner.highest_received);
        if !inner.xmit_table.is_empty() {
            let missing = inner.xmit_table.get_null_messages(inner.highest_received);
            result.push_str(&format!(" (size={}, missing={}, highest stability={})",
                inner.xmit_table.size(), missing, inner.highest_stability_seqno));
        }
        result.push(']');
        result
    }

    pub async fn print_loss_rate(&self) -> String {
        let inner = self.inner.read().await;

        let num_missing = inner.pending_xmits();
        let num_received = inner.xmit_table.size();
        format!("total={} (received={}, missing={}), loss rate={}, smoothed loss rate={}",
            num_missing + num_received, num_received, num_missing, inner.loss_rate(), inner.smoothed_loss_rate)
    }

    pub async fn print_retransmit_stats(&self) -> String {
        match &self.inner.read().await.retransmitter {
            Some(retransmitter) => retransmitter.print_stats(),
            None => "n/a".to_string(),
        }
    }
}

impl WindowInner {
    fn remove_next(&mut self, discard_msg: bool) -> Option<Message> {
        let next = self.highest_delivered + 1;
        let msg = if discard_msg {
            self.xmit_table.remove(next)
        }
        else {
            self.xmit_table.get(next).cloned()
        };

        if msg.is_some() {
            self.highest_delivered = next;
        }
        msg
    }

    fn pending_xmits(&self) -> usize {
        self.retransmitter.as_ref()
            .map(|retransmitter| retransmitter.size())
            .unwrap_or(0)
    }

    fn loss_rate(&self) -> f64 {
        let total_msgs = self.xmit_table.size();
        let pending = self.pending_xmits();
        if pending == 0 || total_msgs == 0 {
            return 0.0;
        }
        pending as f64 / total_msgs as f64
    }

    fn update_smoothed_loss_rate(&mut self) {
        let new_loss_rate = self.loss_rate();
        if self.smoothed_loss_rate == 0.0 {
            self.smoothed_loss_rate = new_loss_rate;
        }
        else {
            self.smoothed_loss_rate = self.smoothed_loss_rate * 0.3 + new_loss_rate * 0.7;
        }
    }
}
