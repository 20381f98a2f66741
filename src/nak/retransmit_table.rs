use std::time::Duration;

use tokio::time::Instant;
use tracing::trace;

use crate::messaging::message::Message;

/// Tuning knobs for a [RetransmitTable]. The defaults are sized for a busy sender: rows are
///  allocated lazily, so a mostly idle sender pays for at most one row.
#[derive(Clone, Debug)]
pub struct XmitTableConfig {
    pub num_rows: usize,
    pub msgs_per_row: usize,
    /// growth factor applied to the row array when a seqno beyond the current capacity arrives;
    ///  > 1.0
    pub resize_factor: f64,
    /// minimum time between two automatic compaction runs
    pub max_compaction_time: Duration,
    /// if set, a purge triggers compaction once `max_compaction_time` has passed since the last
    ///  compaction
    pub automatic_purging: bool,
}

impl Default for XmitTableConfig {
    fn default() -> XmitTableConfig {
        XmitTableConfig {
            num_rows: 5,
            msgs_per_row: 10_000,
            resize_factor: 1.2,
            max_compaction_time: Duration::from_secs(5 * 60),
            automatic_purging: false,
        }
    }
}

/// A sparse, row-indexed buffer of message slots keyed by seqno.
///
/// A seqno maps to `(seqno - offset) / msgs_per_row` for the row and `(seqno - offset) %
///  msgs_per_row` for the slot within the row, so get/put are array accesses without per-message
///  heap structure. A slot is either a message or null; null slots in the live range are the
///  gaps the retransmitter is chasing.
///
/// Storage is reclaimed in two steps: [RetransmitTable::purge] nulls all slots up to a seqno,
///  and [RetransmitTable::compact] releases leading rows that consist entirely of purged slots,
///  advancing `offset`. Compaction never moves surviving entries, it only drops dead rows.
///
/// The table is not internally synchronized; the owning window accesses it under its own lock.
pub struct RetransmitTable {
    num_rows: usize,
    msgs_per_row: usize,
    resize_factor: f64,
    max_compaction_time: Duration,
    automatic_purging: bool,

    /// the seqno represented by the first slot of the first row
    offset: u64,
    matrix: Vec<Option<Vec<Option<Message>>>>,
    /// number of non-null slots
    size: usize,
    /// all seqnos <= this have been purged; slots between here and `offset` are physically gone
    highest_purged: u64,
    last_compaction: Instant,
}

impl RetransmitTable {
    pub fn new(config: &XmitTableConfig, offset: u64) -> RetransmitTable {
        assert!(config.msgs_per_row > 0, "rows must hold at least one message");
        assert!(config.resize_factor > 1.0, "resize factor must actually grow the table");

        let num_rows = config.num_rows.max(1);
        RetransmitTable {
            num_rows,
            msgs_per_row: config.msgs_per_row,
            resize_factor: config.resize_factor,
            max_compaction_time: config.max_compaction_time,
            automatic_purging: config.automatic_purging,
            offset,
            matrix: vec![None; num_rows],
            size: 0,
            highest_purged: offset,
            last_compaction: Instant::now(),
        }
    }

    /// Stores a message at its slot, overwriting a present message. Seqnos below `offset` have
    ///  been reclaimed and are silently dropped.
    pub fn put(&mut self, seqno: u64, msg: Message) {
        if seqno < self.offset {
            trace!("seqno {} is below the table offset {} - dropping", seqno, self.offset);
            return;
        }
        let was_present = self.slot_mut(seqno).replace(msg).is_some();
        if !was_present {
            self.size += 1;
        }
    }

    /// Stores a message only if its slot is currently null, returning the already present
    ///  message otherwise.
    pub fn put_if_absent(&mut self, seqno: u64, msg: Message) -> Option<&Message> {
        if seqno < self.offset {
            trace!("seqno {} is below the table offset {} - dropping", seqno, self.offset);
            return None;
        }

        let inserted = {
            let slot = self.slot_mut(seqno);
            if slot.is_none() {
                *slot = Some(msg);
                true
            }
            else {
                false
            }
        };

        if inserted {
            self.size += 1;
            None
        }
        else {
            self.get(seqno)
        }
    }

    pub fn get(&self, seqno: u64) -> Option<&Message> {
        if seqno < self.offset {
            return None;
        }
        self.matrix
            .get(self.row_of(seqno))?
            .as_ref()?
            [self.index_of(seqno)]
            .as_ref()
    }

    /// all non-null messages in `[from..=to]`, in seqno order, or `None` if there are none
    pub fn get_range(&self, from: u64, to: u64) -> Option<Vec<Message>> {
        let mut result = Vec::new();
        for seqno in from..=to {
            if let Some(msg) = self.get(seqno) {
                result.push(msg.clone());
            }
        }

        if result.is_empty() {
            None
        }
        else {
            Some(result)
        }
    }

    /// clears the slot, returning the message that was stored there
    pub fn remove(&mut self, seqno: u64) -> Option<Message> {
        if seqno < self.offset {
            return None;
        }
        let row = self.row_of(seqno);
        let index = self.index_of(seqno);

        let removed = self.matrix.get_mut(row)?.as_mut()?[index].take();
        if removed.is_some() {
            self.size -= 1;
        }
        removed
    }

    /// Drops all seqnos <= `seqno`. The slots are nulled but their rows are kept; a later
    ///  [RetransmitTable::compact] releases fully dead leading rows. With automatic purging
    ///  enabled, compaction is triggered here once `max_compaction_time` has passed since the
    ///  last one.
    pub fn purge(&mut self, seqno: u64) {
        for s in (self.highest_purged + 1)..=seqno {
            let _ = self.remove(s);
        }
        self.highest_purged = self.highest_purged.max(seqno);

        if self.automatic_purging && self.last_compaction.elapsed() >= self.max_compaction_time {
            self.compact();
        }
    }

    /// Physically releases leading rows that lie entirely below the purge watermark, advancing
    ///  `offset`. Surviving rows are never moved or copied within their row.
    pub fn compact(&mut self) {
        let droppable_slots = (self.highest_purged + 1).saturating_sub(self.offset);
        let droppable_rows = (droppable_slots / self.msgs_per_row as u64) as usize;
        let droppable_rows = droppable_rows.min(self.matrix.len());

        if droppable_rows > 0 {
            trace!("compacting: dropping {} leading rows, offset {} -> {}",
                droppable_rows, self.offset, self.offset + (droppable_rows * self.msgs_per_row) as u64);
            self.matrix.drain(..droppable_rows);
            self.offset += (droppable_rows * self.msgs_per_row) as u64;
            if self.matrix.len() < self.num_rows {
                self.matrix.resize(self.num_rows, None);
            }
        }
        self.last_compaction = Instant::now();
    }

    /// resets the table to its initial state with offset 0
    pub fn clear(&mut self) {
        self.matrix = vec![None; self.num_rows];
        self.size = 0;
        self.offset = 0;
        self.highest_purged = 0;
    }

    /// the number of null slots above the purge watermark, up to and including `upto`
    pub fn get_null_messages(&self, upto: u64) -> usize {
        ((self.highest_purged + 1)..=upto)
            .filter(|&seqno| self.get(seqno).is_none())
            .count()
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn capacity(&self) -> usize {
        self.matrix.len() * self.msgs_per_row
    }

    pub fn fill_factor(&self) -> f64 {
        self.size as f64 / self.capacity() as f64
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn row_of(&self, seqno: u64) -> usize {
        ((seqno - self.offset) / self.msgs_per_row as u64) as usize
    }

    fn index_of(&self, seqno: u64) -> usize {
        ((seqno - self.offset) % self.msgs_per_row as u64) as usize
    }

    fn slot_mut(&mut self, seqno: u64) -> &mut Option<Message> {
        let row = self.row_of(seqno);
        let index = self.index_of(seqno);
        let msgs_per_row = self.msgs_per_row;

        if row >= self.matrix.len() {
            let grown = (self.matrix.len() as f64 * self.resize_factor).ceil() as usize;
            self.matrix.resize((row + 1).max(grown), None);
        }

        let row_buf = self.matrix[row].get_or_insert_with(|| vec![None; msgs_per_row]);
        &mut row_buf[index]
    }
}
