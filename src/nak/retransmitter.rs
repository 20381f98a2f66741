use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashMap;
use tokio::time;
use tracing::trace;

use crate::messaging::node_addr::NodeAddr;
use crate::nak::interval::Interval;
use crate::util::scheduler::{ScheduledTask, TimeScheduler};

/// Upper-layer command that actually sends a retransmit request for a range of missing seqnos.
///
/// It is invoked from shared scheduler tasks, so it must be thread safe and must not block on
///  window locks. The same seqno can be requested more than once (timer fires are not
///  synchronized with arriving fills); the transport deduplicates by seqno.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait RetransmitCommand: Send + Sync + 'static {
    async fn retransmit(&self, first_seqno: u64, last_seqno: u64, sender: NodeAddr);
}

/// Registry of missing seqnos, each driving periodic retransmit requests until it is removed.
///
/// Every entry owns a scheduler task that sleeps through the configured [Interval] and invokes
///  the [RetransmitCommand] after each delay. Removing an entry aborts its task; an in-flight
///  fire may still complete once and is tolerated downstream.
///
/// The two variants are a closed set: the default variant keeps one entry per missing seqno,
///  the range-based variant keeps one entry per contiguous missing run, splitting it as seqnos
///  arrive. The owning window mutates the retransmitter under its write lock and reads sizes
///  and stats under its read lock.
pub enum Retransmitter {
    Default(DefaultRetransmitter),
    RangeBased(RangeBasedRetransmitter),
}

impl Retransmitter {
    pub fn new_default(sender: NodeAddr, cmd: Arc<dyn RetransmitCommand>, scheduler: Arc<TimeScheduler>) -> Retransmitter {
        Retransmitter::Default(DefaultRetransmitter {
            core: Core::new(sender, cmd, scheduler),
            entries: FxHashMap::default(),
        })
    }

    pub fn new_range_based(sender: NodeAddr, cmd: Arc<dyn RetransmitCommand>, scheduler: Arc<TimeScheduler>) -> Retransmitter {
        Retransmitter::RangeBased(RangeBasedRetransmitter {
            core: Core::new(sender, cmd, scheduler),
            ranges: BTreeMap::default(),
            num_ranges_added: 0,
            num_single_seqnos: 0,
            num_ranges_split: 0,
        })
    }

    /// Registers `[first_seqno..=last_seqno]` as missing. Seqnos that are already registered
    ///  are left untouched.
    pub fn add(&mut self, first_seqno: u64, last_seqno: u64) {
        match self {
            Retransmitter::Default(r) => r.add(first_seqno, last_seqno),
            Retransmitter::RangeBased(r) => r.add(first_seqno, last_seqno),
        }
    }

    /// Deregisters a seqno (typically because it finally arrived), cancelling its scheduled
    ///  requests. Returns the number of retransmit requests that had been fired for its entry.
    pub fn remove(&mut self, seqno: u64) -> u32 {
        match self {
            Retransmitter::Default(r) => r.remove(seqno),
            Retransmitter::RangeBased(r) => r.remove(seqno),
        }
    }

    /// cancels and drops all entries
    pub fn reset(&mut self) {
        match self {
            Retransmitter::Default(r) => r.entries.clear(),
            Retransmitter::RangeBased(r) => r.ranges.clear(),
        }
    }

    /// Installs the backoff sequence used by entries created from now on. Existing entries keep
    ///  the schedule they were created with.
    pub fn set_retransmit_timeouts(&mut self, timeouts: Interval) {
        match self {
            Retransmitter::Default(r) => r.core.retransmit_timeouts = timeouts,
            Retransmitter::RangeBased(r) => r.core.retransmit_timeouts = timeouts,
        }
    }

    /// the number of distinct missing seqnos
    pub fn size(&self) -> usize {
        match self {
            Retransmitter::Default(r) => r.entries.len(),
            Retransmitter::RangeBased(r) => r.size(),
        }
    }

    pub fn print_stats(&self) -> String {
        match self {
            Retransmitter::Default(_) => "n/a".to_string(),
            Retransmitter::RangeBased(r) => r.print_stats(),
        }
    }
}

/// state shared by both variants
struct Core {
    sender: NodeAddr,
    cmd: Arc<dyn RetransmitCommand>,
    scheduler: Arc<TimeScheduler>,
    retransmit_timeouts: Interval,
}

impl Core {
    fn new(sender: NodeAddr, cmd: Arc<dyn RetransmitCommand>, scheduler: Arc<TimeScheduler>) -> Core {
        Core {
            sender,
            cmd,
            scheduler,
            retransmit_timeouts: Interval::default(),
        }
    }

    /// Spawns the sleep loop for one entry. The task counts its fires through the shared
    ///  counter so [Retransmitter::remove] can report them after the task is gone.
    fn spawn_entry_task(&self, first_seqno: u64, last_seqno: u64, num_fires: Arc<AtomicU32>) -> ScheduledTask {
        let cmd = self.cmd.clone();
        let sender = self.sender;
        let mut cursor = self.retransmit_timeouts.cursor();

        self.scheduler.spawn(async move {
            while let Some(delay) = cursor.next() {
                time::sleep(delay).await;
                trace!("requesting retransmission of {}..={} from {:?}", first_seqno, last_seqno, sender);
                cmd.retransmit(first_seqno, last_seqno, sender).await;
                num_fires.fetch_add(1, Ordering::Relaxed);
            }
            // backoff exhausted: stop asking, but the entry stays registered until removed
        })
    }
}

struct SeqnoEntry {
    _task: ScheduledTask,
    num_fires: Arc<AtomicU32>,
}

/// one entry (and one scheduler task) per missing seqno
pub struct DefaultRetransmitter {
    core: Core,
    entries: FxHashMap<u64, SeqnoEntry>,
}

impl DefaultRetransmitter {
    fn add(&mut self, first_seqno: u64, last_seqno: u64) {
        for seqno in first_seqno..=last_seqno {
            if self.entries.contains_key(&seqno) {
                trace!("seqno {} is already scheduled for retransmission", seqno);
                continue;
            }
            let num_fires = Arc::new(AtomicU32::new(0));
            let task = self.core.spawn_entry_task(seqno, seqno, num_fires.clone());
            self.entries.insert(seqno, SeqnoEntry { _task: task, num_fires });
        }
    }

    fn remove(&mut self, seqno: u64) -> u32 {
        match self.entries.remove(&seqno) {
            Some(entry) => entry.num_fires.load(Ordering::Relaxed),
            None => 0,
        }
    }
}

struct RangeEntry {
    last_seqno: u64,
    _task: ScheduledTask,
    num_fires: Arc<AtomicU32>,
}

/// One entry per contiguous missing run, keyed by the run's first seqno.
///
/// Removing a seqno from the middle of a run splits it into the remainders on either side. The
///  remainders inherit the run's fire counter but restart its backoff: a split means the gap is
///  filling, so probing promptly for the rest beats inheriting a multi-second tail delay.
pub struct RangeBasedRetransmitter {
    core: Core,
    ranges: BTreeMap<u64, RangeEntry>,
    num_ranges_added: u64,
    num_single_seqnos: u64,
    num_ranges_split: u64,
}

impl RangeBasedRetransmitter {
    fn add(&mut self, first_seqno: u64, last_seqno: u64) {
        if last_seqno < first_seqno {
            return;
        }
        if self.overlaps(first_seqno, last_seqno) {
            trace!("range {}..={} overlaps an already scheduled range - ignoring", first_seqno, last_seqno);
            return;
        }

        self.insert_range(first_seqno, last_seqno, Arc::new(AtomicU32::new(0)));
        self.num_ranges_added += 1;
        if first_seqno == last_seqno {
            self.num_single_seqnos += 1;
        }
    }

    fn remove(&mut self, seqno: u64) -> u32 {
        let containing_first = self.ranges.range(..=seqno).next_back()
            .filter(|(_, entry)| entry.last_seqno >= seqno)
            .map(|(&first, _)| first);
        let Some(first) = containing_first else {
            return 0;
        };

        let entry = self.ranges.remove(&first)
            .expect("the containing range was just looked up");
        let num_fires = entry.num_fires.load(Ordering::Relaxed);

        // removing an interior seqno leaves the remainders on either side as new ranges
        if seqno > first {
            self.insert_range(first, seqno - 1, entry.num_fires.clone());
        }
        if seqno < entry.last_seqno {
            self.insert_range(seqno + 1, entry.last_seqno, entry.num_fires.clone());
        }
        if seqno > first && seqno < entry.last_seqno {
            self.num_ranges_split += 1;
        }

        num_fires
    }

    fn size(&self) -> usize {
        self.ranges.iter()
            .map(|(&first, entry)| (entry.last_seqno - first + 1) as usize)
            .sum()
    }

    fn print_stats(&self) -> String {
        format!("ranges added: {} ({} single seqnos), ranges split: {}",
            self.num_ranges_added, self.num_single_seqnos, self.num_ranges_split)
    }

    fn overlaps(&self, first_seqno: u64, last_seqno: u64) -> bool {
        self.ranges.range(..=last_seqno).next_back()
            .map(|(_, entry)| entry.last_seqno >= first_seqno)
            .unwrap_or(false)
    }

    fn insert_range(&mut self, first_seqno: u64, last_seqno: u64, num_fires: Arc<AtomicU32>) {
        let task = self.core.spawn_entry_task(first_seqno, last_seqno, num_fires.clone());
        self.ranges.insert(first_seqno, RangeEntry {
            last_seqno,
            _task: task,
            num_fires,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_util::node::test_node_addr_from_number;
    use crate::test_util::recorders::RecordingRetransmitCommand;
    use std::time::Duration;

    fn default_retransmitter(cmd: Arc<RecordingRetransmitCommand>, timeouts: Interval) -> Retransmitter {
        let mut retransmitter = Retransmitter::new_default(
            test_node_addr_from_number(1),
            cmd,
            Arc::new(TimeScheduler::new()),
        );
        retransmitter.set_retransmit_timeouts(timeouts);
        retransmitter
    }

    fn range_retransmitter(cmd: Arc<RecordingRetransmitCommand>, timeouts: Interval) -> Retransmitter {
        let mut retransmitter = Retransmitter::new_range_based(
            test_node_addr_from_number(1),
            cmd,
            Arc::new(TimeScheduler::new()),
        );
        retransmitter.set_retransmit_timeouts(timeouts);
        retransmitter
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_fires_per_seqno() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = default_retransmitter(cmd.clone(), Interval::with_infinite_tail(&[100, 200]));

        retransmitter.add(2, 4);
        assert_eq!(retransmitter.size(), 3);
        assert_eq!(cmd.calls().len(), 0);

        time::sleep(Duration::from_millis(150)).await;
        let mut calls = cmd.calls();
        calls.sort();
        assert_eq!(calls, vec![(2, 2), (3, 3), (4, 4)]);

        // second fire after 100 + 200 ms, then the infinite tail stops the schedule
        time::sleep(Duration::from_millis(200)).await;
        assert_eq!(cmd.calls().len(), 6);

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(cmd.calls().len(), 6);
        assert_eq!(retransmitter.size(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_backoff_repeats_last() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = default_retransmitter(cmd.clone(), Interval::new(&[100, 200]));

        retransmitter.add(7, 7);

        // fires at 100, 300, 500, 700, ...
        time::sleep(Duration::from_millis(750)).await;
        assert_eq!(cmd.calls(), vec![(7, 7), (7, 7), (7, 7), (7, 7)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_remove_cancels_and_reports_fires() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = default_retransmitter(cmd.clone(), Interval::new(&[100, 200]));

        retransmitter.add(3, 3);
        time::sleep(Duration::from_millis(350)).await;

        assert_eq!(retransmitter.remove(3), 2);
        assert_eq!(retransmitter.size(), 0);
        assert_eq!(retransmitter.remove(3), 0);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(cmd.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_duplicate_add_is_noop() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = default_retransmitter(cmd.clone(), Interval::new(&[100]));

        retransmitter.add(2, 3);
        time::sleep(Duration::from_millis(50)).await;
        retransmitter.add(2, 3);
        assert_eq!(retransmitter.size(), 2);

        // re-adding did not restart the delay: the first fire is still at t=100
        time::sleep(Duration::from_millis(60)).await;
        assert_eq!(cmd.calls().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_cancels_everything() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = default_retransmitter(cmd.clone(), Interval::new(&[100]));

        retransmitter.add(1, 5);
        retransmitter.reset();
        assert_eq!(retransmitter.size(), 0);

        time::sleep(Duration::from_secs(1)).await;
        assert_eq!(cmd.calls().len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_fires_whole_range() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd.clone(), Interval::with_infinite_tail(&[100]));

        retransmitter.add(2, 6);
        assert_eq!(retransmitter.size(), 5);

        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cmd.calls(), vec![(2, 6)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_remove_splits() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd.clone(), Interval::with_infinite_tail(&[100]));

        retransmitter.add(2, 6);
        assert_eq!(retransmitter.remove(4), 0);
        assert_eq!(retransmitter.size(), 4);

        // the remainders fire as separate ranges
        time::sleep(Duration::from_millis(150)).await;
        let mut calls = cmd.calls();
        calls.sort();
        assert_eq!(calls, vec![(2, 3), (5, 6)]);

        assert!(retransmitter.print_stats().contains("ranges split: 1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_remove_at_edges() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd.clone(), Interval::with_infinite_tail(&[100]));

        retransmitter.add(2, 4);
        retransmitter.remove(2);
        assert_eq!(retransmitter.size(), 2);
        retransmitter.remove(4);
        assert_eq!(retransmitter.size(), 1);
        retransmitter.remove(3);
        assert_eq!(retransmitter.size(), 0);

        assert!(retransmitter.print_stats().contains("ranges split: 0"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_remove_unknown_seqno() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd, Interval::with_infinite_tail(&[100]));

        retransmitter.add(5, 7);
        assert_eq!(retransmitter.remove(4), 0);
        assert_eq!(retransmitter.remove(8), 0);
        assert_eq!(retransmitter.size(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_split_inherits_fire_count() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd.clone(), Interval::with_infinite_tail(&[100, 200]));

        retransmitter.add(2, 6);
        time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cmd.calls().len(), 1);

        retransmitter.remove(4);
        assert_eq!(retransmitter.remove(2), 1);
        assert_eq!(retransmitter.remove(5), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_overlapping_add_is_ignored() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd, Interval::with_infinite_tail(&[100]));

        retransmitter.add(2, 6);
        retransmitter.add(4, 9);
        assert_eq!(retransmitter.size(), 5);

        retransmitter.add(8, 9);
        assert_eq!(retransmitter.size(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_range_stats() {
        let cmd = RecordingRetransmitCommand::new();
        let mut retransmitter = range_retransmitter(cmd, Interval::with_infinite_tail(&[100]));

        retransmitter.add(2, 2);
        retransmitter.add(4, 8);
        retransmitter.remove(6);

        assert_eq!(retransmitter.print_stats(), "ranges added: 2 (1 single seqnos), ranges split: 1");
    }
}
