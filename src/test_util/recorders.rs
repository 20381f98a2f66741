use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::messaging::node_addr::NodeAddr;
use crate::nak::retransmitter::RetransmitCommand;
use crate::nak::window::NakWindowListener;

/// A [RetransmitCommand] that records the requested ranges instead of touching a transport.
pub struct RecordingRetransmitCommand {
    calls: Mutex<Vec<(u64, u64)>>,
}

impl RecordingRetransmitCommand {
    pub fn new() -> Arc<RecordingRetransmitCommand> {
        Arc::new(RecordingRetransmitCommand {
            calls: Mutex::new(Vec::new()),
        })
    }

    /// all `(first_seqno, last_seqno)` requests so far, in call order
    pub fn calls(&self) -> Vec<(u64, u64)> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RetransmitCommand for RecordingRetransmitCommand {
    async fn retransmit(&self, first_seqno: u64, last_seqno: u64, _sender: NodeAddr) {
        self.calls.lock().unwrap().push((first_seqno, last_seqno));
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ListenerEvent {
    MissingReceived { seqno: u64 },
    GapDetected { from: u64, to: u64 },
}

/// A [NakWindowListener] that records gap events in the order they are dispatched.
pub struct RecordingListener {
    events: Mutex<Vec<ListenerEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<RecordingListener> {
        Arc::new(RecordingListener {
            events: Mutex::new(Vec::new()),
        })
    }

    pub fn events(&self) -> Vec<ListenerEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl NakWindowListener for RecordingListener {
    async fn missing_message_received(&self, seqno: u64, _original_sender: NodeAddr) {
        self.events.lock().unwrap().push(ListenerEvent::MissingReceived { seqno });
    }

    async fn message_gap_detected(&self, from: u64, to: u64, _src: NodeAddr) {
        self.events.lock().unwrap().push(ListenerEvent::GapDetected { from, to });
    }
}
