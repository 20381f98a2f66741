use bytes::Bytes;

use crate::messaging::node_addr::NodeAddr;

/// A single multicast message as buffered by a receive window.
///
/// The payload is reference counted, so clones are cheap. Receive windows hand out clones for
///  non-destructive reads, and the same message can sit in a window and in a delivery batch
///  at the same time.
#[derive(Clone, Eq, PartialEq)]
pub struct Message {
    src: NodeAddr,
    payload: Bytes,
}
impl Message {
    pub fn new(src: NodeAddr, payload: Bytes) -> Message {
        Message {
            src,
            payload,
        }
    }

    /// the member that multicast this message, i.e. the sender whose seqno space it lives in
    pub fn src(&self) -> NodeAddr {
        self.src
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Message{{src: {:?}, {} bytes}}", self.src, self.payload.len())
    }
}
