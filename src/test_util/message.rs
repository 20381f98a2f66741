use bytes::Bytes;

use crate::messaging::message::Message;
use crate::test_util::node::test_node_addr_from_number;

/// convenience method for unit test code: a message from a numbered sender with a readable
///  payload, equal for equal arguments
pub fn test_message(sender_number: u16, text: &str) -> Message {
    Message::new(
        test_node_addr_from_number(sender_number),
        Bytes::copy_from_slice(text.as_bytes()),
    )
}
