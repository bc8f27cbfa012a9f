use super::payload::QueuedMessage;

/// Messages accepted for this thread but not yet handed to a batch.
///
/// Owned by the processor task; nothing else reads or writes it.
#[derive(Debug, Default)]
pub struct PendingBuffer {
    messages: Vec<QueuedMessage>,
}

impl PendingBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, message: QueuedMessage) {
        self.messages.push(message);
    }

    /// Take everything pending, ordered by timestamp. Equal timestamps keep
    /// arrival order.
    pub fn drain_all(&mut self) -> Vec<QueuedMessage> {
        let mut batch = std::mem::take(&mut self.messages);
        batch.sort_by_key(|m| m.timestamp);
        batch
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::payload::test_payload;

    fn queued(text: &str, timestamp: i64) -> QueuedMessage {
        QueuedMessage::new(test_payload("U1", "T1", text), timestamp)
    }

    fn texts(batch: &[QueuedMessage]) -> Vec<&str> {
        batch.iter().map(|m| m.payload.message_text.as_str()).collect()
    }

    #[test]
    fn drain_sorts_by_timestamp() {
        let mut buffer = PendingBuffer::new();
        buffer.append(queued("c", 110));
        buffer.append(queued("a", 100));
        buffer.append(queued("b", 105));

        let batch = buffer.drain_all();
        assert_eq!(texts(&batch), vec!["a", "b", "c"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn equal_timestamps_keep_arrival_order() {
        let mut buffer = PendingBuffer::new();
        buffer.append(queued("first", 100));
        buffer.append(queued("second", 100));
        buffer.append(queued("earlier", 99));

        assert_eq!(texts(&buffer.drain_all()), vec!["earlier", "first", "second"]);
    }

    #[test]
    fn append_after_drain_starts_a_new_batch() {
        let mut buffer = PendingBuffer::new();
        buffer.append(queued("a", 1));
        assert_eq!(buffer.drain_all().len(), 1);

        buffer.append(queued("b", 2));
        assert_eq!(buffer.len(), 1);
        assert_eq!(texts(&buffer.drain_all()), vec!["b"]);
        assert!(buffer.drain_all().is_empty());
    }
}
