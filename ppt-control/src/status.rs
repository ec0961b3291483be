use std::sync::Arc;

use parking_lot::Mutex;

/// A shared list of failure messages, drained by whoever polls it.
///
/// Clones share the same list.
#[derive(Clone, Debug, Default)]
pub struct ErrorSink {
    messages: Arc<Mutex<Vec<String>>>,
}

impl ErrorSink {
    pub fn new() -> ErrorSink {
        ErrorSink::default()
    }

    pub fn push(&self, message: impl Into<String>) {
        self.messages.lock().push(message.into());
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Removes and returns every message collected so far.
    pub fn drain(&self) -> Vec<String> {
        std::mem::take(&mut *self.messages.lock())
    }
}

#[cfg(test)]
mod test {
    use super::ErrorSink;

    #[test]
    fn clones_share_messages() {
        let sink = ErrorSink::new();
        let other = sink.clone();
        other.push("PLL not locked");
        sink.push(String::from("module 2: link down"));
        assert_eq!(sink.drain(), vec!["PLL not locked", "module 2: link down"]);
        assert!(other.is_empty());
    }
}
