/// What the user is currently looking at
///
/// One process-wide value. The navigation layer holds the only
/// [`ActiveContextWriter`]; everything else reads through cloned
/// [`ActiveContextReader`]s.
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveContext {
    pub active_conversation_id: Option<String>,
    pub is_on_conversation_screen: bool,
}

impl ActiveContext {
    /// On the conversation screen with `conversation_id` open
    pub fn viewing(conversation_id: impl Into<String>) -> Self {
        Self {
            active_conversation_id: Some(conversation_id.into()),
            is_on_conversation_screen: true,
        }
    }

    /// Somewhere else in the app, keeping `active` selected in the background
    pub fn away(active: Option<String>) -> Self {
        Self {
            active_conversation_id: active,
            is_on_conversation_screen: false,
        }
    }

    /// Whether a message for `conversation_id` is already on screen
    pub fn is_viewing(&self, conversation_id: &str) -> bool {
        self.is_on_conversation_screen
            && self.active_conversation_id.as_deref() == Some(conversation_id)
    }
}

/// Create the single writer and a reader for a fresh context
pub fn active_context() -> (ActiveContextWriter, ActiveContextReader) {
    let (tx, rx) = watch::channel(ActiveContext::default());
    (ActiveContextWriter { tx }, ActiveContextReader { rx })
}

/// Sole mutator of the active context; intentionally not `Clone`
#[derive(Debug)]
pub struct ActiveContextWriter {
    tx: watch::Sender<ActiveContext>,
}

impl ActiveContextWriter {
    /// Apply one navigation transition. Returns the previous value.
    pub fn navigate(&self, next: ActiveContext) -> ActiveContext {
        let mut previous = ActiveContext::default();
        self.tx.send_if_modified(|current| {
            previous = current.clone();
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        previous
    }
}

#[derive(Debug, Clone)]
pub struct ActiveContextReader {
    rx: watch::Receiver<ActiveContext>,
}

impl ActiveContextReader {
    pub fn current(&self) -> ActiveContext {
        self.rx.borrow().clone()
    }

    pub fn is_viewing(&self, conversation_id: &str) -> bool {
        self.rx.borrow().is_viewing(conversation_id)
    }

    /// Wait for the next navigation transition
    pub async fn changed(&mut self) -> Option<ActiveContext> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }
}
