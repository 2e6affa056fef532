use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Sticky cancellation flag shared between the signal handler thread and the
/// bridge loop. Once triggered it stays triggered: the blocking accessory
/// open, the loopback connect retry and the event loop all observe it.
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_is_sticky_and_shared() {
        let token = ShutdownToken::new();
        let clone = token.clone();
        assert!(!token.is_triggered());
        clone.trigger();
        assert!(token.is_triggered());
        assert!(clone.is_triggered());
    }
}
