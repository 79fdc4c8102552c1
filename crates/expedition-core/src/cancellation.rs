use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

/// Per-thread cancellation tokens, mirroring `tandem-core`'s `CancellationRegistry` —
/// every long-running activity (a runner turn, an instance task) is handed a token it
/// must honour at its next suspension point rather than being killed outright.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<Mutex<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the token for `key`, creating a fresh one if none exists yet.
    pub async fn token_for(&self, key: &str) -> CancellationToken {
        let mut tokens = self.tokens.lock().await;
        tokens.entry(key.to_string()).or_default().clone()
    }

    /// Cancels and removes the token for `key`. A subsequent `token_for` call gets a
    /// fresh, un-cancelled token.
    pub async fn cancel(&self, key: &str) {
        if let Some(token) = self.tokens.lock().await.remove(key) {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_signals_the_issued_token() {
        let registry = CancellationRegistry::new();
        let token = registry.token_for("t1").await;
        assert!(!token.is_cancelled());
        registry.cancel("t1").await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn token_for_after_cancel_returns_a_fresh_token() {
        let registry = CancellationRegistry::new();
        let _first = registry.token_for("t1").await;
        registry.cancel("t1").await;
        let second = registry.token_for("t1").await;
        assert!(!second.is_cancelled());
    }
}
