//! Adapter registry.
//!
//! Loaded adapters are keyed by (adapter-type, adapter-token), the same
//! pair agent bindings reference, so the router can dispatch an outbound
//! envelope straight from a binding row.

use crate::channels::{ChannelAdapter, backoff::StartBackoff};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{error, info, warn};

const MAX_START_ATTEMPTS: usize = 6;

type AdapterKey = (String, String);

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: RwLock<HashMap<AdapterKey, Arc<dyn ChannelAdapter>>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        adapter_type: &str,
        adapter_token: &str,
        adapter: Arc<dyn ChannelAdapter>,
    ) {
        let mut adapters = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        adapters.insert(
            (adapter_type.to_string(), adapter_token.to_string()),
            adapter,
        );
    }

    pub fn unregister(&self, adapter_type: &str, adapter_token: &str) -> bool {
        let mut adapters = self
            .adapters
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        adapters
            .remove(&(adapter_type.to_string(), adapter_token.to_string()))
            .is_some()
    }

    pub fn get(&self, adapter_type: &str, adapter_token: &str) -> Option<Arc<dyn ChannelAdapter>> {
        let adapters = self.adapters.read().unwrap_or_else(PoisonError::into_inner);
        adapters
            .get(&(adapter_type.to_string(), adapter_token.to_string()))
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<(AdapterKey, Arc<dyn ChannelAdapter>)> {
        self.adapters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Start every registered adapter, retrying transient failures with
    /// bounded backoff. A persistently failing adapter is logged and left
    /// unstarted; the rest keep running.
    pub async fn start_all(&self) {
        for ((adapter_type, _token), adapter) in self.snapshot() {
            let mut backoff = StartBackoff::new();
            let mut attempt = 0;
            loop {
                attempt += 1;
                match adapter.start().await {
                    Ok(()) => {
                        info!("adapter {} started", adapter_type);
                        break;
                    }
                    Err(e) if attempt < MAX_START_ATTEMPTS => {
                        let delay = backoff.next_delay();
                        warn!(
                            "adapter {} start failed (attempt {}): {}, retrying in {:?}",
                            adapter_type, attempt, e, delay
                        );
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        error!(
                            "adapter {} failed to start after {} attempts: {}",
                            adapter_type, attempt, e
                        );
                        break;
                    }
                }
            }
        }
    }

    /// Stop every registered adapter. Idempotent; failures are logged.
    pub async fn stop_all(&self) {
        for ((adapter_type, _token), adapter) in self.snapshot() {
            if let Err(e) = adapter.stop().await {
                warn!("error stopping adapter {}: {}", adapter_type, e);
            }
        }
    }
}
