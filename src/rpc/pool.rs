//! Per-chain client cache

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use super::rest::RestClient;
use super::ChainClient;
use crate::chain::Chain;
use crate::error::Result;

/// Builds a client for a chain on first use
pub type ClientFactory = Arc<dyn Fn(&Chain) -> Result<Arc<dyn ChainClient>> + Send + Sync>;

/// Connection pool keyed by chain id. Clients are created lazily and reused by
/// every account on the same chain until [`ClientPool::close`] is called.
pub struct ClientPool {
    clients: DashMap<String, Arc<dyn ChainClient>>,
    factory: ClientFactory,
}

impl ClientPool {
    pub fn new(factory: ClientFactory) -> Self {
        Self {
            clients: DashMap::new(),
            factory,
        }
    }

    /// Pool of REST clients with the given per-request timeout
    pub fn rest(timeout: Duration) -> Self {
        Self::new(Arc::new(move |chain: &Chain| {
            let client: Arc<dyn ChainClient> = Arc::new(RestClient::new(chain, timeout)?);
            Ok(client)
        }))
    }

    /// Client for `chain`, created on first use
    pub fn get(&self, chain: &Chain) -> Result<Arc<dyn ChainClient>> {
        if let Some(client) = self.clients.get(&chain.id) {
            return Ok(Arc::clone(client.value()));
        }

        let entry = self
            .clients
            .entry(chain.id.clone())
            .or_try_insert_with(|| {
                debug!(chain = %chain.id, endpoint = %chain.rpc, "Opening chain client");
                (self.factory)(chain)
            })?;
        Ok(Arc::clone(entry.value()))
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Drop every cached client
    pub fn close(&self) {
        let count = self.clients.len();
        self.clients.clear();
        info!("Closed {} chain client(s)", count);
    }
}
