//! Service lifecycle
//!
//! [`AutoStaker`] owns every long-lived component: it opens the store and the
//! client pool at startup, hands them to the engine, scheduler and control
//! surface, and closes them on shutdown.

use std::future::Future;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::control::Control;
use crate::error::Result;
use crate::keyring::{FileKeyring, Keyring, Operator};
use crate::restake::RestakeEngine;
use crate::rpc::ClientPool;
use crate::scheduler::Scheduler;
use crate::store::RecordStore;
use crate::tx::Broadcaster;

pub struct AutoStaker {
    store: Arc<RecordStore>,
    pool: Arc<ClientPool>,
    scheduler: Arc<Scheduler>,
    control: Control,
}

impl AutoStaker {
    /// Open the service with the configured keyring and REST clients
    pub fn open(config: &Config) -> Result<Self> {
        let keyring: Arc<dyn Keyring> = Arc::new(FileKeyring::load(&config.keyring_dir())?);
        let pool = Arc::new(ClientPool::rest(config.request_timeout()));
        Self::assemble(config, keyring, pool)
    }

    /// Wire the components around an existing keyring and client pool. The
    /// keyring must hold exactly one key.
    pub fn assemble(config: &Config, keyring: Arc<dyn Keyring>, pool: Arc<ClientPool>) -> Result<Self> {
        let operator = Operator::from_keyring(keyring.as_ref())?;
        info!("Operator key {} ({})", operator.key().name, operator.hex_address());

        std::fs::create_dir_all(&config.home_dir)?;
        let store = Arc::new(RecordStore::open(&config.home_dir)?);

        let registry = Arc::new(config.registry());
        let broadcaster = Arc::new(Broadcaster::new(keyring, config.broadcast_settings()));
        let engine = Arc::new(RestakeEngine::new(registry, pool.clone(), broadcaster, operator));
        let scheduler = Arc::new(Scheduler::new(store.clone(), engine.clone(), config.tier_periods()));
        let control = Control::new(store.clone(), engine);

        Ok(Self {
            store,
            pool,
            scheduler,
            control,
        })
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Forget active jobs left behind by a process that did not shut down
    /// cleanly, so their tiers get timers again.
    pub fn reset_active_jobs(&self) -> Result<usize> {
        let jobs = self.store.active_jobs()?;
        for job in &jobs {
            warn!(cadence = %job.cadence, handle = %job.handle, "Clearing recorded active job");
        }
        self.store.clear_all_active_jobs()
    }

    /// Run the scheduler until `shutdown` resolves, then drain it. If `abort`
    /// resolves while ticks are draining, their chain calls are cancelled.
    pub async fn run<S, A>(&self, shutdown: S, abort: A) -> Result<()>
    where
        S: Future<Output = ()>,
        A: Future<Output = ()>,
    {
        let installed = self.scheduler.start()?;
        info!("Scheduler running with {} tier timer(s)", installed.len());

        shutdown.await;
        info!("Shutdown requested, waiting for running ticks");

        let drain = self.scheduler.shutdown();
        tokio::pin!(drain);
        tokio::select! {
            result = &mut drain => {
                result?;
            }
            _ = abort => {
                warn!("Aborting in-flight restakes");
                self.scheduler.abort_in_flight();
                drain.await?;
            }
        }
        Ok(())
    }

    /// Release the client pool and flush the store
    pub fn close(&self) -> Result<()> {
        self.pool.close();
        self.store.flush()?;
        info!("Service closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::test_chain;
    use crate::error::Error;
    use crate::keyring::tests::test_keyring;
    use crate::rpc::mock::MockChainClient;
    use crate::rpc::ChainClient;
    use crate::types::{ActiveJob, Cadence};
    use std::time::Duration;
    use tempfile::tempdir;

    fn mock_pool() -> Arc<ClientPool> {
        Arc::new(ClientPool::new(Arc::new(|_chain: &crate::chain::Chain| {
            let client: Arc<dyn ChainClient> = Arc::new(MockChainClient::new());
            Ok(client)
        })))
    }

    fn config(home: &std::path::Path) -> Config {
        Config {
            home_dir: home.to_path_buf(),
            chains: vec![test_chain("cosmoshub-4", "cosmos", "uatom")],
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_run_installs_and_clears_jobs() {
        let dir = tempdir().unwrap();
        let service = AutoStaker::assemble(&config(dir.path()), Arc::new(test_keyring()), mock_pool()).unwrap();

        service
            .run(
                tokio::time::sleep(Duration::from_millis(20)),
                std::future::pending::<()>(),
            )
            .await
            .unwrap();
        assert!(service.store.active_jobs().unwrap().is_empty());
        service.close().unwrap();
    }

    #[tokio::test]
    async fn test_reset_active_jobs() {
        let dir = tempdir().unwrap();
        let service = AutoStaker::assemble(&config(dir.path()), Arc::new(test_keyring()), mock_pool()).unwrap();
        service.store.put_active_job(&ActiveJob::new(Cadence::Daily)).unwrap();

        assert_eq!(service.reset_active_jobs().unwrap(), 1);
        assert_eq!(service.scheduler().start().unwrap().len(), 4);
        service.scheduler().shutdown().await.unwrap();
    }

    #[test]
    fn test_empty_keyring_is_fatal() {
        let dir = tempdir().unwrap();
        let mut config = config(dir.path());
        config.keyring.dir = Some(dir.path().join("keys"));
        assert!(matches!(
            AutoStaker::open(&config),
            Err(Error::OperatorKeyCount(0))
        ));
    }
}
