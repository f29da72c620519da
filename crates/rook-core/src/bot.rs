//! Process lifecycle: shared services, `start` and `shutdown`.

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use tokio::sync::mpsc;

use crate::{
    config::Config,
    cooldown::CooldownTracker,
    dispatch::Dispatcher,
    events::GatewayEvent,
    funnel::ErrorFunnel,
    messaging::port::Responder,
    registry::{ExtensionCatalog, ExtensionRegistry},
    scheduler::TaskScheduler,
    store::RecordStore,
    Result,
};

/// Everything handlers, listeners and extensions can reach.
pub struct Services {
    pub config: Arc<Config>,
    pub responder: Arc<dyn Responder>,
    pub store: Arc<dyn RecordStore>,
    pub cooldowns: Arc<CooldownTracker>,
    pub funnel: ErrorFunnel,
    pub scheduler: TaskScheduler,
    pub registry: ExtensionRegistry,
}

impl Services {
    pub fn new(
        config: Config,
        responder: Arc<dyn Responder>,
        store: Arc<dyn RecordStore>,
        catalog: ExtensionCatalog,
    ) -> Arc<Self> {
        let funnel = ErrorFunnel::new(responder.clone(), config.operator_channel);
        let scheduler = TaskScheduler::new(store.clone(), responder.clone(), funnel.clone());
        let registry = ExtensionRegistry::new(catalog, config.case_insensitive_commands);
        let cooldowns = Arc::new(CooldownTracker::new(config.cooldown_retention_periods));

        Arc::new(Self {
            config: Arc::new(config),
            responder,
            store,
            cooldowns,
            funnel,
            scheduler,
            registry,
        })
    }

    pub async fn load_extension(self: &Arc<Self>, name: &str) -> Result<()> {
        self.registry.load(name, self).await
    }

    pub async fn unload_extension(self: &Arc<Self>, name: &str) -> Result<()> {
        self.registry.unload(name, self).await
    }

    pub async fn reload_extension(self: &Arc<Self>, name: &str) -> Result<()> {
        self.registry.reload(name, self).await
    }
}

#[derive(Debug, Default)]
pub struct StartReport {
    pub loaded: Vec<String>,
    /// Extension name and reason.
    pub failed: Vec<(String, String)>,
    pub restored_tasks: usize,
}

#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Every in-flight invocation finished within the grace period.
    pub drained: bool,
    pub flushed_tasks: usize,
}

pub struct Bot {
    services: Arc<Services>,
    dispatcher: Dispatcher,
    started: AtomicBool,
}

impl Bot {
    pub fn new(services: Arc<Services>) -> Self {
        Self {
            dispatcher: Dispatcher::new(services.clone()),
            services,
            started: AtomicBool::new(false),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// Restore scheduled tasks and load the configured extensions.
    ///
    /// An extension that fails to load is logged and skipped; the bot starts
    /// with whatever else loaded.
    pub async fn start(&self) -> Result<StartReport> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Ok(StartReport::default());
        }

        let mut report = StartReport {
            restored_tasks: self.services.scheduler.start().await?,
            ..StartReport::default()
        };

        for name in &self.services.config.autoload_extensions {
            match self.services.load_extension(name).await {
                Ok(()) => report.loaded.push(name.clone()),
                Err(e) => {
                    tracing::warn!(extension = %name, "skipping extension: {e}");
                    report.failed.push((name.clone(), e.to_string()));
                }
            }
        }

        tracing::info!(
            loaded = report.loaded.len(),
            failed = report.failed.len(),
            restored_tasks = report.restored_tasks,
            commands = self.services.registry.table().len(),
            "bot started"
        );
        Ok(report)
    }

    /// Dispatch events until the source closes or shutdown begins.
    pub async fn run(&self, events: mpsc::Receiver<GatewayEvent>) {
        self.dispatcher.run(events).await;
    }

    pub async fn shutdown(&self) -> Result<ShutdownReport> {
        self.shutdown_with_grace(self.services.config.shutdown_grace)
            .await
    }

    /// Stop accepting events, let in-flight invocations finish within
    /// `grace` (then cancel them), stop the scheduler, unload every extension
    /// and flush pending tasks.
    pub async fn shutdown_with_grace(&self, grace: Duration) -> Result<ShutdownReport> {
        tracing::info!(?grace, "shutting down");
        let drained = self.dispatcher.shutdown(grace).await;
        self.services.scheduler.shutdown(grace).await?;
        self.services.registry.unload_all(&self.services).await;
        let flushed_tasks = self.services.scheduler.flush().await?;

        tracing::info!(drained, flushed_tasks, "shutdown complete");
        Ok(ShutdownReport {
            drained,
            flushed_tasks,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use super::*;
    use crate::{
        messaging::recording::RecordingResponder,
        registry::{Extension, ExtensionBuilder, ExtensionState},
        store::MemoryStore,
        Error,
    };

    struct Fine;

    #[async_trait]
    impl Extension for Fine {
        async fn setup(&self, _ext: &mut ExtensionBuilder) -> crate::Result<()> {
            Ok(())
        }
    }

    struct Broken;

    #[async_trait]
    impl Extension for Broken {
        async fn setup(&self, _ext: &mut ExtensionBuilder) -> crate::Result<()> {
            Err(Error::External("no credentials".to_string()))
        }
    }

    #[tokio::test]
    async fn start_skips_failing_extensions() {
        let mut config = Config::new("t");
        config.autoload_extensions = vec!["fine".into(), "broken".into(), "missing".into()];
        let catalog = ExtensionCatalog::new()
            .with("fine", || Arc::new(Fine) as Arc<dyn Extension>)
            .with("broken", || Arc::new(Broken) as Arc<dyn Extension>);
        let services = Services::new(
            config,
            Arc::new(RecordingResponder::new()),
            Arc::new(MemoryStore::new()),
            catalog,
        );
        let bot = Bot::new(services.clone());

        let report = bot.start().await.unwrap();
        assert_eq!(report.loaded, vec!["fine"]);
        assert_eq!(report.failed.len(), 2);
        assert!(matches!(
            services.registry.state("broken").await,
            ExtensionState::Failed(_)
        ));

        let down = bot.shutdown_with_grace(Duration::from_millis(50)).await.unwrap();
        assert!(down.drained);
        assert_eq!(services.registry.state("fine").await, ExtensionState::Unloaded);
    }
}
