pub mod config;
pub mod initialization;
pub mod logging_system;
pub mod shutdown;

pub use config::{BufferTier, Config, ConfigError, ExportRequest, LogLevel, MemoryOverflow, PortSelection};
pub use initialization::InitializationError;
pub use logging_system::{LoggingSystem, setup_logging_safe};
pub use shutdown::ShutdownSignal;

use crate::buffer::{Buffer, CloudQueueClient, ExportSummary};
use crate::domain::{QueueInfo, TierKind};
use crate::reliability::MetricsCollector;
use crate::sender::{BackendApi, HttpBackendApi, SenderTaskFactory, ShutdownSummary};
use std::process;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub struct App {
    config: Config,
    cloud_queue: Option<Arc<dyn CloudQueueClient>>,
}

impl App {
    pub fn from_args<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<std::ffi::OsString> + Clone,
    {
        Ok(Self::from_config(Config::from_args(args)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            cloud_queue: None,
        }
    }

    /// Queue service client backing the external tier.
    pub fn with_cloud_queue(mut self, client: Arc<dyn CloudQueueClient>) -> Self {
        self.cloud_queue = Some(client);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    async fn open_buffers(
        &self,
        selection: Option<&PortSelection>,
    ) -> Result<Vec<(QueueInfo, Buffer)>, InitializationError> {
        let storage = self
            .config
            .storage_config(self.cloud_queue.clone())
            .map_err(|e| InitializationError::ResourceInitFailed {
                resource: "storage tier".to_string(),
                source: Box::new(e),
            })?;
        let pipelines =
            self.config
                .pipelines()
                .map_err(|e| InitializationError::ResourceInitFailed {
                    resource: "pipelines".to_string(),
                    source: Box::new(e),
                })?;

        let mut buffers = Vec::with_capacity(pipelines.len());
        for info in pipelines {
            if selection.is_some_and(|ports| !ports.matches(info.key())) {
                continue;
            }
            let buffer = Buffer::open(&info, &storage).await.map_err(|e| {
                InitializationError::ResourceInitFailed {
                    resource: format!("buffer for {}", info.key()),
                    source: Box::new(e),
                }
            })?;
            buffers.push((info, buffer));
        }
        Ok(buffers)
    }

    /// Opens every buffer, purges it when `purge_buffer` is set and starts the
    /// sender tasks of every configured pipeline.
    pub async fn start(&self, backend: Arc<dyn BackendApi>) -> Result<SenderTaskFactory, BoxError> {
        let metrics = Arc::new(MetricsCollector::new()?);
        let factory = SenderTaskFactory::new(backend, self.config.properties(), metrics)
            .with_shutdown_timeout(self.config.shutdown_timeout);

        for (info, buffer) in self.open_buffers(None).await? {
            if self.config.purge_buffer {
                let purged = buffer.truncate().await?;
                if purged > 0 {
                    warn!(pipeline = %info.key(), tasks = purged, "Purged buffered tasks");
                }
            }
            let backlog = buffer.size().await?;
            if backlog > 0 {
                info!(pipeline = %info.key(), tasks = backlog, "Resuming buffered backlog");
            }
            factory.create_sender_tasks(&info, buffer)?;
        }
        Ok(factory)
    }

    /// Runs against `backend` until `signal` fires, then shuts every pipeline down.
    pub async fn run_until(
        &self,
        backend: Arc<dyn BackendApi>,
        signal: &ShutdownSignal,
    ) -> Result<ShutdownSummary, BoxError> {
        let factory = self.start(backend).await?;
        info!(
            pipelines = factory.handles().len(),
            server = %self.config.server,
            tier = ?self.config.buffer_tier,
            "telemetry-proxy is running"
        );

        signal.wait().await;
        Ok(factory.shutdown().await)
    }

    /// Runs against the configured HTTP backend until SIGINT or SIGTERM.
    pub async fn run(self) -> Result<ShutdownSummary, BoxError> {
        let backend = Arc::new(HttpBackendApi::new(self.config.client_config())?);
        let signal = ShutdownSignal::new();
        let listener = signal.listen_for_os_signals();

        let result = self.run_until(backend, &signal).await;
        listener.abort();
        result
    }

    /// Writes the buffered items of the selected pipelines to the output file.
    pub async fn export(&self, request: &ExportRequest) -> Result<ExportSummary, BoxError> {
        if self.config.buffer_tier == BufferTier::Memory {
            warn!("Memory tier keeps nothing across restarts; export will be empty");
        }

        let file = tokio::fs::File::create(&request.output).await?;
        let mut sink = tokio::io::BufWriter::new(file);
        let mut summary = ExportSummary::default();

        for (info, buffer) in self.open_buffers(Some(&request.ports)).await? {
            if info.tier() == TierKind::Memory {
                continue;
            }
            let exported = buffer.export(&mut sink, request.retain).await?;
            if exported.tasks > 0 {
                info!(
                    pipeline = %info.key(),
                    tasks = exported.tasks,
                    items = exported.items,
                    retain = request.retain,
                    "Exported buffered items"
                );
            }
            summary += exported;
        }

        sink.flush().await?;
        Ok(summary)
    }
}

pub fn get_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

pub async fn main() -> Result<(), BoxError> {
    let config = match Config::from_args(std::env::args_os()) {
        Ok(config) => config,
        Err(ConfigError::Cli(e)) => e.exit(),
        Err(e) => {
            eprintln!("Configuration error: {e}");
            process::exit(2);
        }
    };

    setup_logging_safe(config.log_level, &config.log_directives)?;
    info!(version = %get_version(), "Starting telemetry-proxy");

    let app = App::from_config(config);
    if let Some(request) = app.config().export_request()? {
        let summary = app.export(&request).await?;
        info!(
            tasks = summary.tasks,
            items = summary.items,
            output = %request.output.display(),
            "Export complete"
        );
        return Ok(());
    }

    match app.run().await {
        Ok(summary) => {
            info!(
                pipelines = summary.pipelines,
                drained = summary.drained_items,
                dropped = summary.dropped_items,
                "telemetry-proxy stopped"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "telemetry-proxy failed");
            process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DataSubmissionTask, EntityType, HandlerKey, Item};
    use crate::sender::SubmissionOutcome;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[derive(Debug, Default)]
    struct CountingBackend {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl BackendApi for CountingBackend {
        async fn submit(&self, _key: &HandlerKey, items: &[Item]) -> SubmissionOutcome {
            self.delivered.fetch_add(items.len(), Ordering::SeqCst);
            SubmissionOutcome::Delivered
        }
    }

    fn disk_config(dir: &Path) -> Config {
        let mut config = Config {
            buffer: dir.to_path_buf(),
            flush_threads: Some(1),
            push_flush_interval_ms: 3_600_000,
            ..Config::default()
        };
        config.post_process().unwrap();
        config
    }

    fn task(handle: &str, items: &[&str]) -> DataSubmissionTask {
        DataSubmissionTask::new(
            &HandlerKey::new(EntityType::Points, handle),
            items.iter().map(|i| (*i).to_string()).collect(),
        )
        .unwrap()
    }

    async fn seed(app: &App, handle: &str, items: &[&str]) {
        let buffers = app.open_buffers(None).await.unwrap();
        let (_, buffer) = buffers
            .iter()
            .find(|(info, _)| {
                info.key() == &HandlerKey::new(EntityType::Points, handle)
            })
            .unwrap();
        buffer.enqueue(None, task(handle, items)).await.unwrap();
    }

    #[tokio::test]
    async fn test_run_until_starts_and_stops_pipelines() {
        let dir = tempfile::tempdir().unwrap();
        let app = App::from_config(disk_config(dir.path()));
        let backend = Arc::new(CountingBackend::default());
        let signal = ShutdownSignal::new();
        signal.trigger();

        let summary = app.run_until(backend, &signal).await.unwrap();
        assert_eq!(summary.pipelines, 5);
        assert_eq!(summary.abandoned_workers, 0);
    }

    #[tokio::test]
    async fn test_start_purges_buffer_when_configured() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = disk_config(dir.path());
        seed(&App::from_config(config.clone()), "2878", &["a 1", "b 2"]).await;

        config.purge_buffer = true;
        let app = App::from_config(config);
        let factory = app.start(Arc::new(CountingBackend::default())).await.unwrap();
        let key = HandlerKey::new(EntityType::Points, "2878");
        let handle = factory.handle(&key).unwrap();

        assert_eq!(handle.buffer().size().await.unwrap(), 0);
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_backlog_is_delivered_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = disk_config(dir.path());
        seed(&App::from_config(config.clone()), "2878", &["a 1", "b 2", "c 3"]).await;

        config.push_flush_interval_ms = 20;
        config.post_process().unwrap();
        let app = App::from_config(config);
        let backend = Arc::new(CountingBackend::default());
        let factory = app.start(backend.clone()).await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), async {
            while backend.delivered.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        factory.shutdown().await;
    }

    #[tokio::test]
    async fn test_export_writes_selected_ports() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = disk_config(dir.path());
        config.push_listener_ports = "2878,2879".to_string();
        let app = App::from_config(config);
        seed(&app, "2878", &["cpu 1", "cpu 2"]).await;
        seed(&app, "2879", &["mem 3"]).await;

        let output = dir.path().join("export.txt");
        let request = ExportRequest {
            ports: PortSelection::parse("2878").unwrap(),
            output: output.clone(),
            retain: false,
        };
        let summary = app.export(&request).await.unwrap();
        assert_eq!(summary.items, 2);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "cpu 1\ncpu 2\n");

        let summary = app.export(&request).await.unwrap();
        assert_eq!(summary.items, 0);

        let request = ExportRequest {
            ports: PortSelection::All,
            output: output.clone(),
            retain: true,
        };
        let summary = app.export(&request).await.unwrap();
        assert_eq!(summary.items, 1);
        assert_eq!(std::fs::read_to_string(&output).unwrap(), "mem 3\n");
    }
}
