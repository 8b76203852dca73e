use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::admission::{self, AdmissionReceiver};
use crate::config::{Config, RecordFormat};
use crate::dedup::{DecisionConfig, DecisionEngine, DecisionStats, EngineError};
use crate::delivery::{self, DeliverySink};
use crate::envelope::AlertEvent;
use crate::sources::{IngestRecord, IngestSource, SourceInstance};

const SOURCE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Source -> decision engine -> admission channel -> delivery sink.
pub struct Alerter {
    config: Config,
    engine: Arc<DecisionEngine>,
    source: Mutex<Option<Box<dyn IngestSource>>>,
    sink: Arc<dyn DeliverySink>,
    admission_receiver: Mutex<Option<AdmissionReceiver>>,
    shutdown: CancellationToken,
    delivery_stats: Mutex<DeliveryStats>,
}

#[derive(Debug, Clone, Default)]
pub struct DeliveryStats {
    pub delivered: u64,
    pub failed: u64,
}

#[derive(Debug, Clone)]
pub struct AlerterStatus {
    pub is_running: bool,
    pub incidents: usize,
    pub decisions: DecisionStats,
    pub delivery: DeliveryStats,
}

impl std::fmt::Display for AlerterStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Alerter Status - Running: {}, Incidents: {}, Processed: {}, New: {}, Recurring: {}, Suppressed: {}, Delivered: {}, Failed: {}",
            self.is_running,
            self.incidents,
            self.decisions.messages_processed,
            self.decisions.new_incidents,
            self.decisions.recurring_alerts,
            self.decisions.suppressed,
            self.delivery.delivered,
            self.delivery.failed
        )
    }
}

impl Alerter {
    pub async fn new(config: Config) -> Result<Self> {
        info!("Initializing log alerter");

        let source = SourceInstance::from_config(&config.source)
            .context("Failed to initialize ingestion source")?;
        let sink = delivery::sink_from_config(&config.delivery)
            .context("Failed to initialize delivery sink")?;

        Ok(Self::with_parts(config, Box::new(source), Arc::from(sink)))
    }

    /// Assemble the pipeline around an explicit source and sink.
    pub fn with_parts(
        config: Config,
        source: Box<dyn IngestSource>,
        sink: Arc<dyn DeliverySink>,
    ) -> Self {
        let (admission_sender, admission_receiver) =
            admission::channel(config.dedup.admission_capacity);
        let engine = Arc::new(DecisionEngine::new(
            DecisionConfig::from(&config.dedup),
            admission_sender,
        ));

        info!(
            "Decision engine ready (threshold {} bits, re-alert window {}s, admission capacity {})",
            config.dedup.similarity_threshold,
            config.dedup.realert_window_secs,
            config.dedup.admission_capacity
        );

        Self {
            config,
            engine,
            source: Mutex::new(Some(source)),
            sink,
            admission_receiver: Mutex::new(Some(admission_receiver)),
            shutdown: CancellationToken::new(),
            delivery_stats: Mutex::new(DeliveryStats::default()),
        }
    }

    /// Run until shutdown is requested or the source is exhausted.
    pub async fn run(&self) -> Result<()> {
        info!("Starting log alerter");

        let source = self
            .source
            .lock()
            .await
            .take()
            .context("Source already taken")?;
        let admission_receiver = self
            .admission_receiver
            .lock()
            .await
            .take()
            .context("Admission receiver already taken")?;

        let (ingest_result, delivery_result, _) = tokio::join!(
            self.ingest(source),
            self.deliver_alerts(admission_receiver),
            self.maintain()
        );

        ingest_result?;
        delivery_result?;

        let status = self.get_status().await;
        info!("{}", status);
        Ok(())
    }

    pub fn shutdown(&self) {
        info!("Shutting down log alerter");
        self.shutdown.cancel();
    }

    async fn ingest(&self, mut source: Box<dyn IngestSource>) -> Result<()> {
        let format = self.config.source.format;
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    info!("Ingestion stopped, abandoning {} in-flight decisions", tasks.len());
                    tasks.abort_all();
                    break;
                }
                next = source.next_record() => {
                    match next {
                        Ok(Some(record)) => {
                            reap_finished(&mut tasks);
                            let engine = Arc::clone(&self.engine);
                            tasks.spawn(decide_record(engine, record, format));
                        }
                        Ok(None) => {
                            info!("Source {} exhausted after {} records", source.name(), source.records_pulled());
                            while let Some(joined) = tasks.join_next().await {
                                if let Err(e) = joined {
                                    error!("Decision task failed: {}", e);
                                }
                            }
                            // Let the delivery consumer drain and exit.
                            self.shutdown.cancel();
                            break;
                        }
                        Err(e) => {
                            warn!("Source {} failed: {:#}", source.name(), e);
                            tokio::select! {
                                _ = self.shutdown.cancelled() => {}
                                _ = tokio::time::sleep(SOURCE_RETRY_DELAY) => {}
                            }
                        }
                    }
                }
            }
        }

        Ok(())
    }

    async fn deliver_alerts(&self, mut receiver: AdmissionReceiver) -> Result<()> {
        info!("Delivery consumer started ({})", self.sink.name());

        loop {
            tokio::select! {
                biased;
                alert = receiver.recv() => {
                    match alert {
                        Some(alert) => self.deliver_one(&alert).await,
                        None => {
                            debug!("Admission channel closed");
                            break;
                        }
                    }
                }
                _ = self.shutdown.cancelled() => {
                    receiver.close();
                    let mut drained = 0;
                    while let Some(alert) = receiver.try_recv() {
                        self.deliver_one(&alert).await;
                        drained += 1;
                    }
                    debug!("Delivered {} buffered alerts during shutdown", drained);
                    break;
                }
            }
        }

        info!("Delivery consumer stopped");
        Ok(())
    }

    async fn deliver_one(&self, alert: &AlertEvent) {
        match self.sink.deliver(alert).await {
            Ok(()) => {
                self.delivery_stats.lock().await.delivered += 1;
            }
            Err(e) => {
                self.delivery_stats.lock().await.failed += 1;
                warn!("Failed to deliver alert {}: {:#}", alert.id, e);
            }
        }
    }

    /// Periodic eviction sweep and status report.
    async fn maintain(&self) {
        let interval = Duration::from_secs(self.config.dedup.maintenance_interval_secs);
        debug!("Maintenance task started (every {:?})", interval);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tokio::time::sleep(interval) => {
                    self.engine.evict_idle(Utc::now()).await;
                    info!("{}", self.get_status().await);
                }
            }
        }

        debug!("Maintenance task stopped");
    }

    pub async fn get_status(&self) -> AlerterStatus {
        AlerterStatus {
            is_running: !self.shutdown.is_cancelled(),
            incidents: self.engine.incident_count().await,
            decisions: self.engine.get_stats().await,
            delivery: self.delivery_stats.lock().await.clone(),
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.try_join_next() {
        if let Err(e) = joined {
            if e.is_panic() {
                error!("Decision task panicked: {}", e);
            }
        }
    }
}

async fn decide_record(engine: Arc<DecisionEngine>, record: IngestRecord, format: RecordFormat) {
    let envelope = match record.decode(format) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!("Skipping record: {}", e);
            return;
        }
    };

    match engine.process(envelope, record.arrival_time).await {
        Ok(decision) => debug!("Decision for incident {}: {:?}", decision.incident(), decision),
        Err(EngineError::AdmissionClosed(e)) => debug!("{}", e),
    }
}
