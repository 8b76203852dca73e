use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::config::{RecordFormat, SourceConfig, SourceKind};
use crate::envelope::{EnvelopeError, LogEnvelope};

use super::lines::LineSource;
use super::redis_list::RedisListSource;

/// One raw record as pulled from the source, stamped on arrival.
/// Bytes are kept undecoded so a bad record fails alone in `decode`.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    pub raw: Vec<u8>,
    pub arrival_time: DateTime<Utc>,
}

impl IngestRecord {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        Self {
            raw: raw.into(),
            arrival_time: Utc::now(),
        }
    }

    pub fn decode(&self, format: RecordFormat) -> Result<LogEnvelope, EnvelopeError> {
        let text = std::str::from_utf8(&self.raw)?;
        match format {
            RecordFormat::Json => LogEnvelope::from_json(text),
            RecordFormat::Text => Ok(LogEnvelope::from_text(text)),
        }
    }
}

#[async_trait::async_trait]
pub trait IngestSource: Send {
    /// Next record, or `None` once the source is exhausted.
    async fn next_record(&mut self) -> Result<Option<IngestRecord>>;
    fn records_pulled(&self) -> u64;
    fn name(&self) -> &'static str;
}

// Enum over the concrete sources; the pipeline boxes it as an IngestSource
pub enum SourceInstance {
    Redis(RedisListSource),
    Lines(LineSource),
}

impl SourceInstance {
    pub fn from_config(config: &SourceConfig) -> Result<Self> {
        let source = match config.kind {
            SourceKind::Redis => SourceInstance::Redis(RedisListSource::new(config)?),
            SourceKind::Stdin => SourceInstance::Lines(LineSource::stdin()),
        };
        info!("Initialized {} source ({:?} records)", source.name(), config.format);
        Ok(source)
    }
}

#[async_trait::async_trait]
impl IngestSource for SourceInstance {
    async fn next_record(&mut self) -> Result<Option<IngestRecord>> {
        match self {
            SourceInstance::Redis(s) => s.next_record().await,
            SourceInstance::Lines(s) => s.next_record().await,
        }
    }

    fn records_pulled(&self) -> u64 {
        match self {
            SourceInstance::Redis(s) => s.records_pulled(),
            SourceInstance::Lines(s) => s.records_pulled(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            SourceInstance::Redis(s) => s.name(),
            SourceInstance::Lines(s) => s.name(),
        }
    }
}
