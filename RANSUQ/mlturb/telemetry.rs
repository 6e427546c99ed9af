use std::{fmt, path::PathBuf, sync::Arc};

use anyhow::Result;
use serde_json::Value;
use shared_event_bus::{EventPublisher, EventRecord};
use shared_logging::{JsonLogger, LogLevel, LogRecord};
use tokio::runtime::{Handle, Runtime};

/// Builder for pipeline telemetry sinks.
pub struct RansuqTelemetryBuilder {
    module: String,
    run_id: Option<String>,
    log_path: Option<PathBuf>,
    min_level: LogLevel,
    event_publisher: Option<Arc<dyn EventPublisher>>,
}

impl RansuqTelemetryBuilder {
    /// Creates the builder.
    #[must_use]
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            run_id: None,
            log_path: None,
            min_level: LogLevel::Info,
            event_publisher: None,
        }
    }

    /// Sets the JSON-lines log path.
    #[must_use]
    pub fn log_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_path = Some(path.into());
        self
    }

    /// Drops log records below `level`; `Info` unless lowered.
    #[must_use]
    pub const fn min_level(mut self, level: LogLevel) -> Self {
        self.min_level = level;
        self
    }

    /// Tags every record and event with a run identifier.
    #[must_use]
    pub fn run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Sets the event publisher.
    #[must_use]
    pub fn event_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.event_publisher = Some(publisher);
        self
    }

    /// Builds the telemetry handle.
    pub fn build(self) -> Result<RansuqTelemetry> {
        let logger = match self.log_path {
            Some(path) => Some(JsonLogger::new(path)?.with_min_level(self.min_level)),
            None => None,
        };
        let event = match self.event_publisher {
            Some(publisher) => Some(EventHandle::new(publisher)?),
            None => None,
        };
        Ok(RansuqTelemetry {
            inner: Arc::new(TelemetryInner {
                module: self.module,
                run_id: self.run_id,
                logger,
                event,
            }),
        })
    }
}

/// Telemetry handle shared by the loader, scheduler, trainer and orchestrator.
#[derive(Clone)]
pub struct RansuqTelemetry {
    inner: Arc<TelemetryInner>,
}

impl fmt::Debug for RansuqTelemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RansuqTelemetry")
            .field("module", &self.inner.module)
            .field("run_id", &self.inner.run_id)
            .finish()
    }
}

struct TelemetryInner {
    module: String,
    run_id: Option<String>,
    logger: Option<JsonLogger>,
    event: Option<EventHandle>,
}

struct EventHandle {
    runtime: Runtime,
    publisher: Arc<dyn EventPublisher>,
}

impl EventHandle {
    fn new(publisher: Arc<dyn EventPublisher>) -> Result<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("ransuq-telemetry")
            .enable_all()
            .build()?;
        Ok(Self { runtime, publisher })
    }

    fn publish(&self, record: EventRecord) -> Result<()> {
        if let Ok(handle) = Handle::try_current() {
            let publisher = Arc::clone(&self.publisher);
            handle.spawn(async move {
                if let Err(err) = publisher.publish(record).await {
                    eprintln!("telemetry event publish failed: {err:?}");
                }
            });
            Ok(())
        } else {
            self.runtime.block_on(self.publisher.publish(record))
        }
    }
}

impl RansuqTelemetry {
    /// Returns a builder.
    #[must_use]
    pub fn builder(module: impl Into<String>) -> RansuqTelemetryBuilder {
        RansuqTelemetryBuilder::new(module)
    }

    /// Run identifier, if one was assigned.
    #[must_use]
    pub fn run_id(&self) -> Option<&str> {
        self.inner.run_id.as_deref()
    }

    /// Logs structured metadata.
    pub fn log(&self, level: LogLevel, message: &str, metadata: Value) -> Result<()> {
        if let Some(logger) = &self.inner.logger {
            let mut record = LogRecord::new(&self.inner.module, level, message).with_metadata(metadata);
            record.run_id.clone_from(&self.inner.run_id);
            logger.log(&record)?;
        }
        Ok(())
    }

    /// Emits an event on the bus.
    pub fn event(&self, event_type: &str, payload: Value) -> Result<()> {
        if let Some(handle) = &self.inner.event {
            let mut record = EventRecord::new(&self.inner.module, event_type, payload);
            record.run_id.clone_from(&self.inner.run_id);
            handle.publish(record)?;
        }
        Ok(())
    }
}

/// Logs through optional telemetry, ignoring sink failures.
pub fn log(telemetry: Option<&RansuqTelemetry>, level: LogLevel, message: &str, metadata: Value) {
    if let Some(tel) = telemetry {
        let _ = tel.log(level, message, metadata);
    }
}

/// Emits through optional telemetry, ignoring sink failures.
pub fn event(telemetry: Option<&RansuqTelemetry>, event_type: &str, payload: Value) {
    if let Some(tel) = telemetry {
        let _ = tel.event(event_type, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use shared_event_bus::MemoryEventBus;
    use tempfile::tempdir;

    #[test]
    fn telemetry_writes_log_and_event() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("ransuq.log");
        let bus = Arc::new(MemoryEventBus::new(16));
        let telemetry = RansuqTelemetry::builder("mlturb")
            .log_path(&path)
            .run_id("run-7")
            .event_publisher(bus.clone())
            .build()
            .unwrap();
        telemetry
            .log(LogLevel::Info, "mlturb.start", json!({ "training": 3 }))
            .unwrap();
        telemetry
            .event("mlturb.training.finished", json!({ "evaluations": 40 }))
            .unwrap();
        let records = shared_logging::read_records(&path).unwrap();
        assert_eq!(records[0].message, "mlturb.start");
        assert_eq!(records[0].run_id.as_deref(), Some("run-7"));
        let events = bus.snapshot();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].run_id.as_deref(), Some("run-7"));
    }

    #[test]
    fn debug_records_need_a_lowered_threshold() {
        let tmp = tempdir().unwrap();
        let quiet = tmp.path().join("quiet.log");
        let telemetry = RansuqTelemetry::builder("mlturb").log_path(&quiet).build().unwrap();
        telemetry.log(LogLevel::Debug, "scheduler.job.started", json!({})).unwrap();
        telemetry.log(LogLevel::Info, "mlturb.started", json!({})).unwrap();
        let records = shared_logging::read_records(&quiet).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].message, "mlturb.started");

        let verbose = tmp.path().join("verbose.log");
        let telemetry = RansuqTelemetry::builder("mlturb")
            .log_path(&verbose)
            .min_level(LogLevel::Debug)
            .build()
            .unwrap();
        telemetry.log(LogLevel::Debug, "scheduler.job.started", json!({})).unwrap();
        assert_eq!(shared_logging::read_records(&verbose).unwrap().len(), 1);
    }

    #[test]
    fn absent_sinks_are_noops() {
        let telemetry = RansuqTelemetry::builder("quiet").build().unwrap();
        assert!(telemetry.log(LogLevel::Error, "x", json!({})).is_ok());
        assert!(telemetry.event("x", json!({})).is_ok());
        log(None, LogLevel::Info, "ignored", json!({}));
    }
}
