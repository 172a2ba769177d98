//! Process lifecycle for one participant.
//!
//! 1. **Startup**: load `.env`, initialise tracing, read configuration, start
//!    the metrics exporter if enabled, connect to the broker
//! 2. **Runtime**: publish originated events, then run the participant's
//!    subscriber until a shutdown signal (Ctrl+C or SIGTERM)
//! 3. **Shutdown**: broadcast to the subscriber, let in-flight handlers finish
//!    within the grace period, report final health
//!
//! The broker connection is owned by [`launch`] and disconnected on every
//! exit path, including startup errors after the connection was made.
//!
//! # Example
//!
//! ```rust,ignore
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     lifecycle::launch(Service::Payment).await?;
//!     Ok(())
//! }
//! ```

use crate::config::{Config, ConfigError, KafkaConfig};
use crate::origin;
use crate::reactions::{AdminAudit, NotificationFanIn, PaymentConfirmation, TicketIssuer};
use crate::telemetry;
use smart_ticketing_core::event_bus::{EventBus, EventBusError};
use smart_ticketing_core::reaction::Reaction;
use smart_ticketing_core::topic::{Service, TopicRegistry};
use smart_ticketing_redpanda::RedpandaEventBus;
use smart_ticketing_runtime::metrics::{MetricsError, MetricsServer};
use smart_ticketing_runtime::retry::{RetryPolicy, retry_with_backoff};
use smart_ticketing_runtime::{HealthReport, InMemoryLedger, Participant, Publisher, Subscriber};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Why a participant process stopped abnormally.
#[derive(Error, Debug)]
pub enum LaunchError {
    /// Configuration could not be loaded.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The metrics exporter could not start.
    #[error(transparent)]
    Metrics(#[from] MetricsError),

    /// The broker stayed unreachable for the whole connect budget.
    #[error("cannot reach the broker: {0}")]
    Connect(#[source] EventBusError),

    /// An originated event could not be appended.
    #[error("failed to publish to {topic}: {source}")]
    Publish {
        /// Destination topic
        topic: String,
        /// Last delivery error
        #[source]
        source: EventBusError,
    },

    /// The subscriber task panicked or was cancelled.
    #[error("subscriber task failed: {0}")]
    Subscriber(String),
}

/// Run `service` as a standalone process against the configured broker.
///
/// # Errors
///
/// Returns [`LaunchError`] if startup fails or the participant stops
/// abnormally. The broker connection is released either way.
pub async fn launch(service: Service) -> Result<(), LaunchError> {
    let _ = dotenvy::dotenv();
    telemetry::init();

    info!(service = %service, "Starting participant");
    let config = Config::from_env()?;
    info!(
        service = %service,
        brokers = %config.kafka.brokers,
        client_id = %config.kafka.client_id,
        group = %service.consumer_group(),
        "Configuration loaded"
    );

    let _metrics = start_metrics(&config)?;

    let bus = Arc::new(connect(&config.kafka).await?);
    let shared: Arc<dyn EventBus> = bus.clone();
    let result = run_until(service, shared, &config, shutdown_signal()).await;

    match bus.disconnect().await {
        Ok(()) => info!(service = %service, "Broker connection closed"),
        Err(e) => warn!(service = %service, error = %e, "Disconnect failed"),
    }

    if let Err(e) = &result {
        error!(service = %service, error = %e, "Participant stopped with error");
    }
    result
}

fn start_metrics(config: &Config) -> Result<Option<MetricsServer>, LaunchError> {
    if !config.metrics.enabled {
        return Ok(None);
    }
    let mut server = MetricsServer::new(config.metrics_addr()?);
    server.start()?;
    Ok(Some(server))
}

/// Create the broker client and wait until it answers a metadata request.
///
/// # Errors
///
/// Returns [`LaunchError::Connect`] once `connect_max_retries` retries have
/// failed.
pub async fn connect(kafka: &KafkaConfig) -> Result<RedpandaEventBus, LaunchError> {
    let policy = RetryPolicy::builder()
        .max_retries(kafka.connect_max_retries)
        .initial_delay(Duration::from_millis(500))
        .max_delay(Duration::from_secs(10))
        .build();

    retry_with_backoff(&policy, || async {
        let bus = RedpandaEventBus::builder()
            .brokers(kafka.brokers.clone())
            .client_id(kafka.client_id.clone())
            .producer_acks(kafka.producer_acks.clone())
            .timeout(kafka.publish_timeout())
            .auto_offset_reset(kafka.auto_offset_reset.clone())
            .session_timeout(kafka.session_timeout())
            .build()?;
        bus.ping().await?;
        Ok::<_, EventBusError>(bus)
    })
    .await
    .map_err(LaunchError::Connect)
}

/// Run `service` on an already connected bus until `shutdown` completes.
///
/// Originating services publish their events and return without waiting.
/// Consuming services run their subscriber until `shutdown`, then drain.
/// The caller keeps ownership of `bus` and is responsible for disconnecting.
///
/// # Errors
///
/// Returns [`LaunchError::Publish`] if an originated event cannot be appended
/// and [`LaunchError::Subscriber`] if the subscriber task failed.
pub async fn run_until<F>(
    service: Service,
    bus: Arc<dyn EventBus>,
    config: &Config,
    shutdown: F,
) -> Result<(), LaunchError>
where
    F: Future<Output = ()>,
{
    for topic in TopicRegistry::unproduced_subscriptions(service) {
        warn!(
            service = %service,
            topic = %topic,
            "Subscribed topic has no producer in the registry, expect no traffic"
        );
    }

    originate(service, &bus, config).await?;

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let Some(subscriber) = subscriber_for(service, bus, config, shutdown_rx) else {
        info!(service = %service, "Nothing to consume, exiting");
        return Ok(());
    };

    let health = subscriber.health_handle();
    let handle = subscriber.spawn();
    info!(service = %service, group = %service.consumer_group(), "Participant running");

    shutdown.await;
    info!(service = %service, "Shutdown requested, draining in-flight envelopes");
    let _ = shutdown_tx.send(());

    // The subscriber enforces the grace period itself; this only guards against a hung task.
    let deadline = config.delivery.shutdown_grace() + Duration::from_secs(1);
    let outcome = join_subscriber(service, handle, deadline).await;

    let report = HealthReport::new(vec![health.check()]);
    info!(
        service = %service,
        status = %report.status,
        timestamp = %report.timestamp,
        "Final health"
    );
    for check in report.checks.iter().filter(|c| !c.status.is_healthy()) {
        warn!(
            component = %check.component,
            status = %check.status,
            message = check.message.as_deref().unwrap_or(""),
            metadata = ?check.metadata,
            "Component not healthy at shutdown"
        );
    }

    outcome
}

/// Wait up to `deadline` for the subscriber task, aborting it if it overruns
/// so nothing keeps using the bus after it is disconnected.
async fn join_subscriber(
    service: Service,
    mut handle: JoinHandle<()>,
    deadline: Duration,
) -> Result<(), LaunchError> {
    match tokio::time::timeout(deadline, &mut handle).await {
        Ok(Ok(())) => {
            info!(service = %service, "Subscriber stopped gracefully");
            Ok(())
        },
        Ok(Err(e)) => Err(LaunchError::Subscriber(e.to_string())),
        Err(_) => {
            warn!(service = %service, "Subscriber shutdown timed out, aborting");
            handle.abort();
            Ok(())
        },
    }
}

async fn originate(service: Service, bus: &Arc<dyn EventBus>, config: &Config) -> Result<(), LaunchError> {
    let events = origin::stimuli(service, &config.origin);
    if events.is_empty() {
        return Ok(());
    }

    let publisher = Publisher::for_service(service, Arc::clone(bus));
    let policy = delivery_retry_policy(config);
    for event in &events {
        let ack = publisher
            .send_with_retry(event, &policy)
            .await
            .map_err(|source| LaunchError::Publish {
                topic: event.topic.to_string(),
                source,
            })?;
        info!(
            service = %service,
            topic = %event.topic,
            key = event.key.as_deref().unwrap_or("<none>"),
            partition = ack.partition,
            offset = ack.offset,
            "Event originated"
        );
    }
    Ok(())
}

fn subscriber_for(
    service: Service,
    bus: Arc<dyn EventBus>,
    config: &Config,
    shutdown: broadcast::Receiver<()>,
) -> Option<Subscriber> {
    match service {
        Service::Payment => Some(participant(PaymentConfirmation, bus, config, shutdown)),
        Service::Ticketing => Some(participant(TicketIssuer, bus, config, shutdown)),
        Service::Notification => Some(participant(NotificationFanIn, bus, config, shutdown)),
        Service::Admin => Some(participant(AdminAudit, bus, config, shutdown)),
        Service::Passenger | Service::Transport => None,
    }
}

fn participant<R: Reaction>(
    reaction: R,
    bus: Arc<dyn EventBus>,
    config: &Config,
    shutdown: broadcast::Receiver<()>,
) -> Subscriber {
    let delivery = &config.delivery;
    let publisher = Publisher::for_service(reaction.service(), Arc::clone(&bus));

    Participant::new(reaction, publisher)
        .with_ledger(Arc::new(InMemoryLedger::new(delivery.idempotency_capacity)))
        .into_subscriber(bus, shutdown)
        .with_retry_policy(delivery_retry_policy(config))
        .with_shutdown_grace(delivery.shutdown_grace())
        .with_partition_buffer(delivery.partition_buffer)
}

fn delivery_retry_policy(config: &Config) -> RetryPolicy {
    RetryPolicy::builder()
        .max_retries(config.delivery.handler_max_retries)
        .initial_delay(config.delivery.retry_initial())
        .max_delay(config.delivery.retry_max())
        .build()
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
///
/// If a handler cannot be installed, that signal source is ignored and the
/// other one still works.
pub async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            },
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C signal");
        }
        () = terminate => {
            info!("Received SIGTERM signal");
        }
    }
}
