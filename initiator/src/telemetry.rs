//! Application telemetry
//!
//! A [`TelemetryClient`] is a cheaply cloneable handle, shared through the
//! application by passing it where it is needed. It is initialized once with
//! a [`TelemetrySink`] that delivers telemetry to its destination. Until then,
//! or while tracking is disabled, telemetry is discarded.

use std::{
    collections::BTreeMap,
    error,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, SystemTime},
};

use initiator_tokens::TokenRefreshed;
use tokio::{sync::broadcast, task::JoinHandle};
use uuid::Uuid;

/// Named string values attached to telemetry
pub type Properties = BTreeMap<String, String>;

/// Named numeric values attached to telemetry
pub type Metrics = BTreeMap<String, f64>;

/// Who and what telemetry is being reported for
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TelemetryContext {
    /// Uniquely identifies the user
    pub user_key: String,
    /// Uniquely identifies this session of the application
    pub session_id: Uuid,
    /// The operating system the application is running on
    pub operating_system: &'static str,
}

/// A call made to an external component
#[derive(Clone, Debug, PartialEq)]
pub struct Dependency {
    /// The name of the external dependency
    pub name: String,
    /// The command issued to the dependency
    pub command: String,
    /// When the call started
    pub start_time: SystemTime,
    /// How long the call took
    pub duration: Duration,
    /// Whether the call succeeded
    pub success: bool,
}

/// A destination for telemetry
pub trait TelemetrySink: Send + Sync {
    /// Records a user action or other event
    fn track_event(
        &self,
        context: &TelemetryContext,
        name: &str,
        properties: &Properties,
        metrics: &Metrics,
    );

    /// Records a measurement
    fn track_metric(
        &self,
        context: &TelemetryContext,
        name: &str,
        value: f64,
        properties: &Properties,
    );

    /// Records an error for diagnosis
    fn track_exception(
        &self,
        context: &TelemetryContext,
        error: &(dyn error::Error + 'static),
        properties: &Properties,
    );

    /// Records a call made to an external component
    fn track_dependency(&self, context: &TelemetryContext, dependency: &Dependency);

    /// Delivers any buffered telemetry
    fn flush(&self);
}

/// Writes telemetry as `tracing` events under the `telemetry` target
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingTelemetrySink;

impl TelemetrySink for TracingTelemetrySink {
    fn track_event(
        &self,
        context: &TelemetryContext,
        name: &str,
        properties: &Properties,
        metrics: &Metrics,
    ) {
        tracing::info!(
            target: "telemetry",
            session_id = %context.session_id,
            user_key = %context.user_key,
            name,
            ?properties,
            ?metrics,
            "event"
        );
    }

    fn track_metric(
        &self,
        context: &TelemetryContext,
        name: &str,
        value: f64,
        properties: &Properties,
    ) {
        tracing::info!(
            target: "telemetry",
            session_id = %context.session_id,
            user_key = %context.user_key,
            name,
            value,
            ?properties,
            "metric"
        );
    }

    fn track_exception(
        &self,
        context: &TelemetryContext,
        error: &(dyn error::Error + 'static),
        properties: &Properties,
    ) {
        tracing::error!(
            target: "telemetry",
            session_id = %context.session_id,
            user_key = %context.user_key,
            error,
            ?properties,
            "exception"
        );
    }

    fn track_dependency(&self, context: &TelemetryContext, dependency: &Dependency) {
        tracing::info!(
            target: "telemetry",
            session_id = %context.session_id,
            user_key = %context.user_key,
            dependency = %dependency.name,
            command = %dependency.command,
            duration_ms = dependency.duration.as_millis() as u64,
            success = dependency.success,
            "dependency"
        );
    }

    fn flush(&self) {}
}

struct Initialized {
    sink: Arc<dyn TelemetrySink>,
    context: TelemetryContext,
}

struct Inner {
    startup: tokio::sync::Mutex<()>,
    state: parking_lot::RwLock<Option<Arc<Initialized>>>,
    tracking_enabled: AtomicBool,
}

/// A handle for reporting telemetry
#[derive(Clone)]
pub struct TelemetryClient {
    inner: Arc<Inner>,
}

impl Default for TelemetryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TelemetryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetryClient")
            .field("context", &self.context())
            .field("tracking_enabled", &self.tracking_enabled())
            .finish_non_exhaustive()
    }
}

impl TelemetryClient {
    /// Constructs an uninitialized client with tracking enabled
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                startup: tokio::sync::Mutex::new(()),
                state: parking_lot::RwLock::new(None),
                tracking_enabled: AtomicBool::new(true),
            }),
        }
    }

    /// Initializes the client to deliver telemetry for `user_key` to `sink`
    ///
    /// A client can only be initialized once. Later calls log a warning and
    /// return `false`.
    pub async fn initialize(&self, sink: Arc<dyn TelemetrySink>, user_key: impl Into<String>) -> bool {
        let _startup = self.inner.startup.lock().await;

        if self.inner.state.read().is_some() {
            tracing::warn!("telemetry client can only be initialized once");
            return false;
        }

        let context = TelemetryContext {
            user_key: user_key.into(),
            session_id: Uuid::new_v4(),
            operating_system: std::env::consts::OS,
        };

        tracing::debug!(session_id = %context.session_id, "telemetry client initialized");
        *self.inner.state.write() = Some(Arc::new(Initialized { sink, context }));
        true
    }

    /// Whether the client has been initialized
    pub fn is_initialized(&self) -> bool {
        self.inner.state.read().is_some()
    }

    /// The context telemetry is reported under, once initialized
    pub fn context(&self) -> Option<TelemetryContext> {
        self.inner
            .state
            .read()
            .as_ref()
            .map(|s| s.context.clone())
    }

    /// Enables or disables delivery of telemetry
    pub fn set_tracking_enabled(&self, enabled: bool) {
        self.inner.tracking_enabled.store(enabled, Ordering::Relaxed);
    }

    /// Whether telemetry is currently being delivered
    pub fn tracking_enabled(&self) -> bool {
        self.inner.tracking_enabled.load(Ordering::Relaxed)
    }

    /// Records a user action or other event
    pub fn track_event(&self, name: &str, properties: &Properties, metrics: &Metrics) {
        if let Some(s) = self.postable() {
            s.sink.track_event(&s.context, name, properties, metrics);
        }
    }

    /// Records a measurement
    pub fn track_metric(&self, name: &str, value: f64, properties: &Properties) {
        if let Some(s) = self.postable() {
            s.sink.track_metric(&s.context, name, value, properties);
        }
    }

    /// Records an error for diagnosis
    pub fn track_exception(&self, error: &(dyn error::Error + 'static), properties: &Properties) {
        if let Some(s) = self.postable() {
            s.sink.track_exception(&s.context, error, properties);
        }
    }

    /// Records a call made to an external component
    pub fn track_dependency(&self, dependency: &Dependency) {
        if let Some(s) = self.postable() {
            s.sink.track_dependency(&s.context, dependency);
        }
    }

    /// Delivers any buffered telemetry
    pub fn flush(&self) {
        let state = self.inner.state.read().clone();
        if let Some(s) = state {
            s.sink.flush();
        }
    }

    fn postable(&self) -> Option<Arc<Initialized>> {
        if !self.tracking_enabled() {
            return None;
        }
        self.inner.state.read().clone()
    }
}

/// Reports each background token refresh as a `TokenRefreshed` telemetry event
///
/// The returned task ends once the token manager that produced `refreshes`
/// has been dropped.
pub fn forward_token_refreshes(
    mut refreshes: broadcast::Receiver<TokenRefreshed>,
    client: TelemetryClient,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match refreshes.recv().await {
                Ok(event) => {
                    let properties =
                        Properties::from([("token_name".to_owned(), event.token_name.to_string())]);
                    let metrics = Metrics::from([(
                        "expiration".to_owned(),
                        event.token.expiration_date().0 as f64,
                    )]);
                    client.track_event("TokenRefreshed", &properties, &metrics);
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "telemetry missed token refresh notifications");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use initiator_tokens::{TokenData, TokenName};

    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: parking_lot::Mutex<Vec<(String, Properties, Metrics)>>,
        metrics: parking_lot::Mutex<Vec<(String, f64)>>,
        exceptions: parking_lot::Mutex<Vec<String>>,
        dependencies: parking_lot::Mutex<Vec<Dependency>>,
        flushes: parking_lot::Mutex<usize>,
    }

    impl TelemetrySink for RecordingSink {
        fn track_event(&self, _: &TelemetryContext, name: &str, p: &Properties, m: &Metrics) {
            self.events
                .lock()
                .push((name.to_owned(), p.clone(), m.clone()));
        }

        fn track_metric(&self, _: &TelemetryContext, name: &str, value: f64, _: &Properties) {
            self.metrics.lock().push((name.to_owned(), value));
        }

        fn track_exception(
            &self,
            _: &TelemetryContext,
            error: &(dyn error::Error + 'static),
            _: &Properties,
        ) {
            self.exceptions.lock().push(error.to_string());
        }

        fn track_dependency(&self, _: &TelemetryContext, dependency: &Dependency) {
            self.dependencies.lock().push(dependency.clone());
        }

        fn flush(&self) {
            *self.flushes.lock() += 1;
        }
    }

    #[tokio::test]
    async fn telemetry_before_initialization_is_dropped() {
        let client = TelemetryClient::new();
        let sink = Arc::new(RecordingSink::default());

        client.track_event("early", &Properties::new(), &Metrics::new());
        assert!(client.initialize(sink.clone(), "user-1").await);
        client.track_event("late", &Properties::new(), &Metrics::new());

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "late");
    }

    #[tokio::test]
    async fn initializes_only_once() {
        let client = TelemetryClient::new();
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());

        assert!(client.initialize(first.clone(), "user-1").await);
        let context = client.context().unwrap();
        assert!(!client.clone().initialize(second.clone(), "user-2").await);

        client.track_metric("latency", 1.5, &Properties::new());

        assert_eq!(client.context(), Some(context.clone()));
        assert_eq!(context.user_key, "user-1");
        assert_eq!(first.metrics.lock().as_slice(), &[("latency".to_owned(), 1.5)]);
        assert!(second.metrics.lock().is_empty());
    }

    #[tokio::test]
    async fn concurrent_initialization_has_one_winner() {
        let client = TelemetryClient::new();

        let attempts = (0..8).map(|i| {
            let client = client.clone();
            tokio::spawn(async move {
                client
                    .initialize(Arc::new(TracingTelemetrySink), format!("user-{i}"))
                    .await
            })
        });

        let mut winners = 0;
        for attempt in attempts.collect::<Vec<_>>() {
            if attempt.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn sessions_are_unique_per_client() {
        let first = TelemetryClient::new();
        let second = TelemetryClient::new();
        first.initialize(Arc::new(TracingTelemetrySink), "user").await;
        second.initialize(Arc::new(TracingTelemetrySink), "user").await;

        assert_ne!(
            first.context().unwrap().session_id,
            second.context().unwrap().session_id
        );
    }

    #[tokio::test]
    async fn disabled_tracking_drops_telemetry() {
        let client = TelemetryClient::new();
        let sink = Arc::new(RecordingSink::default());
        client.initialize(sink.clone(), "user").await;

        client.set_tracking_enabled(false);
        client.track_exception(&std::fmt::Error, &Properties::new());
        client.track_dependency(&Dependency {
            name: "idp".to_owned(),
            command: "token".to_owned(),
            start_time: SystemTime::now(),
            duration: Duration::from_millis(40),
            success: true,
        });
        client.set_tracking_enabled(true);
        client.track_exception(&std::fmt::Error, &Properties::new());
        client.flush();

        assert_eq!(sink.exceptions.lock().len(), 1);
        assert!(sink.dependencies.lock().is_empty());
        assert_eq!(*sink.flushes.lock(), 1);
    }

    #[tokio::test]
    async fn forwards_token_refreshes_as_events() {
        let client = TelemetryClient::new();
        let sink = Arc::new(RecordingSink::default());
        client.initialize(sink.clone(), "user").await;

        let (tx, rx) = broadcast::channel(4);
        let task = forward_token_refreshes(rx, client);

        let token =
            TokenData::new("eyJhbGciOiJub25lIn0.eyJleHAiOjEwLCJzdWIiOiJhbGljZSJ9.").unwrap();
        tx.send(TokenRefreshed {
            token_name: TokenName::from_static("api"),
            token,
        })
        .unwrap();
        drop(tx);
        task.await.unwrap();

        let events = sink.events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "TokenRefreshed");
        assert_eq!(events[0].1["token_name"], "api");
        assert_eq!(events[0].2["expiration"], 10.0);
    }
}
