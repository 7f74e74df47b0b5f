//! Configuration watcher.
//!
//! # Data Flow
//! ```text
//! providers ──► raw queue ──► pre_load ──► ProviderThrottle (one per provider)
//!                                                   │
//!              listeners ◄── merge ◄── load ◄── validated queue
//! ```
//!
//! # Design Decisions
//! - `current` has a single writer (the load task); readers take snapshots
//! - Listeners run synchronously, in registration order, on the load task
//! - Each listener receives its own clone of the merged configuration

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, Level};

use crate::config::{Configuration, Configurations, Message};
use crate::provider::Provider;
use crate::watcher::merge::merge_configuration;
use crate::watcher::throttle::ProviderThrottle;

/// Capacity of the raw and validated queues.
pub const QUEUE_CAPACITY: usize = 100;

/// Callback invoked with every newly merged configuration.
pub type ConfigListener = Box<dyn Fn(Configuration) + Send + Sync>;

/// Collects provider messages, merges them and notifies listeners.
pub struct ConfigurationWatcher {
    providers: Vec<Arc<dyn Provider>>,
    default_entry_points: Vec<String>,
    throttle: Duration,
    required_provider: Option<String>,
    current: Arc<ArcSwap<Configurations>>,
    listeners: Vec<ConfigListener>,
    raw_tx: mpsc::Sender<Message>,
    raw_rx: Option<mpsc::Receiver<Message>>,
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl ConfigurationWatcher {
    pub fn new(default_entry_points: Vec<String>, throttle: Duration) -> Self {
        let (raw_tx, raw_rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            providers: Vec::new(),
            default_entry_points,
            throttle,
            required_provider: None,
            current: Arc::new(ArcSwap::from_pointee(Configurations::new())),
            listeners: Vec::new(),
            raw_tx,
            raw_rx: Some(raw_rx),
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    /// Hold notifications until `provider` has delivered a configuration.
    pub fn with_required_provider(mut self, provider: Option<String>) -> Self {
        self.required_provider = provider;
        self
    }

    pub fn add_provider(&mut self, provider: Arc<dyn Provider>) {
        self.providers.push(provider);
    }

    /// Register a listener. Only listeners added before [`start`](Self::start)
    /// are notified.
    pub fn add_listener<F>(&mut self, listener: F)
    where
        F: Fn(Configuration) + Send + Sync + 'static,
    {
        self.listeners.push(Box::new(listener));
    }

    /// Sender onto the raw queue, for configuration produced in-process.
    pub fn sender(&self) -> mpsc::Sender<Message> {
        self.raw_tx.clone()
    }

    /// Snapshot of the last accepted configuration of every provider.
    pub fn current_configurations(&self) -> Arc<Configurations> {
        self.current.load_full()
    }

    /// Spawn the pipeline tasks and start every provider.
    pub fn start(&mut self) {
        let Some(raw_rx) = self.raw_rx.take() else {
            debug!("Configuration watcher already started");
            return;
        };

        let (validated_tx, validated_rx) = mpsc::channel(QUEUE_CAPACITY);

        self.tasks.push(tokio::spawn(pre_load(
            raw_rx,
            validated_tx,
            self.current.clone(),
            self.throttle,
            self.token.clone(),
        )));

        let loader = Loader {
            current: self.current.clone(),
            default_entry_points: self.default_entry_points.clone(),
            required_provider: self.required_provider.clone(),
            listeners: std::mem::take(&mut self.listeners),
        };
        self.tasks
            .push(tokio::spawn(loader.run(validated_rx, self.token.clone())));

        for provider in &self.providers {
            let name = provider.name().to_string();
            match provider.provide(self.raw_tx.clone(), self.token.child_token()) {
                Ok(()) => info!(provider = %name, "Provider started"),
                Err(e) => error!(provider = %name, error = %e, "Cannot start provider"),
            }
        }
    }

    /// Cancel providers and pipeline tasks, then wait for the tasks to end.
    pub async fn stop(&mut self) {
        self.token.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                error!(error = %e, "Configuration watcher task failed");
            }
        }
        debug!("Configuration watcher stopped");
    }
}

async fn pre_load(
    mut raw_rx: mpsc::Receiver<Message>,
    validated_tx: mpsc::Sender<Message>,
    current: Arc<ArcSwap<Configurations>>,
    throttle: Duration,
    token: CancellationToken,
) {
    let mut throttles: HashMap<String, ProviderThrottle> = HashMap::new();

    loop {
        let message = tokio::select! {
            _ = token.cancelled() => break,
            message = raw_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        log_message(&message);

        if message.is_empty() {
            debug!(provider = %message.provider_name, "Skipping empty configuration");
            continue;
        }

        if is_current(&current, &message) {
            debug!(provider = %message.provider_name, "Skipping unchanged configuration");
            continue;
        }

        let name = message.provider_name.clone();
        let throttle = throttles
            .entry(name.clone())
            .and_modify(|t| {
                if t.is_finished() {
                    *t = ProviderThrottle::spawn(
                        name.clone(),
                        throttle,
                        validated_tx.clone(),
                        token.clone(),
                    );
                }
            })
            .or_insert_with(|| {
                ProviderThrottle::spawn(name.clone(), throttle, validated_tx.clone(), token.clone())
            });
        throttle.push(message);
    }

    debug!("Configuration pre-load stopped");
}

struct Loader {
    current: Arc<ArcSwap<Configurations>>,
    default_entry_points: Vec<String>,
    required_provider: Option<String>,
    listeners: Vec<ConfigListener>,
}

impl Loader {
    async fn run(self, mut validated_rx: mpsc::Receiver<Message>, token: CancellationToken) {
        loop {
            let message = tokio::select! {
                _ = token.cancelled() => break,
                message = validated_rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };
            self.load(message);
        }

        debug!("Configuration load stopped");
    }

    fn load(&self, message: Message) {
        if is_current(&self.current, &message) {
            debug!(provider = %message.provider_name, "Skipping unchanged configuration");
            return;
        }
        let Some(configuration) = message.configuration else {
            return;
        };

        let mut next = Configurations::clone(&self.current.load());
        next.insert(message.provider_name, configuration);
        let next = Arc::new(next);
        self.current.store(next.clone());

        if let Some(required) = &self.required_provider {
            if !next.contains_key(required) {
                debug!(provider = %required, "Waiting for required provider before publishing");
                return;
            }
        }

        let merged = merge_configuration(&next, &self.default_entry_points);
        if tracing::enabled!(Level::DEBUG) {
            match serde_json::to_string(&merged) {
                Ok(json) => debug!(configuration = %json, "Merged configuration"),
                Err(e) => error!(error = %e, "Could not serialize merged configuration"),
            }
        }

        for listener in &self.listeners {
            listener(merged.clone());
        }
    }
}

fn is_current(current: &ArcSwap<Configurations>, message: &Message) -> bool {
    match &message.configuration {
        Some(conf) => current.load().get(&message.provider_name) == Some(conf),
        None => false,
    }
}

fn log_message(message: &Message) {
    if !tracing::enabled!(Level::DEBUG) {
        return;
    }
    match serde_json::to_string(message) {
        Ok(json) => debug!(
            provider = %message.provider_name,
            configuration = %json,
            "Configuration received"
        ),
        Err(e) => error!(
            provider = %message.provider_name,
            error = %e,
            "Could not serialize configuration"
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::dynamic::{HttpConfiguration, Router};

    fn config(rule: &str) -> Configuration {
        let mut http = HttpConfiguration::default();
        http.routers.insert(
            "r".into(),
            Router {
                rule: rule.into(),
                entry_points: vec!["web".into()],
                ..Default::default()
            },
        );
        Configuration {
            http: Some(http),
            ..Default::default()
        }
    }

    fn recording_watcher(
        throttle: Duration,
    ) -> (ConfigurationWatcher, Arc<Mutex<Vec<Configuration>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = ConfigurationWatcher::new(vec!["web".into()], throttle);
        let sink = seen.clone();
        watcher.add_listener(move |conf| sink.lock().unwrap().push(conf));
        (watcher, seen)
    }

    #[tokio::test]
    async fn publishes_namespaced_configuration() {
        let (mut watcher, seen) = recording_watcher(Duration::ZERO);
        watcher.start();

        watcher
            .sender()
            .send(Message::new("p", config("Host(`a`)")))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].http.as_ref().unwrap().routers.contains_key("r@p"));
        assert!(watcher.current_configurations().contains_key("p"));
        drop(seen);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn repeated_configuration_is_ignored() {
        let (mut watcher, seen) = recording_watcher(Duration::ZERO);
        watcher.start();

        let tx = watcher.sender();
        tx.send(Message::new("p", config("Host(`a`)"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send(Message::new("p", config("Host(`a`)"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(seen.lock().unwrap().len(), 1);
        watcher.stop().await;
    }

    #[tokio::test]
    async fn empty_message_is_skipped() {
        let (mut watcher, seen) = recording_watcher(Duration::ZERO);
        watcher.start();

        let tx = watcher.sender();
        tx.send(Message {
            provider_name: "p".into(),
            configuration: None,
        })
        .await
        .unwrap();
        tx.send(Message::new("p", Configuration::empty_sections()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(seen.lock().unwrap().is_empty());
        assert!(watcher.current_configurations().is_empty());
        watcher.stop().await;
    }

    #[tokio::test]
    async fn required_provider_gates_publication() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut watcher = ConfigurationWatcher::new(vec![], Duration::ZERO)
            .with_required_provider(Some("main".into()));
        let sink = seen.clone();
        watcher.add_listener(move |conf| sink.lock().unwrap().push(conf));
        watcher.start();

        let tx = watcher.sender();
        tx.send(Message::new("side", config("Host(`a`)"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(seen.lock().unwrap().is_empty());

        tx.send(Message::new("main", config("Host(`b`)"))).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        let routers = &seen[0].http.as_ref().unwrap().routers;
        assert!(routers.contains_key("r@side") && routers.contains_key("r@main"));
        drop(seen);
        watcher.stop().await;
    }
}
