//! Connector lifecycle and outbound routing.
//!
//! The manager builds enabled connectors through the factory table,
//! starts each in its own task, prunes startups that have already failed
//! after a short readiness grace, and runs the outbound dispatcher that
//! routes bus messages to the owning connector by the `channel` field.
//! Shutdown stops the dispatcher first, then every connector.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use spanbot_core::MessageBus;
use spanbot_types::config::Config;
use spanbot_types::error::ChannelError;

use crate::traits::{Channel, ChannelFactory};

/// Time the manager waits before inspecting startup results.
const READINESS_GRACE: Duration = Duration::from_secs(1);

/// Owns connector lifecycle and the outbound dispatcher.
pub struct ChannelManager {
    bus: Arc<MessageBus>,
    factories: HashMap<String, Arc<dyn ChannelFactory>>,
    channels: RwLock<HashMap<String, Arc<dyn Channel>>>,
    cancel_tokens: RwLock<HashMap<String, CancellationToken>>,
    task_handles: RwLock<HashMap<String, JoinHandle<Result<(), ChannelError>>>>,
    dispatcher: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ChannelManager {
    /// Create a manager with the given factory table.
    pub fn new(bus: Arc<MessageBus>, factories: Vec<Arc<dyn ChannelFactory>>) -> Self {
        let factories = factories
            .into_iter()
            .map(|f| (f.channel_name().to_owned(), f))
            .collect();
        Self {
            bus,
            factories,
            channels: RwLock::new(HashMap::new()),
            cancel_tokens: RwLock::new(HashMap::new()),
            task_handles: RwLock::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        }
    }

    /// A live connector by name.
    pub async fn get(&self, name: &str) -> Option<Arc<dyn Channel>> {
        self.channels.read().await.get(name).cloned()
    }

    /// Names of live connectors.
    pub async fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Build and start every enabled channel, then the dispatcher.
    ///
    /// Returns the number of connectors that survived startup.
    pub async fn start_all(&self, config: &Config) -> usize {
        for name in config.enabled_channels() {
            let Some(factory) = self.factories.get(&name) else {
                warn!(channel = %name, "channel enabled but not registered");
                continue;
            };
            let Some(section) = config.channels.get(&name) else {
                continue;
            };

            match factory.build(section, self.bus.clone()) {
                Ok(channel) => {
                    self.spawn_channel(&name, channel).await;
                    info!(channel = %name, "channel start task created");
                }
                Err(e) => {
                    error!(channel = %name, error = %e, "failed to create channel");
                }
            }
        }

        // Give connectors a moment to initialize, then drop the ones
        // whose start task has already failed.
        tokio::time::sleep(READINESS_GRACE).await;
        self.prune_failed().await;

        let started = self.channels.read().await.len();
        if started > 0 {
            self.start_dispatcher().await;
        }
        started
    }

    async fn spawn_channel(&self, name: &str, channel: Arc<dyn Channel>) {
        let cancel = CancellationToken::new();
        let task_channel = channel.clone();
        let task_cancel = cancel.clone();
        let task_name = name.to_owned();

        let handle = tokio::spawn(async move {
            let result = task_channel.start(task_cancel).await;
            if let Err(ref e) = result {
                error!(channel = %task_name, error = %e, "channel exited with error");
            }
            result
        });

        self.channels.write().await.insert(name.to_owned(), channel);
        self.cancel_tokens.write().await.insert(name.to_owned(), cancel);
        self.task_handles.write().await.insert(name.to_owned(), handle);
    }

    /// Remove channels whose start task already finished with an error.
    async fn prune_failed(&self) {
        let mut failed = Vec::new();
        {
            let mut handles = self.task_handles.write().await;
            let finished: Vec<String> = handles
                .iter()
                .filter(|(_, h)| h.is_finished())
                .map(|(name, _)| name.clone())
                .collect();

            for name in finished {
                if let Some(handle) = handles.remove(&name) {
                    match handle.await {
                        Ok(Ok(())) => debug!(channel = %name, "channel finished cleanly"),
                        Ok(Err(e)) => {
                            error!(channel = %name, error = %e, "channel failed to start");
                            failed.push(name);
                        }
                        Err(e) => {
                            error!(channel = %name, error = %e, "channel start task panicked");
                            failed.push(name);
                        }
                    }
                }
            }
        }

        for name in failed {
            self.channels.write().await.remove(&name);
            self.cancel_tokens.write().await.remove(&name);
        }
    }

    /// Spawn the outbound dispatcher worker.
    async fn start_dispatcher(&self) {
        let cancel = CancellationToken::new();
        let bus = self.bus.clone();
        let channels = self.snapshot().await;
        let dispatch_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            debug!("outbound dispatcher started");
            loop {
                tokio::select! {
                    _ = dispatch_cancel.cancelled() => {
                        info!("outbound dispatcher shutting down");
                        break;
                    }
                    msg = bus.consume_outbound() => {
                        let Some(msg) = msg else {
                            info!("outbound queue closed, dispatcher exiting");
                            break;
                        };

                        let Some(channel) = channels.get(&msg.channel) else {
                            warn!(channel = %msg.channel, "outbound message for unknown channel, dropping");
                            continue;
                        };

                        if let Err(e) = channel.send(&msg).await {
                            error!(
                                channel = %msg.channel,
                                chat_id = %msg.chat_id,
                                error = %e,
                                "outbound send failed"
                            );
                        }
                    }
                }
            }
        });

        *self.dispatcher.lock().await = Some((cancel, handle));
    }

    async fn snapshot(&self) -> Arc<HashMap<String, Arc<dyn Channel>>> {
        Arc::new(self.channels.read().await.clone())
    }

    /// Stop the dispatcher first, then every connector.
    pub async fn stop_all(&self) {
        if let Some((cancel, handle)) = self.dispatcher.lock().await.take() {
            cancel.cancel();
            let _ = handle.await;
        }

        let names: Vec<String> = self.cancel_tokens.read().await.keys().cloned().collect();
        for name in names {
            if let Some(token) = self.cancel_tokens.write().await.remove(&name) {
                token.cancel();
            }
            if let Some(handle) = self.task_handles.write().await.remove(&name) {
                let _ = handle.await;
            }
            info!(channel = %name, "channel stopped");
        }

        self.channels.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::{ChannelStatus, MessageId};
    use async_trait::async_trait;
    use spanbot_types::config::ChannelSection;
    use spanbot_types::event::OutboundMessage;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct MockChannel {
        channel_name: String,
        fail_start: bool,
        sent: Arc<Mutex<Vec<OutboundMessage>>>,
    }

    #[async_trait]
    impl Channel for MockChannel {
        fn name(&self) -> &str {
            &self.channel_name
        }

        fn status(&self) -> ChannelStatus {
            ChannelStatus::Running
        }

        fn is_allowed(&self, _sender_id: &str) -> bool {
            true
        }

        async fn start(&self, cancel: CancellationToken) -> Result<(), ChannelError> {
            if self.fail_start {
                return Err(ChannelError::AuthFailed("bad token".into()));
            }
            cancel.cancelled().await;
            Ok(())
        }

        async fn send(&self, msg: &OutboundMessage) -> Result<MessageId, ChannelError> {
            self.sent.lock().await.push(msg.clone());
            Ok(MessageId(format!("mock-{}", msg.chat_id)))
        }
    }

    struct MockFactory {
        channel_name: String,
        fail_start: bool,
        sent: Arc<Mutex<Vec<OutboundMessage>>>,
        built: Arc<AtomicUsize>,
    }

    impl ChannelFactory for MockFactory {
        fn channel_name(&self) -> &str {
            &self.channel_name
        }

        fn build(
            &self,
            _config: &ChannelSection,
            _bus: Arc<MessageBus>,
        ) -> Result<Arc<dyn Channel>, ChannelError> {
            self.built.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(MockChannel {
                channel_name: self.channel_name.clone(),
                fail_start: self.fail_start,
                sent: self.sent.clone(),
            }))
        }
    }

    fn config_with(channels: &[&str]) -> Config {
        let mut config = Config::default();
        for name in channels {
            config.channels.insert(
                name.to_string(),
                ChannelSection {
                    enabled: true,
                    ..Default::default()
                },
            );
        }
        config
    }

    fn factory(name: &str, fail_start: bool) -> (Arc<MockFactory>, Arc<Mutex<Vec<OutboundMessage>>>) {
        let sent = Arc::new(Mutex::new(Vec::new()));
        let factory = Arc::new(MockFactory {
            channel_name: name.into(),
            fail_start,
            sent: sent.clone(),
            built: Arc::new(AtomicUsize::new(0)),
        });
        (factory, sent)
    }

    #[tokio::test]
    async fn starts_enabled_channels_only() {
        let bus = Arc::new(MessageBus::new());
        let (good, _) = factory("alpha", false);
        let (other, _) = factory("beta", false);
        let manager = ChannelManager::new(bus, vec![good.clone(), other]);

        let started = manager.start_all(&config_with(&["alpha"])).await;
        assert_eq!(started, 1);
        assert_eq!(manager.active().await, vec!["alpha"]);
        assert_eq!(good.built.load(Ordering::SeqCst), 1);

        manager.stop_all().await;
        assert!(manager.active().await.is_empty());
    }

    #[tokio::test]
    async fn failed_startup_is_pruned() {
        let bus = Arc::new(MessageBus::new());
        let (bad, _) = factory("broken", true);
        let (good, _) = factory("healthy", false);
        let manager = ChannelManager::new(bus, vec![bad, good]);

        let started = manager.start_all(&config_with(&["broken", "healthy"])).await;
        assert_eq!(started, 1);
        assert_eq!(manager.active().await, vec!["healthy"]);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn dispatcher_routes_by_channel_field() {
        let bus = Arc::new(MessageBus::new());
        let (alpha, alpha_sent) = factory("alpha", false);
        let (beta, beta_sent) = factory("beta", false);
        let manager = ChannelManager::new(bus.clone(), vec![alpha, beta]);

        manager.start_all(&config_with(&["alpha", "beta"])).await;

        bus.publish_outbound(OutboundMessage::new("alpha", "c1", "to alpha"));
        bus.publish_outbound(OutboundMessage::new("beta", "c2", "to beta"));
        bus.publish_outbound(OutboundMessage::new("missing", "c3", "dropped"));

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(alpha_sent.lock().await.len(), 1);
        assert_eq!(alpha_sent.lock().await[0].content, "to alpha");
        assert_eq!(beta_sent.lock().await.len(), 1);

        manager.stop_all().await;
    }

    #[tokio::test]
    async fn unregistered_channel_is_skipped() {
        let bus = Arc::new(MessageBus::new());
        let manager = ChannelManager::new(bus, vec![]);
        let started = manager.start_all(&config_with(&["ghost"])).await;
        assert_eq!(started, 0);
    }
}
