//! Fan-out of committed changes to watchers and the reload hook

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use futures::stream;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, warn};

use govstore_core::config_store::{ConfigChange, ConfigChangeStream, ConfigDomain, ConfigReloadHook};
use govstore_core::model::ClientConfig;

const CHANNEL_CAPACITY: usize = 256;

pub(crate) struct Notifier {
    sender: broadcast::Sender<ConfigChange>,
    version: AtomicU64,
    hook: RwLock<Option<Arc<dyn ConfigReloadHook>>>,
}

impl Notifier {
    pub(crate) fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            version: AtomicU64::new(0),
            hook: RwLock::new(None),
        }
    }

    pub(crate) fn set_hook(&self, hook: Arc<dyn ConfigReloadHook>) {
        *self.hook.write() = Some(hook);
    }

    pub(crate) fn publish(&self, domain: ConfigDomain) {
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let change = ConfigChange {
            domain,
            timestamp: chrono::Utc::now(),
            version,
        };
        // No receivers is not an error
        if self.sender.send(change).is_err() {
            debug!("No watchers for {:?} change {}", domain, version);
        }
    }

    pub(crate) async fn client_config_changed(&self, config: &ClientConfig) {
        let hook = self.hook.read().clone();
        if let Some(hook) = hook {
            hook.client_config_changed(config).await;
        }
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }

    /// Changes published after this call
    pub(crate) fn subscribe(&self) -> ConfigChangeStream<'static> {
        let receiver = self.sender.subscribe();
        let stream = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(change) => return Some((change, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Config change watcher lagged, skipped {} changes", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Box::pin(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn test_publish_reaches_subscribers_in_order() {
        let notifier = Notifier::new();
        let mut changes = notifier.subscribe();

        notifier.publish(ConfigDomain::Providers);
        notifier.publish(ConfigDomain::ClientConfig);

        let first = changes.next().await.unwrap();
        let second = changes.next().await.unwrap();
        assert_eq!(first.domain, ConfigDomain::Providers);
        assert_eq!(first.version, 1);
        assert_eq!(second.domain, ConfigDomain::ClientConfig);
        assert_eq!(second.version, 2);
    }

    #[test]
    fn test_publish_without_subscribers() {
        let notifier = Notifier::new();
        notifier.publish(ConfigDomain::Plugins);
        assert_eq!(notifier.version(), 1);
    }
}
