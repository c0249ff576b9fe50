//! Slave-side schema resolution.
//!
//! The resolver registers the master as the remote origin of every source
//! the device uses, then asks the local repository to build a model from
//! them. Each attempt runs in its own task and reports back to the
//! coordinator, which decides whether the outcome still matters.

use crate::coordinator::MountPointHandle;
use crate::error::MountError;
use crate::facade::ProxySchemaSourceProvider;
use crate::protocol::CoordinatorMessage;
use crate::schema::{SchemaRepository, SchemaSourceProvider};
use crate::services::Registration;
use netmount_types::{DeviceId, SourceId};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Attempts up to this number are always logged.
const VERBOSE_ATTEMPTS: u32 = 5;

/// After the verbose window only every this-many-th attempt is logged.
const QUIET_LOG_INTERVAL: u32 = 10;

/// Whether a retried resolution attempt should be logged.
pub fn should_log_attempt(attempt: u32) -> bool {
    attempt <= VERBOSE_ATTEMPTS || attempt % QUIET_LOG_INTERVAL == 0
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Decision {
    Retry { next: u32 },
    GiveUp,
}

pub(crate) struct SchemaResolver {
    device: DeviceId,
    repository: Arc<dyn SchemaRepository>,
    sources: Vec<SourceId>,
    registrations: Vec<Box<dyn Registration>>,
}

impl SchemaResolver {
    pub(crate) fn new(
        device: DeviceId,
        repository: Arc<dyn SchemaRepository>,
        sources: Vec<SourceId>,
        master: MountPointHandle,
    ) -> Self {
        let provider: Arc<dyn SchemaSourceProvider> =
            Arc::new(ProxySchemaSourceProvider::new(master));
        let registrations = sources
            .iter()
            .map(|id| repository.register_source(id.clone(), Arc::clone(&provider)))
            .collect();

        Self {
            device,
            repository,
            sources,
            registrations,
        }
    }

    /// Starts resolution attempt `attempt` for `generation`; the outcome is
    /// posted to `coordinator` as a continuation message.
    pub(crate) fn spawn_attempt(
        &self,
        generation: u64,
        attempt: u32,
        coordinator: mpsc::WeakSender<CoordinatorMessage>,
    ) {
        let device = self.device.clone();
        let repository = Arc::clone(&self.repository);
        let sources = self.sources.clone();

        tokio::spawn(async move {
            debug!("{device}: schema resolution attempt {attempt}");
            let message = match repository.build_model(&sources).await {
                Ok(model) => CoordinatorMessage::SchemaResolved { generation, model },
                Err(error) => CoordinatorMessage::SchemaResolutionFailed {
                    generation,
                    attempt,
                    error,
                },
            };
            match coordinator.upgrade() {
                Some(tx) => {
                    let _ = tx.send(message).await;
                }
                None => debug!("{device}: coordinator gone, dropping resolution outcome"),
            }
        });
    }

    /// Classifies a failed attempt. Only remote-call timeouts are retried,
    /// immediately and without limit.
    pub(crate) fn on_failure(&self, attempt: u32, error: &MountError) -> Decision {
        if error.is_transient() {
            if should_log_attempt(attempt) {
                warn!(
                    "{}: Failed to resolve schema context - retrying (attempt {attempt}): {error}",
                    self.device
                );
            }
            Decision::Retry {
                next: attempt.saturating_add(1),
            }
        } else {
            error!(
                "{}: Failed to resolve schema context after {attempt} attempts, device stays unmounted: {error}",
                self.device
            );
            Decision::GiveUp
        }
    }

    /// Withdraws the master as a source provider.
    pub(crate) fn close(self) {
        let count = self.registrations.len();
        for registration in self.registrations {
            registration.close();
        }
        debug!("{}: closed {count} schema source registrations", self.device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MountConfig;
    use crate::mock::MockMountPointService;
    use crate::schema::InMemorySchemaRepository;
    use std::time::Duration;

    fn resolver() -> SchemaResolver {
        let device = DeviceId::new("edge-9", "192.0.2.9:830".parse().unwrap());
        let repository: Arc<dyn SchemaRepository> = Arc::new(InMemorySchemaRepository::new());
        let master = MountPointHandle::spawn(
            device.clone(),
            MountConfig::default(),
            Arc::clone(&repository),
            Arc::new(MockMountPointService::new()),
        )
        .unwrap();
        SchemaResolver::new(device, repository, vec![SourceId::new("ietf-ip")], master)
    }

    fn timeout() -> MountError {
        MountError::AskTimeout {
            device: "edge-9".into(),
            operation: "fetch-schema-source",
            timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn logs_first_five_then_every_tenth() {
        let logged: Vec<u32> = (1..=40).filter(|a| should_log_attempt(*a)).collect();
        assert_eq!(logged, vec![1, 2, 3, 4, 5, 10, 20, 30, 40]);
    }

    #[tokio::test]
    async fn transient_failure_retries_with_next_attempt() {
        let resolver = resolver();
        assert_eq!(resolver.on_failure(1, &timeout()), Decision::Retry { next: 2 });
        assert_eq!(
            resolver.on_failure(u32::MAX, &timeout()),
            Decision::Retry { next: u32::MAX }
        );
        assert_eq!(
            resolver.on_failure(3, &MountError::Device("bad module".into())),
            Decision::GiveUp
        );
        resolver.close();
    }
}
