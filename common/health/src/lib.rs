use std::collections::HashMap;
use std::ops::Add;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tokio::sync::mpsc;
use tracing::warn;

/// Health reporting for the long-running loops of a process.
///
/// Both alert binaries are made of asynchronous loops (queue consumers,
/// flush tasks, the retention cycle), and the process should only pass its
/// liveness probe while all of them keep making progress. Each loop registers
/// a component and must report healthy more often than its deadline; a loop
/// that stops reporting turns the whole process unhealthy.
#[derive(Default, Debug)]
pub struct HealthStatus {
    /// The overall status: true if all components are healthy
    pub healthy: bool,
    /// Current status of each registered component, for display
    pub components: HashMap<String, ComponentStatus>,
}

impl IntoResponse for HealthStatus {
    /// Computes the axum status code based on the overall health status,
    /// and prints each component status in the body for debugging.
    fn into_response(self) -> Response {
        let body = format!("{self:?}");
        match self.healthy {
            true => (StatusCode::OK, body),
            false => (StatusCode::INTERNAL_SERVER_ERROR, body),
        }
        .into_response()
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ComponentStatus {
    /// Automatically set when a component is newly registered
    Starting,
    /// Recently reported healthy, will need to report again before the date
    HealthyUntil(time::OffsetDateTime),
    /// Reported unhealthy
    Unhealthy,
}

struct HealthMessage {
    component: String,
    status: ComponentStatus,
}

#[derive(Clone)]
pub struct HealthHandle {
    component: String,
    deadline: Duration,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthHandle {
    /// Asynchronously report healthy, returns when the message is queued.
    /// Must be called more frequently than the configured deadline.
    pub async fn report_healthy(&self) {
        self.report_status(ComponentStatus::HealthyUntil(
            time::OffsetDateTime::now_utc().add(self.deadline),
        ))
        .await
    }

    /// Asynchronously report component status, returns when the message is queued.
    pub async fn report_status(&self, status: ComponentStatus) {
        let message = HealthMessage {
            component: self.component.clone(),
            status,
        };
        if let Err(err) = self.sender.send(message).await {
            warn!("failed to report health status: {}", err)
        }
    }
}

#[derive(Clone)]
pub struct HealthRegistry {
    name: String,
    components: Arc<RwLock<HashMap<String, ComponentStatus>>>,
    sender: mpsc::Sender<HealthMessage>,
}

impl HealthRegistry {
    pub fn new(name: &str) -> Self {
        let (tx, mut rx) = mpsc::channel::<HealthMessage>(16);
        let registry = Self {
            name: name.to_owned(),
            components: Default::default(),
            sender: tx,
        };

        let components = registry.components.clone();
        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Ok(mut map) = components.write() {
                    _ = map.insert(message.component, message.status);
                } else {
                    // Poisoned lock: just warn, the probes will fail and the process restart
                    warn!("poisoned HealthRegistry lock")
                }
            }
        });

        registry
    }

    /// Registers a new component in the registry. The returned handle should be passed
    /// to the component, to allow it to frequently report its health status.
    pub async fn register(&self, component: String, deadline: Duration) -> HealthHandle {
        let handle = HealthHandle {
            component,
            deadline,
            sender: self.sender.clone(),
        };
        handle.report_status(ComponentStatus::Starting).await;
        handle
    }

    /// Returns the overall process status, computed from the status of all the components
    /// currently registered. Can be used as an axum handler.
    pub fn get_status(&self) -> HealthStatus {
        let components = self
            .components
            .read()
            .expect("poisoned HealthRegistry lock");

        let now = time::OffsetDateTime::now_utc();
        let result = HealthStatus {
            // Unhealthy until a first component registers.
            healthy: !components.is_empty(),
            components: Default::default(),
        };

        let result = components
            .iter()
            .fold(result, |mut result, (name, status)| {
                match status {
                    ComponentStatus::HealthyUntil(until) => {
                        if !until.gt(&now) {
                            result.healthy = false
                        }
                    }
                    _ => result.healthy = false,
                }
                result.components.insert(name.clone(), status.clone());
                result
            });

        if !result.healthy {
            warn!("{} is unhealthy: {:?}", self.name, result.components);
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn empty_registry_is_unhealthy() {
        let registry = HealthRegistry::new("liveness");
        assert!(!registry.get_status().healthy);
    }

    #[tokio::test]
    async fn healthy_component_within_deadline() {
        let registry = HealthRegistry::new("liveness");
        let handle = registry
            .register("consumer".to_string(), Duration::from_secs(30))
            .await;
        handle.report_healthy().await;

        // Reports are applied by a background task, give it a beat.
        tokio::task::yield_now().await;

        let status = registry.get_status();
        assert!(status.healthy);
        assert!(matches!(
            status.components.get("consumer"),
            Some(ComponentStatus::HealthyUntil(_))
        ));
    }

    #[tokio::test]
    async fn starting_component_is_not_healthy() {
        let registry = HealthRegistry::new("liveness");
        let _handle = registry
            .register("retention".to_string(), Duration::from_secs(30))
            .await;

        tokio::task::yield_now().await;

        let status = registry.get_status();
        assert!(!status.healthy);
        assert_eq!(
            status.components.get("retention"),
            Some(&ComponentStatus::Starting)
        );
    }

    #[tokio::test]
    async fn unhealthy_report_fails_the_process() {
        let registry = HealthRegistry::new("liveness");
        let healthy = registry
            .register("consumer".to_string(), Duration::from_secs(30))
            .await;
        let failing = registry
            .register("flusher".to_string(), Duration::from_secs(30))
            .await;

        healthy.report_healthy().await;
        failing.report_status(ComponentStatus::Unhealthy).await;
        tokio::task::yield_now().await;

        assert!(!registry.get_status().healthy);
    }
}
