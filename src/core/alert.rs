// src/core/alert.rs

//! Alert dispatch: routes a `status_update` outcome that matches the
//! failure predicate to the configured `push_alert_method` plugin. Recovery
//! and ordinary transitions are logged only, never pushed — the cluster
//! state's log ring already carries those for operators polling `get_status`.

use tracing::error;

use crate::core::cluster::StatusUpdateOutcome;
use crate::core::plugin::PluginRegistry;

/// Dispatches `message` to the alert plugin named by `alert_method` if
/// `outcome` is a failure and a method is configured; otherwise a no-op.
pub async fn dispatch(
    plugins: &PluginRegistry,
    alert_method: Option<&str>,
    outcome: StatusUpdateOutcome,
    message: &str,
) {
    if outcome != StatusUpdateOutcome::Failure {
        return;
    }
    let Some(method) = alert_method else {
        return;
    };
    let result = plugins.get(method).run(&[message.to_string()]).await;
    if !result.ok {
        error!(details = %result.details, "alert plugin failed to deliver notification");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::plugin::{Plugin, PluginResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingAlert(Arc<AtomicUsize>);

    #[async_trait]
    impl Plugin for CountingAlert {
        fn name(&self) -> &str {
            "counting"
        }
        async fn run(&self, _args: &[String]) -> PluginResult {
            self.0.fetch_add(1, Ordering::SeqCst);
            PluginResult::ok("delivered")
        }
    }

    #[tokio::test]
    async fn only_failure_outcomes_trigger_dispatch() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut registry = PluginRegistry::new();
        registry.register("counting", Arc::new(CountingAlert(counter.clone())));

        dispatch(&registry, Some("counting"), StatusUpdateOutcome::Recovery, "recovered").await;
        dispatch(&registry, Some("counting"), StatusUpdateOutcome::Unchanged, "no-op").await;
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        dispatch(&registry, Some("counting"), StatusUpdateOutcome::Failure, "down").await;
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn no_configured_method_is_a_no_op() {
        let registry = PluginRegistry::new();
        dispatch(&registry, None, StatusUpdateOutcome::Failure, "down").await;
    }
}
