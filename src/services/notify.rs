use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tracing::error;

use super::error::NotifyError;

/// Operator alert channel
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    async fn send_alert(&self, subject: &str, body: &str, context: &Value) -> Result<(), NotifyError>;
}

/// Emits alerts as error-level log lines
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingNotifier;

#[async_trait]
impl NotificationChannel for TracingNotifier {
    async fn send_alert(&self, subject: &str, body: &str, context: &Value) -> Result<(), NotifyError> {
        error!(subject, body, %context, "ALERT");
        Ok(())
    }
}

/// A delivered alert
#[derive(Debug, Clone, PartialEq)]
pub struct Alert {
    pub subject: String,
    pub body: String,
    pub context: Value,
}

/// Keeps alerts in memory
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    alerts: Mutex<Vec<Alert>>,
}

impl MemoryNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Alerts whose subject contains `needle`
    pub fn matching(&self, needle: &str) -> Vec<Alert> {
        self.alerts()
            .into_iter()
            .filter(|a| a.subject.contains(needle))
            .collect()
    }
}

#[async_trait]
impl NotificationChannel for MemoryNotifier {
    async fn send_alert(&self, subject: &str, body: &str, context: &Value) -> Result<(), NotifyError> {
        self.alerts
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(Alert {
                subject: subject.to_string(),
                body: body.to_string(),
                context: context.clone(),
            });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_notifier_records_alerts() {
        let notifier = MemoryNotifier::new();
        notifier
            .send_alert("Circuit open", "import halted", &json!({"failures": 5}))
            .await
            .unwrap();
        notifier
            .send_alert("Health critical", "score 10", &json!({}))
            .await
            .unwrap();

        assert_eq!(notifier.alerts().len(), 2);
        let circuit = notifier.matching("Circuit");
        assert_eq!(circuit.len(), 1);
        assert_eq!(circuit[0].context["failures"], 5);
    }

    #[tokio::test]
    async fn tracing_notifier_never_fails() {
        assert!(TracingNotifier.send_alert("s", "b", &json!(null)).await.is_ok());
    }
}
