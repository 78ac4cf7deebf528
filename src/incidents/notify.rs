//! Notification dispatch
//!
//! The incident manager never talks to the gateway directly: it pushes onto a
//! bounded queue ([`NotificationDispatcher`]) and moves on. The dispatch
//! worker drains the queue and calls the [`Notifier`]. Failures are logged
//! and not retried.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::types::AlertKey;

pub const ACCOUNT_SID_ENV: &str = "SMS_ACCOUNT_SID";
pub const AUTH_TOKEN_ENV: &str = "SMS_AUTH_TOKEN";
pub const FROM_NUMBER_ENV: &str = "SMS_FROM_NUMBER";
pub const TO_NUMBER_ENV: &str = "SMS_TO_NUMBER";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DispatchError {
    #[error("notification queue full")]
    QueueFull,
    #[error("notification queue closed")]
    Closed,
    #[error("gateway error: {0}")]
    Gateway(String),
}

/// A queued outbound message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub key: AlertKey,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Notifier
// ============================================================================

#[async_trait]
pub trait Notifier: Send + Sync + 'static {
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<(), DispatchError>;

    fn notifier_name(&self) -> &str;
}

/// Twilio-compatible SMS REST gateway.
#[derive(Clone)]
pub struct SmsGateway {
    http: reqwest::Client,
    base_url: String,
    account_sid: String,
    auth_token: String,
}

impl SmsGateway {
    pub fn new(
        base_url: &str,
        account_sid: &str,
        auth_token: &str,
        timeout: Duration,
    ) -> Result<Self, DispatchError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Gateway(e.to_string()))?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            account_sid: account_sid.to_string(),
            auth_token: auth_token.to_string(),
        })
    }

    /// Build from `SMS_ACCOUNT_SID` / `SMS_AUTH_TOKEN`. `None` when either is
    /// unset or empty.
    pub fn from_env(config: &NotificationConfig) -> Option<Result<Self, DispatchError>> {
        let sid = env_non_empty(ACCOUNT_SID_ENV)?;
        let token = env_non_empty(AUTH_TOKEN_ENV)?;
        Some(Self::new(
            &config.gateway_url,
            &sid,
            &token,
            Duration::from_secs(config.request_timeout_secs),
        ))
    }

    fn messages_url(&self) -> String {
        format!("{}/Accounts/{}/Messages.json", self.base_url, self.account_sid)
    }
}

#[async_trait]
impl Notifier for SmsGateway {
    async fn send(&self, to: &str, from: &str, body: &str) -> Result<(), DispatchError> {
        let resp = self
            .http
            .post(self.messages_url())
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&[("To", to), ("From", from), ("Body", body)])
            .send()
            .await
            .map_err(|e| DispatchError::Gateway(e.to_string()))?;

        let status = resp.status();
        if status.is_success() {
            Ok(())
        } else {
            let detail = resp.text().await.unwrap_or_default();
            Err(DispatchError::Gateway(format!("status {status}: {detail}")))
        }
    }

    fn notifier_name(&self) -> &str {
        "sms"
    }
}

/// Writes notifications to the log instead of sending them.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, to: &str, _from: &str, body: &str) -> Result<(), DispatchError> {
        info!(to = %to, "[Notify] {}", body);
        Ok(())
    }

    fn notifier_name(&self) -> &str {
        "log"
    }
}

/// Sender/recipient numbers, from config first, then the environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipients {
    pub to: String,
    pub from: String,
}

impl Recipients {
    pub fn resolve(config: &NotificationConfig) -> Self {
        let pick = |configured: &Option<String>, env: &str| {
            configured
                .clone()
                .filter(|s| !s.trim().is_empty())
                .or_else(|| env_non_empty(env))
                .unwrap_or_default()
        };
        Self {
            to: pick(&config.to_number, TO_NUMBER_ENV),
            from: pick(&config.from_number, FROM_NUMBER_ENV),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.to.is_empty() && !self.from.is_empty()
    }
}

fn env_non_empty(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Producer half of the bounded notification queue. Cheap to clone.
#[derive(Clone)]
pub struct NotificationDispatcher {
    tx: mpsc::Sender<Notification>,
}

impl NotificationDispatcher {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Notification>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    /// Enqueue without waiting. A full queue is an error; the caller logs it.
    pub fn dispatch(&self, notification: Notification) -> Result<(), DispatchError> {
        self.tx.try_send(notification).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => DispatchError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => DispatchError::Closed,
        })
    }
}

/// Drain the queue until cancelled, sending each notification once.
///
/// Whatever is already queued at cancellation is still sent.
pub async fn run_dispatch_worker(
    mut rx: mpsc::Receiver<Notification>,
    notifier: Arc<dyn Notifier>,
    recipients: Recipients,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    info!("[Dispatch] Worker started (notifier: {})", notifier.notifier_name());
    let mut sent = 0u64;
    let mut failed = 0u64;

    loop {
        let notification = tokio::select! {
            _ = cancel.cancelled() => {
                rx.close();
                break;
            }
            next = rx.recv() => match next {
                Some(n) => n,
                None => break,
            },
        };
        deliver(notifier.as_ref(), &recipients, &notification, &mut sent, &mut failed).await;
    }

    while let Some(notification) = rx.recv().await {
        deliver(notifier.as_ref(), &recipients, &notification, &mut sent, &mut failed).await;
    }

    info!("[Dispatch] Worker stopped ({} sent, {} failed)", sent, failed);
    Ok(())
}

async fn deliver(
    notifier: &dyn Notifier,
    recipients: &Recipients,
    notification: &Notification,
    sent: &mut u64,
    failed: &mut u64,
) {
    match notifier
        .send(&recipients.to, &recipients.from, &notification.body)
        .await
    {
        Ok(()) => *sent += 1,
        Err(e) => {
            *failed += 1;
            warn!(key = %notification.key, error = %e, "[Dispatch] Notification failed, not retried");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recording {
        bodies: Mutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for Recording {
        async fn send(&self, _to: &str, _from: &str, body: &str) -> Result<(), DispatchError> {
            self.bodies.lock().unwrap().push(body.to_string());
            if self.fail {
                Err(DispatchError::Gateway("boom".to_string()))
            } else {
                Ok(())
            }
        }

        fn notifier_name(&self) -> &str {
            "recording"
        }
    }

    fn note(body: &str) -> Notification {
        Notification {
            key: AlertKey::metric("ingest-a", "lag"),
            body: body.to_string(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_full_queue_is_dispatch_error() {
        let (dispatcher, _rx) = NotificationDispatcher::channel(1);
        dispatcher.dispatch(note("a")).unwrap();
        assert_eq!(dispatcher.dispatch(note("b")), Err(DispatchError::QueueFull));
    }

    #[test]
    fn test_closed_queue_is_dispatch_error() {
        let (dispatcher, rx) = NotificationDispatcher::channel(1);
        drop(rx);
        assert_eq!(dispatcher.dispatch(note("a")), Err(DispatchError::Closed));
    }

    #[tokio::test]
    async fn test_worker_sends_queued_then_stops() {
        let (dispatcher, rx) = NotificationDispatcher::channel(8);
        dispatcher.dispatch(note("first")).unwrap();
        dispatcher.dispatch(note("second")).unwrap();

        let notifier = Arc::new(Recording::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let recipients = Recipients {
            to: "+15550001".to_string(),
            from: "+15550002".to_string(),
        };
        run_dispatch_worker(rx, notifier.clone(), recipients, cancel).await.unwrap();

        assert_eq!(*notifier.bodies.lock().unwrap(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn test_worker_continues_after_gateway_failure() {
        let (dispatcher, rx) = NotificationDispatcher::channel(8);
        dispatcher.dispatch(note("one")).unwrap();
        dispatcher.dispatch(note("two")).unwrap();
        drop(dispatcher);

        let notifier = Arc::new(Recording {
            fail: true,
            ..Recording::default()
        });
        let recipients = Recipients {
            to: String::new(),
            from: String::new(),
        };
        run_dispatch_worker(rx, notifier.clone(), recipients, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(notifier.bodies.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_messages_url() {
        let gw = SmsGateway::new("https://sms.example.com/2010-04-01/", "AC123", "tok", Duration::from_secs(1))
            .unwrap();
        assert_eq!(gw.messages_url(), "https://sms.example.com/2010-04-01/Accounts/AC123/Messages.json");
    }
}
