// src/notify.rs
//
// Push notifications for room transitions.
//
// ─ Architecture ─────────────────────────────────────────────────────────────
//
//   EventBus ──subscribe()──> notification dispatcher (background task)
//                                  │
//                                  ├─ filter: live/offline edges only
//                                  ├─ render title/body (template or default)
//                                  └─ fan out to every enabled channel
//
// Channels are independent: one endpoint timing out or erroring never stops
// the others, and a notification failure never touches a recording.  Results
// are summarized to the console.
//
// ────────────────────────────────────────────────────────────────────────────

use std::sync::Arc;
use std::time::Duration;

use futures::future::{join_all, BoxFuture};
use reqwest::Client;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::Settings;
use crate::events::{EventBus, EventType, RoomEvent};

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

// ─── Templates ──────────────────────────────────────────────────────────────

pub const NAME_PLACEHOLDER: &str = "[直播間名稱]";
pub const TIME_PLACEHOLDER: &str = "[時間]";

/// Substitute the two supported placeholders into a user template.
pub fn render_template(template: &str, room_name: &str, time: &str) -> String {
    template
        .replace(NAME_PLACEHOLDER, room_name)
        .replace(TIME_PLACEHOLDER, time)
}

fn default_body(event: &RoomEvent) -> String {
    match event.event_type {
        EventType::WentLive => format!(
            "主播 {} 開播了！({})",
            event.anchor,
            event.local_time()
        ),
        _ => format!("主播 {} 已下播。({})", event.anchor, event.local_time()),
    }
}

fn title_for(event: &RoomEvent) -> String {
    match event.event_type {
        EventType::WentLive => format!("[{}] 開播通知", event.platform),
        _ => format!("[{}] 下播通知", event.platform),
    }
}

// ─── The notifier seam ──────────────────────────────────────────────────────

pub trait Notifier: Send + Sync {
    fn name(&self) -> &'static str;

    fn notify<'a>(&'a self, title: &'a str, body: &'a str) -> BoxFuture<'a, Result<(), String>>;
}

// ─── Channel providers ──────────────────────────────────────────────────────

/// Generic JSON webhook: `POST {"title": …, "content": …}`.
pub struct WebhookNotifier {
    client: Client,
    url: String,
}

impl WebhookNotifier {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

impl Notifier for WebhookNotifier {
    fn name(&self) -> &'static str {
        "webhook"
    }

    fn notify<'a>(&'a self, title: &'a str, body: &'a str) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&serde_json::json!({ "title": title, "content": body }))
                .timeout(DELIVERY_TIMEOUT)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("HTTP {}", response.status()))
            }
        })
    }
}

/// Bark push (`POST {"title": …, "body": …}` against the device URL).
pub struct BarkNotifier {
    client: Client,
    url: String,
}

impl BarkNotifier {
    pub fn new(client: Client, url: String) -> Self {
        Self { client, url }
    }
}

impl Notifier for BarkNotifier {
    fn name(&self) -> &'static str {
        "bark"
    }

    fn notify<'a>(&'a self, title: &'a str, body: &'a str) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.url)
                .json(&serde_json::json!({ "title": title, "body": body }))
                .timeout(DELIVERY_TIMEOUT)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("HTTP {}", response.status()))
            }
        })
    }
}

/// Mail via an HTTP gateway: `POST {"to": …, "subject": …, "text": …}`.
pub struct EmailNotifier {
    client: Client,
    endpoint: String,
    to: String,
}

impl EmailNotifier {
    pub fn new(client: Client, endpoint: String, to: String) -> Self {
        Self {
            client,
            endpoint,
            to,
        }
    }
}

impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    fn notify<'a>(&'a self, title: &'a str, body: &'a str) -> BoxFuture<'a, Result<(), String>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(&serde_json::json!({
                    "to": self.to,
                    "subject": title,
                    "text": body,
                }))
                .timeout(DELIVERY_TIMEOUT)
                .send()
                .await
                .map_err(|e| e.to_string())?;
            if response.status().is_success() {
                Ok(())
            } else {
                Err(format!("HTTP {}", response.status()))
            }
        })
    }
}

// ─── Hub ────────────────────────────────────────────────────────────────────

pub struct NotificationHub {
    notifiers: Vec<Arc<dyn Notifier>>,
}

impl NotificationHub {
    pub fn new(notifiers: Vec<Arc<dyn Notifier>>) -> Self {
        Self { notifiers }
    }

    /// Enable whichever channels are both named in `push_channels` and have
    /// an endpoint configured.
    pub fn from_settings(settings: &Settings) -> Self {
        let client = Client::new();
        let enabled = |name: &str| settings.push_channels.iter().any(|c| c == name);
        let mut notifiers: Vec<Arc<dyn Notifier>> = Vec::new();

        if enabled("webhook") {
            match &settings.webhook_url {
                Some(url) => notifiers.push(Arc::new(WebhookNotifier::new(
                    client.clone(),
                    url.clone(),
                ))),
                None => warn!("webhook channel enabled but webhook_url is empty"),
            }
        }
        if enabled("bark") {
            match &settings.bark_url {
                Some(url) => {
                    notifiers.push(Arc::new(BarkNotifier::new(client.clone(), url.clone())))
                }
                None => warn!("bark channel enabled but bark_url is empty"),
            }
        }
        if enabled("email") {
            match (&settings.email_webhook, &settings.email_to) {
                (Some(endpoint), Some(to)) => notifiers.push(Arc::new(EmailNotifier::new(
                    client,
                    endpoint.clone(),
                    to.clone(),
                ))),
                _ => warn!("email channel enabled but email_webhook/email_to is incomplete"),
            }
        }
        Self::new(notifiers)
    }

    pub fn is_empty(&self) -> bool {
        self.notifiers.is_empty()
    }

    pub fn channel_names(&self) -> Vec<&'static str> {
        self.notifiers.iter().map(|n| n.name()).collect()
    }

    /// Deliver to every channel concurrently.  Returns `(ok, total)`.
    pub async fn dispatch(&self, title: &str, body: &str) -> (usize, usize) {
        let total = self.notifiers.len();
        if total == 0 {
            return (0, 0);
        }
        let deliveries = self.notifiers.iter().map(|n| {
            let name = n.name();
            async move {
                match n.notify(title, body).await {
                    Ok(()) => {
                        info!(channel = name, "notification delivered");
                        true
                    }
                    Err(e) => {
                        warn!(channel = name, error = %e, "notification failed");
                        false
                    }
                }
            }
        });
        let ok = join_all(deliveries).await.into_iter().filter(|ok| *ok).count();
        info!(ok, total, "notification fan-out finished");
        (ok, total)
    }
}

// ─── Background dispatcher ──────────────────────────────────────────────────

/// Read room events off the bus and push the live/offline edges out.
pub fn spawn_dispatcher(
    bus: EventBus,
    hub: Arc<NotificationHub>,
    settings: Arc<Settings>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        if hub.is_empty() {
            info!("no push channels enabled, notification dispatcher idle");
        } else {
            info!(channels = ?hub.channel_names(), "notification dispatcher started");
        }
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => match received {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!("notification dispatcher lagged, skipped {n} events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            };

            if !event.event_type.is_push_worthy() || hub.is_empty() {
                continue;
            }
            if event.event_type == EventType::WentOffline && !settings.push_offline {
                continue;
            }

            let title = title_for(&event);
            let body = match &settings.push_template {
                Some(template) => {
                    render_template(template, &event.anchor, &event.local_time())
                }
                None => default_body(&event),
            };
            hub.dispatch(&title, &body).await;
        }
    })
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn template_substitution() {
        let out = render_template(
            "[直播間名稱] 開播了，時間：[時間]",
            "Alice 的房間",
            "2025-03-18 14:22:05",
        );
        assert_eq!(out, "Alice 的房間 開播了，時間：2025-03-18 14:22:05");
    }

    #[test]
    fn template_without_placeholders_is_untouched() {
        assert_eq!(render_template("hello", "x", "y"), "hello");
    }

    struct CountingNotifier {
        calls: Arc<AtomicUsize>,
        fail: bool,
    }

    impl Notifier for CountingNotifier {
        fn name(&self) -> &'static str {
            "counting"
        }
        fn notify<'a>(&'a self, _: &'a str, _: &'a str) -> BoxFuture<'a, Result<(), String>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if self.fail {
                    Err("boom".into())
                } else {
                    Ok(())
                }
            })
        }
    }

    #[tokio::test]
    async fn one_failure_never_cancels_the_rest() {
        let calls = Arc::new(AtomicUsize::new(0));
        let hub = NotificationHub::new(vec![
            Arc::new(CountingNotifier { calls: calls.clone(), fail: false }),
            Arc::new(CountingNotifier { calls: calls.clone(), fail: true }),
            Arc::new(CountingNotifier { calls: calls.clone(), fail: false }),
        ]);
        let (ok, total) = hub.dispatch("t", "b").await;
        assert_eq!((ok, total), (2, 3));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn channel_selection_from_settings() {
        let mut settings = Settings::default();
        settings.push_channels = vec!["webhook".into(), "bark".into()];
        settings.webhook_url = Some("https://example.com/hook".into());
        // bark named but not configured → skipped with a warning.
        let hub = NotificationHub::from_settings(&settings);
        assert_eq!(hub.channel_names(), vec!["webhook"]);
    }

    #[tokio::test]
    async fn dispatcher_filters_events() {
        let bus = EventBus::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let hub = Arc::new(NotificationHub::new(vec![Arc::new(CountingNotifier {
            calls: calls.clone(),
            fail: false,
        })]));
        let mut settings = Settings::default();
        settings.push_offline = false;
        let cancel = CancellationToken::new();
        let handle = spawn_dispatcher(bus.clone(), hub, Arc::new(settings), cancel.clone());

        // Give the dispatcher a beat to subscribe-drain... it subscribed
        // before spawn, so these are all seen.
        bus.emit(RoomEvent::new(EventType::RecordingStarted, "u", "p", "a", None));
        bus.emit(RoomEvent::new(EventType::WentOffline, "u", "p", "a", None));
        bus.emit(RoomEvent::new(EventType::WentLive, "u", "p", "a", None));

        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let _ = handle.await;

        // Only the WentLive edge got through: started isn't push-worthy and
        // offline pushes are disabled.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
