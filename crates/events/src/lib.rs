//! Drover event observer: best-effort notifications about one resource.
//!
//! Observability only. A subscription that cannot be established, or a
//! stream that dies, never fails the workflow driving the resource.

#![forbid(unsafe_code)]

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::core::v1::Event as CoreEvent;
use kube::{api::Api, runtime::watcher, Client};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use drover_core::ResourceIdentity;

/// One change notification about the observed resource. Consumed and
/// discarded as it arrives; never retained.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationEvent {
    pub type_: String,
    pub reason: String,
    pub message: String,
    pub subject_uid: String,
}

impl From<&CoreEvent> for NotificationEvent {
    fn from(ev: &CoreEvent) -> Self {
        Self {
            type_: ev.type_.clone().unwrap_or_default(),
            reason: ev.reason.clone().unwrap_or_default(),
            message: ev.message.clone().unwrap_or_default(),
            subject_uid: ev.involved_object.uid.clone().unwrap_or_default(),
        }
    }
}

/// Cancellation handle for an in-flight subscription. Dropping it has
/// the same effect as calling `cancel`.
#[derive(Debug)]
pub struct CancelHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl CancelHandle {
    /// Wrap the cancel side of a subscription's oneshot channel.
    pub fn new(tx: oneshot::Sender<()>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn cancel(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Result of starting a subscription: bounded receiver plus its cancel side.
pub struct StreamHandle<T> {
    pub rx: mpsc::Receiver<T>,
    pub cancel: CancelHandle,
}

fn queue_cap() -> usize {
    std::env::var("DROVER_EVENTS_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(1024)
}

/// Change-notification source keyed by resource identity.
#[async_trait]
pub trait EventSource: Send + Sync {
    /// Subscribe to notifications whose subject matches `id`. The stream
    /// is lazy, unbounded in time and not restartable; dropping the
    /// handle ends it.
    async fn subscribe(&self, id: &ResourceIdentity) -> Result<StreamHandle<NotificationEvent>>;
}

/// Event source backed by core/v1 Events in the resource's namespace.
pub struct KubeEvents;

impl KubeEvents {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl EventSource for KubeEvents {
    async fn subscribe(&self, id: &ResourceIdentity) -> Result<StreamHandle<NotificationEvent>> {
        let client = Client::try_default().await.context("building kube client for events")?;
        let api: Api<CoreEvent> = Api::namespaced(client, &id.namespace);
        // Keyed on the subject uid, not the name: a recreated object with
        // the same name must not leak its events into this stream.
        let cfg = watcher::Config::default().fields(&format!("involvedObject.uid={}", id.uid));
        let (tx, rx) = mpsc::channel::<NotificationEvent>(queue_cap());
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let cancel = CancelHandle::new(cancel_tx);

        let subject = id.to_string();
        let stream = watcher::watcher(api, cfg);
        tokio::spawn(async move {
            info!(subject = %subject, "event watch starting");
            pump_events(stream, tx, cancel_rx, &subject).await;
        });

        Ok(StreamHandle { rx, cancel })
    }
}

/// Drain a subscription on its own task, logging each notification as it
/// arrives. Not joined on the success path; the cancel side lives inside
/// the task so the pump is not torn down early.
pub fn spawn_logger(handle: StreamHandle<NotificationEvent>) -> tokio::task::JoinHandle<()> {
    let StreamHandle { mut rx, cancel } = handle;
    tokio::spawn(async move {
        let _cancel = cancel;
        while let Some(ev) = rx.recv().await {
            info!(type_ = %ev.type_, reason = %ev.reason, message = %ev.message, "resource event");
        }
    })
}

/// Forward watch arrivals into a bounded channel. Drops notifications
/// when the channel is full rather than backpressuring the producer.
/// Watch restarts re-deliver the current set as plain arrivals.
async fn pump_events<S, E>(
    stream: S,
    tx: mpsc::Sender<NotificationEvent>,
    mut cancel_rx: oneshot::Receiver<()>,
    subject: &str,
) where
    S: futures::Stream<Item = Result<watcher::Event<CoreEvent>, E>>,
    E: std::fmt::Display,
{
    let stream = stream.fuse();
    futures::pin_mut!(stream);
    loop {
        tokio::select! {
            _ = &mut cancel_rx => {
                info!(subject = %subject, "event watch cancelled");
                break;
            }
            next = stream.next() => {
                match next {
                    Some(Ok(watcher::Event::Applied(ev))) => {
                        let _ = tx.try_send(NotificationEvent::from(&ev));
                    }
                    Some(Ok(watcher::Event::Restarted(list))) => {
                        for ev in list.iter() {
                            let _ = tx.try_send(NotificationEvent::from(ev));
                        }
                    }
                    Some(Ok(watcher::Event::Deleted(_))) => {}
                    Some(Err(e)) => {
                        warn!(subject = %subject, error = %e, "event watch error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
    info!(subject = %subject, "event watch ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn event(reason: &str, uid: &str) -> CoreEvent {
        let mut ev = CoreEvent::default();
        ev.type_ = Some("Normal".to_string());
        ev.reason = Some(reason.to_string());
        ev.message = Some(format!("{} happened", reason));
        ev.involved_object.uid = Some(uid.to_string());
        ev
    }

    async fn drain(mut rx: mpsc::Receiver<NotificationEvent>) -> Vec<String> {
        let mut out = Vec::new();
        while let Some(ev) = rx.recv().await {
            out.push(ev.reason);
        }
        out
    }

    #[tokio::test]
    async fn forwards_arrivals_in_order() {
        let (tx, rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let items = vec![
            Ok::<_, std::io::Error>(watcher::Event::Applied(event("Scheduled", "u-1"))),
            Ok(watcher::Event::Applied(event("Pulled", "u-1"))),
            Ok(watcher::Event::Applied(event("Started", "u-1"))),
        ];
        pump_events(stream::iter(items), tx, cancel_rx, "ns/demo").await;
        assert_eq!(drain(rx).await, vec!["Scheduled", "Pulled", "Started"]);
    }

    #[tokio::test]
    async fn restart_redelivers_the_current_set() {
        let (tx, rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let items = vec![Ok::<_, std::io::Error>(watcher::Event::Restarted(vec![
            event("Scheduled", "u-1"),
            event("Started", "u-1"),
        ]))];
        pump_events(stream::iter(items), tx, cancel_rx, "ns/demo").await;
        assert_eq!(drain(rx).await, vec!["Scheduled", "Started"]);
    }

    #[tokio::test]
    async fn deletions_are_not_notifications() {
        let (tx, rx) = mpsc::channel(16);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let items = vec![
            Ok::<_, std::io::Error>(watcher::Event::Deleted(event("Gone", "u-1"))),
            Ok(watcher::Event::Applied(event("Started", "u-1"))),
        ];
        pump_events(stream::iter(items), tx, cancel_rx, "ns/demo").await;
        assert_eq!(drain(rx).await, vec!["Started"]);
    }

    #[tokio::test]
    async fn full_channel_drops_instead_of_blocking() {
        let (tx, rx) = mpsc::channel(1);
        let (_cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let items = vec![
            Ok::<_, std::io::Error>(watcher::Event::Applied(event("A", "u-1"))),
            Ok(watcher::Event::Applied(event("B", "u-1"))),
            Ok(watcher::Event::Applied(event("C", "u-1"))),
        ];
        pump_events(stream::iter(items), tx, cancel_rx, "ns/demo").await;
        let got = drain(rx).await;
        assert!(!got.is_empty());
        assert!(got.len() < 3, "expected drops with a full channel, got {:?}", got);
    }

    #[tokio::test]
    async fn cancel_stops_the_pump_quickly() {
        let (tx, mut rx) = mpsc::channel(16);
        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        let s = async_stream::stream! {
            loop {
                tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                yield Ok::<_, std::io::Error>(watcher::Event::Applied(event("Tick", "u-1")));
            }
        };
        let handle = tokio::spawn(async move { pump_events(s, tx, cancel_rx, "ns/demo").await });
        tokio::time::sleep(std::time::Duration::from_millis(75)).await;
        let _ = cancel_tx.send(());
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("pump did not stop")
            .unwrap();
        let _ = tokio::time::timeout(std::time::Duration::from_millis(50), rx.recv()).await;
    }

    #[test]
    fn notification_copies_the_subject_uid() {
        let n = NotificationEvent::from(&event("Started", "u-42"));
        assert_eq!(n.subject_uid, "u-42");
        assert_eq!(n.type_, "Normal");
        assert_eq!(n.message, "Started happened");
    }
}
