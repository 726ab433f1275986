//! Shared fixtures for notifier integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Barrier;

use ipn_common::types::{Channel, ChannelMode, ClaimedNotification, Notification};
use ipn_notifier::gateway::{Gateway, SendResult};

/// Gateway double that records calls and answers from a script.
///
/// Unscripted calls succeed with tracking id `sms-<id>` / `email-<id>`.
#[derive(Default)]
pub struct ScriptedGateway {
    calls: Mutex<Vec<(Channel, i64)>>,
    script: Mutex<HashMap<(Channel, i64), SendResult>>,
    rendezvous: Option<Arc<Barrier>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGateway {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every call waits on a shared barrier of `parties`; calls that are
    /// not concurrent never get past it.
    pub fn with_rendezvous(parties: usize) -> Self {
        Self {
            rendezvous: Some(Arc::new(Barrier::new(parties))),
            ..Self::default()
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn respond(&self, channel: Channel, id: i64, result: SendResult) {
        self.script.lock().insert((channel, id), result);
    }

    pub fn fail(&self, channel: Channel, id: i64, message: &str) {
        self.respond(channel, id, SendResult::failed(message));
    }

    pub fn calls(&self) -> Vec<(Channel, i64)> {
        self.calls.lock().clone()
    }

    pub fn calls_for(&self, id: i64) -> Vec<Channel> {
        let mut channels: Vec<Channel> = self
            .calls
            .lock()
            .iter()
            .filter(|(_, call_id)| *call_id == id)
            .map(|(channel, _)| *channel)
            .collect();
        channels.sort_by_key(|c| *c == Channel::Email);
        channels
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn call(&self, channel: Channel, notification: &ClaimedNotification) -> SendResult {
        self.calls.lock().push((channel, notification.id));
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if let Some(barrier) = &self.rendezvous {
            barrier.wait().await;
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        let scripted = self.script.lock().get(&(channel, notification.id)).cloned();
        scripted.unwrap_or_else(|| {
            let prefix = match channel {
                Channel::Sms => "sms",
                Channel::Email => "email",
            };
            SendResult::accepted(format!("{prefix}-{}", notification.id), "queued")
        })
    }
}

#[async_trait]
impl Gateway for ScriptedGateway {
    async fn send_sms(&self, notification: &ClaimedNotification) -> SendResult {
        self.call(Channel::Sms, notification).await
    }

    async fn send_email(&self, notification: &ClaimedNotification) -> SendResult {
        self.call(Channel::Email, notification).await
    }
}

pub fn notification(id: i64, mode: ChannelMode, email: Option<&str>) -> Notification {
    let mut row = Notification::queued(id, format!("2547{id:08}"), format!("message {id}"))
        .with_channel_mode(mode);
    row.recipient_email = email.map(str::to_string);
    row
}

pub fn claimed(id: i64, mode: ChannelMode, email: Option<&str>) -> ClaimedNotification {
    notification(id, mode, email).to_claimed()
}
