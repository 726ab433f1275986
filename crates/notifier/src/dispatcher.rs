//! Channel dispatcher: fans a claimed bucket out to the gateway.
//!
//! Notifications are sent through a bounded pool. Within one notification
//! the SMS and email legs of a dual-channel send run as two spawned tasks
//! and both are joined before the outcome is produced.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use ipn_common::types::{Channel, ChannelMode, ClaimedNotification};

use crate::gateway::{Gateway, SendResult};

/// The gateway calls a notification resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Skip,
    Sms,
    Email,
    SmsAndEmail,
}

impl Route {
    /// Without an email address, email modes fall back to SMS.
    pub fn resolve(notification: &ClaimedNotification) -> Self {
        let has_email = notification.email().is_some();
        match notification.channel_mode {
            ChannelMode::None => Route::Skip,
            ChannelMode::Sms => Route::Sms,
            ChannelMode::Email if has_email => Route::Email,
            ChannelMode::SmsAndEmail if has_email => Route::SmsAndEmail,
            ChannelMode::Email | ChannelMode::SmsAndEmail => Route::Sms,
        }
    }
}

/// `(id, external id, message)` of one dispatched notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Delivery {
    pub id: i64,
    pub external_id: Option<String>,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub succeeded: Vec<Delivery>,
    pub failed: Vec<Delivery>,
    /// `ChannelMode::None` notifications, counted in neither list.
    pub skipped: usize,
}

impl DispatchReport {
    fn record(&mut self, id: i64, result: SendResult) {
        let delivery = Delivery {
            id,
            external_id: result.external_id,
            message: result.message,
        };
        if result.success {
            self.succeeded.push(delivery);
        } else {
            self.failed.push(delivery);
        }
    }
}

/// Merge both legs of a dual-channel send; success follows the SMS leg.
pub fn combine(sms: SendResult, email: SendResult) -> SendResult {
    SendResult {
        success: sms.success,
        external_id: Some(format!(
            "S:{}|E:{}",
            sms.external_id.unwrap_or_default(),
            email.external_id.unwrap_or_default()
        )),
        message: Some(format!(
            "S:{}|E:{}",
            sms.message.unwrap_or_default(),
            email.message.unwrap_or_default()
        )),
    }
}

pub struct Dispatcher {
    gateway: Arc<dyn Gateway>,
    concurrency: usize,
}

impl Dispatcher {
    pub fn new(gateway: Arc<dyn Gateway>, concurrency: usize) -> Self {
        Self {
            gateway,
            concurrency: concurrency.max(1),
        }
    }

    /// Send every notification in the bucket and collect the outcomes.
    pub async fn dispatch(&self, notifications: Vec<ClaimedNotification>) -> DispatchReport {
        let mut report = DispatchReport::default();
        let permits = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();

        for notification in notifications {
            let route = Route::resolve(&notification);
            if route == Route::Skip {
                report.skipped += 1;
                continue;
            }

            let gateway = self.gateway.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                // The semaphore is never closed; a closed one only lifts the bound.
                let _permit = permits.acquire_owned().await.ok();
                let id = notification.id;
                (id, deliver(gateway, notification, route).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, result)) => report.record(id, result),
                // Legs run in their own tasks, so this is a bug in the
                // orchestration itself; the row stays in `processing`.
                Err(e) => tracing::error!(error = %e, "Dispatch task aborted"),
            }
        }

        tracing::debug!(
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped,
            "Bucket dispatched"
        );
        report
    }
}

async fn deliver(
    gateway: Arc<dyn Gateway>,
    notification: ClaimedNotification,
    route: Route,
) -> SendResult {
    let notification = Arc::new(notification);
    match route {
        Route::Skip => SendResult::default(),
        Route::Sms => spawn_leg(gateway, notification, Channel::Sms).await,
        Route::Email => spawn_leg(gateway, notification, Channel::Email).await,
        Route::SmsAndEmail => {
            let sms = spawn_leg(gateway.clone(), notification.clone(), Channel::Sms);
            let email = spawn_leg(gateway, notification, Channel::Email);
            let (sms, email) = tokio::join!(sms, email);
            combine(sms, email)
        }
    }
}

/// Run one gateway call in its own task. The task is spawned before the
/// returned future is first polled, so two legs are in flight at once.
fn spawn_leg(
    gateway: Arc<dyn Gateway>,
    notification: Arc<ClaimedNotification>,
    channel: Channel,
) -> impl Future<Output = SendResult> + Send {
    let id = notification.id;
    let handle = tokio::spawn(async move {
        match channel {
            Channel::Sms => gateway.send_sms(&notification).await,
            Channel::Email => gateway.send_email(&notification).await,
        }
    });

    async move {
        match handle.await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(notification_id = id, channel = %channel, error = %e, "Gateway call panicked");
                SendResult::failed(format!("{channel} Notification Id: {id}|{e}"))
            }
        }
    }
}
