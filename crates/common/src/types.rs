use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a notification.
///
/// The dispatcher only ever moves rows `Queued -> Processing -> Submitted | Retry`.
/// `Cancelled`, `Failed` and `Sent` are written by administrative and
/// delivery-report paths.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum NotificationStatus {
    Queued,
    Processing,
    Submitted,
    Retry,
    Cancelled,
    Failed,
    Sent,
}

impl NotificationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationStatus::Queued => "queued",
            NotificationStatus::Processing => "processing",
            NotificationStatus::Submitted => "submitted",
            NotificationStatus::Retry => "retry",
            NotificationStatus::Cancelled => "cancelled",
            NotificationStatus::Failed => "failed",
            NotificationStatus::Sent => "sent",
        }
    }
}

impl std::fmt::Display for NotificationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which delivery channel(s) a notification requires.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ChannelMode {
    None,
    Sms,
    Email,
    SmsAndEmail,
}

impl std::fmt::Display for ChannelMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelMode::None => write!(f, "none"),
            ChannelMode::Sms => write!(f, "sms"),
            ChannelMode::Email => write!(f, "email"),
            ChannelMode::SmsAndEmail => write!(f, "sms_and_email"),
        }
    }
}

/// Delivery channel of a single gateway call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Channel {
    Sms,
    Email,
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Channel::Sms => write!(f, "SMS"),
            Channel::Email => write!(f, "Email"),
        }
    }
}

/// A notification row as stored in the `notifications` table.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Notification {
    pub id: i64,
    pub recipient_phone: String,
    pub recipient_email: Option<String>,
    pub text_body: String,
    pub subject: Option<String>,
    pub cc_list: Option<String>,
    pub sender_id: Option<String>,
    pub transaction_reference: Option<i64>,
    pub channel_mode: ChannelMode,
    pub priority: i32,
    pub status: NotificationStatus,
    pub bucket_id: i64,
    pub send_attempts: i32,
    pub last_error: Option<String>,
    pub last_message: Option<String>,
    pub external_id: Option<String>,
    pub provider_id: Option<String>,
    pub queued_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
}

impl Notification {
    /// A freshly produced, unclaimed notification.
    pub fn queued(id: i64, recipient_phone: impl Into<String>, text_body: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id,
            recipient_phone: recipient_phone.into(),
            recipient_email: None,
            text_body: text_body.into(),
            subject: None,
            cc_list: None,
            sender_id: None,
            transaction_reference: None,
            channel_mode: ChannelMode::Sms,
            priority: 0,
            status: NotificationStatus::Queued,
            bucket_id: 0,
            send_attempts: 0,
            last_error: None,
            last_message: None,
            external_id: None,
            provider_id: None,
            queued_at: None,
            delivered_at: None,
            created_at: now,
            modified_at: now,
        }
    }

    pub fn with_channel_mode(mut self, mode: ChannelMode) -> Self {
        self.channel_mode = mode;
        self
    }

    pub fn with_email(mut self, email: impl Into<String>) -> Self {
        self.recipient_email = Some(email.into());
        self
    }

    /// Eligible rows are queued and not owned by any bucket.
    pub fn is_claimable(&self) -> bool {
        self.status == NotificationStatus::Queued && self.bucket_id == 0
    }

    /// The projection handed to the dispatcher after a claim.
    pub fn to_claimed(&self) -> ClaimedNotification {
        ClaimedNotification {
            id: self.id,
            recipient_phone: self.recipient_phone.clone(),
            text_body: self.text_body.clone(),
            sender_id: self.sender_id.clone(),
            priority: self.priority,
            channel_mode: self.channel_mode,
            recipient_email: self.recipient_email.clone(),
            cc_list: self.cc_list.clone(),
            subject: self.subject.clone(),
        }
    }
}

/// Fields of a claimed notification needed to build gateway payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ClaimedNotification {
    pub id: i64,
    pub recipient_phone: String,
    pub text_body: String,
    pub sender_id: Option<String>,
    pub priority: i32,
    pub channel_mode: ChannelMode,
    pub recipient_email: Option<String>,
    pub cc_list: Option<String>,
    pub subject: Option<String>,
}

impl ClaimedNotification {
    /// The email address, if one is present and non-blank.
    pub fn email(&self) -> Option<&str> {
        self.recipient_email
            .as_deref()
            .map(str::trim)
            .filter(|e| !e.is_empty())
    }
}
