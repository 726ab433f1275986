//! Outbound SMS / email gateway.
//!
//! Every call resolves to a [`SendResult`]; transport and decoding problems
//! are folded into a failed result so one bad call never aborts a bucket.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use ipn_common::config::GatewayConfig;
use ipn_common::error::{AppError, AppResult};
use ipn_common::types::{Channel, ClaimedNotification};

/// Header carrying the calling application's identity.
pub const APP_ID_HEADER: &str = "x-app-id";

/// Outcome of a single gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SendResult {
    pub success: bool,
    /// Tracking id assigned by the gateway.
    pub external_id: Option<String>,
    pub message: Option<String>,
}

impl SendResult {
    pub fn accepted(external_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            success: true,
            external_id: Some(external_id.into()),
            message: Some(message.into()),
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            external_id: None,
            message: Some(message.into()),
        }
    }
}

#[async_trait]
pub trait Gateway: Send + Sync {
    async fn send_sms(&self, notification: &ClaimedNotification) -> SendResult;

    async fn send_email(&self, notification: &ClaimedNotification) -> SendResult;
}

#[derive(Debug, Serialize)]
struct SmsPayload<'a> {
    phone: &'a str,
    message: &'a str,
    #[serde(rename = "senderID")]
    sender_id: &'a str,
    priority: i32,
    product: &'a str,
    #[serde(rename = "notificationURL")]
    notification_url: Option<&'a str>,
    #[serde(rename = "externalId")]
    external_id: String,
}

#[derive(Debug, Serialize)]
struct EmailPayload<'a> {
    to: &'a str,
    cc: Option<&'a str>,
    from: &'a str,
    message: &'a str,
    subject: Option<&'a str>,
    priority: i32,
    product: &'a str,
    #[serde(rename = "notificationURL")]
    notification_url: Option<&'a str>,
    #[serde(rename = "externalId")]
    external_id: String,
}

/// Response body shared by both gateway endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayResponse {
    pub success: bool,
    pub data: GatewayData,
    pub message: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayData {
    pub id: String,
}

/// Interpret a 2xx gateway body. A missing field is a failed send.
pub fn interpret_response(channel: Channel, notification_id: i64, body: &[u8]) -> SendResult {
    match serde_json::from_slice::<GatewayResponse>(body) {
        Ok(response) => SendResult {
            success: response.success,
            external_id: Some(response.data.id),
            message: Some(response.message),
        },
        Err(e) => SendResult::failed(format!(
            "{channel} Notification Id: {notification_id}|malformed gateway response: {e}"
        )),
    }
}

/// JSON-over-HTTP gateway client.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> AppResult<Self> {
        let mut builder = reqwest::Client::builder();
        if let Some(ms) = config.timeout_ms {
            builder = builder.timeout(Duration::from_millis(ms));
        }
        let client = builder.build()?;
        Ok(Self { client, config })
    }

    async fn post<P: Serialize + Sync>(
        &self,
        channel: Channel,
        url: &str,
        notification_id: i64,
        payload: &P,
    ) -> SendResult {
        match self.try_post(channel, url, notification_id, payload).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    notification_id,
                    channel = %channel,
                    error = %e,
                    "Exception while queueing notification to gateway"
                );
                SendResult::failed(e.to_string())
            }
        }
    }

    async fn try_post<P: Serialize + Sync>(
        &self,
        channel: Channel,
        url: &str,
        notification_id: i64,
        payload: &P,
    ) -> AppResult<SendResult> {
        let response = self
            .client
            .post(url)
            .header(APP_ID_HEADER, self.config.app_key.as_str())
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(
                notification_id,
                channel = %channel,
                status = status.as_u16(),
                "Gateway rejected notification"
            );
            return Err(AppError::Gateway(format!(
                "{channel} Notification Id: {notification_id}|{status}"
            )));
        }

        let body = response.bytes().await?;
        Ok(interpret_response(channel, notification_id, &body))
    }
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn send_sms(&self, notification: &ClaimedNotification) -> SendResult {
        let payload = SmsPayload {
            phone: &notification.recipient_phone,
            message: &notification.text_body,
            sender_id: notification
                .sender_id
                .as_deref()
                .filter(|s| !s.is_empty())
                .unwrap_or(self.config.sender_id.as_str()),
            priority: notification.priority,
            product: &self.config.product,
            notification_url: self.config.notification_url.as_deref(),
            external_id: notification.id.to_string(),
        };
        self.post(Channel::Sms, &self.config.sms_url, notification.id, &payload)
            .await
    }

    async fn send_email(&self, notification: &ClaimedNotification) -> SendResult {
        let Some(to) = notification.email() else {
            return SendResult::failed(format!(
                "Email Notification Id: {}|no recipient address",
                notification.id
            ));
        };
        let payload = EmailPayload {
            to,
            cc: notification.cc_list.as_deref(),
            from: &self.config.sender_mail,
            message: &notification.text_body,
            subject: notification.subject.as_deref(),
            priority: notification.priority,
            product: &self.config.product,
            notification_url: self.config.notification_url.as_deref(),
            external_id: notification.id.to_string(),
        };
        self.post(Channel::Email, &self.config.email_url, notification.id, &payload)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_success() {
        let body = br#"{"success": true, "data": {"id": "trk-1"}, "message": "queued"}"#;
        let result = interpret_response(Channel::Sms, 1, body);
        assert_eq!(result, SendResult::accepted("trk-1", "queued"));
    }

    #[test]
    fn test_interpret_logical_failure_keeps_tracking_id() {
        let body = br#"{"success": false, "data": {"id": "trk-2"}, "message": "insufficient credit"}"#;
        let result = interpret_response(Channel::Sms, 2, body);
        assert!(!result.success);
        assert_eq!(result.external_id.as_deref(), Some("trk-2"));
        assert_eq!(result.message.as_deref(), Some("insufficient credit"));
    }

    #[test]
    fn test_interpret_missing_field_fails() {
        let body = br#"{"success": true, "message": "queued"}"#;
        let result = interpret_response(Channel::Email, 3, body);
        assert!(!result.success);
        assert!(result.message.unwrap().starts_with("Email Notification Id: 3|"));
    }

    #[test]
    fn test_interpret_garbage_fails() {
        let result = interpret_response(Channel::Sms, 4, b"<html>oops</html>");
        assert!(!result.success);
        assert_eq!(result.external_id, None);
    }

    #[test]
    fn test_sms_payload_field_names() {
        let payload = SmsPayload {
            phone: "254700000001",
            message: "hello",
            sender_id: "IPN",
            priority: 2,
            product: "ipn",
            notification_url: None,
            external_id: "42".to_string(),
        };
        let json = serde_json::to_value(&payload).unwrap();
        assert_eq!(json["senderID"], "IPN");
        assert_eq!(json["externalId"], "42");
        assert!(json["notificationURL"].is_null());
        assert_eq!(json["priority"], 2);
    }
}
