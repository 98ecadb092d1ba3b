use std::time::Duration;

use askama::Template;
use async_trait::async_trait;
use serde_json::json;
use tracing::debug;

use crate::notify::{Confirmation, Notifier, NotifyError};

pub const RESEND_ENDPOINT: &str = "https://api.resend.com/emails";

/// Sends confirmation emails through the Resend HTTP API.
pub struct EmailNotifier {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    from: String,
}

impl EmailNotifier {
    pub fn new(api_key: String, from: String) -> Result<Self, NotifyError> {
        Self::with_endpoint(RESEND_ENDPOINT.to_string(), api_key, from)
    }

    pub fn with_endpoint(endpoint: String, api_key: String, from: String) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| NotifyError::Transport(e.to_string()))?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            from,
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &'static str {
        "email"
    }

    async fn send(&self, c: &Confirmation) -> Result<(), NotifyError> {
        let body = json!({
            "from": self.from,
            "to": [c.appointment.email],
            "subject": "Appointment Confirmation",
            "html": render_html(c)?,
        });
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| NotifyError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        debug!("confirmation email sent to {}", c.appointment.email);
        Ok(())
    }
}

/// Confirmation email body. Askama escapes every interpolated value.
#[derive(Template)]
#[template(path = "confirmation.html")]
struct ConfirmationEmail<'a> {
    name: &'a str,
    topic: &'a str,
    when: String,
    branch: &'a str,
    address: &'a str,
    reason: &'a str,
}

impl<'a> From<&'a Confirmation> for ConfirmationEmail<'a> {
    fn from(c: &'a Confirmation) -> Self {
        Self {
            name: &c.appointment.name,
            topic: &c.topic_name,
            when: c
                .appointment
                .slot_start
                .at()
                .format("%A, %B %-d, %Y at %-I:%M %p")
                .to_string(),
            branch: &c.branch_name,
            address: &c.branch_address,
            reason: &c.appointment.reason,
        }
    }
}

pub fn render_html(c: &Confirmation) -> Result<String, NotifyError> {
    ConfirmationEmail::from(c)
        .render()
        .map_err(|e| NotifyError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Appointment, SlotStart};
    use chrono::{NaiveDateTime, Utc};
    use httpmock::prelude::*;
    use ulid::Ulid;

    fn confirmation(name: &str, reason: &str) -> Confirmation {
        let at = NaiveDateTime::parse_from_str("2026-02-07T09:30:00", "%Y-%m-%dT%H:%M:%S").unwrap();
        Confirmation {
            appointment: Appointment {
                id: Ulid::new(),
                name: name.into(),
                email: "barbara@example.com".into(),
                topic_id: "1".into(),
                branch_id: "1".into(),
                slot_start: SlotStart::new(at).unwrap(),
                reason: reason.into(),
                created_at: Utc::now(),
            },
            topic_name: "Personal Loans".into(),
            branch_name: "Downtown Main Branch".into(),
            branch_address: "123 Main Street".into(),
        }
    }

    #[test]
    fn html_escapes_customer_input() {
        let html = render_html(&confirmation("<script>alert(1)</script>", "a & b")).unwrap();
        assert!(html.contains("&lt;script&gt;alert(1)&lt;/script&gt;"));
        assert!(!html.contains("<script>"));
        assert!(html.contains("a &amp; b"));
    }

    #[test]
    fn html_formats_slot_time() {
        let html = render_html(&confirmation("Barbara", "")).unwrap();
        assert!(html.contains("Saturday, February 7, 2026 at 9:30 AM"));
        assert!(!html.contains("Your notes"));
    }

    #[tokio::test]
    async fn posts_to_resend() {
        let server = MockServer::start_async().await;
        let mock = server
            .mock_async(|when, then| {
                when.method(POST)
                    .path("/emails")
                    .header("authorization", "Bearer re_test");
                then.status(200).json_body(serde_json::json!({ "id": "email_1" }));
            })
            .await;

        let notifier = EmailNotifier::with_endpoint(
            server.url("/emails"),
            "re_test".into(),
            "Appointments <test@example.com>".into(),
        )
        .unwrap();
        notifier.send(&confirmation("Barbara", "refinance")).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn rejection_surfaces_status() {
        let server = MockServer::start_async().await;
        server
            .mock_async(|when, then| {
                when.method(POST).path("/emails");
                then.status(403).body("domain not verified");
            })
            .await;

        let notifier =
            EmailNotifier::with_endpoint(server.url("/emails"), "re_test".into(), "x@example.com".into()).unwrap();
        let err = notifier.send(&confirmation("Barbara", "")).await.unwrap_err();
        assert!(matches!(err, NotifyError::Rejected { status: 403, .. }));
    }
}
