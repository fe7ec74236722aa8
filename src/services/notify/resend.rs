use anyhow::Context;
use async_trait::async_trait;

use super::{Notification, Notifier};

const RESEND_API_URL: &str = "https://api.resend.com/emails";
const FROM_ADDRESS: &str = "Deposit Desk <bookings@resend.dev>";

/// Plain-text email notifications through Resend. Each lifecycle event
/// produces a customer email and, when an owner address is configured, an
/// operator alert.
pub struct ResendNotifier {
    api_key: String,
    owner_email: String,
    client: reqwest::Client,
}

impl ResendNotifier {
    pub fn new(api_key: String, owner_email: String) -> Self {
        Self {
            api_key,
            owner_email,
            client: reqwest::Client::new(),
        }
    }

    async fn send_email(&self, to: &str, subject: &str, text: &str) -> anyhow::Result<()> {
        self.client
            .post(RESEND_API_URL)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({
                "from": FROM_ADDRESS,
                "to": to,
                "subject": subject,
                "text": text,
            }))
            .send()
            .await
            .context("failed to send email")?
            .error_for_status()
            .context("mail API returned error")?;
        Ok(())
    }
}

fn dollars(cents: i64) -> String {
    format!("${}.{:02}", cents / 100, cents % 100)
}

#[async_trait]
impl Notifier for ResendNotifier {
    async fn notify(&self, notification: &Notification) -> anyhow::Result<()> {
        match notification {
            Notification::BookingConfirmed {
                customer_name,
                customer_email,
                appointment_time,
                service_type,
                total_price_cents,
                deposit_cents,
                manage_url,
            } => {
                let text = format!(
                    "Hi {customer_name},\n\nYour {service_type} appointment on {appointment_time} is confirmed.\n\
                     Total: {} (deposit paid: {}).\n\nManage or cancel your booking: {manage_url}\n",
                    dollars(*total_price_cents),
                    dollars(*deposit_cents),
                );
                self.send_email(customer_email, "Booking confirmed", &text)
                    .await?;

                if !self.owner_email.is_empty() {
                    let text = format!(
                        "New booking: {customer_name} ({customer_email})\n\
                         {service_type} on {appointment_time}\nTotal {}, deposit {} collected.\n",
                        dollars(*total_price_cents),
                        dollars(*deposit_cents),
                    );
                    self.send_email(&self.owner_email, &format!("New booking: {customer_name}"), &text)
                        .await?;
                }
            }
            Notification::BookingCancelled {
                customer_name,
                customer_email,
                appointment_time,
                refunded_cents,
                forfeited,
            } => {
                let refund_line = if *forfeited {
                    "No refund was issued (late cancellation).".to_string()
                } else {
                    format!("{} has been refunded to your payment method.", dollars(*refunded_cents))
                };
                let text = format!(
                    "Hi {customer_name},\n\nYour appointment on {appointment_time} has been cancelled.\n{refund_line}\n"
                );
                self.send_email(customer_email, "Booking cancelled", &text)
                    .await?;

                if !self.owner_email.is_empty() {
                    let text = format!(
                        "Cancelled: {customer_name} ({customer_email}), was {appointment_time}.\n\
                         Refunded {}.\n",
                        dollars(*refunded_cents),
                    );
                    self.send_email(
                        &self.owner_email,
                        &format!("CANCELLED: {customer_name}"),
                        &text,
                    )
                    .await?;
                }
            }
        }
        Ok(())
    }
}
