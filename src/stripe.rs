use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use serde::Deserialize;

use crate::error::Error;

/// Minimal Stripe client built on reqwest. The gateway is treated as an
/// opaque service: we create a payment intent and hand the client secret
/// back to the caller, nothing more.
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    secret_key: String,
    currency: String,
}

impl StripeClient {
    pub fn new(secret_key: String, currency: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            secret_key,
            currency,
        }
    }

    pub fn new_from_env() -> Self {
        let secret_key = std::env::var("STRIPE_SECRET_KEY")
            .expect("Missing required environment variable: STRIPE_SECRET_KEY");
        let currency = std::env::var("STRIPE_CURRENCY").unwrap_or_else(|_| "usd".to_string());

        Self::new(secret_key, currency)
    }

    /// Creates a payment intent for `amount_minor` (smallest currency unit)
    /// and returns its client secret.
    /// https://stripe.com/docs/api/payment_intents/create
    pub async fn create_payment_intent(&self, amount_minor: i64) -> Result<String, Error> {
        let body = [
            ("amount", amount_minor.to_string()),
            ("currency", self.currency.clone()),
            ("automatic_payment_methods[enabled]", "true".to_string()),
        ];

        let resp = self
            .http
            .post("https://api.stripe.com/v1/payment_intents")
            .header(AUTHORIZATION, format!("Bearer {}", self.secret_key))
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .form(&body)
            .send()
            .await?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            tracing::error!(
                status = %status,
                response_body = %body,
                "stripe payment intent request failed"
            );
            return Err(Error::GatewayFailure);
        }

        #[derive(Deserialize)]
        struct IntentResp {
            client_secret: Option<String>,
        }

        let parsed: IntentResp = resp.json().await?;
        parsed.client_secret.ok_or(Error::GatewayFailure)
    }
}
