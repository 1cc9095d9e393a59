// services/mpesa_service.rs
use std::fmt;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD as base64, Engine as _};
use chrono::{DateTime, Local, TimeZone};
use reqwest::{header, Client};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{error, info, warn};
use validator::Validate;

use crate::config::AppConfig;
use crate::errors::{AppError, ToolError};
use crate::services::credentials::CredentialBundle;
use crate::services::token_cache::{AccessToken, TokenCache};

pub const STK_PUSH_PATH: &str = "/mpesa/stkpush/v1/processrequest";
pub const TRANSACTION_TYPE: &str = "CustomerPayBillOnline";

const REQUIRED_FIELDS: [&str; 4] = ["amount", "phone_number", "account_reference", "transaction_desc"];

/// Validated `stk_push` tool arguments.
#[derive(Debug, Clone, PartialEq, Eq, Validate)]
pub struct PaymentRequest {
    #[validate(length(min = 1))]
    pub amount: String,
    #[validate(length(equal = 12))]
    pub phone_number: String,
    #[validate(length(min = 1, max = 12))]
    pub account_reference: String,
    #[validate(length(min = 1, max = 13))]
    pub transaction_desc: String,
}

impl PaymentRequest {
    /// Parses and validates raw tool arguments. Fields are checked in a fixed
    /// order so the first missing one is always the one reported.
    pub fn from_arguments(arguments: &Value) -> Result<Self, ToolError> {
        let args = arguments
            .as_object()
            .ok_or_else(|| ToolError::validation("arguments must be a JSON object"))?;

        let mut values = Vec::with_capacity(REQUIRED_FIELDS.len());
        for field in REQUIRED_FIELDS {
            let value = match args.get(field) {
                Some(Value::String(s)) if !s.trim().is_empty() => s.trim().to_string(),
                Some(Value::Number(n)) => n.to_string(),
                _ => {
                    warn!("Missing required field: '{}'", field);
                    return Err(ToolError::validation(format!("Missing required field: '{}'", field)));
                }
            };
            values.push(value);
        }

        let [amount, phone_number, account_reference, transaction_desc]: [String; 4] = values
            .try_into()
            .map_err(|_| ToolError::unexpected("argument parsing lost a field"))?;

        let phone_number = format_phone_number(&phone_number);
        if !is_valid_phone(&phone_number) {
            return Err(ToolError::validation(format!(
                "phone_number must match 2547XXXXXXXX, got '{}'",
                phone_number
            )));
        }

        let request = PaymentRequest {
            amount,
            phone_number,
            account_reference,
            transaction_desc,
        };

        request.validate().map_err(|errors| {
            let mut fields: Vec<String> = errors.field_errors().keys().map(|k| k.to_string()).collect();
            fields.sort();
            ToolError::validation(format!(
                "Field(s) exceed allowed length (account_reference <= 12, transaction_desc <= 13): {}",
                fields.join(", ")
            ))
        })?;

        Ok(request)
    }
}

/// Accepts `2547XXXXXXXX`, `07XXXXXXXX` and `7XXXXXXXX`.
pub fn format_phone_number(phone: &str) -> String {
    let phone = phone.trim().trim_start_matches('+');
    if phone.starts_with("254") && phone.len() == 12 {
        return phone.to_string();
    }
    if phone.starts_with("07") && phone.len() == 10 {
        return format!("254{}", &phone[1..]);
    }
    if phone.starts_with('7') && phone.len() == 9 {
        return format!("254{}", phone);
    }
    phone.to_string()
}

fn is_valid_phone(phone: &str) -> bool {
    phone.len() == 12 && phone.starts_with("2547") && phone.bytes().all(|b| b.is_ascii_digit())
}

/// Amount as sent upstream: an integer when the input is a whole number,
/// otherwise the caller's string untouched so the gateway can reject it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Amount {
    Whole(i64),
    Raw(String),
}

impl Amount {
    pub fn coerce(raw: &str) -> Self {
        match raw.trim().parse::<i64>() {
            Ok(n) => Amount::Whole(n),
            Err(_) => Amount::Raw(raw.to_string()),
        }
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Amount::Whole(n) => write!(f, "{}", n),
            Amount::Raw(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StkPushRequest {
    #[serde(rename = "BusinessShortCode")]
    pub business_short_code: String,
    #[serde(rename = "Password")]
    pub password: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: String,
    #[serde(rename = "TransactionType")]
    pub transaction_type: String,
    #[serde(rename = "Amount")]
    pub amount: Amount,
    #[serde(rename = "PartyA")]
    pub party_a: String,
    #[serde(rename = "PartyB")]
    pub party_b: String,
    #[serde(rename = "PhoneNumber")]
    pub phone_number: String,
    #[serde(rename = "CallBackURL")]
    pub callback_url: String,
    #[serde(rename = "AccountReference")]
    pub account_reference: String,
    #[serde(rename = "TransactionDesc")]
    pub transaction_desc: String,
}

impl StkPushRequest {
    pub fn build(bundle: &CredentialBundle, request: &PaymentRequest, timestamp: String) -> Self {
        let password = generate_password(&bundle.business_short_code, &bundle.passkey, &timestamp);

        StkPushRequest {
            business_short_code: bundle.business_short_code.clone(),
            password,
            timestamp,
            transaction_type: TRANSACTION_TYPE.to_string(),
            amount: Amount::coerce(&request.amount),
            party_a: request.phone_number.clone(),
            party_b: bundle.business_short_code.clone(),
            phone_number: request.phone_number.clone(),
            callback_url: bundle.callback_url.clone(),
            account_reference: request.account_reference.clone(),
            transaction_desc: request.transaction_desc.clone(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct StkPushResponse {
    #[serde(rename = "MerchantRequestID", default)]
    pub merchant_request_id: Option<String>,
    #[serde(rename = "CheckoutRequestID", default)]
    pub checkout_request_id: Option<String>,
    #[serde(rename = "ResponseCode", default)]
    pub response_code: Option<String>,
    #[serde(rename = "ResponseDescription", default)]
    pub response_description: Option<String>,
    #[serde(rename = "CustomerMessage", default)]
    pub customer_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StkPushSuccess {
    pub message: String,
    pub merchant_request_id: Option<String>,
    pub checkout_request_id: Option<String>,
    pub amount: String,
    pub phone_number: String,
    pub reference: String,
}

/// Outcome of a request the gateway accepted at the HTTP level.
#[derive(Debug, Clone, PartialEq)]
pub enum UpstreamResult {
    Success(StkPushSuccess),
    Failure { message: String, raw: Value },
}

/// `YYYYMMDDHHMMSS` in the gateway's expected local time.
pub fn generate_timestamp<Tz: TimeZone>(now: &DateTime<Tz>) -> String
where
    Tz::Offset: fmt::Display,
{
    now.format("%Y%m%d%H%M%S").to_string()
}

pub fn generate_password(short_code: &str, passkey: &str, timestamp: &str) -> String {
    let password_string = format!("{}{}{}", short_code, passkey, timestamp);
    base64.encode(password_string)
}

#[derive(Debug, Clone)]
pub struct MpesaService {
    client: Client,
    tokens: TokenCache,
    timeout: Duration,
}

impl MpesaService {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let client = Client::builder().timeout(config.http_timeout).build()?;
        let tokens = TokenCache::new(client.clone(), config.mpesa_oauth_endpoint.clone(), config.http_timeout);

        Ok(MpesaService {
            client,
            tokens,
            timeout: config.http_timeout,
        })
    }

    pub fn tokens(&self) -> &TokenCache {
        &self.tokens
    }

    /// Acquires a token, then sends the push. Stops at the first failure.
    pub async fn stk_push(
        &self,
        bundle: &CredentialBundle,
        request: &PaymentRequest,
    ) -> Result<UpstreamResult, ToolError> {
        let token = self.tokens.get_token(bundle, false).await?;
        self.initiate_payment(bundle, &token, request).await
    }

    pub async fn initiate_payment(
        &self,
        bundle: &CredentialBundle,
        token: &AccessToken,
        request: &PaymentRequest,
    ) -> Result<UpstreamResult, ToolError> {
        info!("C2B: STK push for {} - KSh {}", request.phone_number, request.amount);

        let timestamp = generate_timestamp(&Local::now());
        let stk_request = StkPushRequest::build(bundle, request, timestamp);
        let amount = stk_request.amount.to_string();

        let url = format!("{}{}", bundle.base_url, STK_PUSH_PATH);
        let response = self
            .client
            .post(&url)
            .header(header::AUTHORIZATION, format!("Bearer {}", token.as_str()))
            .header(header::CONTENT_TYPE, "application/json")
            .json(&stk_request)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| {
                error!("C2B request failed: {}", e);
                ToolError::from(e)
            })?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            error!("C2B failed: {} - {}", status, body);
            return Err(ToolError::UpstreamHttpError {
                status: status.as_u16(),
                body,
            });
        }

        let raw: Value = serde_json::from_str(&body)
            .map_err(|e| ToolError::unexpected(format!("invalid JSON from STK push endpoint: {}", e)))?;
        let stk_response: StkPushResponse = serde_json::from_value(raw.clone())
            .map_err(|e| ToolError::unexpected(format!("unexpected STK push response shape: {}", e)))?;

        if stk_response.response_code.as_deref() != Some("0") {
            let message = stk_response
                .response_description
                .unwrap_or_else(|| "Unknown error".to_string());
            warn!(
                "STK push failed: code={:?} msg={}",
                stk_response.response_code, message
            );
            return Ok(UpstreamResult::Failure { message, raw });
        }

        let success = StkPushSuccess {
            message: stk_response
                .customer_message
                .unwrap_or_else(|| "Payment prompt sent successfully".to_string()),
            merchant_request_id: stk_response.merchant_request_id,
            checkout_request_id: stk_response.checkout_request_id,
            amount,
            phone_number: request.phone_number.clone(),
            reference: request.account_reference.clone(),
        };

        info!(
            "STK push successful for {} KES to {}",
            success.amount, success.phone_number
        );
        Ok(UpstreamResult::Success(success))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};
    use mockito::Matcher;
    use serde_json::json;

    use crate::errors::AuthError;
    use crate::services::token_cache::CachedToken;

    fn bundle(base_url: &str) -> CredentialBundle {
        CredentialBundle {
            consumer_key: "key".to_string(),
            consumer_secret: "secret".to_string(),
            base_url: base_url.to_string(),
            business_short_code: "174379".to_string(),
            passkey: "passkey".to_string(),
            callback_url: "https://example.com/cb".to_string(),
        }
    }

    fn request() -> PaymentRequest {
        PaymentRequest::from_arguments(&json!({
            "amount": "100",
            "phone_number": "254712345678",
            "account_reference": "ORDER1",
            "transaction_desc": "Test"
        }))
        .unwrap()
    }

    fn service() -> MpesaService {
        let config = AppConfig {
            http_timeout: Duration::from_secs(5),
            ..AppConfig::default()
        };
        MpesaService::new(&config).unwrap()
    }

    #[test]
    fn password_and_timestamp_are_reproducible() {
        let eat = FixedOffset::east_opt(3 * 3600).unwrap();
        let now = eat.with_ymd_and_hms(2024, 1, 2, 3, 4, 5).unwrap();
        let timestamp = generate_timestamp(&now);
        assert_eq!(timestamp, "20240102030405");
        // base64("174379passkey20240102030405")
        assert_eq!(
            generate_password("174379", "passkey", &timestamp),
            "MTc0Mzc5cGFzc2tleTIwMjQwMTAyMDMwNDA1"
        );
    }

    #[test]
    fn payload_echoes_phone_and_shortcode() {
        let stk = StkPushRequest::build(&bundle("https://x"), &request(), "20240102030405".to_string());
        let value = serde_json::to_value(&stk).unwrap();

        assert_eq!(value["BusinessShortCode"], "174379");
        assert_eq!(value["PartyB"], "174379");
        assert_eq!(value["PartyA"], "254712345678");
        assert_eq!(value["PhoneNumber"], "254712345678");
        assert_eq!(value["TransactionType"], "CustomerPayBillOnline");
        assert_eq!(value["Amount"], 100);
        assert_eq!(value["CallBackURL"], "https://example.com/cb");
        assert_eq!(value["AccountReference"], "ORDER1");
        assert_eq!(value["TransactionDesc"], "Test");
    }

    #[test]
    fn amount_coercion_is_tolerant() {
        assert_eq!(Amount::coerce("100"), Amount::Whole(100));
        assert_eq!(Amount::coerce("10.50"), Amount::Raw("10.50".to_string()));
        assert_eq!(serde_json::to_value(Amount::coerce("abc")).unwrap(), json!("abc"));
        assert_eq!(Amount::coerce("10.50").to_string(), "10.50");
    }

    #[test]
    fn missing_field_is_named() {
        let err = PaymentRequest::from_arguments(&json!({
            "amount": "100",
            "account_reference": "ORDER1",
            "transaction_desc": "Test"
        }))
        .unwrap_err();
        assert_eq!(err.kind(), "ValidationError");
        assert_eq!(err.to_string(), "Invalid input: Missing required field: 'phone_number'");
    }

    #[test]
    fn empty_field_counts_as_missing() {
        let err = PaymentRequest::from_arguments(&json!({
            "amount": "",
            "phone_number": "254712345678",
            "account_reference": "ORDER1",
            "transaction_desc": "Test"
        }))
        .unwrap_err();
        assert!(err.to_string().contains("'amount'"));
    }

    #[test]
    fn numeric_arguments_and_local_phone_formats_are_accepted() {
        let req = PaymentRequest::from_arguments(&json!({
            "amount": 250,
            "phone_number": "0712345678",
            "account_reference": "ORDER1",
            "transaction_desc": "Test"
        }))
        .unwrap();
        assert_eq!(req.amount, "250");
        assert_eq!(req.phone_number, "254712345678");
        assert_eq!(format_phone_number("712345678"), "254712345678");
    }

    #[test]
    fn rejects_bad_phone_and_long_fields() {
        let bad_phone = PaymentRequest::from_arguments(&json!({
            "amount": "1",
            "phone_number": "12345",
            "account_reference": "ORDER1",
            "transaction_desc": "Test"
        }))
        .unwrap_err();
        assert!(bad_phone.to_string().contains("2547XXXXXXXX"));

        let too_long = PaymentRequest::from_arguments(&json!({
            "amount": "1",
            "phone_number": "254712345678",
            "account_reference": "THIRTEEN-CHAR",
            "transaction_desc": "Test"
        }))
        .unwrap_err();
        assert_eq!(too_long.kind(), "ValidationError");
        assert!(too_long.to_string().contains("account_reference"));
    }

    #[tokio::test]
    async fn successful_push_returns_ids_and_reference() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", STK_PUSH_PATH)
            .match_header("authorization", "Bearer tok")
            .match_body(Matcher::PartialJson(json!({
                "Amount": 100,
                "PartyA": "254712345678",
                "PartyB": "174379",
                "TransactionType": "CustomerPayBillOnline"
            })))
            .with_status(200)
            .with_body(
                json!({
                    "ResponseCode": "0",
                    "CustomerMessage": "ok",
                    "MerchantRequestID": "m1",
                    "CheckoutRequestID": "c1"
                })
                .to_string(),
            )
            .expect(1)
            .create_async()
            .await;

        let result = service()
            .initiate_payment(&bundle(&server.url()), &AccessToken::new("tok"), &request())
            .await
            .unwrap();

        assert_eq!(
            result,
            UpstreamResult::Success(StkPushSuccess {
                message: "ok".to_string(),
                merchant_request_id: Some("m1".to_string()),
                checkout_request_id: Some("c1".to_string()),
                amount: "100".to_string(),
                phone_number: "254712345678".to_string(),
                reference: "ORDER1".to_string(),
            })
        );
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn vendor_failure_code_is_business_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", STK_PUSH_PATH)
            .with_status(200)
            .with_body(json!({"ResponseCode": "1", "ResponseDescription": "Insufficient funds"}).to_string())
            .create_async()
            .await;

        let result = service()
            .initiate_payment(&bundle(&server.url()), &AccessToken::new("tok"), &request())
            .await
            .unwrap();

        match result {
            UpstreamResult::Failure { message, raw } => {
                assert_eq!(message, "Insufficient funds");
                assert_eq!(raw["ResponseCode"], "1");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn absent_response_code_is_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", STK_PUSH_PATH)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let result = service()
            .initiate_payment(&bundle(&server.url()), &AccessToken::new("tok"), &request())
            .await
            .unwrap();

        assert!(matches!(result, UpstreamResult::Failure { ref message, .. } if message == "Unknown error"));
    }

    #[tokio::test]
    async fn non_success_status_is_upstream_http_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", STK_PUSH_PATH)
            .with_status(400)
            .with_body("{\"errorMessage\":\"Invalid Access Token\"}")
            .create_async()
            .await;

        let err = service()
            .initiate_payment(&bundle(&server.url()), &AccessToken::new("tok"), &request())
            .await
            .unwrap_err();

        match err {
            ToolError::UpstreamHttpError { status, body } => {
                assert_eq!(status, 400);
                assert!(body.contains("Invalid Access Token"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_json_success_body_is_unexpected() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("POST", STK_PUSH_PATH)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let err = service()
            .initiate_payment(&bundle(&server.url()), &AccessToken::new("tok"), &request())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "UnexpectedError");
    }

    #[tokio::test]
    async fn auth_failure_skips_payment() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/oauth/v1/generate")
            .match_query(Matcher::Any)
            .with_status(500)
            .create_async()
            .await;
        let payment = server
            .mock("POST", STK_PUSH_PATH)
            .expect(0)
            .create_async()
            .await;

        let err = service().stk_push(&bundle(&server.url()), &request()).await.unwrap_err();
        assert!(matches!(err, ToolError::AuthError(AuthError::Status { status: 500, .. })));
        payment.assert_async().await;
    }

    #[tokio::test]
    async fn cached_token_is_used_for_payment() {
        let mut server = mockito::Server::new_async().await;
        let oauth = server
            .mock("GET", "/oauth/v1/generate")
            .match_query(Matcher::Any)
            .expect(0)
            .create_async()
            .await;
        let payment = server
            .mock("POST", STK_PUSH_PATH)
            .match_header("authorization", "Bearer seeded")
            .with_status(200)
            .with_body(json!({"ResponseCode": "0"}).to_string())
            .expect(1)
            .create_async()
            .await;

        let svc = service();
        let b = bundle(&server.url());
        svc.tokens()
            .insert(
                &b,
                CachedToken {
                    access_token: AccessToken::new("seeded"),
                    expires_at: Utc::now() + chrono::Duration::seconds(3600),
                },
            )
            .await;

        let result = svc.stk_push(&b, &request()).await.unwrap();
        assert!(matches!(result, UpstreamResult::Success(_)));
        oauth.assert_async().await;
        payment.assert_async().await;
    }
}
