use crate::auth::current_user_id;
use crate::booking::{apply_payment, load_booking, BookingStatus, PaymentStatus};
use crate::notify::notify;
use crate::shared::error::ServiceError;
use crate::shared::models::Transaction;
use crate::shared::state::AppState;
use crate::shared::utils::get_conn;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use diesel::prelude::*;
use log::{error, info};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Share of every settled booking kept by the platform.
pub const PLATFORM_FEE_RATE: f64 = 0.10;

#[derive(Debug, Clone)]
pub struct PaystackClient {
    secret_key: String,
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    pub authorization_url: String,
    pub access_code: String,
    pub reference: String,
}

#[derive(Debug, Deserialize)]
struct GatewayEnvelope<T> {
    status: bool,
    message: String,
    data: Option<T>,
}

#[derive(Debug, Deserialize)]
struct VerifyData {
    status: String,
}

impl PaystackClient {
    pub fn new(secret_key: String, base_url: String) -> Self {
        Self {
            secret_key,
            client: reqwest::Client::new(),
            base_url,
        }
    }

    pub async fn initialize(
        &self,
        email: &str,
        amount_kobo: i64,
        reference: &str,
        callback_url: &str,
    ) -> Result<PaymentAuthorization, ServiceError> {
        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .bearer_auth(&self.secret_key)
            .json(&serde_json::json!({
                "email": email,
                "amount": amount_kobo,
                "reference": reference,
                "callback_url": callback_url,
            }))
            .send()
            .await?;
        let envelope: GatewayEnvelope<PaymentAuthorization> =
            handle_response(response).await?;
        if !envelope.status {
            return Err(ServiceError::Transport(envelope.message));
        }
        envelope
            .data
            .ok_or(ServiceError::Transport("empty gateway response".to_string()))
    }

    /// True when the gateway reports the reference as successfully charged.
    pub async fn verify(&self, reference: &str) -> Result<bool, ServiceError> {
        let response = self
            .client
            .get(format!("{}/transaction/verify/{}", self.base_url, reference))
            .bearer_auth(&self.secret_key)
            .send()
            .await?;
        let envelope: GatewayEnvelope<VerifyData> = handle_response(response).await?;
        Ok(envelope.status
            && envelope
                .data
                .map(|d| d.status == "success")
                .unwrap_or(false))
    }
}

async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, ServiceError> {
    let status = response.status();
    let body = response.text().await?;

    if !status.is_success() {
        #[derive(Deserialize)]
        struct GatewayError {
            message: String,
        }
        if let Ok(err) = serde_json::from_str::<GatewayError>(&body) {
            return Err(ServiceError::Transport(err.message));
        }
        return Err(ServiceError::Transport(format!("HTTP {}: {}", status, body)));
    }

    serde_json::from_str(&body).map_err(|e| ServiceError::Transport(e.to_string()))
}

/// Paystack charges in kobo.
pub fn kobo(amount: f64) -> i64 {
    (amount * 100.0).round() as i64
}

pub fn split_fees(total: f64) -> (f64, f64) {
    let platform_fee = total * PLATFORM_FEE_RATE;
    (platform_fee, total - platform_fee)
}

pub fn payment_reference(booking_id: Uuid) -> String {
    format!("ref_{}", booking_id)
}

#[actix_web::post("/api/payments/initialize/{booking_id}")]
pub async fn initialize_payment(
    req: HttpRequest,
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let mut conn = get_conn(&data.conn)?;

    let booking = load_booking(&mut conn, path.into_inner())?;
    if booking.customer_id != uid {
        return Err(ServiceError::NotAuthorized(
            "only the customer can pay for a booking".to_string(),
        ));
    }
    let status: BookingStatus = booking.status.parse()?;
    if status != BookingStatus::CustomerConfirmed {
        return Err(ServiceError::InvalidTransition(
            "booking must be confirmed by the customer before payment".to_string(),
        ));
    }
    if booking.payment_status.parse::<PaymentStatus>()? == PaymentStatus::Paid {
        return Err(ServiceError::InvalidTransition(
            "booking is already paid".to_string(),
        ));
    }

    let email = {
        use crate::shared::models::schema::users::dsl::*;
        users
            .find(uid)
            .select(email)
            .first::<String>(&mut conn)
            .optional()?
            .ok_or(ServiceError::NotFound("user"))?
    };

    let reference = payment_reference(booking.id);
    let callback_url = format!("{}/payment/callback", data.config.public_origin);
    let authorization = data
        .paystack
        .initialize(&email, kobo(booking.total_amount), &reference, &callback_url)
        .await?;

    info!(
        "payment initialized for booking {} with reference {}",
        booking.id, authorization.reference
    );
    Ok(HttpResponse::Ok().json(authorization))
}

#[actix_web::post("/api/payments/verify/{reference}")]
pub async fn verify_payment(
    req: HttpRequest,
    path: web::Path<String>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    current_user_id(&req, &data.config.jwt_secret)?;
    let reference = path.into_inner();
    let booking_id = reference
        .strip_prefix("ref_")
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| {
            ServiceError::Validation(format!("malformed payment reference: {}", reference))
        })?;

    let charged = data.paystack.verify(&reference).await?;

    let mut conn = get_conn(&data.conn)?;
    let mut booking = load_booking(&mut conn, booking_id)?;

    if !charged {
        apply_payment(&mut booking, PaymentStatus::Failed)?;
        {
            use crate::shared::models::schema::bookings::dsl::*;
            diesel::update(bookings.find(booking.id))
                .set((
                    payment_status.eq(&booking.payment_status),
                    updated_at.eq(booking.updated_at),
                ))
                .execute(&mut conn)?;
        }
        error!("payment failed for booking {}", booking.id);
        return Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "failed" })));
    }

    apply_payment(&mut booking, PaymentStatus::Paid)?;
    let (platform_fee, provider_earnings) = split_fees(booking.total_amount);
    let transaction = Transaction {
        id: Uuid::new_v4(),
        booking_id: booking.id,
        customer_id: booking.customer_id,
        provider_id: booking.provider_id,
        amount: booking.total_amount,
        platform_fee,
        provider_earnings,
        reference: reference.clone(),
        created_at: Utc::now(),
    };

    conn.transaction::<_, ServiceError, _>(|conn| {
        {
            use crate::shared::models::schema::bookings::dsl::*;
            diesel::update(bookings.find(booking.id))
                .set((
                    payment_status.eq(&booking.payment_status),
                    updated_at.eq(booking.updated_at),
                ))
                .execute(conn)?;
        }
        {
            use crate::shared::models::schema::transactions::dsl::*;
            diesel::insert_into(transactions)
                .values(&transaction)
                .execute(conn)?;
        }
        Ok(())
    })?;

    info!(
        "payment verified for booking {}: {} to provider, {} platform fee",
        booking.id, provider_earnings, platform_fee
    );
    notify(
        &mut conn,
        booking.provider_id,
        "payment_received",
        "Payment for your booking has been received",
        Some(booking.id),
    );

    Ok(HttpResponse::Ok().json(serde_json::json!({ "status": "success" })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kobo_rounds_to_the_nearest_unit() {
        assert_eq!(kobo(4000.0), 400_000);
        assert_eq!(kobo(19.99), 1_999);
        assert_eq!(kobo(0.005), 1);
    }

    #[test]
    fn fee_split_is_ten_percent() {
        let (fee, earnings) = split_fees(5000.0);
        assert_eq!(fee, 500.0);
        assert_eq!(earnings, 4500.0);
    }

    #[test]
    fn reference_round_trip() {
        let id = Uuid::new_v4();
        let reference = payment_reference(id);
        let parsed = reference
            .strip_prefix("ref_")
            .and_then(|s| Uuid::parse_str(s).ok());
        assert_eq!(parsed, Some(id));
    }
}
