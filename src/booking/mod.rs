use crate::auth::current_user_id;
use crate::notify::notify;
use crate::shared::error::ServiceError;
use crate::shared::models::Booking;
use crate::shared::state::AppState;
use crate::shared::utils::get_conn;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use log::info;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BookingStatus {
    Pending,
    Accepted,
    Completed,
    CustomerConfirmed,
    Cancelled,
}

impl std::fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Completed => write!(f, "completed"),
            Self::CustomerConfirmed => write!(f, "customer_confirmed"),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for BookingStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "completed" => Ok(Self::Completed),
            "customer_confirmed" => Ok(Self::CustomerConfirmed),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(ServiceError::Validation(format!(
                "unknown booking status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Paid => write!(f, "paid"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "paid" => Ok(Self::Paid),
            "failed" => Ok(Self::Failed),
            other => Err(ServiceError::Validation(format!(
                "unknown payment status: {}",
                other
            ))),
        }
    }
}

/// Which side of the booking the acting user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Party {
    Customer,
    Provider,
}

impl Booking {
    pub fn party_of(&self, user_id: Uuid) -> Option<Party> {
        if self.customer_id == user_id {
            Some(Party::Customer)
        } else if self.provider_id == user_id {
            Some(Party::Provider)
        } else {
            None
        }
    }
}

/// The two axes evolve independently; this is the allow-list that keeps
/// their combinations valid. `paid`/`failed` only exist once the customer
/// has confirmed completion.
pub fn is_valid_state_pair(status: BookingStatus, payment: PaymentStatus) -> bool {
    matches!(payment, PaymentStatus::Pending)
        || matches!(status, BookingStatus::CustomerConfirmed)
}

pub fn validate_transition(
    current: BookingStatus,
    actor: Party,
    target: BookingStatus,
) -> Result<(), ServiceError> {
    use BookingStatus::*;

    match target {
        Accepted | Completed if actor != Party::Provider => {
            return Err(ServiceError::NotAuthorized(
                "only the provider can accept or complete a booking".to_string(),
            ));
        }
        CustomerConfirmed if actor != Party::Customer => {
            return Err(ServiceError::NotAuthorized(
                "only the customer can confirm completion".to_string(),
            ));
        }
        _ => {}
    }

    // Decline before acceptance and cancellation afterwards share the same
    // terminal state. customer_confirmed ends the status axis and cannot be
    // cancelled; only the payment axis moves from there.
    let allowed = matches!(
        (current, target),
        (Pending, Accepted)
            | (Accepted, Completed)
            | (Completed, CustomerConfirmed)
            | (Pending | Accepted | Completed, Cancelled)
    );
    if allowed {
        Ok(())
    } else {
        Err(ServiceError::InvalidTransition(format!(
            "cannot move booking from {} to {}",
            current, target
        )))
    }
}

/// Validates and applies a status transition in place, together with its
/// side effects from the transition table.
pub fn apply_transition(
    booking: &mut Booking,
    actor: Party,
    target: BookingStatus,
) -> Result<(), ServiceError> {
    let current: BookingStatus = booking.status.parse()?;
    validate_transition(current, actor, target)?;

    let payment: PaymentStatus = booking.payment_status.parse()?;
    if !is_valid_state_pair(target, payment) {
        return Err(ServiceError::InvalidTransition(format!(
            "state pair ({}, {}) is not allowed",
            target, payment
        )));
    }

    let now = Utc::now();
    booking.status = target.to_string();
    booking.updated_at = now;
    match target {
        BookingStatus::Accepted => {
            // An accepted offer fixed the price earlier; acceptance of the
            // booking is where it becomes the amount due.
            if booking.price_negotiated {
                if let Some(agreed) = booking.agreed_price {
                    booking.total_amount = agreed;
                }
            }
        }
        BookingStatus::Completed => {
            booking.completed_at = Some(now);
        }
        _ => {}
    }
    Ok(())
}

/// The payment axis only moves `pending -> paid` or `pending -> failed`,
/// driven by the payment collaborator after customer confirmation.
pub fn apply_payment(booking: &mut Booking, target: PaymentStatus) -> Result<(), ServiceError> {
    let current: PaymentStatus = booking.payment_status.parse()?;
    if current != PaymentStatus::Pending || target == PaymentStatus::Pending {
        return Err(ServiceError::InvalidTransition(format!(
            "payment status cannot move from {} to {}",
            current, target
        )));
    }
    let status: BookingStatus = booking.status.parse()?;
    if !is_valid_state_pair(status, target) {
        return Err(ServiceError::InvalidTransition(format!(
            "state pair ({}, {}) is not allowed",
            status, target
        )));
    }
    booking.payment_status = target.to_string();
    booking.updated_at = Utc::now();
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct BookingCreate {
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub preferred_date: String,
    pub preferred_time: String,
    pub service_location: String,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StatusUpdate {
    pub status: String,
}

#[actix_web::post("/api/bookings")]
pub async fn create_booking(
    req: HttpRequest,
    body: web::Json<BookingCreate>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let mut conn = get_conn(&data.conn)?;

    let listed_price: f64 = {
        use crate::shared::models::schema::services::dsl::*;
        services
            .filter(id.eq(body.service_id))
            .select(price)
            .first::<f64>(&mut conn)
            .optional()?
            .ok_or(ServiceError::NotFound("service"))?
    };

    let now = Utc::now();
    let booking = Booking {
        id: Uuid::new_v4(),
        customer_id: uid,
        provider_id: body.provider_id,
        service_id: body.service_id,
        status: BookingStatus::Pending.to_string(),
        payment_status: PaymentStatus::Pending.to_string(),
        total_amount: listed_price,
        agreed_price: None,
        price_negotiated: false,
        preferred_date: body.preferred_date.clone(),
        preferred_time: body.preferred_time.clone(),
        service_location: body.service_location.clone(),
        notes: body.notes.clone(),
        created_at: now,
        updated_at: now,
        completed_at: None,
    };

    {
        use crate::shared::models::schema::bookings::dsl::*;
        diesel::insert_into(bookings)
            .values(&booking)
            .execute(&mut conn)?;
    }

    info!("booking {} created by customer {}", booking.id, uid);
    notify(
        &mut conn,
        booking.provider_id,
        "new_booking",
        "You have a new booking request",
        Some(booking.id),
    );

    Ok(HttpResponse::Ok().json(booking))
}

#[actix_web::get("/api/bookings")]
pub async fn list_bookings(
    req: HttpRequest,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    use crate::shared::models::schema::bookings::dsl::*;

    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let mut conn = get_conn(&data.conn)?;
    let results = bookings
        .filter(customer_id.eq(uid).or(provider_id.eq(uid)))
        .order(created_at.desc())
        .load::<Booking>(&mut conn)?;
    Ok(HttpResponse::Ok().json(results))
}

#[actix_web::get("/api/bookings/{booking_id}")]
pub async fn get_booking(
    req: HttpRequest,
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let mut conn = get_conn(&data.conn)?;
    let booking = load_booking(&mut conn, path.into_inner())?;
    booking.party_of(uid).ok_or_else(|| {
        ServiceError::NotAuthorized("not a party to this booking".to_string())
    })?;
    Ok(HttpResponse::Ok().json(booking))
}

#[actix_web::put("/api/bookings/{booking_id}/status")]
pub async fn update_booking_status(
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: web::Json<StatusUpdate>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let target: BookingStatus = body.status.parse()?;
    let mut conn = get_conn(&data.conn)?;

    let mut booking = load_booking(&mut conn, path.into_inner())?;
    let actor = booking.party_of(uid).ok_or_else(|| {
        ServiceError::NotAuthorized("not a party to this booking".to_string())
    })?;
    apply_transition(&mut booking, actor, target)?;

    {
        use crate::shared::models::schema::bookings::dsl::*;
        diesel::update(bookings.find(booking.id))
            .set((
                status.eq(&booking.status),
                total_amount.eq(booking.total_amount),
                updated_at.eq(booking.updated_at),
                completed_at.eq(booking.completed_at),
            ))
            .execute(&mut conn)?;
    }

    info!("booking {} moved to {} by {}", booking.id, target, uid);
    let counterpart = match actor {
        Party::Customer => booking.provider_id,
        Party::Provider => booking.customer_id,
    };
    notify(
        &mut conn,
        counterpart,
        &format!("booking_{}", target),
        &format!("Booking is now {}", target),
        Some(booking.id),
    );

    // Authoritative state after the write.
    let booking = load_booking(&mut conn, booking.id)?;
    Ok(HttpResponse::Ok().json(booking))
}

pub fn load_booking(
    conn: &mut PgConnection,
    lookup_id: Uuid,
) -> Result<Booking, ServiceError> {
    use crate::shared::models::schema::bookings::dsl::*;
    bookings
        .find(lookup_id)
        .first::<Booking>(conn)
        .optional()?
        .ok_or(ServiceError::NotFound("booking"))
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn booking_fixture(customer: Uuid, provider: Uuid) -> Booking {
        let now = Utc::now();
        Booking {
            id: Uuid::new_v4(),
            customer_id: customer,
            provider_id: provider,
            service_id: Uuid::new_v4(),
            status: BookingStatus::Pending.to_string(),
            payment_status: PaymentStatus::Pending.to_string(),
            total_amount: 5000.0,
            agreed_price: None,
            price_negotiated: false,
            preferred_date: "2026-08-20".to_string(),
            preferred_time: "10:00".to_string(),
            service_location: "12 Marina Rd".to_string(),
            notes: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }
}
