use crate::auth::current_user_id;
use crate::booking::{load_booking, BookingStatus, Party};
use crate::notify::notify;
use crate::shared::error::ServiceError;
use crate::shared::models::{Booking, PriceOffer};
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
pub enum OfferStatus {
    Pending,
    Accepted,
    Rejected,
    Countered,
    Superseded,
}

impl std::fmt::Display for OfferStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Accepted => write!(f, "accepted"),
            Self::Rejected => write!(f, "rejected"),
            Self::Countered => write!(f, "countered"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

impl std::str::FromStr for OfferStatus {
    type Err = ServiceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "countered" => Ok(Self::Countered),
            "superseded" => Ok(Self::Superseded),
            other => Err(ServiceError::Validation(format!(
                "unknown offer status: {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferAction {
    Accept,
    Reject,
    Counter,
}

/// Gate for a new offer. Negotiation is open to both parties until the
/// booking terminates or a price is agreed; one acceptance locks it for
/// good.
pub fn validate_propose(
    booking: &Booking,
    proposer: Uuid,
    price: f64,
) -> Result<(), ServiceError> {
    booking.party_of(proposer).ok_or_else(|| {
        ServiceError::NotAuthorized("only a booking party can make an offer".to_string())
    })?;
    if !(price > 0.0) {
        return Err(ServiceError::Validation(
            "offer price must be greater than zero".to_string(),
        ));
    }
    let status: BookingStatus = booking.status.parse()?;
    if status == BookingStatus::Cancelled {
        return Err(ServiceError::InvalidTransition(
            "cannot negotiate on a cancelled booking".to_string(),
        ));
    }
    if booking.price_negotiated {
        return Err(ServiceError::InvalidTransition(
            "price for this booking has already been agreed".to_string(),
        ));
    }
    Ok(())
}

pub fn build_offer(
    booking: &Booking,
    proposer: Uuid,
    price: f64,
    message: Option<String>,
    parent: Option<Uuid>,
) -> PriceOffer {
    PriceOffer {
        id: Uuid::new_v4(),
        booking_id: booking.id,
        offered_by: proposer,
        offered_price: price,
        message,
        status: OfferStatus::Pending.to_string(),
        parent_offer_id: parent,
        created_at: Utc::now(),
        responded_at: None,
    }
}

/// Change-set produced by resolving an offer. The caller persists it as one
/// write and then re-reads authoritative state.
#[derive(Debug)]
pub struct ResponseOutcome {
    pub offer: PriceOffer,
    pub superseded: Vec<Uuid>,
    pub counter: Option<PriceOffer>,
    pub agreed_price: Option<f64>,
}

/// Resolves a pending offer against the booking's full offer ledger.
///
/// Acceptance is authoritative and retroactive: it supersedes every other
/// still-pending offer on the booking rather than failing, so two parties
/// proposing simultaneously can never deadlock the negotiation.
pub fn respond_to_offer(
    booking: &Booking,
    ledger: &[PriceOffer],
    offer_id: Uuid,
    responder: Uuid,
    action: OfferAction,
    counter_price: Option<f64>,
    message: Option<String>,
) -> Result<ResponseOutcome, ServiceError> {
    let mut offer = ledger
        .iter()
        .find(|o| o.id == offer_id)
        .cloned()
        .ok_or(ServiceError::NotFound("offer"))?;

    booking.party_of(responder).ok_or_else(|| {
        ServiceError::NotAuthorized("only a booking party can respond to an offer".to_string())
    })?;
    if offer.offered_by == responder {
        return Err(ServiceError::NotAuthorized(
            "an offer cannot be resolved by its own proposer".to_string(),
        ));
    }
    if offer.status.parse::<OfferStatus>()? != OfferStatus::Pending {
        return Err(ServiceError::AlreadyResolved);
    }

    let now = Utc::now();
    offer.responded_at = Some(now);

    match action {
        OfferAction::Accept => {
            offer.status = OfferStatus::Accepted.to_string();
            let superseded = ledger
                .iter()
                .filter(|o| o.id != offer.id && o.status == OfferStatus::Pending.to_string())
                .map(|o| o.id)
                .collect();
            Ok(ResponseOutcome {
                agreed_price: Some(offer.offered_price),
                superseded,
                counter: None,
                offer,
            })
        }
        OfferAction::Reject => {
            offer.status = OfferStatus::Rejected.to_string();
            Ok(ResponseOutcome {
                offer,
                superseded: Vec::new(),
                counter: None,
                agreed_price: None,
            })
        }
        OfferAction::Counter => {
            let price = counter_price
                .filter(|p| *p > 0.0)
                .ok_or_else(|| {
                    ServiceError::Validation(
                        "counter price must be greater than zero".to_string(),
                    )
                })?;
            offer.status = OfferStatus::Countered.to_string();
            let counter = build_offer(booking, responder, price, message, Some(offer.id));
            Ok(ResponseOutcome {
                offer,
                superseded: Vec::new(),
                counter: Some(counter),
                agreed_price: None,
            })
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct OfferCreate {
    pub offered_price: f64,
    pub message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct OfferRespond {
    pub action: OfferAction,
    pub counter_price: Option<f64>,
    pub message: Option<String>,
}

#[actix_web::post("/api/bookings/{booking_id}/offers")]
pub async fn propose_offer(
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: web::Json<OfferCreate>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let mut conn = get_conn(&data.conn)?;

    let booking = load_booking(&mut conn, path.into_inner())?;
    validate_propose(&booking, uid, body.offered_price)?;
    let offer = build_offer(&booking, uid, body.offered_price, body.message.clone(), None);

    {
        use crate::shared::models::schema::price_offers::dsl::*;
        diesel::insert_into(price_offers)
            .values(&offer)
            .execute(&mut conn)?;
    }

    info!(
        "offer {} ({}) proposed on booking {} by {}",
        offer.id, offer.offered_price, booking.id, uid
    );
    let receiver = match booking.party_of(uid) {
        Some(Party::Customer) => booking.provider_id,
        _ => booking.customer_id,
    };
    notify(
        &mut conn,
        receiver,
        "price_offer",
        "You have received a price offer",
        Some(booking.id),
    );

    Ok(HttpResponse::Ok().json(offer))
}

#[actix_web::get("/api/bookings/{booking_id}/offers")]
pub async fn list_offers(
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
    let ledger = load_ledger(&mut conn, booking.id)?;
    Ok(HttpResponse::Ok().json(ledger))
}

#[actix_web::put("/api/offers/{offer_id}/respond")]
pub async fn respond_offer(
    req: HttpRequest,
    path: web::Path<Uuid>,
    body: web::Json<OfferRespond>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let offer_id = path.into_inner();
    let mut conn = get_conn(&data.conn)?;

    let parent_booking_id: Uuid = {
        use crate::shared::models::schema::price_offers::dsl::*;
        price_offers
            .find(offer_id)
            .select(booking_id)
            .first::<Uuid>(&mut conn)
            .optional()?
            .ok_or(ServiceError::NotFound("offer"))?
    };
    let booking = load_booking(&mut conn, parent_booking_id)?;
    let ledger = load_ledger(&mut conn, booking.id)?;

    let outcome = respond_to_offer(
        &booking,
        &ledger,
        offer_id,
        uid,
        body.action,
        body.counter_price,
        body.message.clone(),
    )?;

    conn.transaction::<_, ServiceError, _>(|conn| {
        {
            use crate::shared::models::schema::price_offers::dsl::*;
            diesel::update(price_offers.find(outcome.offer.id))
                .set((
                    status.eq(&outcome.offer.status),
                    responded_at.eq(outcome.offer.responded_at),
                ))
                .execute(conn)?;
            if !outcome.superseded.is_empty() {
                diesel::update(price_offers.filter(id.eq_any(&outcome.superseded)))
                    .set((
                        status.eq(OfferStatus::Superseded.to_string()),
                        responded_at.eq(outcome.offer.responded_at),
                    ))
                    .execute(conn)?;
            }
            if let Some(counter) = &outcome.counter {
                diesel::insert_into(price_offers)
                    .values(counter)
                    .execute(conn)?;
            }
        }
        if let Some(agreed) = outcome.agreed_price {
            use crate::shared::models::schema::bookings::dsl::*;
            diesel::update(bookings.find(booking.id))
                .set((
                    agreed_price.eq(Some(agreed)),
                    total_amount.eq(agreed),
                    price_negotiated.eq(true),
                    updated_at.eq(Utc::now()),
                ))
                .execute(conn)?;
        }
        Ok(())
    })?;

    info!(
        "offer {} on booking {} resolved as {} by {}",
        outcome.offer.id, booking.id, outcome.offer.status, uid
    );
    notify(
        &mut conn,
        outcome.offer.offered_by,
        &format!("offer_{}", outcome.offer.status),
        &format!("Your price offer was {}", outcome.offer.status),
        Some(booking.id),
    );

    // Re-read so the caller sees server-confirmed state, not the change-set.
    let booking = load_booking(&mut conn, booking.id)?;
    let offer = {
        use crate::shared::models::schema::price_offers::dsl::*;
        price_offers
            .find(outcome.offer.id)
            .first::<PriceOffer>(&mut conn)?
    };
    Ok(HttpResponse::Ok().json(serde_json::json!({
        "offer": offer,
        "booking": booking,
    })))
}

pub fn load_ledger(
    conn: &mut PgConnection,
    for_booking: Uuid,
) -> Result<Vec<PriceOffer>, ServiceError> {
    use crate::shared::models::schema::price_offers::dsl::*;
    Ok(price_offers
        .filter(booking_id.eq(for_booking))
        .order(created_at.asc())
        .load::<PriceOffer>(conn)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::booking::test_support::booking_fixture;

    fn apply_outcome(ledger: &mut Vec<PriceOffer>, booking: &mut Booking, outcome: &ResponseOutcome) {
        for entry in ledger.iter_mut() {
            if entry.id == outcome.offer.id {
                *entry = outcome.offer.clone();
            } else if outcome.superseded.contains(&entry.id) {
                entry.status = OfferStatus::Superseded.to_string();
                entry.responded_at = outcome.offer.responded_at;
            }
        }
        if let Some(counter) = &outcome.counter {
            ledger.push(counter.clone());
        }
        if let Some(agreed) = outcome.agreed_price {
            booking.agreed_price = Some(agreed);
            booking.total_amount = agreed;
            booking.price_negotiated = true;
        }
    }

    fn assert_price_invariant(booking: &Booking, ledger: &[PriceOffer]) {
        let accepted: Vec<_> = ledger
            .iter()
            .filter(|o| o.status == "accepted")
            .collect();
        if booking.price_negotiated {
            assert_eq!(accepted.len(), 1);
            assert_eq!(booking.agreed_price, Some(accepted[0].offered_price));
            assert_eq!(booking.total_amount, accepted[0].offered_price);
            assert!(!ledger.iter().any(|o| o.status == "pending"));
        } else {
            assert!(accepted.is_empty());
            assert_eq!(booking.agreed_price, None);
        }
    }

    #[test]
    fn propose_counter_accept_fixes_price() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let mut booking = booking_fixture(customer, provider);
        let mut ledger = Vec::new();

        validate_propose(&booking, provider, 5000.0).unwrap();
        ledger.push(build_offer(&booking, provider, 5000.0, None, None));
        let initial_id = ledger[0].id;

        let outcome = respond_to_offer(
            &booking,
            &ledger,
            initial_id,
            customer,
            OfferAction::Counter,
            Some(4000.0),
            None,
        )
        .unwrap();
        apply_outcome(&mut ledger, &mut booking, &outcome);
        let counter_id = ledger[1].id;
        assert_eq!(ledger[0].status, "countered");
        assert_eq!(ledger[1].offered_by, customer);
        assert_eq!(ledger[1].parent_offer_id, Some(initial_id));

        // The original proposer is now the responder for the counter.
        let outcome = respond_to_offer(
            &booking,
            &ledger,
            counter_id,
            provider,
            OfferAction::Accept,
            None,
            None,
        )
        .unwrap();
        apply_outcome(&mut ledger, &mut booking, &outcome);

        assert_eq!(booking.agreed_price, Some(4000.0));
        assert_eq!(booking.total_amount, 4000.0);
        assert!(booking.price_negotiated);
        assert_eq!(ledger[0].status, "countered");
        assert_eq!(ledger[1].status, "accepted");
        assert_price_invariant(&booking, &ledger);
    }

    #[test]
    fn proposer_cannot_accept_own_offer() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let booking = booking_fixture(customer, provider);
        let ledger = vec![build_offer(&booking, provider, 3000.0, None, None)];

        let err = respond_to_offer(
            &booking,
            &ledger,
            ledger[0].id,
            provider,
            OfferAction::Accept,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::NotAuthorized(_)));
        assert_eq!(ledger[0].status, "pending");
    }

    #[test]
    fn acceptance_supersedes_concurrent_pending_offer() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let mut booking = booking_fixture(customer, provider);
        let mut ledger = vec![
            build_offer(&booking, provider, 6000.0, None, None),
            build_offer(&booking, customer, 4500.0, None, None),
        ];

        let outcome = respond_to_offer(
            &booking,
            &ledger,
            ledger[1].id,
            provider,
            OfferAction::Accept,
            None,
            None,
        )
        .unwrap();
        assert_eq!(outcome.superseded, vec![ledger[0].id]);
        apply_outcome(&mut ledger, &mut booking, &outcome);

        assert_eq!(ledger[0].status, "superseded");
        assert_eq!(ledger[1].status, "accepted");
        assert_price_invariant(&booking, &ledger);
    }

    #[test]
    fn double_response_is_already_resolved() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let mut booking = booking_fixture(customer, provider);
        let mut ledger = vec![build_offer(&booking, provider, 3000.0, None, None)];
        let offer_id = ledger[0].id;

        let outcome = respond_to_offer(
            &booking,
            &ledger,
            offer_id,
            customer,
            OfferAction::Accept,
            None,
            None,
        )
        .unwrap();
        apply_outcome(&mut ledger, &mut booking, &outcome);
        let snapshot = (booking.clone(), ledger.clone());

        let err = respond_to_offer(
            &booking,
            &ledger,
            offer_id,
            customer,
            OfferAction::Reject,
            None,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, ServiceError::AlreadyResolved));
        // State after the failed second call equals state after the first.
        assert_eq!(snapshot.0.agreed_price, booking.agreed_price);
        assert_eq!(snapshot.1[0].status, ledger[0].status);
    }

    #[test]
    fn negotiation_locks_after_acceptance() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let mut booking = booking_fixture(customer, provider);
        let mut ledger = vec![build_offer(&booking, customer, 2500.0, None, None)];

        let outcome = respond_to_offer(
            &booking,
            &ledger,
            ledger[0].id,
            provider,
            OfferAction::Accept,
            None,
            None,
        )
        .unwrap();
        apply_outcome(&mut ledger, &mut booking, &outcome);

        let err = validate_propose(&booking, customer, 2000.0).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
        let err = validate_propose(&booking, provider, 9000.0).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
    }

    #[test]
    fn propose_rejected_on_cancelled_booking() {
        let mut booking = booking_fixture(Uuid::new_v4(), Uuid::new_v4());
        booking.status = BookingStatus::Cancelled.to_string();
        let err = validate_propose(&booking, booking.customer_id, 1000.0).unwrap_err();
        assert!(matches!(err, ServiceError::InvalidTransition(_)));
    }

    #[test]
    fn propose_validates_amount_and_party() {
        let booking = booking_fixture(Uuid::new_v4(), Uuid::new_v4());
        let err = validate_propose(&booking, booking.customer_id, 0.0).unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
        let err = validate_propose(&booking, Uuid::new_v4(), 1000.0).unwrap_err();
        assert!(matches!(err, ServiceError::NotAuthorized(_)));
    }

    #[test]
    fn counter_requires_positive_price() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let booking = booking_fixture(customer, provider);
        let ledger = vec![build_offer(&booking, provider, 3000.0, None, None)];

        for bad in [None, Some(0.0), Some(-50.0)] {
            let err = respond_to_offer(
                &booking,
                &ledger,
                ledger[0].id,
                customer,
                OfferAction::Counter,
                bad,
                None,
            )
            .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)));
        }
    }

    #[test]
    fn rejection_leaves_booking_untouched() {
        let customer = Uuid::new_v4();
        let provider = Uuid::new_v4();
        let mut booking = booking_fixture(customer, provider);
        let mut ledger = vec![build_offer(&booking, customer, 1500.0, None, None)];

        let outcome = respond_to_offer(
            &booking,
            &ledger,
            ledger[0].id,
            provider,
            OfferAction::Reject,
            None,
            None,
        )
        .unwrap();
        apply_outcome(&mut ledger, &mut booking, &outcome);

        assert_eq!(ledger[0].status, "rejected");
        assert!(!booking.price_negotiated);
        assert_eq!(booking.agreed_price, None);
        assert_price_invariant(&booking, &ledger);

        // A rejected offer does not lock negotiation; a fresh one may follow.
        validate_propose(&booking, customer, 1800.0).unwrap();
    }
}
