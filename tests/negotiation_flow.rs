use chrono::Utc;
use marketserver::booking::{
    apply_payment, apply_transition, BookingStatus, Party, PaymentStatus,
};
use marketserver::negotiation::{
    build_offer, respond_to_offer, validate_propose, OfferAction, ResponseOutcome,
};
use marketserver::shared::models::{Booking, PriceOffer};
use uuid::Uuid;

fn new_booking(customer: Uuid, provider: Uuid, listed_price: f64) -> Booking {
    let now = Utc::now();
    Booking {
        id: Uuid::new_v4(),
        customer_id: customer,
        provider_id: provider,
        service_id: Uuid::new_v4(),
        status: "pending".to_string(),
        payment_status: "pending".to_string(),
        total_amount: listed_price,
        agreed_price: None,
        price_negotiated: false,
        preferred_date: "2026-09-01".to_string(),
        preferred_time: "14:00".to_string(),
        service_location: "4 Allen Avenue".to_string(),
        notes: Some("gate code 2244".to_string()),
        created_at: now,
        updated_at: now,
        completed_at: None,
    }
}

fn apply(ledger: &mut Vec<PriceOffer>, booking: &mut Booking, outcome: &ResponseOutcome) {
    for entry in ledger.iter_mut() {
        if entry.id == outcome.offer.id {
            *entry = outcome.offer.clone();
        } else if outcome.superseded.contains(&entry.id) {
            entry.status = "superseded".to_string();
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
    let accepted: Vec<_> = ledger.iter().filter(|o| o.status == "accepted").collect();
    if booking.price_negotiated {
        assert_eq!(accepted.len(), 1, "exactly one accepted offer");
        assert_eq!(booking.agreed_price, Some(accepted[0].offered_price));
        assert_eq!(booking.total_amount, accepted[0].offered_price);
        assert!(
            !ledger.iter().any(|o| o.status == "pending"),
            "no offer may stay pending after acceptance"
        );
    } else {
        assert!(accepted.is_empty());
    }
}

#[test]
fn negotiated_engagement_end_to_end() {
    let customer = Uuid::new_v4();
    let provider = Uuid::new_v4();
    let mut booking = new_booking(customer, provider, 6500.0);
    let mut ledger: Vec<PriceOffer> = Vec::new();

    // Provider opens at 5000, customer counters at 4000, provider accepts.
    validate_propose(&booking, provider, 5000.0).unwrap();
    ledger.push(build_offer(&booking, provider, 5000.0, None, None));
    assert_price_invariant(&booking, &ledger);

    let counter = respond_to_offer(
        &booking,
        &ledger,
        ledger[0].id,
        customer,
        OfferAction::Counter,
        Some(4000.0),
        Some("meet me halfway".to_string()),
    )
    .unwrap();
    apply(&mut ledger, &mut booking, &counter);
    assert_price_invariant(&booking, &ledger);

    let accepted = respond_to_offer(
        &booking,
        &ledger,
        ledger[1].id,
        provider,
        OfferAction::Accept,
        None,
        None,
    )
    .unwrap();
    apply(&mut ledger, &mut booking, &accepted);

    assert_eq!(booking.agreed_price, Some(4000.0));
    assert!(booking.price_negotiated);
    assert_eq!(ledger[0].status, "countered");
    assert_eq!(ledger[1].status, "accepted");
    assert_price_invariant(&booking, &ledger);

    // Negotiation is locked; the lifecycle carries the agreed price through.
    assert!(validate_propose(&booking, customer, 3500.0).is_err());

    apply_transition(&mut booking, Party::Provider, BookingStatus::Accepted).unwrap();
    assert_eq!(booking.total_amount, 4000.0);
    apply_transition(&mut booking, Party::Provider, BookingStatus::Completed).unwrap();
    apply_transition(&mut booking, Party::Customer, BookingStatus::CustomerConfirmed).unwrap();

    // Payment settles out of band once the customer confirmed.
    apply_payment(&mut booking, PaymentStatus::Paid).unwrap();
    assert_eq!(booking.status, "customer_confirmed");
    assert_eq!(booking.payment_status, "paid");
    assert_price_invariant(&booking, &ledger);
}

#[test]
fn racing_offers_settle_without_deadlock() {
    let customer = Uuid::new_v4();
    let provider = Uuid::new_v4();
    let mut booking = new_booking(customer, provider, 9000.0);

    // Both parties propose before either sees the other's offer.
    let mut ledger = vec![
        build_offer(&booking, provider, 8000.0, None, None),
        build_offer(&booking, customer, 7000.0, None, None),
    ];

    // The provider accepts the customer's number; the provider's own offer
    // must not be left dangling.
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
    apply(&mut ledger, &mut booking, &outcome);

    assert_eq!(ledger[0].status, "superseded");
    assert_eq!(ledger[1].status, "accepted");
    assert_price_invariant(&booking, &ledger);

    // The customer's late response to the superseded offer is an expected
    // race outcome, not a success.
    let err = respond_to_offer(
        &booking,
        &ledger,
        ledger[0].id,
        customer,
        OfferAction::Accept,
        None,
        None,
    )
    .unwrap_err();
    assert!(matches!(
        err,
        marketserver::shared::error::ServiceError::AlreadyResolved
    ));
}
