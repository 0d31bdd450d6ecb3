use chrono::{DateTime, Utc};
use diesel::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = bookings)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub service_id: Uuid,
    pub status: String,
    pub payment_status: String,
    pub total_amount: f64,
    pub agreed_price: Option<f64>,
    pub price_negotiated: bool,
    pub preferred_date: String,
    pub preferred_time: String,
    pub service_location: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = price_offers)]
pub struct PriceOffer {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub offered_by: Uuid,
    pub offered_price: f64,
    pub message: Option<String>,
    pub status: String,
    pub parent_offer_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = messages)]
pub struct ChatMessage {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub sender_id: Uuid,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = notifications)]
pub struct Notification {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: String,
    pub message: String,
    pub booking_id: Option<Uuid>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Insertable, Selectable)]
#[diesel(table_name = transactions)]
pub struct Transaction {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub amount: f64,
    pub platform_fee: f64,
    pub provider_earnings: f64,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

// Account and listing records are owned by external collaborators; we only
// read the columns the engine needs.
#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub full_name: String,
    pub email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Queryable, Identifiable, Selectable)]
#[diesel(table_name = services)]
pub struct Service {
    pub id: Uuid,
    pub provider_id: Uuid,
    pub title: String,
    pub price: f64,
}

pub mod schema {
    diesel::table! {
        bookings (id) {
            id -> Uuid,
            customer_id -> Uuid,
            provider_id -> Uuid,
            service_id -> Uuid,
            status -> Text,
            payment_status -> Text,
            total_amount -> Float8,
            agreed_price -> Nullable<Float8>,
            price_negotiated -> Bool,
            preferred_date -> Text,
            preferred_time -> Text,
            service_location -> Text,
            notes -> Nullable<Text>,
            created_at -> Timestamptz,
            updated_at -> Timestamptz,
            completed_at -> Nullable<Timestamptz>,
        }
    }

    diesel::table! {
        price_offers (id) {
            id -> Uuid,
            booking_id -> Uuid,
            offered_by -> Uuid,
            offered_price -> Float8,
            message -> Nullable<Text>,
            status -> Text,
            parent_offer_id -> Nullable<Uuid>,
            created_at -> Timestamptz,
            responded_at -> Nullable<Timestamptz>,
        }
    }

    diesel::table! {
        messages (id) {
            id -> Uuid,
            booking_id -> Uuid,
            sender_id -> Uuid,
            sender_name -> Text,
            text -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        notifications (id) {
            id -> Uuid,
            user_id -> Uuid,
            kind -> Text,
            message -> Text,
            booking_id -> Nullable<Uuid>,
            is_read -> Bool,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        transactions (id) {
            id -> Uuid,
            booking_id -> Uuid,
            customer_id -> Uuid,
            provider_id -> Uuid,
            amount -> Float8,
            platform_fee -> Float8,
            provider_earnings -> Float8,
            reference -> Text,
            created_at -> Timestamptz,
        }
    }

    diesel::table! {
        users (id) {
            id -> Uuid,
            full_name -> Text,
            email -> Text,
        }
    }

    diesel::table! {
        services (id) {
            id -> Uuid,
            provider_id -> Uuid,
            title -> Text,
            price -> Float8,
        }
    }
}

pub use schema::*;
