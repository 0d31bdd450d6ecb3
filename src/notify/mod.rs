use crate::shared::models::Notification;
use chrono::Utc;
use diesel::prelude::*;
use diesel::PgConnection;
use log::warn;
use uuid::Uuid;

/// Fire-and-forget sink: a notification that cannot be recorded is logged
/// and never fails the request that produced it.
pub fn notify(
    conn: &mut PgConnection,
    recipient: Uuid,
    kind: &str,
    message: &str,
    booking: Option<Uuid>,
) {
    let row = Notification {
        id: Uuid::new_v4(),
        user_id: recipient,
        kind: kind.to_string(),
        message: message.to_string(),
        booking_id: booking,
        is_read: false,
        created_at: Utc::now(),
    };
    use crate::shared::models::schema::notifications;
    if let Err(e) = diesel::insert_into(notifications::table).values(&row).execute(conn) {
        warn!("failed to record {} notification for {}: {}", kind, recipient, e);
    }
}
