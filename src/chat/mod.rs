use crate::auth::current_user_id;
use crate::shared::error::ServiceError;
use crate::shared::models::ChatMessage;
use crate::shared::state::AppState;
use crate::shared::utils::{get_conn, DbPool};
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::Message as WsMessage;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio::sync::mpsc;
use tokio::sync::Mutex as AsyncMutex;
use uuid::Uuid;

pub mod client;

/// Outbound frame a participant writes to the channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSend {
    pub sender_id: Uuid,
    pub text: String,
}

/// Inbound frame every connected participant receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatEvent {
    pub sender_id: Uuid,
    pub sender_name: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
}

/// Registry of live connections, keyed by booking. Delivery is at-most-once:
/// a peer that cannot take the event right now simply misses it, and a dead
/// peer is dropped from the registry on the next broadcast.
pub struct ChatHub {
    connections: AsyncMutex<HashMap<Uuid, HashMap<Uuid, mpsc::Sender<ChatEvent>>>>,
}

impl ChatHub {
    pub fn new() -> Self {
        Self {
            connections: AsyncMutex::new(HashMap::new()),
        }
    }

    pub async fn add_connection(&self, booking_id: Uuid, conn_id: Uuid, tx: mpsc::Sender<ChatEvent>) {
        let mut connections = self.connections.lock().await;
        connections.entry(booking_id).or_default().insert(conn_id, tx);
    }

    pub async fn remove_connection(&self, booking_id: Uuid, conn_id: Uuid) {
        let mut connections = self.connections.lock().await;
        if let Some(peers) = connections.get_mut(&booking_id) {
            peers.remove(&conn_id);
            if peers.is_empty() {
                connections.remove(&booking_id);
            }
        }
    }

    pub async fn broadcast(&self, booking_id: Uuid, event: ChatEvent) -> usize {
        let mut connections = self.connections.lock().await;
        let Some(peers) = connections.get_mut(&booking_id) else {
            return 0;
        };
        let mut delivered = 0;
        let mut dead = Vec::new();
        for (conn_id, tx) in peers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {}
                Err(mpsc::error::TrySendError::Closed(_)) => dead.push(*conn_id),
            }
        }
        for conn_id in dead {
            peers.remove(&conn_id);
        }
        delivered
    }
}

impl Default for ChatHub {
    fn default() -> Self {
        Self::new()
    }
}

#[actix_web::get("/api/messages/{booking_id}")]
pub async fn get_messages(
    req: HttpRequest,
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, ServiceError> {
    let uid = current_user_id(&req, &data.config.jwt_secret)?;
    let mut conn = get_conn(&data.conn)?;
    let booking = crate::booking::load_booking(&mut conn, path.into_inner())?;
    booking.party_of(uid).ok_or_else(|| {
        ServiceError::NotAuthorized("not a party to this booking".to_string())
    })?;

    use crate::shared::models::schema::messages::dsl::*;
    let history = messages
        .filter(booking_id.eq(booking.id))
        .order(created_at.asc())
        .load::<ChatMessage>(&mut conn)?;
    Ok(HttpResponse::Ok().json(history))
}

fn append_message(pool: &DbPool, for_booking: Uuid, send: ChatSend) -> Result<ChatEvent, ServiceError> {
    let mut conn = get_conn(pool)?;

    let sender_name = {
        use crate::shared::models::schema::users::dsl::*;
        users
            .find(send.sender_id)
            .select(full_name)
            .first::<String>(&mut conn)
            .optional()?
            .unwrap_or_else(|| "Unknown".to_string())
    };

    let row = ChatMessage {
        id: Uuid::new_v4(),
        booking_id: for_booking,
        sender_id: send.sender_id,
        sender_name: sender_name.clone(),
        text: send.text.clone(),
        created_at: Utc::now(),
    };
    {
        use crate::shared::models::schema::messages::dsl::*;
        diesel::insert_into(messages).values(&row).execute(&mut conn)?;
    }

    Ok(ChatEvent {
        sender_id: row.sender_id,
        sender_name: row.sender_name,
        text: row.text,
        created_at: row.created_at,
    })
}

#[actix_web::get("/ws/chat/{booking_id}")]
pub async fn chat_socket(
    req: HttpRequest,
    stream: web::Payload,
    path: web::Path<Uuid>,
    data: web::Data<AppState>,
) -> Result<HttpResponse, actix_web::Error> {
    let booking_id = path.into_inner();
    let (res, mut session, mut msg_stream) = actix_ws::handle(&req, stream)?;

    let conn_id = Uuid::new_v4();
    let (tx, mut rx) = mpsc::channel::<ChatEvent>(100);
    data.chat_hub.add_connection(booking_id, conn_id, tx).await;
    info!(
        "chat connection {} opened for booking {}",
        conn_id, booking_id
    );

    actix_web::rt::spawn(async move {
        while let Some(event) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                if session.text(json).await.is_err() {
                    break;
                }
            }
        }
        debug!("chat sender terminated for connection {}", conn_id);
    });

    let hub = data.chat_hub.clone();
    let pool = data.conn.clone();
    actix_web::rt::spawn(async move {
        while let Some(Ok(msg)) = msg_stream.recv().await {
            match msg {
                WsMessage::Text(text) => {
                    let send: ChatSend = match serde_json::from_str(&text) {
                        Ok(value) => value,
                        Err(e) => {
                            error!("dropping malformed chat frame: {}", e);
                            continue;
                        }
                    };
                    match append_message(&pool, booking_id, send) {
                        Ok(event) => {
                            hub.broadcast(booking_id, event).await;
                        }
                        Err(e) => error!("failed to append chat message: {}", e),
                    }
                }
                WsMessage::Close(reason) => {
                    debug!(
                        "chat connection {} closing for booking {} - reason: {:?}",
                        conn_id, booking_id, reason
                    );
                    break;
                }
                _ => {}
            }
        }
        hub.remove_connection(booking_id, conn_id).await;
        info!(
            "chat connection {} closed for booking {}",
            conn_id, booking_id
        );
    });

    Ok(res)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> ChatEvent {
        ChatEvent {
            sender_id: Uuid::new_v4(),
            sender_name: "Ada".to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_every_registered_peer() {
        let hub = ChatHub::new();
        let booking = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::channel(8);
        let (tx_b, mut rx_b) = mpsc::channel(8);
        hub.add_connection(booking, Uuid::new_v4(), tx_a).await;
        hub.add_connection(booking, Uuid::new_v4(), tx_b).await;

        assert_eq!(hub.broadcast(booking, event("hello")).await, 2);
        assert_eq!(rx_a.recv().await.unwrap().text, "hello");
        assert_eq!(rx_b.recv().await.unwrap().text, "hello");
    }

    #[tokio::test]
    async fn broadcast_is_scoped_to_the_booking() {
        let hub = ChatHub::new();
        let (tx, mut rx) = mpsc::channel(8);
        hub.add_connection(Uuid::new_v4(), Uuid::new_v4(), tx).await;

        assert_eq!(hub.broadcast(Uuid::new_v4(), event("elsewhere")).await, 0);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn disconnected_peer_misses_events_for_good() {
        let hub = ChatHub::new();
        let booking = Uuid::new_v4();
        let conn = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(8);
        hub.add_connection(booking, conn, tx).await;
        hub.remove_connection(booking, conn).await;

        // Three messages arrive while the peer is away; none are queued or
        // replayed for it. Recovery is the history backfill, not the channel.
        for text in ["one", "two", "three"] {
            assert_eq!(hub.broadcast(booking, event(text)).await, 0);
        }
        assert!(rx.try_recv().is_err());

        let (tx2, mut rx2) = mpsc::channel(8);
        hub.add_connection(booking, Uuid::new_v4(), tx2).await;
        assert_eq!(hub.broadcast(booking, event("four")).await, 1);
        assert_eq!(rx2.recv().await.unwrap().text, "four");
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn dead_peer_is_pruned_on_broadcast() {
        let hub = ChatHub::new();
        let booking = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(8);
        hub.add_connection(booking, Uuid::new_v4(), tx).await;
        drop(rx);

        assert_eq!(hub.broadcast(booking, event("lost")).await, 0);
        // Registry entry is gone entirely once its last peer died.
        assert!(hub.connections.lock().await.get(&booking).is_none());
    }
}
