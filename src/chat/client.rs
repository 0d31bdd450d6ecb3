use crate::chat::{ChatEvent, ChatSend};
use crate::shared::error::ServiceError;
use crate::shared::models::{Booking, ChatMessage, PriceOffer};
use futures_util::{SinkExt, StreamExt};
use log::warn;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

/// Fixed delay between reconnection attempts while a conversation view is
/// active.
pub const RECONNECT_DELAY: Duration = Duration::from_secs(3);

/// Lifecycle of the live channel as seen by the owning view.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(ChatEvent),
    Error(String),
    Closed,
}

/// Consumer of one booking's conversation: history backfill and
/// booking/offer reconciliation over REST, live chat over the channel.
///
/// Mutations are not trusted until the server answers; every mutating call
/// is followed by an authoritative re-read of booking + offers.
#[derive(Debug, Clone)]
pub struct ConversationClient {
    http: reqwest::Client,
    base_url: String,
    ws_url: String,
    booking_id: Uuid,
    token: String,
}

impl ConversationClient {
    pub fn new(base_url: &str, ws_url: &str, booking_id: Uuid, token: &str) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            ws_url: ws_url.trim_end_matches('/').to_string(),
            booking_id,
            token: token.to_string(),
        }
    }

    /// Full chat history. Also the only way to recover messages that were
    /// broadcast while the channel was down.
    pub async fn backfill(&self) -> Result<Vec<ChatMessage>, ServiceError> {
        self.get(&format!("{}/api/messages/{}", self.base_url, self.booking_id))
            .await
    }

    pub async fn fetch_booking(&self) -> Result<Booking, ServiceError> {
        self.get(&format!("{}/api/bookings/{}", self.base_url, self.booking_id))
            .await
    }

    pub async fn fetch_offers(&self) -> Result<Vec<PriceOffer>, ServiceError> {
        self.get(&format!(
            "{}/api/bookings/{}/offers",
            self.base_url, self.booking_id
        ))
        .await
    }

    /// Authoritative re-read of the negotiation state.
    pub async fn refresh(&self) -> Result<(Booking, Vec<PriceOffer>), ServiceError> {
        let booking = self.fetch_booking().await?;
        let offers = self.fetch_offers().await?;
        Ok((booking, offers))
    }

    pub async fn propose_offer(
        &self,
        price: f64,
        message: Option<&str>,
    ) -> Result<(Booking, Vec<PriceOffer>), ServiceError> {
        let url = format!("{}/api/bookings/{}/offers", self.base_url, self.booking_id);
        let body = serde_json::json!({ "offered_price": price, "message": message });
        let response = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        self.refresh().await
    }

    pub async fn respond_offer(
        &self,
        offer_id: Uuid,
        action: &str,
        counter_price: Option<f64>,
        message: Option<&str>,
    ) -> Result<(Booking, Vec<PriceOffer>), ServiceError> {
        let url = format!("{}/api/offers/{}/respond", self.base_url, offer_id);
        let body = serde_json::json!({
            "action": action,
            "counter_price": counter_price,
            "message": message,
        });
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await?;
        check_status(response).await?;
        self.refresh().await
    }

    pub async fn update_status(
        &self,
        target: &str,
    ) -> Result<(Booking, Vec<PriceOffer>), ServiceError> {
        let url = format!("{}/api/bookings/{}/status", self.base_url, self.booking_id);
        let response = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .json(&serde_json::json!({ "status": target }))
            .send()
            .await?;
        check_status(response).await?;
        self.refresh().await
    }

    /// Opens the live channel. The returned handle owns the connection task;
    /// closing or dropping it tears down the socket and any pending
    /// reconnect timer.
    pub fn open_channel(&self, events: mpsc::Sender<ChannelEvent>) -> ChannelHandle {
        let url = format!("{}/ws/chat/{}", self.ws_url, self.booking_id);
        let (out_tx, out_rx) = mpsc::channel::<ChatSend>(64);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(run_channel(url, out_rx, events, shutdown_rx));
        ChannelHandle {
            outbound: out_tx,
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    async fn get<T: DeserializeOwned>(&self, url: &str) -> Result<T, ServiceError> {
        let response = self.http.get(url).bearer_auth(&self.token).send().await?;
        let response = check_status(response).await?;
        Ok(response.json::<T>().await?)
    }
}

async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, ServiceError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let detail = response
        .json::<serde_json::Value>()
        .await
        .ok()
        .and_then(|v| v.get("detail").and_then(|d| d.as_str()).map(String::from))
        .unwrap_or_else(|| format!("HTTP {}", status));
    Err(match status.as_u16() {
        400 => ServiceError::Validation(detail),
        403 => ServiceError::NotAuthorized(detail),
        404 => ServiceError::NotFound("resource"),
        409 => ServiceError::InvalidTransition(detail),
        _ => ServiceError::Transport(detail),
    })
}

/// Handle to the channel task. `close` shuts it down gracefully; dropping
/// it without closing aborts the task outright so nothing outlives the view.
pub struct ChannelHandle {
    outbound: mpsc::Sender<ChatSend>,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub async fn send_text(&self, sender_id: Uuid, text: &str) -> Result<(), ServiceError> {
        self.outbound
            .send(ChatSend {
                sender_id,
                text: text.to_string(),
            })
            .await
            .map_err(|_| ServiceError::Transport("channel task has shut down".to_string()))
    }

    pub async fn close(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        self.shutdown.take();
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

async fn run_channel(
    url: String,
    mut outbound: mpsc::Receiver<ChatSend>,
    events: mpsc::Sender<ChannelEvent>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut outbound_open = true;
    loop {
        let connected = tokio::select! {
            _ = &mut shutdown => return,
            attempt = connect_async(url.as_str()) => attempt,
        };

        match connected {
            Ok((ws, _)) => {
                if events.send(ChannelEvent::Open).await.is_err() {
                    return;
                }
                let (mut sink, mut stream) = ws.split();
                loop {
                    tokio::select! {
                        _ = &mut shutdown => {
                            let _ = sink.send(Message::Close(None)).await;
                            return;
                        }
                        out = outbound.recv(), if outbound_open => match out {
                            Some(msg) => {
                                let json = match serde_json::to_string(&msg) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        warn!("dropping unserializable chat frame: {}", e);
                                        continue;
                                    }
                                };
                                if sink.send(Message::Text(json.into())).await.is_err() {
                                    let _ = events
                                        .send(ChannelEvent::Error("send failed".to_string()))
                                        .await;
                                    break;
                                }
                            }
                            None => outbound_open = false,
                        },
                        frame = stream.next() => match frame {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<ChatEvent>(text.as_str()) {
                                    Ok(event) => {
                                        if events.send(ChannelEvent::Message(event)).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(e) => warn!("dropping malformed chat event: {}", e),
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Ok(_)) => {}
                            Some(Err(e)) => {
                                let _ = events.send(ChannelEvent::Error(e.to_string())).await;
                                break;
                            }
                        },
                    }
                }
            }
            Err(e) => {
                if events.send(ChannelEvent::Error(e.to_string())).await.is_err() {
                    return;
                }
            }
        }

        if events.send(ChannelEvent::Closed).await.is_err() {
            return;
        }
        // Fixed-delay reconnect; cancellation wins over the timer.
        tokio::select! {
            _ = &mut shutdown => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
