use crate::chat::ChatHub;
use crate::config::AppConfig;
use crate::payments::PaystackClient;
use crate::shared::utils::DbPool;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub conn: DbPool,
    pub config: AppConfig,
    pub chat_hub: Arc<ChatHub>,
    pub paystack: PaystackClient,
}

impl AppState {
    pub fn new(conn: DbPool, config: AppConfig) -> Self {
        let paystack = PaystackClient::new(
            config.paystack.secret_key.clone(),
            config.paystack.base_url.clone(),
        );
        Self {
            conn,
            config,
            chat_hub: Arc::new(ChatHub::new()),
            paystack,
        }
    }
}
