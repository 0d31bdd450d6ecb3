use actix_cors::Cors;
use actix_web::middleware::Logger;
use actix_web::{web, App, HttpServer};
use dotenvy::dotenv;
use log::{error, info};

use marketserver::config::AppConfig;
use marketserver::shared::state::AppState;
use marketserver::shared::utils::create_conn;
use marketserver::{booking, chat, negotiation, payments};

#[tokio::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .write_style(env_logger::WriteStyle::Always)
        .init();

    let config = AppConfig::from_env().expect("Failed to load config from env");
    let pool = match create_conn() {
        Ok(pool) => pool,
        Err(e) => {
            error!("Failed to create database pool: {}", e);
            return Err(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("Database pool creation failed: {}", e),
            ));
        }
    };

    let app_state = AppState::new(pool, config.clone());

    info!(
        "Starting HTTP server on {}:{}",
        config.server.host, config.server.port
    );
    let worker_count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4);

    HttpServer::new(move || {
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);
        App::new()
            .wrap(cors)
            .wrap(Logger::default())
            .app_data(web::Data::new(app_state.clone()))
            .service(booking::create_booking)
            .service(booking::list_bookings)
            .service(booking::get_booking)
            .service(booking::update_booking_status)
            .service(negotiation::propose_offer)
            .service(negotiation::list_offers)
            .service(negotiation::respond_offer)
            .service(chat::get_messages)
            .service(chat::chat_socket)
            .service(payments::initialize_payment)
            .service(payments::verify_payment)
    })
    .workers(worker_count)
    .bind((config.server.host.clone(), config.server.port))?
    .run()
    .await
}
