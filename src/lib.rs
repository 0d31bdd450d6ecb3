pub mod auth;
pub mod booking;
pub mod chat;
pub mod config;
pub mod negotiation;
pub mod notify;
pub mod payments;
pub mod shared;
