pub mod auth;
pub mod conversations;
pub mod error;
pub mod messages;
pub mod middleware;
pub mod moderation;
pub mod routes;
pub mod service;
pub mod users;

pub use routes::{AppState, router};
pub use service::Messenger;
