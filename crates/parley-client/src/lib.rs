pub mod backend;
pub mod error;
pub mod gateway;
pub mod retry;
pub mod session;

pub use backend::{Backend, HttpBackend, MessageQuery};
pub use error::{ClientError, ClientResult};
pub use gateway::{GatewayEvents, GatewayHandle, Subscriptions};
pub use session::{Applied, PendingMessage, Session, SessionState};
