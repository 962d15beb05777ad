//! HTTP 与 WebSocket 接入层

mod auth;
mod error;
mod routes;
mod state;
mod ws_connection;

pub use auth::{bearer_token, Claims, JwtService};
pub use config::JwtConfig;
pub use error::{ApiError, ErrorBody};
pub use routes::{router, router_with_cors, INTERNAL_TOKEN_HEADER};
pub use state::AppState;
