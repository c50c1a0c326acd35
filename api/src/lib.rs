//! HTTP control surface for the ringkeeper membership registry.
//!
//! Nodes register themselves with `POST /v1/instances` while bootstrapping;
//! operators and peers read membership back as one `key=value` line per node.

pub mod api;
pub mod state;

pub use api::error::{ApiError, ApiResult};
pub use api::http::app_routes;
pub use state::AppState;
