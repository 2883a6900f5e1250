pub mod app;
pub mod client;
pub mod error;
pub mod handlers;
pub mod pipeline;
pub mod state;

pub use app::build_app;
pub use client::HttpPeerClient;
pub use error::ApiError;
pub use pipeline::{handle_with_session, SessionLayerOptions, DEFAULT_TOKEN_HEADER};
pub use state::{AppHandler, AppState};
