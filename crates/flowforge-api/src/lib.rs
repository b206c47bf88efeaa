pub mod api;
pub mod background;
pub mod config;
pub mod metrics;
pub mod server;
pub mod state;

pub use config::{ApiArgs, ApiConfig};
pub use metrics::ApiMetrics;
pub use state::AppState;
