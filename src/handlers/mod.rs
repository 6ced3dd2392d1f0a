mod activity;
mod chat;
mod control;
mod health;
mod heartbeat;
mod metrics;

pub use activity::activity_check_handler;
pub use chat::chat_handler;
pub use control::{control_action_handler, control_body_handler, control_status_handler};
pub use health::health_handler;
pub use heartbeat::heartbeat_handler;
pub use metrics::metrics_handler;
