pub mod alerts;
pub mod commands;

pub use alerts::{format_event, forward_events, send_alert};
pub use commands::{start_bot, BotDeps, Command};
