use teloxide::prelude::*;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::warn;

use common::TradeEvent;

/// Send a proactive alert to all configured chat IDs.
pub async fn send_alert(bot: &Bot, chat_ids: &[ChatId], message: &str) {
    for &chat_id in chat_ids {
        if let Err(e) = bot.send_message(chat_id, message).await {
            warn!(chat_id = ?chat_id, error = %e, "Failed to send Telegram alert");
        }
    }
}

/// Forward trade events as chat alerts until the event channel closes.
pub async fn forward_events(bot: Bot, chat_ids: Vec<ChatId>, mut events: broadcast::Receiver<TradeEvent>) {
    loop {
        match events.recv().await {
            Ok(event) => send_alert(&bot, &chat_ids, &format_event(&event)).await,
            Err(RecvError::Lagged(missed)) => {
                warn!(missed, "Alert forwarder lagging, events dropped");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

pub fn format_event(event: &TradeEvent) -> String {
    match event {
        TradeEvent::PositionOpened { symbol, side, price, quantity, stop_loss, take_profit } => format!(
            "Opened {side} {symbol}\nQty {quantity} @ {price:.4}\nSL {stop_loss:.4} | TP {take_profit:.4}"
        ),
        TradeEvent::PositionClosed { symbol, side, price, pnl, reason } => {
            format!("Closed {side} {symbol} @ {price:.4} ({reason})\nPnL {pnl:+.2}")
        }
        TradeEvent::PositionAdopted { symbol, side, quantity } => {
            format!("Adopted {side} {symbol} qty {quantity} found on the venue")
        }
        TradeEvent::OrderFailed { symbol, error } => format!("Order failed on {symbol}: {error}"),
        TradeEvent::Unprotected { symbol, error } => {
            format!("No stop levels for {symbol}, engine exits disabled: {error}")
        }
        TradeEvent::CycleFailed { error } => format!("Cycle aborted: {error}"),
    }
}
