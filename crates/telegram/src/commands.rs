use std::sync::Arc;

use teloxide::{
    dispatching::UpdateHandler,
    prelude::*,
    utils::command::BotCommands,
};
use tracing::{info, warn};

use common::{EngineCommand, EngineState, Position, TradingMode};
use engine::EngineHandle;

type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Dependencies injected into every handler via `dptree`.
#[derive(Clone)]
pub struct BotDeps {
    pub engine: EngineHandle,
    pub trading_mode: TradingMode,
    pub allowed_user_ids: Arc<Vec<i64>>,
}

/// Telegram bot commands exposed to the operator.
#[derive(BotCommands, Clone, Debug, PartialEq)]
#[command(rename_rule = "lowercase", description = "Supertrend bot commands:")]
pub enum Command {
    #[command(description = "Show this help")]
    Help,
    #[command(description = "Show engine state and the last cycle")]
    Status,
    #[command(description = "List open positions")]
    Positions,
    #[command(description = "Skip cycles until resumed")]
    Pause,
    #[command(description = "Resume the polling loop")]
    Resume,
    #[command(description = "Run one cycle now")]
    RunNow,
}

/// Start the Telegram bot in long-polling mode.
pub async fn start_bot(bot: Bot, deps: BotDeps) {
    let deps = Arc::new(deps);

    info!("Telegram bot starting (long-polling)");

    Dispatcher::builder(bot, schema())
        .dependencies(dptree::deps![deps])
        .build()
        .dispatch()
        .await;
}

fn schema() -> UpdateHandler<Box<dyn std::error::Error + Send + Sync>> {
    use dptree::case;

    let command_handler = teloxide::filter_command::<Command, _>()
        .branch(case![Command::Help].endpoint(handle_help))
        .branch(case![Command::Status].endpoint(handle_status))
        .branch(case![Command::Positions].endpoint(handle_positions))
        .branch(case![Command::Pause].endpoint(handle_pause))
        .branch(case![Command::Resume].endpoint(handle_resume))
        .branch(case![Command::RunNow].endpoint(handle_run_now));

    Update::filter_message()
        .filter_map(|msg: Message| msg.from().map(|u| u.id))
        .filter_async(auth_filter)
        .branch(command_handler)
}

/// Silently drop messages from users not in the allowed list.
async fn auth_filter(user_id: UserId, deps: Arc<BotDeps>) -> bool {
    let uid = user_id.0 as i64;
    let allowed = deps.allowed_user_ids.contains(&uid);
    if !allowed {
        warn!(user_id = uid, "Unauthorized Telegram access attempt");
    }
    allowed
}

async fn handle_help(bot: Bot, msg: Message) -> HandlerResult {
    bot.send_message(msg.chat.id, Command::descriptions().to_string()).await?;
    Ok(())
}

async fn handle_status(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let state = deps.engine.state().await;
    let open = deps.engine.positions().await.len();
    let last = match deps.engine.last_cycle().await {
        Some(report) => format!(
            "{} ({} evaluated, {} skipped)",
            report.finished_at.format("%Y-%m-%d %H:%M:%S UTC"),
            report.steps.len(),
            report.skipped.len()
        ),
        None => "none yet".to_string(),
    };
    let text = format!(
        "Supertrend Bot Status\n\
         Engine: {state}\n\
         Mode: {mode}\n\
         Open positions: {open}\n\
         Last cycle: {last}",
        mode = deps.trading_mode
    );
    bot.send_message(msg.chat.id, text).await?;
    Ok(())
}

async fn handle_positions(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    let positions = deps.engine.positions().await;
    bot.send_message(msg.chat.id, format_positions(&positions)).await?;
    Ok(())
}

async fn handle_pause(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    if deps.engine.state().await == EngineState::Paused {
        bot.send_message(msg.chat.id, "Engine is already paused.").await?;
    } else {
        deps.engine.send(EngineCommand::Pause).await;
        bot.send_message(msg.chat.id, "Engine paused. Open positions stay on the venue.").await?;
    }
    Ok(())
}

async fn handle_resume(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    if deps.engine.state().await != EngineState::Paused {
        bot.send_message(msg.chat.id, "Engine is not paused.").await?;
    } else {
        deps.engine.send(EngineCommand::Resume).await;
        bot.send_message(msg.chat.id, "Engine resumed.").await?;
    }
    Ok(())
}

async fn handle_run_now(bot: Bot, msg: Message, deps: Arc<BotDeps>) -> HandlerResult {
    if deps.engine.state().await == EngineState::Paused {
        bot.send_message(msg.chat.id, "Engine is paused. /resume first.").await?;
    } else {
        deps.engine.send(EngineCommand::RunNow).await;
        bot.send_message(msg.chat.id, "Cycle requested.").await?;
    }
    Ok(())
}

/// One line per open position.
pub fn format_positions(positions: &[Position]) -> String {
    if positions.is_empty() {
        return "No open positions.".to_string();
    }
    positions
        .iter()
        .map(|p| {
            if p.levels_pending {
                format!(
                    "{} {} {} @ {:.4} (adopted, levels pending)",
                    p.symbol, p.side, p.quantity, p.entry_price
                )
            } else {
                format!(
                    "{} {} {} @ {:.4} | SL {:.4} | TSL {:.4} | TP {:.4}",
                    p.symbol, p.side, p.quantity, p.entry_price, p.stop_loss, p.trailing_stop, p.take_profit
                )
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}
