use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use common::{EngineCommand, EngineState, Position, TradeEvent};

use crate::cycle::{CycleReport, Trader};

/// Cloneable handle passed to other crates (Telegram, API).
#[derive(Clone)]
pub struct EngineHandle {
    command_tx: mpsc::Sender<EngineCommand>,
    state: Arc<RwLock<EngineState>>,
    positions: Arc<RwLock<Vec<Position>>>,
    last_cycle: Arc<RwLock<Option<CycleReport>>>,
    events: broadcast::Sender<TradeEvent>,
}

impl EngineHandle {
    pub async fn send(&self, cmd: EngineCommand) {
        let _ = self.command_tx.send(cmd).await;
    }

    pub async fn state(&self) -> EngineState {
        *self.state.read().await
    }

    /// Open positions as of the last finished cycle.
    pub async fn positions(&self) -> Vec<Position> {
        self.positions.read().await.clone()
    }

    pub async fn last_cycle(&self) -> Option<CycleReport> {
        self.last_cycle.read().await.clone()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TradeEvent> {
        self.events.subscribe()
    }
}

/// Polling loop: runs one trading cycle per interval and handles operator
/// commands in between. Cycles never overlap.
pub struct Engine {
    trader: Arc<Mutex<Trader>>,
    interval: Duration,
    state: Arc<RwLock<EngineState>>,
    positions: Arc<RwLock<Vec<Position>>>,
    last_cycle: Arc<RwLock<Option<CycleReport>>>,
    events: broadcast::Sender<TradeEvent>,
    command_rx: mpsc::Receiver<EngineCommand>,
}

impl Engine {
    /// `events` must be the sender the trader was built with, so that handle
    /// subscribers see trade events.
    pub fn new(trader: Trader, interval: Duration, events: broadcast::Sender<TradeEvent>) -> (Self, EngineHandle) {
        let (command_tx, command_rx) = mpsc::channel(32);
        let state = Arc::new(RwLock::new(EngineState::Stopped));
        let positions = Arc::new(RwLock::new(trader.open_positions()));
        let last_cycle = Arc::new(RwLock::new(None));

        let handle = EngineHandle {
            command_tx,
            state: state.clone(),
            positions: positions.clone(),
            last_cycle: last_cycle.clone(),
            events: events.clone(),
        };

        let engine = Engine {
            trader: Arc::new(Mutex::new(trader)),
            interval,
            state,
            positions,
            last_cycle,
            events,
            command_rx,
        };

        (engine, handle)
    }

    /// Run until `Stop` arrives or every handle is dropped. Call from `tokio::spawn`.
    pub async fn run(mut self) {
        *self.state.write().await = EngineState::Running;
        info!(interval = ?self.interval, "Engine running");

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if *self.state.read().await == EngineState::Paused {
                        debug!("Engine paused, skipping cycle");
                        continue;
                    }
                    self.run_once().await;
                }
                cmd = self.command_rx.recv() => match cmd {
                    Some(EngineCommand::Pause) => {
                        let mut state = self.state.write().await;
                        if *state == EngineState::Running {
                            info!("Engine paused");
                            *state = EngineState::Paused;
                        }
                    }
                    Some(EngineCommand::Resume) => {
                        let mut state = self.state.write().await;
                        if *state == EngineState::Paused {
                            info!("Engine resumed");
                            *state = EngineState::Running;
                        }
                    }
                    Some(EngineCommand::RunNow) => {
                        if *self.state.read().await == EngineState::Paused {
                            info!("Manual cycle ignored while paused");
                        } else {
                            info!("Manual cycle requested");
                            self.run_once().await;
                        }
                    }
                    Some(EngineCommand::Stop) => {
                        info!("Engine stopping");
                        break;
                    }
                    None => {
                        warn!("Engine command channel closed, shutting down");
                        break;
                    }
                },
            }
        }

        *self.state.write().await = EngineState::Stopped;
    }

    /// Run a single cycle unless one is already in flight.
    async fn run_once(&self) {
        let Ok(mut trader) = self.trader.try_lock() else {
            warn!("Cycle already in progress, trigger ignored");
            return;
        };

        match trader.run_cycle().await {
            Ok(report) => {
                *self.last_cycle.write().await = Some(report);
            }
            Err(e) => {
                error!(error = %e, "Cycle aborted");
                let _ = self.events.send(TradeEvent::CycleFailed { error: e.to_string() });
            }
        }
        *self.positions.write().await = trader.open_positions();
    }
}
