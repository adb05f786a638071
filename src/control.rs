/// control.rs – Kill-switch orchestration and per-strategy pause flags.
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::exchange::ExchangeClient;
use crate::models::StrategyId;
use crate::notifier::{ControlCommand, Notifier};
use crate::risk::KillSwitch;

/// Per-strategy pause switches, toggled from chat and consulted by each
/// strategy loop before every tick.
#[derive(Clone)]
pub struct PauseFlags(Arc<HashMap<StrategyId, AtomicBool>>);

impl Default for PauseFlags {
    fn default() -> Self {
        Self::new()
    }
}

impl PauseFlags {
    pub fn new() -> Self {
        let map = StrategyId::ALL
            .iter()
            .map(|s| (*s, AtomicBool::new(false)))
            .collect();
        Self(Arc::new(map))
    }

    pub fn is_paused(&self, strategy: StrategyId) -> bool {
        self.0
            .get(&strategy)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }

    pub fn set_paused(&self, strategy: StrategyId, paused: bool) {
        if let Some(flag) = self.0.get(&strategy) {
            flag.store(paused, Ordering::Relaxed);
        }
    }
}

/// Execute the kill sequence: persist the switch, cancel every open order,
/// alert. Queued entry signals drain through the order manager's fast
/// discard path the moment the flag is on. Each step is idempotent; only
/// the first activation runs the side effects.
pub async fn activate_kill(
    kill: &KillSwitch,
    exchange: &ExchangeClient,
    notifier: &Notifier,
    reason: &str,
) {
    let first = match kill.activate(reason) {
        Ok(first) => first,
        Err(e) => {
            // Persistence failed but the in-memory flag is set; trading is
            // halted either way.
            error!("kill switch persist failed: {e:#}");
            true
        }
    };
    if !first {
        info!("kill switch already active");
        return;
    }

    if let Err(e) = exchange.cancel_all().await {
        error!("cancel_all during kill failed: {e:#}");
    }
    notifier
        .alert_critical(&format!("Trading halted: {reason}"))
        .await;
}

/// Dispatch operator commands from chat (and any other control producer).
pub async fn run_control_loop(
    mut control_rx: mpsc::Receiver<ControlCommand>,
    kill: Arc<KillSwitch>,
    exchange: Arc<ExchangeClient>,
    notifier: Arc<Notifier>,
    pause: PauseFlags,
) {
    while let Some(command) = control_rx.recv().await {
        match command {
            ControlCommand::Kill { reason } => {
                warn!(reason, "kill command received");
                activate_kill(&kill, &exchange, &notifier, &reason).await;
            }
            ControlCommand::Pause(strategy) => {
                pause.set_paused(strategy, true);
                info!(%strategy, "strategy paused");
            }
            ControlCommand::Resume(strategy) => {
                pause.set_paused(strategy, false);
                info!(%strategy, "strategy resumed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_flags_toggle_independently() {
        let flags = PauseFlags::new();
        assert!(!flags.is_paused(StrategyId::CopyTrader));

        flags.set_paused(StrategyId::CopyTrader, true);
        assert!(flags.is_paused(StrategyId::CopyTrader));
        assert!(!flags.is_paused(StrategyId::ArbScanner));

        flags.set_paused(StrategyId::CopyTrader, false);
        assert!(!flags.is_paused(StrategyId::CopyTrader));
    }
}
