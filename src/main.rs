#[cfg(feature = "jemalloc")]
use tikv_jemallocator::Jemalloc;
#[cfg(feature = "jemalloc")]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[cfg(feature = "jemalloc")]
fn jemalloc_purge() {
    use tikv_jemalloc_ctl::epoch;
    // Advancing the epoch causes jemalloc to evaluate all decay windows
    // and release dirty pages back to the OS via its background purge logic.
    if let Ok(e) = epoch::mib() {
        let _ = e.advance();
    }
    log::debug!("jemalloc: epoch advanced — dirty pages scheduled for release");
}

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Timelike;
use tokio::sync::Semaphore;

use ob_trader::bybit_api::BybitClient;
use ob_trader::config::{
    symbol_params, tick_decimals, ACCOUNT_CAPITAL, EQUITY_FLOOR_PCT, KLINE_INTERVAL,
    MAX_DAILY_LOSS_PCT, MAX_OPEN_POSITIONS, TRADING_PAIRS, USE_ALL_PAIRS, WARMUP_BARS,
};
use ob_trader::engine::{EngineEvent, ObEngine, TradeState, Transition};
use ob_trader::position_manager;
use ob_trader::regime::InMemoryRegimeCache;
use ob_trader::risk::RiskState;
use ob_trader::telegram::TelegramBot;
use ob_trader::types::{Candle, Trade};
use ob_trader::websocket_handler;

/// Account-level bookkeeping for the live loop. Streak state lives in
/// RiskState; this tracks the daily guard rails.
struct AccountStatus {
    account_balance: f64,
    current_equity: f64,
    daily_pnl: f64,
    max_daily_loss: f64,
    trading_enabled: bool,
    trades_today: u32,
    wins_today: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let tg = TelegramBot::new();
    let bybit = BybitClient::new();

    // ── Determine trading pairs ───────────────────────────────────────────────
    let trading_pairs: Vec<String> = if USE_ALL_PAIRS {
        match bybit.fetch_linear_symbols().await {
            Ok(pairs) => {
                log::info!("Fetched {} USDT linear symbols from Bybit", pairs.len());
                pairs
            }
            Err(e) => {
                log::warn!("fetch_linear_symbols failed: {} — falling back to default pairs", e);
                TRADING_PAIRS.iter().map(|s| s.to_string()).collect()
            }
        }
    } else {
        TRADING_PAIRS.iter().map(|s| s.to_string()).collect()
    };
    let pair_refs: Vec<&str> = trading_pairs.iter().map(|s| s.as_str()).collect();

    let mut status = AccountStatus {
        account_balance: ACCOUNT_CAPITAL,
        current_equity: ACCOUNT_CAPITAL,
        daily_pnl: 0.0,
        max_daily_loss: ACCOUNT_CAPITAL * MAX_DAILY_LOSS_PCT,
        trading_enabled: true,
        trades_today: 0,
        wins_today: 0,
    };

    // Streak/sizing state is pooled across all symbols; this loop is its
    // single writer.
    let mut risk = RiskState::new();

    // ── One engine per symbol, shared regime cache ────────────────────────────
    let regime_cache = Arc::new(InMemoryRegimeCache::new());
    let mut engines: HashMap<String, ObEngine> = trading_pairs
        .iter()
        .map(|s| {
            (s.clone(), ObEngine::new(s, symbol_params(s), regime_cache.clone()))
        })
        .collect();
    let mut last_processed: HashMap<String, i64> = HashMap::new();

    // ── WebSocket: single connection, all symbols, closed candles only ────────
    let ws_client = websocket_handler::BybitWsClient::new(&pair_refs);
    let candle_map = ws_client.candle_map.clone();
    tokio::spawn(async move {
        websocket_handler::reconnect_with_backoff(&ws_client, 20, 5)
            .await
            .unwrap_or_else(|e| log::error!("WebSocket failed permanently: {}", e));
    });

    // ── Orphan check: the engine starts flat, so exchange positions opened
    // outside the bot stay unmanaged ────────────────────────────────────────
    match bybit.get_all_open_positions().await {
        Ok(open) if !open.is_empty() => {
            for (sym, info) in &open {
                log::warn!(
                    "[{}] Unmanaged exchange position: {} size={:.4} @ {:.4} — close it or restart flat",
                    sym, info.side, info.size, info.avg_price
                );
            }
            tg.notify_risk_alert(&format!(
                "{} unmanaged exchange position(s) found at startup; the engine starts flat.",
                open.len()
            ))
            .await;
        }
        Ok(_) => log::info!("No open exchange positions at startup."),
        Err(e) => log::warn!("Startup position check failed: {}", e),
    }

    // ── Warm-up history via REST, in parallel with a request cap ──────────────
    let sem = Arc::new(Semaphore::new(10));
    log::info!(
        "Pre-loading {} candles × {} symbols via REST…",
        WARMUP_BARS,
        trading_pairs.len()
    );
    let prefetch_handles: Vec<_> = trading_pairs
        .iter()
        .map(|symbol| {
            let sem = sem.clone();
            let bybit = bybit.clone();
            let symbol = symbol.clone();
            tokio::spawn(async move {
                let _permit = sem.acquire().await.unwrap();
                match bybit.fetch_klines(&symbol, KLINE_INTERVAL, WARMUP_BARS).await {
                    Ok(candles) => Some((symbol, candles)),
                    Err(e) => {
                        log::warn!("[{}] prefetch failed: {}", symbol, e);
                        None
                    }
                }
            })
        })
        .collect();

    for h in prefetch_handles {
        let Ok(Some((symbol, mut candles))) = h.await else { continue; };
        // The newest row may still be in progress; the engine only ever sees
        // closed candles.
        candles.pop();
        let count = candles.len();
        if let Some(engine) = engines.get_mut(&symbol) {
            for c in candles {
                last_processed.insert(symbol.clone(), c.timestamp);
                engine.step(c, &mut risk, status.account_balance);
            }
        }
        log::info!("[{}] warm-up complete: {} candles", symbol, count);
    }

    tg.send(&format!(
        "🤖 <b>OB Trader started</b>\nPairs: {} | TF: {}m | Capital: ${:.0}",
        trading_pairs.join(", "),
        KLINE_INTERVAL,
        ACCOUNT_CAPITAL
    ))
    .await;
    log::info!("OB Trader started — {} pairs", trading_pairs.len());

    // ── Main loop ─────────────────────────────────────────────────────────────
    let status_interval = Duration::from_secs(5 * 60);
    let mut last_status_ts = Instant::now()
        .checked_sub(status_interval)
        .unwrap_or_else(Instant::now);
    let mut status_lines: Vec<String> = Vec::new();

    loop {
        // Snapshot closed candles for all symbols under a single lock
        let all_candles: HashMap<String, Vec<Candle>> = {
            let map = candle_map.lock().unwrap();
            map.iter()
                .map(|(sym, buf)| (sym.clone(), buf.iter().cloned().collect()))
                .collect()
        };

        status_lines.clear();

        for symbol in &trading_pairs {
            let since = last_processed.get(symbol).copied().unwrap_or(0);
            let fresh: Vec<Candle> = all_candles
                .get(symbol)
                .map(|cs| cs.iter().filter(|c| c.timestamp > since).cloned().collect())
                .unwrap_or_default();

            for candle in fresh {
                last_processed.insert(symbol.clone(), candle.timestamp);

                // Positions open across the whole account, for the entry cap.
                // This symbol is at most LIMIT_PENDING while deciding an entry.
                let open_positions = engines
                    .values()
                    .filter(|e| matches!(e.state(), TradeState::Open(_)))
                    .count();

                let Some(engine) = engines.get_mut(symbol) else { break; };
                engine.push_candle(candle);
                let transition = engine.decide(&risk, status.account_balance);

                let allow_entry = status.trading_enabled && open_positions < MAX_OPEN_POSITIONS;
                match confirm_exchange_side(&bybit, &tg, symbol, &transition, allow_entry).await {
                    Ok(()) => {
                        let events = engine.apply(transition, &mut risk);
                        for event in &events {
                            log_event(symbol, event);
                            settle_event(&mut status, event);
                        }
                        notify_events(&tg, symbol, &events).await;
                    }
                    Err(e) => {
                        // Engine state untouched: the same decision is
                        // re-derived from the next candle.
                        log::error!("[{}] exchange confirmation failed: {} — deferring", symbol, e);
                        tg.notify_risk_alert(&format!("[{}] order failed: {}", symbol, e)).await;
                    }
                }
            }

            if let Some(engine) = engines.get(symbol) {
                if let Some(c) = engine.last_candle() {
                    status_lines.push(format!(
                        "<b>{symbol}</b> | <code>{:.4}</code> | {}",
                        c.close,
                        engine.state().name()
                    ));
                }
            }
        }

        // ── Status report every 5 minutes ────────────────────────────────────
        if last_status_ts.elapsed() >= status_interval && !status_lines.is_empty() {
            tg.notify_status(
                &status_lines,
                status.current_equity,
                status.daily_pnl,
                status.trades_today,
                status.trading_enabled,
            )
            .await;
            last_status_ts = Instant::now();

            // Release unused memory pages back to the OS
            #[cfg(feature = "jemalloc")]
            jemalloc_purge();
        }

        // ── Daily reset at UTC midnight ───────────────────────────────────────
        if is_daily_reset_time() {
            tg.notify_daily_summary(
                status.daily_pnl,
                status.trades_today,
                status.wins_today,
                status.current_equity,
            )
            .await;
            log::info!(
                "Daily reset | PnL: {:.2} | Trades: {} | Wins: {}",
                status.daily_pnl, status.trades_today, status.wins_today
            );
            status.daily_pnl = 0.0;
            status.trades_today = 0;
            status.wins_today = 0;
            status.trading_enabled =
                status.current_equity >= status.account_balance * EQUITY_FLOOR_PCT;
        }

        // Disable trading if daily drawdown limit reached
        if status.daily_pnl < -status.max_daily_loss && status.trading_enabled {
            status.trading_enabled = false;
            tg.notify_risk_alert(
                "Daily drawdown limit reached. Trading halted for today across all pairs.",
            )
            .await;
            log::warn!("Daily drawdown limit reached. Trading disabled.");
        }

        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Mirror the transition's entry/exit decisions on the exchange. The caller
/// only applies the transition once every exchange action is confirmed, so a
/// failed submission is retried off the next candle instead of producing an
/// unconfirmed Trade record.
async fn confirm_exchange_side(
    bybit: &BybitClient,
    tg: &TelegramBot,
    symbol: &str,
    transition: &Transition,
    allow_entry: bool,
) -> Result<(), String> {
    let p = symbol_params(symbol);
    let decimals = tick_decimals(p.tick_size);

    for event in &transition.events {
        match event {
            EngineEvent::PositionOpened { position } => {
                if !allow_entry {
                    return Err("entries blocked (position cap or daily guard)".to_string());
                }
                position_manager::validate_entry(position)?;
                let qty = round_to_step(position.qty, p.qty_step);
                if qty <= 0.0 {
                    return Err("qty rounds to zero at exchange lot step".to_string());
                }
                let link = format!("{}-{}-entry", symbol, position.entry_bar);
                bybit
                    .place_order(
                        symbol,
                        position.direction.order_side(),
                        qty,
                        position.stop_loss,
                        position.take_profit_2,
                        decimals,
                        &link,
                    )
                    .await
                    .map_err(|e| e.to_string())?;
                tg.notify_trade_open(
                    symbol,
                    position.direction.order_side(),
                    qty,
                    position.entry,
                    position.stop_loss,
                    position.take_profit_1,
                    position.take_profit_2,
                )
                .await;
            }
            EngineEvent::PartialExit { trade } => {
                let qty = round_to_step(trade.size, p.qty_step);
                if qty > 0.0 {
                    let link = format!("{}-{}-tp1", symbol, trade.exit_time);
                    bybit
                        .close_position(symbol, trade.direction.order_side(), qty, &link)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
            EngineEvent::PositionClosed { trade } => {
                let qty = round_to_step(trade.size, p.qty_step);
                if qty > 0.0 {
                    let link = format!("{}-{}-exit", symbol, trade.exit_time);
                    bybit
                        .close_position(symbol, trade.direction.order_side(), qty, &link)
                        .await
                        .map_err(|e| e.to_string())?;
                }
            }
            _ => {}
        }
    }
    Ok(())
}

/// Round a quantity DOWN to the exchange's lot step (e.g. 0.001 BTC).
fn round_to_step(qty: f64, step: f64) -> f64 {
    if step <= 0.0 { return qty; }
    (qty / step).floor() * step
}

fn settle_event(status: &mut AccountStatus, event: &EngineEvent) {
    match event {
        EngineEvent::PositionOpened { .. } => {
            status.trades_today += 1;
        }
        EngineEvent::PartialExit { trade } | EngineEvent::PositionClosed { trade } => {
            apply_trade(status, trade);
        }
        _ => {}
    }
}

fn apply_trade(status: &mut AccountStatus, trade: &Trade) {
    status.account_balance += trade.pnl;
    status.current_equity = status.account_balance;
    status.daily_pnl += trade.pnl;
    if trade.pnl > 0.0 {
        status.wins_today += 1;
    }
}

fn log_event(symbol: &str, event: &EngineEvent) {
    match event {
        EngineEvent::ObDetected { direction, top, bottom, volume_ratio } => log::info!(
            "[{}] OB detected {} [{:.4}–{:.4}] vol×{:.2}",
            symbol, direction.as_str(), bottom, top, volume_ratio
        ),
        EngineEvent::ObRejected { direction, reason } => {
            log::info!("[{}] OB rejected ({}): {}", symbol, direction.as_str(), reason)
        }
        EngineEvent::ObReplaced { old_volume_ratio, new_volume_ratio } => log::info!(
            "[{}] OB replaced: vol×{:.2} → vol×{:.2}",
            symbol, old_volume_ratio, new_volume_ratio
        ),
        EngineEvent::ObInvalidated { reason } => {
            log::info!("[{}] OB invalidated: {}", symbol, reason)
        }
        EngineEvent::ObMovedAway { direction, threshold } => log::info!(
            "[{}] price moved away {} (beyond {:.4})",
            symbol, direction.as_str(), threshold
        ),
        EngineEvent::LimitPlaced { direction, price } => {
            log::info!("[{}] limit pending {} @ {:.4}", symbol, direction.as_str(), price)
        }
        EngineEvent::LimitCancelled { kind, reason } => {
            log::info!("[{}] limit cancelled ({:?}): {}", symbol, kind, reason)
        }
        EngineEvent::FillDeferred { reason } => {
            log::debug!("[{}] fill deferred: {}", symbol, reason)
        }
        EngineEvent::PositionOpened { position } => log::info!(
            "[{}] {} entry={:.4} sl={:.4} tp1={:.4} tp2={:.4} qty={:.4}",
            symbol,
            position.direction.as_str(),
            position.entry,
            position.stop_loss,
            position.take_profit_1,
            position.take_profit_2,
            position.qty
        ),
        EngineEvent::PartialExit { trade } => log::info!(
            "[{}] TP1 partial exit @ {:.4} pnl={:+.2}",
            symbol, trade.exit, trade.pnl
        ),
        EngineEvent::PositionClosed { trade } => log::info!(
            "[{}] closed @ {:.4} ({}) pnl={:+.2}",
            symbol, trade.exit, trade.reason.as_str(), trade.pnl
        ),
    }
}

async fn notify_events(tg: &TelegramBot, symbol: &str, events: &[EngineEvent]) {
    for event in events {
        match event {
            EngineEvent::PartialExit { trade } => tg.notify_partial_exit(symbol, trade).await,
            EngineEvent::PositionClosed { trade } => tg.notify_trade_close(symbol, trade).await,
            _ => {}
        }
    }
}

fn is_daily_reset_time() -> bool {
    let now = chrono::Utc::now();
    now.hour() == 0 && now.minute() == 0
}
