/// OB Backtester — lee data/*.csv, reproduce la estrategia vela a vela
/// con el mismo motor que usa el bot en vivo.
/// Run: cargo run --bin backtest --release
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

use ob_trader::config::{symbol_params, ACCOUNT_CAPITAL, KLINE_INTERVAL, TRADING_PAIRS};
use ob_trader::harness::{run_backtest, BacktestReport, BacktestSummary};
use ob_trader::types::{Candle, Trade};

// ── CSV loader ────────────────────────────────────────────────────────────────
// Expected columns: ts_ms,symbol,open,high,low,close,volume (header row skipped)
fn load_csv(path: &Path) -> Vec<Candle> {
    let mut out = Vec::with_capacity(9000);
    for (i, line) in BufReader::new(File::open(path).expect("CSV not found")).lines().enumerate() {
        let line = line.unwrap();
        if i == 0 { continue; }
        let f: Vec<&str> = line.split(',').collect();
        if f.len() < 7 { continue; }
        out.push(Candle {
            timestamp: f[0].parse().unwrap_or(0),
            open:      f[2].parse().unwrap_or(0.0),
            high:      f[3].parse().unwrap_or(0.0),
            low:       f[4].parse().unwrap_or(0.0),
            close:     f[5].parse().unwrap_or(0.0),
            volume:    f[6].parse().unwrap_or(0.0),
        });
    }
    out.sort_by_key(|c| c.timestamp);
    out.dedup_by_key(|c| c.timestamp);
    out
}

// ── Reporte por símbolo ───────────────────────────────────────────────────────
fn print_stats(symbol: &str, s: &BacktestSummary) {
    let verdict = if s.win_rate >= 55.0 && s.profit_factor >= 1.5 { "✅ APTO" }
                  else if s.win_rate >= 50.0 { "⚠️  MARGINAL" }
                  else { "❌ NO APTO" };
    println!();
    println!("  ┌─────────────────────────────────────────────┐");
    println!("  │  {:12}                    {}  │", symbol, verdict);
    println!("  ├─────────────────────────────────────────────┤");
    println!("  │  Trades         {:>6}   ({} W / {} L)", s.total_trades, s.wins, s.losses);
    println!("  │  Win Rate       {:>6.1}%", s.win_rate);
    println!("  │  Total PnL      {:>+9.2} USDT  ({:+.1}%)", s.total_pnl, s.total_return_pct);
    println!("  │  Avg Win        {:>+9.2} USDT", s.avg_win);
    println!("  │  Avg Loss       {:>+9.2} USDT", -s.avg_loss);
    println!("  │  Profit Factor  {:>9.2}", s.profit_factor);
    println!("  │  Max Drawdown   {:>6.1}%", s.max_drawdown_pct);
    println!("  │  Best Trade     {:>+9.2} USDT", s.best);
    println!("  │  Worst Trade    {:>+9.2} USDT", s.worst);
    println!("  └─────────────────────────────────────────────┘");
}

fn print_global(all_trades: &[Trade], symbols: usize) {
    let s = ob_trader::harness::compute_summary(all_trades, ACCOUNT_CAPITAL);
    let verdict = if s.win_rate >= 55.0 && s.profit_factor >= 1.5 { "✅ APTO PARA LIVE" }
                  else if s.win_rate >= 50.0 { "⚠️  REVISAR PARAMETROS" }
                  else { "❌ NO INICIAR LIVE" };
    println!();
    println!("  ╔══════════════════════════════════════════════════╗");
    println!("  ║  RESULTADO GLOBAL — {} PARES  {}  ║", symbols, verdict);
    println!("  ╠══════════════════════════════════════════════════╣");
    println!("  ║  Trades         {:>6}   ({} W / {} L)", s.total_trades, s.wins, s.losses);
    println!("  ║  Win Rate       {:>6.1}%", s.win_rate);
    println!("  ║  Total PnL      {:>+9.2} USDT  ({:+.1}%)", s.total_pnl, s.total_return_pct);
    println!("  ║  Profit Factor  {:>9.2}", s.profit_factor);
    println!("  ║  Max Drawdown   {:>6.1}%", s.max_drawdown_pct);
    println!("  ║  Best Trade     {:>+9.2} USDT", s.best);
    println!("  ║  Worst Trade    {:>+9.2} USDT", s.worst);
    println!("  ╚══════════════════════════════════════════════════╝");

    let mut reasons: HashMap<&str, (usize, f64)> = HashMap::new();
    for t in all_trades {
        let e = reasons.entry(t.reason.as_str()).or_insert((0, 0.0));
        e.0 += 1;
        e.1 += t.pnl;
    }
    println!();
    println!("  Salidas por tipo:");
    let mut rv: Vec<_> = reasons.iter().collect();
    rv.sort_by_key(|(k, _)| *k);
    for (r, (n, pnl)) in &rv {
        let pct = *n as f64 / s.total_trades as f64 * 100.0;
        println!("    {:<12}  {:>5} trades ({:>4.1}%)   {:>+9.2} USDT", r, n, pct, pnl);
    }
}

// ── Trade log CSV ─────────────────────────────────────────────────────────────
fn save_trades(reports: &[BacktestReport], path: &Path) {
    let mut f = File::create(path).expect("no se pudo crear trade log");
    writeln!(f, "symbol,side,entry_date,exit_date,entry,exit,qty,fees,pnl,pnl_pct,win,reason").unwrap();
    for report in reports {
        for t in &report.trades {
            writeln!(
                f,
                "{},{},{},{},{:.4},{:.4},{:.4},{:.4},{:.4},{:.4},{},{}",
                report.symbol, t.direction.as_str(),
                ms_to_date(t.entry_time), ms_to_date(t.exit_time),
                t.entry, t.exit, t.size, t.fees, t.pnl, t.pnl_pct,
                t.is_win, t.reason.as_str()
            )
            .unwrap();
        }
    }
}

fn ms_to_date(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ms.to_string())
}

// ── Main ──────────────────────────────────────────────────────────────────────
fn main() {
    let data_dir = Path::new(env!("CARGO_MANIFEST_DIR")).join("data");

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║      OB BACKTESTER  —  velas {}M  —  retest ORB      ║", KLINE_INTERVAL);
    println!("║  Capital: ${}                                      ║", ACCOUNT_CAPITAL as u32);
    println!("╚═══════════════════════════════════════════════════════╝");

    let mut reports: Vec<BacktestReport> = Vec::new();

    for &symbol in TRADING_PAIRS {
        let csv = data_dir.join(format!("{}_{}M.csv", symbol, KLINE_INTERVAL));
        if !csv.exists() {
            eprintln!("  ⚠  No existe: {:?}", csv);
            continue;
        }

        print!("  {} … cargando", symbol);
        let candles = load_csv(&csv);
        println!(" {} velas  →  ejecutando …", candles.len());

        let report = run_backtest(symbol, &candles, symbol_params(symbol), ACCOUNT_CAPITAL);
        print_stats(symbol, &report.summary);
        println!("  Rechazos de OB: {}", report.rejections.len());
        reports.push(report);
    }

    let all_trades: Vec<Trade> = reports.iter().flat_map(|r| r.trades.iter().cloned()).collect();
    print_global(&all_trades, reports.len());

    let log = data_dir.join("backtest_trades.csv");
    save_trades(&reports, &log);
    println!("\n  📄 Trade log guardado: {:?}\n", log);
}
