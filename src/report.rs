//! `report.json` parsing (§4.C report parser): a fixed metric projection out
//! of dotted paths, tolerant of missing fields. Parse failure of the whole
//! document is the only thing that fails the pass — a missing individual
//! field just yields `None` for that metric.

use crate::model::Metrics;

/// Parse `report.json` bytes into the fixed metric projection.
///
/// Returns `Err` only when the bytes are not valid JSON at all, matching the
/// teacher's `GeminiParser`/`CodexParser` shape: a structurally invalid
/// document is a hard parse failure, but individual missing keys inside a
/// valid document are not.
pub fn parse_report(bytes: &[u8]) -> Result<Metrics, String> {
    let root: serde_json::Value =
        serde_json::from_slice(bytes).map_err(|e| format!("report.json parse failed: {e}"))?;

    let main = root.get("main");
    let trade_statistics = root.get("tradeStatistics");
    let equity = root.get("equity");

    let net_profit = dotted_f64(main, "netProfit")
        .or_else(|| dotted_f64(trade_statistics, "netProfit"));

    Ok(Metrics {
        net_profit,
        ending_equity: dotted_f64(main, "endingEquity"),
        ending_balance: dotted_f64(main, "endingBalance"),
        profit_factor: nested_f64(trade_statistics, "profitFactor", "all"),
        total_trades: nested_f64(trade_statistics, "totalTrades", "all"),
        winning_trades: nested_f64(trade_statistics, "winningTrades", "all"),
        losing_trades: nested_f64(trade_statistics, "losingTrades", "all"),
        average_trade: nested_f64(trade_statistics, "averageTrade", "all"),
        max_equity_drawdown_percent: dotted_f64(equity, "maxEquityDrawdownPercent"),
        max_balance_drawdown_percent: dotted_f64(equity, "maxBalanceDrawdownPercent"),
        max_equity_drawdown_absolute: dotted_f64(equity, "maxEquityDrawdownAbsolute"),
        max_balance_drawdown_absolute: dotted_f64(equity, "maxBalanceDrawdownAbsolute"),
        main: main.cloned(),
        trade_statistics: trade_statistics.cloned(),
        equity: equity.cloned(),
    })
}

fn dotted_f64(section: Option<&serde_json::Value>, key: &str) -> Option<f64> {
    section.and_then(|v| v.get(key)).and_then(|v| v.as_f64())
}

fn nested_f64(section: Option<&serde_json::Value>, key: &str, subkey: &str) -> Option<f64> {
    section
        .and_then(|v| v.get(key))
        .and_then(|v| v.get(subkey))
        .and_then(|v| v.as_f64())
}

/// Reports-ready predicate (§4.C, §8 invariant 6): both files exist and are
/// non-empty. Independent of the child's exit code — the CLI is known to
/// linger after writing reports, so exit code alone is not trustworthy.
pub fn reports_ready(report_html: &std::path::Path, report_json: &std::path::Path) -> bool {
    file_nonempty(report_html) && file_nonempty(report_json)
}

fn file_nonempty(path: &std::path::Path) -> bool {
    std::fs::metadata(path).map(|m| m.len() > 0).unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_full_metric_projection() {
        let json = serde_json::json!({
            "main": { "netProfit": 1234.5, "endingEquity": 11234.5, "endingBalance": 11000.0 },
            "tradeStatistics": {
                "profitFactor": { "all": 1.8 },
                "totalTrades": { "all": 50 },
                "winningTrades": { "all": 30 },
                "losingTrades": { "all": 20 },
                "averageTrade": { "all": 24.69 }
            },
            "equity": {
                "maxEquityDrawdownPercent": 12.3,
                "maxBalanceDrawdownPercent": 10.1,
                "maxEquityDrawdownAbsolute": 500.0,
                "maxBalanceDrawdownAbsolute": 450.0
            }
        });
        let metrics = parse_report(json.to_string().as_bytes()).unwrap();
        assert_eq!(metrics.net_profit, Some(1234.5));
        assert_eq!(metrics.ending_equity, Some(11234.5));
        assert_eq!(metrics.profit_factor, Some(1.8));
        assert_eq!(metrics.total_trades, Some(50.0));
        assert_eq!(metrics.max_equity_drawdown_percent, Some(12.3));
        assert!(metrics.main.is_some());
    }

    #[test]
    fn net_profit_falls_back_to_trade_statistics() {
        let json = serde_json::json!({
            "tradeStatistics": { "netProfit": 99.0 }
        });
        let metrics = parse_report(json.to_string().as_bytes()).unwrap();
        assert_eq!(metrics.net_profit, Some(99.0));
    }

    #[test]
    fn missing_fields_yield_none_not_error() {
        let json = serde_json::json!({ "main": {} });
        let metrics = parse_report(json.to_string().as_bytes()).unwrap();
        assert_eq!(metrics.net_profit, None);
        assert_eq!(metrics.ending_equity, None);
    }

    #[test]
    fn malformed_json_is_a_hard_error() {
        let err = parse_report(b"not json at all").unwrap_err();
        assert!(err.contains("parse failed"));
    }

    #[test]
    fn reports_ready_requires_both_files_nonempty() {
        let dir = tempfile::tempdir().unwrap();
        let html = dir.path().join("report.html");
        let json = dir.path().join("report.json");
        assert!(!reports_ready(&html, &json));

        std::fs::write(&html, b"<html></html>").unwrap();
        assert!(!reports_ready(&html, &json), "json still missing");

        std::fs::write(&json, b"{}").unwrap();
        assert!(reports_ready(&html, &json));

        std::fs::write(&json, b"").unwrap();
        assert!(!reports_ready(&html, &json), "empty json fails predicate");
    }
}
