//! Activity statistics over the collected orders.
//!
//! Orders carry side, size, price and creation time only, so everything here
//! is activity based: counts, traded size and notional (size times price).

use chrono::{NaiveDate, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::models::{Order, Side};

/// Symbols listed in the notional ranking.
pub const TOP_SYMBOLS: usize = 15;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderAnalytics {
    pub general: GeneralStats,
    pub symbols: BTreeMap<String, SymbolSummary>,
    /// Highest notional first, at most `TOP_SYMBOLS` entries.
    pub top_symbols_by_notional: Vec<SymbolNotional>,
    /// Oldest day first.
    pub daily: Vec<DailyActivity>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GeneralStats {
    pub total_orders: usize,
    pub unique_symbols: usize,
    pub buy_orders: usize,
    pub sell_orders: usize,
    pub total_size: Decimal,
    pub total_notional: Decimal,
    pub active_days: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SymbolSummary {
    pub orders: usize,
    pub buy_orders: usize,
    pub sell_orders: usize,
    pub total_size: Decimal,
    pub total_notional: Decimal,
    /// Size-weighted; `None` when the traded size is zero.
    pub average_price: Option<Decimal>,
    pub first_order_at: i64,
    pub last_order_at: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolNotional {
    pub symbol: String,
    pub total_notional: Decimal,
    pub orders: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DailyActivity {
    /// UTC calendar day, `YYYY-MM-DD`.
    pub date: String,
    pub orders: usize,
    pub total_notional: Decimal,
    pub cumulative_notional: Decimal,
}

pub fn analyze(orders: &[Order]) -> OrderAnalytics {
    let mut general = GeneralStats::default();
    let mut symbols: BTreeMap<String, SymbolSummary> = BTreeMap::new();
    let mut days: BTreeMap<NaiveDate, (usize, Decimal)> = BTreeMap::new();

    for order in orders {
        let notional = order.size * order.price;
        general.total_orders += 1;
        general.total_size += order.size;
        general.total_notional += notional;

        let summary = symbols.entry(order.symbol.clone()).or_insert_with(|| SymbolSummary {
            first_order_at: order.create_time,
            last_order_at: order.create_time,
            ..Default::default()
        });
        summary.orders += 1;
        summary.total_size += order.size;
        summary.total_notional += notional;
        summary.first_order_at = summary.first_order_at.min(order.create_time);
        summary.last_order_at = summary.last_order_at.max(order.create_time);

        match order.side {
            Side::Buy => {
                general.buy_orders += 1;
                summary.buy_orders += 1;
            }
            Side::Sell => {
                general.sell_orders += 1;
                summary.sell_orders += 1;
            }
        }

        if let Some(day) = utc_day(order.create_time) {
            let entry = days.entry(day).or_insert((0, Decimal::ZERO));
            entry.0 += 1;
            entry.1 += notional;
        }
    }

    for summary in symbols.values_mut() {
        if !summary.total_size.is_zero() {
            summary.average_price = Some(summary.total_notional / summary.total_size);
        }
    }

    general.unique_symbols = symbols.len();
    general.active_days = days.len();

    OrderAnalytics {
        general,
        top_symbols_by_notional: rank_by_notional(&symbols),
        daily: daily_series(days),
        symbols,
    }
}

fn utc_day(ts_ms: i64) -> Option<NaiveDate> {
    Utc.timestamp_millis_opt(ts_ms).single().map(|dt| dt.date_naive())
}

fn rank_by_notional(symbols: &BTreeMap<String, SymbolSummary>) -> Vec<SymbolNotional> {
    let mut ranked: Vec<SymbolNotional> = symbols
        .iter()
        .map(|(symbol, summary)| SymbolNotional {
            symbol: symbol.clone(),
            total_notional: summary.total_notional,
            orders: summary.orders,
        })
        .collect();
    // Ties keep symbol order from the map.
    ranked.sort_by(|a, b| b.total_notional.cmp(&a.total_notional));
    ranked.truncate(TOP_SYMBOLS);
    ranked
}

fn daily_series(days: BTreeMap<NaiveDate, (usize, Decimal)>) -> Vec<DailyActivity> {
    let mut running = Decimal::ZERO;
    days.into_iter()
        .map(|(day, (orders, notional))| {
            running += notional;
            DailyActivity {
                date: day.format("%Y-%m-%d").to_string(),
                orders,
                total_notional: notional,
                cumulative_notional: running,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ProductType, MS_PER_DAY};
    use std::str::FromStr;

    fn order(id: &str, symbol: &str, side: Side, size: &str, price: &str, ts: i64) -> Order {
        Order {
            order_id: id.to_string(),
            symbol: symbol.to_string(),
            side,
            size: Decimal::from_str(size).unwrap(),
            price: Decimal::from_str(price).unwrap(),
            create_time: ts,
            product_type: ProductType::Umcbl,
        }
    }

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_empty_input() {
        let analytics = analyze(&[]);
        assert_eq!(analytics, OrderAnalytics::default());
    }

    #[test]
    fn test_symbol_summary_and_general_stats() {
        let orders = vec![
            order("1", "BTCUSDT_UMCBL", Side::Buy, "0.5", "40000", 3 * MS_PER_DAY),
            order("2", "BTCUSDT_UMCBL", Side::Sell, "1.5", "44000", MS_PER_DAY),
            order("3", "ETHUSDT_UMCBL", Side::Buy, "2", "2500", MS_PER_DAY + 10),
        ];
        let analytics = analyze(&orders);

        let btc = &analytics.symbols["BTCUSDT_UMCBL"];
        assert_eq!(btc.orders, 2);
        assert_eq!((btc.buy_orders, btc.sell_orders), (1, 1));
        assert_eq!(btc.total_size, dec("2.0"));
        assert_eq!(btc.total_notional, dec("86000"));
        assert_eq!(btc.average_price, Some(dec("43000")));
        assert_eq!(btc.first_order_at, MS_PER_DAY);
        assert_eq!(btc.last_order_at, 3 * MS_PER_DAY);

        let general = &analytics.general;
        assert_eq!(general.total_orders, 3);
        assert_eq!(general.unique_symbols, 2);
        assert_eq!((general.buy_orders, general.sell_orders), (2, 1));
        assert_eq!(general.total_notional, dec("91000"));
        assert_eq!(general.active_days, 2);
    }

    #[test]
    fn test_zero_size_has_no_average_price() {
        let analytics = analyze(&[order("1", "AAA", Side::Buy, "0", "10", 0)]);
        assert_eq!(analytics.symbols["AAA"].average_price, None);
    }

    #[test]
    fn test_notional_ranking_keeps_top_fifteen() {
        let orders: Vec<Order> = (0..20)
            .map(|i| {
                order(
                    &i.to_string(),
                    &format!("SYM{:02}", i),
                    Side::Buy,
                    "1",
                    &(i + 1).to_string(),
                    0,
                )
            })
            .collect();
        let ranked = analyze(&orders).top_symbols_by_notional;

        assert_eq!(ranked.len(), TOP_SYMBOLS);
        assert_eq!(ranked[0].symbol, "SYM19");
        assert_eq!(ranked[0].total_notional, dec("20"));
        assert_eq!(ranked[14].symbol, "SYM05");
    }

    #[test]
    fn test_daily_series_accumulates_in_date_order() {
        let orders = vec![
            order("1", "AAA", Side::Buy, "1", "10", 2 * MS_PER_DAY + 5),
            order("2", "AAA", Side::Sell, "1", "5", 0),
            order("3", "BBB", Side::Buy, "2", "1", 5),
        ];
        let daily = analyze(&orders).daily;

        assert_eq!(daily.len(), 2);
        assert_eq!(daily[0].date, "1970-01-01");
        assert_eq!(daily[0].orders, 2);
        assert_eq!(daily[0].total_notional, dec("7"));
        assert_eq!(daily[1].date, "1970-01-03");
        assert_eq!(daily[1].cumulative_notional, dec("17"));
    }
}
