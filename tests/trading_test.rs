//! Trade execution tests
//!
//! Tests cover:
//! - Buy/sell settlement and the round-trip law
//! - Rate limiting ahead of trade validation
//! - Fresh-price policy and price outages
//! - Serialization of concurrent trades on one portfolio
//! - Storage fault retries

mod common;

use common::{config, league, order, personal, Harness};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::{Arc, Barrier};
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};
use tradeleague::config::RateRule;
use tradeleague::services::{TradeError, TradeErrorKind};
use tradeleague::types::TradeSide;

// =============================================================================
// Settlement
// =============================================================================

mod settlement_tests {
    use super::*;

    #[tokio::test]
    async fn test_buy_then_sell_scenario() {
        let h = Harness::new(config(), &[("AAPL", dec!(150))]);
        let ctx = league("l1", "alice");
        assert_ok!(h.state.executor.open_portfolio(ctx.clone(), Some(dec!(10000))));

        let receipt = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 10))
            .await
            .unwrap();
        assert_eq!(receipt.new_cash, dec!(8500));
        assert_eq!(receipt.new_holding_shares, 10);

        let portfolio = h.state.portfolios.get(&ctx).unwrap();
        assert_eq!(portfolio.holdings["AAPL"].shares, 10);
        assert_eq!(portfolio.holdings["AAPL"].average_cost, dec!(150));

        h.state.prices.insert("AAPL", dec!(160));
        let receipt = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Sell, 10))
            .await
            .unwrap();
        assert_eq!(receipt.new_cash, dec!(10100));
        assert_eq!(receipt.new_holding_shares, 0);

        let portfolio = h.state.portfolios.get(&ctx).unwrap();
        assert_eq!(portfolio.cash, dec!(10100));
        assert!(portfolio.holdings.get("AAPL").is_none());

        let history = h.state.portfolios.transactions(&ctx, 10).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].side, TradeSide::Sell);
        assert_eq!(history[0].price, dec!(160));
        assert_eq!(history[1].side, TradeSide::Buy);
    }

    #[tokio::test]
    async fn test_round_trip_costs_only_fees() {
        let mut cfg = config();
        cfg.execution.fee_flat = dec!(1);
        cfg.execution.fee_pct = dec!(0.001);
        let h = Harness::new(cfg, &[("MSFT", dec!(300))]);
        let ctx = personal("bob");
        h.state
            .executor
            .open_portfolio(ctx.clone(), Some(dec!(5000)))
            .unwrap();

        let buy = h
            .state
            .executor
            .submit(order(&ctx, "MSFT", TradeSide::Buy, 5))
            .await
            .unwrap();
        let sell = h
            .state
            .executor
            .submit(order(&ctx, "MSFT", TradeSide::Sell, 5))
            .await
            .unwrap();

        // 1 + 0.1% of 1500 = 2.50 each way
        assert_eq!(buy.fee, dec!(2.50));
        assert_eq!(sell.fee, dec!(2.50));
        assert_eq!(sell.new_cash, dec!(5000) - buy.fee - sell.fee);
    }

    #[tokio::test]
    async fn test_cash_and_shares_never_negative() {
        let h = Harness::new(
            config(),
            &[("AAPL", dec!(37.25)), ("MSFT", dec!(301.10)), ("TSLA", dec!(212.5))],
        );
        let ctx = personal("carol");
        h.state
            .executor
            .open_portfolio(ctx.clone(), Some(dec!(2500)))
            .unwrap();

        let ops = [
            ("AAPL", TradeSide::Buy, 20),
            ("MSFT", TradeSide::Buy, 5),
            ("TSLA", TradeSide::Buy, 3),
            ("AAPL", TradeSide::Sell, 25),
            ("AAPL", TradeSide::Sell, 20),
            ("MSFT", TradeSide::Buy, 7),
            ("TSLA", TradeSide::Sell, 1),
            ("TSLA", TradeSide::Buy, 10),
            ("MSFT", TradeSide::Sell, 5),
            ("AAPL", TradeSide::Buy, 50),
        ];

        for (symbol, side, shares) in ops {
            // Rejections are expected along the way; the invariants must hold regardless.
            let _ = h
                .state
                .executor
                .submit(order(&ctx, symbol, side, shares))
                .await;

            let portfolio = h.state.portfolios.get(&ctx).unwrap();
            assert!(portfolio.cash >= Decimal::ZERO, "cash went negative");
            assert!(portfolio.holdings.values().all(|h| h.shares > 0));
        }
    }

    #[tokio::test]
    async fn test_invalid_quantity_and_unknown_portfolio() {
        let h = Harness::new(config(), &[("AAPL", dec!(150))]);
        let ctx = personal("dave");

        let err = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TradeErrorKind::PortfolioNotFound);

        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();
        for shares in [0, -3] {
            let err = h
                .state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, shares))
                .await
                .unwrap_err();
            assert_eq!(err.kind(), TradeErrorKind::InvalidQuantity);
        }
    }

    #[tokio::test]
    async fn test_insufficient_funds_and_shares() {
        let h = Harness::new(config(), &[("AAPL", dec!(150))]);
        let ctx = personal("erin");
        h.state
            .executor
            .open_portfolio(ctx.clone(), Some(dec!(1000)))
            .unwrap();

        let err = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 7))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TradeErrorKind::InsufficientFunds);

        let err = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Sell, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TradeErrorKind::InsufficientShares);
        assert_eq!(h.state.portfolios.get(&ctx).unwrap().cash, dec!(1000));
    }

    #[tokio::test]
    async fn test_ids_with_colons_keep_separate_portfolios() {
        let h = Harness::new(config(), &[("AAPL", dec!(100))]);
        let owner = league("x:a", "b");
        let other = league("x", "a:b");

        assert_ok!(h.state.executor.open_portfolio(owner.clone(), Some(dec!(10000))));
        assert_ok!(h.state.executor.open_portfolio(other.clone(), Some(dec!(500))));

        assert_ok!(
            h.state
                .executor
                .submit(order(&other, "AAPL", TradeSide::Buy, 5))
                .await
        );

        let owner_portfolio = h.state.portfolios.get(&owner).unwrap();
        assert_eq!(owner_portfolio.context, owner);
        assert_eq!(owner_portfolio.cash, dec!(10000));
        assert!(owner_portfolio.holdings.is_empty());

        let other_portfolio = h.state.portfolios.get(&other).unwrap();
        assert_eq!(other_portfolio.cash, dec!(0));
        assert_eq!(other_portfolio.shares_of("AAPL"), 5);
    }

    #[tokio::test]
    async fn test_overflowing_cash_is_rejected() {
        let h = Harness::new(config(), &[("AAPL", dec!(100))]);
        let ctx = personal("fred");
        h.state
            .executor
            .open_portfolio(ctx.clone(), Some(Decimal::MAX))
            .unwrap();

        let err = assert_err!(h.state.executor.deposit(&ctx, dec!(1)));
        assert_eq!(err.kind(), TradeErrorKind::InvalidQuantity);
        assert!(!err.is_retryable());

        assert_ok!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                .await
        );
        h.state.prices.insert("AAPL", dec!(1000));

        // Sale proceeds would push cash past the largest decimal.
        let err = assert_err!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Sell, 1))
                .await
        );
        assert_eq!(err.kind(), TradeErrorKind::InvalidQuantity);

        let portfolio = h.state.portfolios.get(&ctx).unwrap();
        assert_eq!(portfolio.cash, Decimal::MAX - dec!(100));
        assert_eq!(portfolio.shares_of("AAPL"), 1);
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

mod rate_limit_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_third_trade_in_window_is_rate_limited() {
        let mut cfg = config();
        cfg.rate_limits.trade = RateRule {
            max_requests: 2,
            time_window_seconds: 60,
        };
        let h = Harness::new(cfg, &[("AAPL", dec!(10))]);
        let ctx = personal("frank");
        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();

        for _ in 0..2 {
            assert_ok!(
                h.state
                    .executor
                    .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                    .await
            );
        }

        // Even an invalid order is rejected by policy first.
        let err = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Sell, 100))
            .await
            .unwrap_err();
        assert!(matches!(err, TradeError::RateLimited(_)));

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_ok!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                .await
        );
        assert_eq!(h.state.portfolios.get(&ctx).unwrap().shares_of("AAPL"), 3);
    }

    #[tokio::test]
    async fn test_limits_are_per_user() {
        let mut cfg = config();
        cfg.rate_limits.trade = RateRule {
            max_requests: 1,
            time_window_seconds: 60,
        };
        let h = Harness::new(cfg, &[("AAPL", dec!(10))]);
        for user in ["gina", "hank"] {
            let ctx = personal(user);
            h.state.executor.open_portfolio(ctx.clone(), None).unwrap();
            assert_ok!(
                h.state
                    .executor
                    .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                    .await
            );
        }
    }
}

// =============================================================================
// Prices
// =============================================================================

mod price_tests {
    use super::*;

    #[tokio::test]
    async fn test_price_unavailable_leaves_portfolio_untouched() {
        let h = Harness::new(config(), &[]);
        h.provider.set_offline(true);
        let ctx = league("l1", "ivan");
        h.state
            .executor
            .open_portfolio(ctx.clone(), Some(dec!(10000)))
            .unwrap();

        let err = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TradeErrorKind::PriceUnavailable);
        assert!(!err.is_retryable());

        let portfolio = h.state.portfolios.get(&ctx).unwrap();
        assert_eq!(portfolio.cash, dec!(10000));
        assert!(portfolio.holdings.is_empty());
        assert!(h.state.portfolios.transactions(&ctx, 10).unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_price_refused_for_trades() {
        let h = Harness::new(config(), &[("AAPL", dec!(150))]);
        let ctx = personal("judy");
        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();
        assert_ok!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                .await
        );

        h.provider.set_offline(true);
        tokio::time::advance(Duration::from_secs(120)).await;

        let err = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), TradeErrorKind::PriceUnavailable);

        // Valuation still uses the stale price.
        let portfolio = h.state.portfolios.get(&ctx).unwrap();
        let valuation = h.state.leaderboard.value_portfolio(&portfolio).await;
        assert!(valuation.stale);
        assert_eq!(valuation.total_value, dec!(10000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_price_allowed_when_configured() {
        let mut cfg = config();
        cfg.prices.allow_stale_trades = true;
        let h = Harness::new(cfg, &[("AAPL", dec!(150))]);
        let ctx = personal("kim");
        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();
        h.state.prices.get_price("AAPL").await.unwrap();

        h.provider.set_offline(true);
        tokio::time::advance(Duration::from_secs(120)).await;

        let receipt = h
            .state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 2))
            .await
            .unwrap();
        assert_eq!(receipt.price, dec!(150));
    }
}

// =============================================================================
// Concurrency
// =============================================================================

mod concurrency_tests {
    use super::*;

    #[test]
    fn test_concurrent_sells_never_oversell() {
        let h = Harness::new(config(), &[]);
        let ctx = personal("leo");
        let store = Arc::clone(&h.state.portfolios);
        store.open_portfolio(ctx.clone(), dec!(1000)).unwrap();
        store
            .apply_trade(&ctx, "AAPL", TradeSide::Buy, 10, dec!(10), dec!(0))
            .unwrap();

        let threads = 8;
        let barrier = Arc::new(Barrier::new(threads));
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let store = Arc::clone(&store);
                let barrier = Arc::clone(&barrier);
                let ctx = ctx.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.apply_trade(&ctx, "AAPL", TradeSide::Sell, 3, dec!(10), dec!(0))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let succeeded = results.iter().filter(|r| r.is_ok()).count();
        assert_eq!(succeeded, 3);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| e.kind() == TradeErrorKind::InsufficientShares));

        let portfolio = store.get(&ctx).unwrap();
        assert_eq!(portfolio.shares_of("AAPL"), 1);
        assert_eq!(portfolio.cash, dec!(990));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_two_concurrent_sells_exactly_one_wins() {
        let h = Harness::new(config(), &[("AAPL", dec!(100))]);
        let ctx = league("l1", "mia");
        h.state
            .executor
            .open_portfolio(ctx.clone(), Some(dec!(10000)))
            .unwrap();
        h.state
            .executor
            .submit(order(&ctx, "AAPL", TradeSide::Buy, 10))
            .await
            .unwrap();

        let sells: Vec<_> = (0..2)
            .map(|_| {
                let executor = Arc::clone(&h.state.executor);
                let request = order(&ctx, "AAPL", TradeSide::Sell, 6);
                tokio::spawn(async move { executor.submit(request).await })
            })
            .collect();

        let mut outcomes = Vec::new();
        for sell in sells {
            outcomes.push(sell.await.unwrap());
        }

        assert_eq!(outcomes.iter().filter(|r| r.is_ok()).count(), 1);
        let failure = outcomes.into_iter().find_map(|r| r.err()).unwrap();
        assert_eq!(failure.kind(), TradeErrorKind::InsufficientShares);
        assert_eq!(h.state.portfolios.get(&ctx).unwrap().shares_of("AAPL"), 4);
    }
}

// =============================================================================
// Storage Faults
// =============================================================================

mod storage_tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_transient_storage_failure_is_retried() {
        let h = Harness::new(config(), &[("AAPL", dec!(100))]);
        let ctx = personal("nina");
        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();

        h.sqlite.inject_commit_failures(2);
        let receipt = assert_ok!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                .await
        );
        assert_eq!(receipt.new_cash, dec!(9900));
        assert_eq!(h.state.portfolios.transactions(&ctx, 10).unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_persistent_storage_failure_surfaces_without_mutation() {
        let mut cfg = config();
        cfg.execution.storage_retry_attempts = 2;
        let h = Harness::new(cfg, &[("AAPL", dec!(100))]);
        let ctx = personal("omar");
        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();

        h.sqlite.inject_commit_failures(5);
        let err = assert_err!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                .await
        );
        assert_eq!(err.kind(), TradeErrorKind::StorageFailure);
        assert!(err.is_retryable());

        let portfolio = h.state.portfolios.get(&ctx).unwrap();
        assert_eq!(portfolio.cash, dec!(10000));
        assert!(portfolio.holdings.is_empty());
    }

    #[tokio::test]
    async fn test_trade_succeeds_without_leaderboard_worker() {
        let mut h = Harness::new(config(), &[("AAPL", dec!(100))]);
        drop(h.worker.take());
        let ctx = league("l1", "pat");
        h.state.executor.open_portfolio(ctx.clone(), None).unwrap();

        assert_ok!(
            h.state
                .executor
                .submit(order(&ctx, "AAPL", TradeSide::Buy, 1))
                .await
        );
    }
}
