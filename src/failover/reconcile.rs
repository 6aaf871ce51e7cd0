//! Position reconciliation between two connections

use rust_decimal::Decimal;
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

use crate::core::{BrokerConnection, OrderRequest, Position, Result, Symbol};

/// Tag carried by reconciliation legs
pub const RECONCILE_TAG: &str = "reconcile";
/// Tag carried by mirrored orders
pub const MIRROR_TAG: &str = "mirror";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub legs: usize,
    pub failed: usize,
}

/// Signed net quantity per symbol, flat symbols dropped
pub fn net_by_symbol(positions: &[Position]) -> BTreeMap<Symbol, Decimal> {
    let mut net = BTreeMap::new();
    for p in positions.iter().filter(|p| !p.is_flat()) {
        *net.entry(p.symbol.clone()).or_insert(Decimal::ZERO) += p.quantity;
    }
    net.retain(|_, q| !q.is_zero());
    net
}

/// Orders that bring `target` to `source`: close target-only symbols, then
/// open or adjust the rest by the signed difference. Every leg is market IOC.
pub fn plan_sync(source: &[Position], target: &[Position]) -> Vec<OrderRequest> {
    let source = net_by_symbol(source);
    let target = net_by_symbol(target);

    let closes = target
        .iter()
        .filter(|(symbol, _)| !source.contains_key(*symbol))
        .map(|(symbol, qty)| (symbol.clone(), -*qty));

    let adjusts = source.iter().filter_map(|(symbol, qty)| {
        let delta = *qty - target.get(symbol).copied().unwrap_or(Decimal::ZERO);
        (!delta.is_zero()).then(|| (symbol.clone(), delta))
    });

    closes
        .chain(adjusts)
        .map(|(symbol, delta)| OrderRequest::market_ioc(symbol, delta).with_tag(RECONCILE_TAG))
        .collect()
}

/// Order moving a `current` net position in `symbol` to `desired`, if it differs
pub fn converge_order(
    symbol: &Symbol,
    desired: Decimal,
    current: Decimal,
    tag: &str,
) -> Option<OrderRequest> {
    let delta = desired - current;
    (!delta.is_zero()).then(|| OrderRequest::market_ioc(symbol.clone(), delta).with_tag(tag))
}

/// Reconcile `target` to `source`. Leg failures are counted, not fatal;
/// failing to read either side's positions is.
pub async fn sync_positions(
    source: &dyn BrokerConnection,
    target: &dyn BrokerConnection,
) -> Result<SyncReport> {
    let (source_positions, target_positions) =
        tokio::try_join!(source.get_positions(), target.get_positions())?;

    let legs = plan_sync(&source_positions, &target_positions);
    let mut report = SyncReport {
        legs: legs.len(),
        failed: 0,
    };

    for leg in legs {
        let description = format!("{} {} {}", leg.side, leg.quantity, leg.symbol);
        match target.place_order(leg).await {
            Ok(order) => debug!("Sync leg {} placed on {} as {}", description, target.key(), order.id),
            Err(e) => {
                warn!("Sync leg {} failed on {}: {}", description, target.key(), e);
                report.failed += 1;
            }
        }
    }

    info!(
        "Synced {} -> {}: {} legs, {} failed",
        source.key(),
        target.key(),
        report.legs,
        report.failed
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{Side, TimeInForce};
    use crate::testing::{MockBroker, position};
    use std::sync::atomic::Ordering;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn test_plan_closes_opens_and_adjusts() {
        let source = vec![position("EURUSD", dec("2")), position("USDJPY", dec("-1"))];
        let target = vec![position("EURUSD", dec("0.5")), position("GBPUSD", dec("3"))];

        let legs = plan_sync(&source, &target);
        let summary: Vec<(&str, Side, Decimal)> = legs
            .iter()
            .map(|o| (o.symbol.as_str(), o.side, o.quantity))
            .collect();
        assert_eq!(
            summary,
            vec![
                ("GBPUSD", Side::Sell, dec("3")),
                ("EURUSD", Side::Buy, dec("1.5")),
                ("USDJPY", Side::Sell, dec("1")),
            ]
        );
        assert!(legs.iter().all(|o| o.time_in_force == TimeInForce::Ioc
            && o.tag.as_deref() == Some(RECONCILE_TAG)));
    }

    #[test]
    fn test_plan_ignores_flat_and_matching() {
        let source = vec![position("EURUSD", dec("1")), position("GBPUSD", Decimal::ZERO)];
        let target = vec![position("EURUSD", dec("1.0"))];
        assert!(plan_sync(&source, &target).is_empty());
    }

    #[test]
    fn test_converge_order() {
        let eurusd = Symbol::new("EURUSD");
        let order = converge_order(&eurusd, dec("-1"), dec("1"), MIRROR_TAG).unwrap();
        assert_eq!(order.side, Side::Sell);
        assert_eq!(order.quantity, dec("2"));
        assert!(converge_order(&eurusd, dec("1"), dec("1.0"), MIRROR_TAG).is_none());
    }

    #[tokio::test]
    async fn test_failed_legs_do_not_abort_sync() {
        let source = MockBroker::new("source");
        let target = MockBroker::new("target");
        *source.positions.write() = vec![position("EURUSD", dec("1")), position("GBPUSD", dec("2"))];
        target.reject_orders.store(true, Ordering::SeqCst);

        let report = sync_positions(&*source, &*target).await.unwrap();
        assert_eq!(report, SyncReport { legs: 2, failed: 2 });
        assert_eq!(target.placed().len(), 2);
    }
}
