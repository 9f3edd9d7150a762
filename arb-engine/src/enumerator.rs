use arb_instrument::{Currency, Market, Speed};
use async_trait::async_trait;
use rust_decimal::Decimal;
use std::hash::{Hash, Hasher};

/// One hop of a candidate path.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub market: Market,
    pub from_currency: Currency,
    pub from_amount: Decimal,
    pub to_amount: Decimal,
    pub speed: Speed,
}

/// A fully-formed candidate path from `fromCurrency` back to one of the requested end
/// currencies, with expected amounts already simulated against the current order books.
#[derive(Debug, Clone, PartialEq)]
pub struct ExhaustivePath {
    pub chain: Vec<Order>,
}

impl ExhaustivePath {
    pub fn expected_profit(&self) -> Decimal {
        let Some(first) = self.chain.first() else {
            return Decimal::ZERO;
        };
        let Some(last) = self.chain.last() else {
            return Decimal::ZERO;
        };
        last.to_amount - first.from_amount
    }

    /// Hash of the `(market, speed)` sequence, used to filter out paths already in flight.
    pub fn shape_hash(&self) -> u64 {
        let mut hasher = fnv::FnvHasher::default();
        for order in &self.chain {
            order.market.hash(&mut hasher);
            order.speed.hash(&mut hasher);
        }
        hasher.finish()
    }
}

/// Boundary the engine consumes to find candidate arbitrage chains. An out-of-scope concern per
/// this engine's contract - a concrete implementation crawls live order books and ranks chains by
/// expected profit; this crate only consumes the trait.
#[async_trait]
pub trait PathEnumerator: Send + Sync {
    /// Candidate chains starting at `from_currency`/`from_amount` and ending at one of
    /// `end_currencies`, ordered by [`ExhaustivePath::expected_profit`] descending with a
    /// shorter-chain tiebreak. `in_flight` is the set of shape hashes already being traded so the
    /// enumerator can exclude them.
    async fn enumerate(
        &self,
        from_currency: &Currency,
        from_amount: Decimal,
        end_currencies: &[Currency],
        in_flight: &[u64],
    ) -> Vec<ExhaustivePath>;
}

/// Sort `paths` by the ordering the trait contract promises and drop anything matching
/// `in_flight`. Implementations of [`PathEnumerator`] are expected to apply this themselves, but
/// it is exposed so tests and the trader loop can re-assert the contract on whatever a fixture
/// returns.
pub fn rank_paths(mut paths: Vec<ExhaustivePath>, in_flight: &[u64]) -> Vec<ExhaustivePath> {
    paths.retain(|path| !in_flight.contains(&path.shape_hash()));
    paths.sort_by(|a, b| {
        b.expected_profit()
            .cmp(&a.expected_profit())
            .then_with(|| a.chain.len().cmp(&b.chain.len()))
    });
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    fn order(market: Market, from: Decimal, to: Decimal) -> Order {
        Order {
            market,
            from_currency: Currency::new("USDT"),
            from_amount: from,
            to_amount: to,
            speed: Speed::Instant,
        }
    }

    #[test]
    fn rank_paths_sorts_by_profit_then_length() {
        let m = Market::new(Currency::new("BTC"), Currency::new("USDT"));
        let better = ExhaustivePath { chain: vec![order(m.clone(), 10.into(), 12.into())] };
        let worse = ExhaustivePath { chain: vec![order(m, 10.into(), 11.into())] };

        let ranked = rank_paths(vec![worse.clone(), better.clone()], &[]);
        assert_eq!(ranked[0], better);
        assert_eq!(ranked[1], worse);
    }

    #[test]
    fn rank_paths_drops_in_flight_shapes() {
        let m = Market::new(Currency::new("BTC"), Currency::new("USDT"));
        let path = ExhaustivePath { chain: vec![order(m, 10.into(), 12.into())] };
        let shape = path.shape_hash();

        assert!(rank_paths(vec![path], &[shape]).is_empty());
    }
}
