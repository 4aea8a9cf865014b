use std::collections::HashMap;

use rust_decimal::Decimal;

use crate::types::{Fill, MarketMeta, PositionSnapshot, Side};

/// One per-market position. Updated only by fills; `avg_price` tracks the
/// size-weighted entry of the currently-held lot and resets when `net_size`
/// crosses zero.
#[derive(Clone, Debug)]
pub struct Position {
    pub market_id: String,
    pub net_size: Decimal,
    pub avg_price: Decimal,
    pub realized_pnl: Decimal,
    /// Set when the position opens from flat; cleared when it returns to flat.
    pub opened_ms: i64,
    pub updated_ms: i64,
}

impl Position {
    fn flat(market_id: &str) -> Self {
        Self {
            market_id: market_id.to_string(),
            net_size: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            realized_pnl: Decimal::ZERO,
            opened_ms: 0,
            updated_ms: 0,
        }
    }

    /// Mark-to-market PnL of the open lot at `mark`.
    pub fn unrealized(&self, mark: Decimal) -> Decimal {
        (mark - self.avg_price) * self.net_size
    }
}

/// Single authoritative position/PnL state. Only the scheduler mutates it,
/// via `apply_fill`; everything else reads snapshots.
pub struct Portfolio {
    positions: HashMap<String, Position>,
    /// Realized PnL (fees included) accumulated since the current UTC day
    /// began.
    realized_today: Decimal,
    day_key: i64,
}

impl Portfolio {
    pub fn new() -> Self {
        Self {
            positions: HashMap::new(),
            realized_today: Decimal::ZERO,
            day_key: 0,
        }
    }

    /// Restore persisted positions at startup (PAPER_RESET_ON_START=false).
    pub fn restore(&mut self, positions: Vec<Position>) {
        for p in positions {
            self.positions.insert(p.market_id.clone(), p);
        }
    }

    // ─── Reads ───

    pub fn position(&self, market_id: &str) -> Option<&Position> {
        self.positions.get(market_id)
    }

    #[inline]
    pub fn net_size(&self, market_id: &str) -> Decimal {
        self.positions
            .get(market_id)
            .map_or(Decimal::ZERO, |p| p.net_size)
    }

    pub fn snapshot(&self, market_id: &str) -> PositionSnapshot {
        self.positions
            .get(market_id)
            .map(|p| PositionSnapshot {
                net_size: p.net_size,
                avg_price: p.avg_price,
            })
            .unwrap_or_default()
    }

    pub fn open_markets(&self) -> usize {
        self.positions
            .values()
            .filter(|p| !p.net_size.is_zero())
            .count()
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    pub fn realized_today(&self) -> Decimal {
        self.realized_today
    }

    pub fn realized_total(&self) -> Decimal {
        self.positions.values().map(|p| p.realized_pnl).sum()
    }

    /// Total unrealized PnL using the supplied per-market marks. Markets
    /// without a mark contribute zero.
    pub fn unrealized_total(&self, mark: impl Fn(&str) -> Option<Decimal>) -> Decimal {
        self.positions
            .values()
            .filter(|p| !p.net_size.is_zero())
            .filter_map(|p| mark(&p.market_id).map(|m| p.unrealized(m)))
            .sum()
    }

    /// Σ |net_size · mid| over open positions in markets sharing `event_id`.
    pub fn event_exposure(
        &self,
        event_id: &str,
        metas: &HashMap<String, MarketMeta>,
        mark: impl Fn(&str) -> Option<Decimal>,
    ) -> Decimal {
        self.positions
            .values()
            .filter(|p| !p.net_size.is_zero())
            .filter(|p| {
                metas
                    .get(&p.market_id)
                    .map_or(false, |m| m.event_id == event_id)
            })
            .filter_map(|p| mark(&p.market_id).map(|m| (p.net_size * m).abs()))
            .sum()
    }

    // ─── Writes ───

    /// Roll the daily accumulator when the UTC day changes.
    pub fn roll_day(&mut self, now_ms: i64) {
        let key = now_ms.div_euclid(86_400_000);
        if key != self.day_key {
            self.day_key = key;
            self.realized_today = Decimal::ZERO;
        }
    }

    /// Apply a fill. Same-sign fills size-weight the average; fills crossing
    /// zero realize PnL on the closed portion at the old average and open a
    /// new lot at the fill price. Fees reduce realized PnL.
    pub fn apply_fill(&mut self, fill: &Fill) {
        self.roll_day(fill.ts_ms);

        let pos = self
            .positions
            .entry(fill.market_id.clone())
            .or_insert_with(|| Position::flat(&fill.market_id));

        let old = pos.net_size;
        let delta = fill.side.sign() * fill.size;
        let new = old + delta;
        let mut realized_delta = -fill.fees;

        if old.is_zero() || (old > Decimal::ZERO) == (delta > Decimal::ZERO) {
            // Opening or adding: weight the average by absolute sizes.
            let total = old.abs() + delta.abs();
            if !total.is_zero() {
                pos.avg_price =
                    (pos.avg_price * old.abs() + fill.price * delta.abs()) / total;
            }
            if old.is_zero() && !new.is_zero() {
                pos.opened_ms = fill.ts_ms;
            }
        } else {
            // Reducing, flattening, or flipping.
            let closed = delta.abs().min(old.abs());
            let lot_sign = if old > Decimal::ZERO {
                Decimal::ONE
            } else {
                -Decimal::ONE
            };
            realized_delta += (fill.price - pos.avg_price) * closed * lot_sign;

            if new.is_zero() {
                pos.avg_price = Decimal::ZERO;
                pos.opened_ms = 0;
            } else if (new > Decimal::ZERO) != (old > Decimal::ZERO) {
                // Crossed through zero: the remainder is a fresh lot.
                pos.avg_price = fill.price;
                pos.opened_ms = fill.ts_ms;
            }
        }

        pos.net_size = new;
        pos.realized_pnl += realized_delta;
        pos.updated_ms = fill.ts_ms;
        self.realized_today += realized_delta;
    }
}

impl Default for Portfolio {
    fn default() -> Self {
        Self::new()
    }
}
