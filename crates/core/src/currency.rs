use std::collections::BTreeMap;

use rust_decimal::{Decimal, RoundingStrategy};

/// Exchange-rate lookup used once at intake. Implementations must be pure: the same pair
/// always yields the same rate for the lifetime of the converter.
pub trait CurrencyConverter: Send + Sync {
    /// Units of `to` per one unit of `from`, or `None` when either code is unknown.
    fn rate(&self, from: &str, to: &str) -> Option<Decimal>;

    fn convert(&self, amount: Decimal, from: &str, to: &str) -> Option<Decimal> {
        self.rate(from, to).map(|rate| round_money(amount * rate))
    }
}

/// Rates quoted against a single pivot currency (`1 pivot = rate units of code`).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StaticRateTable {
    pivot: String,
    rates: BTreeMap<String, Decimal>,
}

impl StaticRateTable {
    pub fn new(pivot: &str, rates: impl IntoIterator<Item = (String, Decimal)>) -> Self {
        let pivot = normalize_code(pivot);
        let mut rates: BTreeMap<String, Decimal> = rates
            .into_iter()
            .filter(|(_, rate)| *rate > Decimal::ZERO)
            .map(|(code, rate)| (normalize_code(&code), rate))
            .collect();
        rates.insert(pivot.clone(), Decimal::ONE);
        Self { pivot, rates }
    }

    pub fn pivot(&self) -> &str {
        &self.pivot
    }

    pub fn supports(&self, code: &str) -> bool {
        self.rates.contains_key(&normalize_code(code))
    }

    pub fn codes(&self) -> impl Iterator<Item = &str> {
        self.rates.keys().map(String::as_str)
    }
}

impl CurrencyConverter for StaticRateTable {
    fn rate(&self, from: &str, to: &str) -> Option<Decimal> {
        let from = self.rates.get(&normalize_code(from))?;
        let to = self.rates.get(&normalize_code(to))?;
        to.checked_div(*from)
    }
}

pub fn normalize_code(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Two decimal places, halves rounded away from zero.
pub fn round_money(amount: Decimal) -> Decimal {
    amount.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
