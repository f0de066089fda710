use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CurrencyUnit {
    #[default]
    Usd,
    Cny,
}

impl CurrencyUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Usd => "usd",
            Self::Cny => "cny",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "usd" => Some(Self::Usd),
            "cny" => Some(Self::Cny),
            _ => None,
        }
    }
}

/// Unit prices per thousand tokens / images / requests, captured from the
/// model catalog when a generation finishes. Stored on the usage record so
/// later catalog edits never change historical cost.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnitPrices {
    #[serde(default)]
    pub prompt: Decimal,
    #[serde(default)]
    pub completion: Decimal,
    #[serde(default)]
    pub image: Decimal,
    #[serde(default)]
    pub request: Decimal,
    #[serde(default)]
    pub currency_unit: CurrencyUnit,
}

/// Monotonic usage counters for one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct UsageCounters {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub image_count: u64,
}

impl UsageCounters {
    /// Merge an incoming usage report. Some upstreams report cumulative
    /// totals on every chunk and some only on the last one, so counters
    /// take the max of old and new instead of summing.
    pub fn merge_max(&mut self, incoming: UsageCounters) {
        self.prompt_tokens = self.prompt_tokens.max(incoming.prompt_tokens);
        self.completion_tokens = self.completion_tokens.max(incoming.completion_tokens);
        self.image_count = self.image_count.max(incoming.image_count);
    }
}

/// cost = prompt x prompt_price/1000 + completion x completion_price/1000
///      + images x image_price/1000 + request_price/1000
pub fn cost_of(usage: &UsageCounters, prices: &UnitPrices) -> Decimal {
    let thousand = Decimal::from(1000u32);
    (Decimal::from(usage.prompt_tokens) * prices.prompt
        + Decimal::from(usage.completion_tokens) * prices.completion
        + Decimal::from(usage.image_count) * prices.image
        + prices.request)
        / thousand
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn cost_matches_reference_example() {
        let usage = UsageCounters {
            prompt_tokens: 1000,
            completion_tokens: 500,
            image_count: 0,
        };
        let prices = UnitPrices {
            prompt: dec("0.002"),
            completion: dec("0.004"),
            ..UnitPrices::default()
        };
        assert_eq!(cost_of(&usage, &prices), dec("0.004"));
    }

    #[test]
    fn missing_price_terms_default_to_zero() {
        let usage = UsageCounters {
            prompt_tokens: 123,
            completion_tokens: 456,
            image_count: 7,
        };
        assert_eq!(cost_of(&usage, &UnitPrices::default()), Decimal::ZERO);
    }

    #[test]
    fn flat_request_price_applies_without_tokens() {
        let usage = UsageCounters::default();
        let prices = UnitPrices {
            request: dec("5"),
            ..UnitPrices::default()
        };
        assert_eq!(cost_of(&usage, &prices), dec("0.005"));
    }

    #[test]
    fn image_cost_scales_with_count() {
        let usage = UsageCounters {
            image_count: 4,
            ..UsageCounters::default()
        };
        let prices = UnitPrices {
            image: dec("20"),
            ..UnitPrices::default()
        };
        assert_eq!(cost_of(&usage, &prices), dec("0.08"));
    }

    #[test]
    fn counters_merge_with_max_not_sum() {
        let mut counters = UsageCounters::default();
        for tokens in [10u64, 7, 15] {
            counters.merge_max(UsageCounters {
                completion_tokens: tokens,
                ..UsageCounters::default()
            });
        }
        assert_eq!(counters.completion_tokens, 15);
    }
}
