//! Static price table, USD per million tokens.
//!
//! Unlisted models fall back to the default entry so cost rows are always
//! written; the estimate is marked by model id, so a fallback is visible in
//! the data.

#[derive(Debug, Clone, Copy)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const DEFAULT_PRICE: ModelPrice = ModelPrice {
    input_per_million: 2.50,
    output_per_million: 10.00,
};

const PRICES: &[(&str, ModelPrice)] = &[
    // OpenAI
    (
        "gpt-4o",
        ModelPrice {
            input_per_million: 2.50,
            output_per_million: 10.00,
        },
    ),
    (
        "gpt-4o-mini",
        ModelPrice {
            input_per_million: 0.15,
            output_per_million: 0.60,
        },
    ),
    (
        "gpt-4-turbo",
        ModelPrice {
            input_per_million: 10.00,
            output_per_million: 30.00,
        },
    ),
    // Anthropic
    (
        "claude-opus-4-20250514",
        ModelPrice {
            input_per_million: 15.00,
            output_per_million: 75.00,
        },
    ),
    (
        "claude-sonnet-4-20250514",
        ModelPrice {
            input_per_million: 3.00,
            output_per_million: 15.00,
        },
    ),
    (
        "claude-haiku-4-20250506",
        ModelPrice {
            input_per_million: 0.80,
            output_per_million: 4.00,
        },
    ),
];

pub fn price_for(model: &str) -> ModelPrice {
    PRICES
        .iter()
        .find(|(id, _)| *id == model)
        .map(|(_, price)| *price)
        .unwrap_or(DEFAULT_PRICE)
}

/// Deterministic, non-negative cost estimate rounded to 6 decimal places.
pub fn estimate_cost(model: &str, prompt_tokens: u32, completion_tokens: u32) -> f64 {
    let price = price_for(model);
    let input = f64::from(prompt_tokens) / 1_000_000.0 * price.input_per_million;
    let output = f64::from(completion_tokens) / 1_000_000.0 * price.output_per_million;
    ((input + output) * 1_000_000.0).round() / 1_000_000.0
}
