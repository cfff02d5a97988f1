//! Per-token pricing for the vision models we call.

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

/// (input, output) USD per token for a model, matched by prefix.
///
/// Unknown models are priced at zero so the ledger still records token counts.
pub fn model_cost(model: &str) -> (Decimal, Decimal) {
    const TABLE: &[(&str, Decimal, Decimal)] = &[
        ("claude-opus", dec!(0.000015), dec!(0.000075)),
        ("claude-sonnet", dec!(0.000003), dec!(0.000015)),
        ("claude-3-5-sonnet", dec!(0.000003), dec!(0.000015)),
        ("claude-haiku", dec!(0.0000008), dec!(0.000004)),
        ("claude-3-5-haiku", dec!(0.0000008), dec!(0.000004)),
        ("gpt-4o-mini", dec!(0.00000015), dec!(0.0000006)),
        ("gpt-4o", dec!(0.0000025), dec!(0.00001)),
        ("gpt-4.1-mini", dec!(0.0000004), dec!(0.0000016)),
        ("gpt-4.1", dec!(0.000002), dec!(0.000008)),
    ];

    TABLE
        .iter()
        .find(|(prefix, _, _)| model.starts_with(prefix))
        .map(|(_, input, output)| (*input, *output))
        .unwrap_or((Decimal::ZERO, Decimal::ZERO))
}
