use rust_decimal::Decimal;

/// Amounts are carried as integer cents everywhere; Decimal is for display
/// and reporting only.
pub fn cents_to_decimal(amount_cents: i64) -> Decimal {
    Decimal::new(amount_cents, 2)
}

pub fn format_usd(amount_cents: i64) -> String {
    if amount_cents < 0 {
        format!("-${}", cents_to_decimal(-amount_cents))
    } else {
        format!("${}", cents_to_decimal(amount_cents))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_whole_and_fractional_amounts() {
        assert_eq!(format_usd(340_00), "$340.00");
        assert_eq!(format_usd(75_50), "$75.50");
        assert_eq!(format_usd(5), "$0.05");
        assert_eq!(format_usd(0), "$0.00");
    }

    #[test]
    fn formats_credit_balances() {
        assert_eq!(format_usd(-40_00), "-$40.00");
    }
}
