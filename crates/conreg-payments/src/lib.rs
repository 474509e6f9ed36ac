use conreg_core::Charge;

/// Minimum instalment a payer may choose, in cents. Matches the price of a
/// supporting membership, so a single successful charge always covers one.
pub const MIN_PAYMENT_AMOUNT: i64 = 40_00;

/// Spacing between offered instalment amounts, in cents.
pub const PAYMENT_STEP: i64 = 40_00;

/// The discrete set of legal payment amounts for an outstanding balance.
///
/// Nothing is owed: no options. Below the minimum: the balance can't be
/// subdivided, pay it in full. Otherwise the minimum stepped up while
/// strictly under the balance, with full payment always the last entry.
pub fn payment_amount_options(amount_owed: i64) -> Vec<i64> {
    if amount_owed <= 0 {
        return Vec::new();
    }
    if amount_owed < MIN_PAYMENT_AMOUNT {
        return vec![amount_owed];
    }

    let mut amounts: Vec<i64> = (MIN_PAYMENT_AMOUNT..amount_owed)
        .step_by(PAYMENT_STEP as usize)
        .collect();
    amounts.push(amount_owed);
    amounts.dedup();
    amounts
}

/// Sum of successful charges against a reservation; pending and failed
/// attempts don't count toward the balance.
pub fn paid_cents(charges: &[Charge]) -> i64 {
    charges
        .iter()
        .filter(|charge| charge.successful())
        .map(|charge| charge.amount_cents)
        .sum()
}

/// Outstanding balance for the active tier. Negative means overpaid (an
/// upgrade can also swing a paid reservation back positive); callers treat
/// anything `<= 0` as fully paid.
pub fn amount_owed(price_cents: i64, paid_cents: i64) -> i64 {
    price_cents - paid_cents
}

/// A single successful charge covers at least a supporting membership,
/// because the minimum payment equals a supporting membership's price.
pub fn has_paid_supporting(charges: &[Charge]) -> bool {
    charges.iter().any(|charge| charge.successful())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use conreg_core::{ChargeState, TransferKind};
    use uuid::Uuid;

    fn charge(amount_cents: i64, state: ChargeState) -> Charge {
        Charge {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            reservation_id: Uuid::new_v4(),
            amount_cents,
            transfer: TransferKind::Cash,
            state,
            comment: "test charge".to_string(),
            provider_ref: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn nothing_owed_offers_nothing() {
        assert!(payment_amount_options(0).is_empty());
        assert!(payment_amount_options(-100).is_empty());
    }

    #[test]
    fn balances_below_the_minimum_must_be_paid_in_full() {
        assert_eq!(payment_amount_options(1), vec![1]);
        assert_eq!(payment_amount_options(39_99), vec![39_99]);
    }

    #[test]
    fn balance_equal_to_the_minimum_is_a_single_option() {
        assert_eq!(payment_amount_options(40_00), vec![40_00]);
    }

    #[test]
    fn steps_up_to_the_full_amount() {
        assert_eq!(payment_amount_options(90_00), vec![40_00, 80_00, 90_00]);
        assert_eq!(
            payment_amount_options(225_00),
            vec![40_00, 80_00, 120_00, 160_00, 200_00, 225_00]
        );
    }

    #[test]
    fn exact_multiples_do_not_repeat_the_final_entry() {
        assert_eq!(payment_amount_options(80_00), vec![40_00, 80_00]);
        assert_eq!(payment_amount_options(120_00), vec![40_00, 80_00, 120_00]);
    }

    #[test]
    fn options_are_strictly_ascending_and_end_at_the_balance() {
        for owed in [1, 39_99, 40_00, 40_01, 80_00, 90_00, 123_45, 340_00] {
            let options = payment_amount_options(owed);
            assert_eq!(*options.last().unwrap(), owed);
            assert!(options.windows(2).all(|pair| pair[0] < pair[1]));
        }
    }

    #[test]
    fn only_successful_charges_count_toward_the_balance() {
        let charges = vec![
            charge(40_00, ChargeState::Successful),
            charge(40_00, ChargeState::Pending),
            charge(80_00, ChargeState::Failed),
            charge(40_00, ChargeState::Successful),
        ];
        assert_eq!(paid_cents(&charges), 80_00);
        assert_eq!(amount_owed(340_00, paid_cents(&charges)), 260_00);
        assert!(has_paid_supporting(&charges));
    }

    #[test]
    fn no_successful_charges_means_nothing_paid() {
        let charges = vec![charge(40_00, ChargeState::Pending)];
        assert_eq!(paid_cents(&charges), 0);
        assert!(!has_paid_supporting(&charges));
    }
}
