use crate::models::TimeWindow;
use rust_decimal::Decimal;

/// Share of `period` covered by `effective`, in `[0, 1]`.
///
/// Computed on whole seconds so the factor is an exact decimal ratio.
pub fn proration_factor(period: &TimeWindow, effective: &TimeWindow) -> Decimal {
    let total = period.duration().num_seconds();
    if total <= 0 {
        return Decimal::ZERO;
    }
    let covered = period
        .intersect(effective)
        .map(|overlap| overlap.duration().num_seconds())
        .unwrap_or(0);
    if covered >= total {
        return Decimal::ONE;
    }
    Decimal::from(covered) / Decimal::from(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn day(d: u32) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 4, d, 0, 0, 0).unwrap()
    }

    #[test]
    fn half_month_is_half() {
        let period = TimeWindow::new(day(1), Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap());
        let effective = TimeWindow::new(day(16), period.end);
        assert_eq!(proration_factor(&period, &effective), dec!(0.5));
    }

    #[test]
    fn full_and_disjoint_windows() {
        let period = TimeWindow::new(day(1), day(11));
        assert_eq!(proration_factor(&period, &period), Decimal::ONE);
        assert_eq!(
            proration_factor(&period, &TimeWindow::new(day(11), day(20))),
            Decimal::ZERO
        );
    }
}
