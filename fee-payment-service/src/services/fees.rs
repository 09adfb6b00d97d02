//! Fee arithmetic: status derivation, tax snapshots, billing cycles and
//! receipt numbering. Everything here is pure and works in minor units.

use crate::models::{BillingCycle, FeeRecord, FeeStatus, RecurringAssignment};
use chrono::{DateTime, Months, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use uuid::Uuid;

/// Rounding tolerance for money comparisons, in minor units.
pub const AMOUNT_TOLERANCE: i64 = 1;

/// Round to whole minor units, halves away from zero.
pub fn round_half_up(value: Decimal) -> i64 {
    value
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero)
        .to_i64()
        .unwrap_or(0)
}

/// Status of a record given what has been paid against it and the date.
///
/// WAIVED is terminal and never recomputed.
pub fn derive_status(
    current: FeeStatus,
    final_amount: i64,
    paid_amount: i64,
    due_date: NaiveDate,
    today: NaiveDate,
) -> FeeStatus {
    if current == FeeStatus::Waived {
        return FeeStatus::Waived;
    }
    if final_amount - paid_amount <= AMOUNT_TOLERANCE {
        FeeStatus::Paid
    } else if due_date < today {
        FeeStatus::Overdue
    } else if paid_amount > 0 {
        FeeStatus::PartiallyPaid
    } else {
        FeeStatus::Pending
    }
}

/// Recompute `record.status` in place from its current amounts.
pub fn refresh_status(record: &mut FeeRecord, today: NaiveDate) {
    record.status = derive_status(
        record.status,
        record.final_amount,
        record.paid_amount,
        record.due_date,
        today,
    );
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaxSnapshot {
    pub taxable: i64,
    pub tax_amount: i64,
    pub final_amount: i64,
}

/// Tax is charged on the amount left after discount and scholarship.
pub fn tax_snapshot(base: i64, discount: i64, scholarship: i64, tax_rate: Decimal) -> TaxSnapshot {
    let taxable = (base - discount - scholarship).max(0);
    let tax_amount = round_half_up(Decimal::from(taxable) * tax_rate / Decimal::ONE_HUNDRED);
    TaxSnapshot {
        taxable,
        tax_amount,
        final_amount: taxable + tax_amount,
    }
}

/// Due date one cycle later, clamped to the end of shorter months.
pub fn next_due_date(due_date: NaiveDate, cycle: BillingCycle) -> Option<NaiveDate> {
    cycle
        .months()
        .and_then(|months| due_date.checked_add_months(Months::new(months)))
}

/// Next cycle's record for an assignment, taxed on its current terms.
pub fn next_cycle_record(
    assignment: &RecurringAssignment,
    due_date: NaiveDate,
    now: DateTime<Utc>,
) -> FeeRecord {
    let snapshot = tax_snapshot(
        assignment.base_amount,
        assignment.discount_amount,
        assignment.scholarship_amount,
        assignment.tax_rate,
    );
    let mut record = FeeRecord {
        id: Uuid::new_v4(),
        tenant_id: assignment.tenant_id,
        member_id: assignment.member_id,
        payee_id: assignment.payee_id,
        assignment_id: Some(assignment.id),
        base_amount: assignment.base_amount,
        discount_amount: assignment.discount_amount,
        scholarship_amount: assignment.scholarship_amount,
        tax_rate: assignment.tax_rate,
        tax_amount: snapshot.tax_amount,
        final_amount: snapshot.final_amount,
        paid_amount: 0,
        status: FeeStatus::Pending,
        due_date,
        allow_installments: assignment.allow_installments,
        installment_amounts: assignment.installment_amounts.clone(),
        last_receipt_number: None,
        last_paid_at: None,
        created_at: now,
        updated_at: now,
    };
    refresh_status(&mut record, now.date_naive());
    record
}

/// Human-readable major units, e.g. `50000` -> `500.00`.
pub fn format_minor(amount: i64) -> String {
    let sign = if amount < 0 { "-" } else { "" };
    let abs = amount.unsigned_abs();
    format!("{}{}.{:02}", sign, abs / 100, abs % 100)
}

/// Receipt period for a payment: its calendar year.
pub fn receipt_period(at: DateTime<Utc>) -> String {
    at.format("%Y").to_string()
}

pub fn receipt_number(period: &str, value: i64) -> String {
    format!("RCPT-{}-{:06}", period, value)
}
