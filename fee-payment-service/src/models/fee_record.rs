//! Fee records, the recurring assignments that generate them, and payees.

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Payment state of a fee record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FeeStatus {
    Pending,
    PartiallyPaid,
    Paid,
    Overdue,
    Waived,
}

impl FeeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::PartiallyPaid => "PARTIALLY_PAID",
            Self::Paid => "PAID",
            Self::Overdue => "OVERDUE",
            Self::Waived => "WAIVED",
        }
    }
}

impl std::fmt::Display for FeeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How often a recurring assignment bills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillingCycle {
    Monthly,
    Quarterly,
    HalfYearly,
    Yearly,
    OneTime,
    FixedInstallment,
}

impl BillingCycle {
    /// Calendar months between due dates, `None` for cycles that never roll over.
    pub fn months(&self) -> Option<u32> {
        match self {
            Self::Monthly => Some(1),
            Self::Quarterly => Some(3),
            Self::HalfYearly => Some(6),
            Self::Yearly => Some(12),
            Self::OneTime | Self::FixedInstallment => None,
        }
    }

    pub fn is_recurring(&self) -> bool {
        self.months().is_some()
    }
}

/// A billable obligation owed by a member to a payee.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct FeeRecord {
    pub id: Uuid,
    pub tenant_id: Uuid,
    /// Account holder the fee is billed to.
    pub member_id: Uuid,
    pub payee_id: Uuid,
    pub assignment_id: Option<Uuid>,
    pub base_amount: i64,
    pub discount_amount: i64,
    pub scholarship_amount: i64,
    /// Percentage, e.g. `18` for 18%.
    pub tax_rate: Decimal,
    pub tax_amount: i64,
    pub final_amount: i64,
    pub paid_amount: i64,
    pub status: FeeStatus,
    pub due_date: NaiveDate,
    pub allow_installments: bool,
    /// Fixed installment amounts a partial payment must match. Empty means any amount.
    pub installment_amounts: Vec<i64>,
    pub last_receipt_number: Option<String>,
    pub last_paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FeeRecord {
    /// Outstanding amount, never negative.
    pub fn balance(&self) -> i64 {
        (self.final_amount - self.paid_amount).max(0)
    }

    pub fn is_waived(&self) -> bool {
        self.status == FeeStatus::Waived
    }
}

/// Billing terms that produce one fee record per cycle.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct RecurringAssignment {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub member_id: Uuid,
    pub payee_id: Uuid,
    pub cycle: BillingCycle,
    pub base_amount: i64,
    pub discount_amount: i64,
    pub scholarship_amount: i64,
    pub tax_rate: Decimal,
    pub allow_installments: bool,
    pub installment_amounts: Vec<i64>,
    pub active: bool,
    pub paused: bool,
}

impl RecurringAssignment {
    /// Whether a paid record of this assignment should spawn the next one.
    pub fn generates_next_cycle(&self) -> bool {
        self.active && !self.paused && self.cycle.is_recurring()
    }
}

/// Onboarding state of a payee's linked (marketplace) account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "varchar", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SettlementStatus {
    NotLinked,
    Pending,
    Activated,
    Suspended,
}

/// The party that receives fee money, less platform commission.
#[derive(Debug, Clone, PartialEq, FromRow, Serialize, Deserialize)]
pub struct Payee {
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub name: String,
    pub linked_account_id: Option<String>,
    pub settlement_status: SettlementStatus,
    /// Fraction of each payment kept by the platform, e.g. `0.05`.
    pub commission_rate: Decimal,
}

impl Payee {
    /// Activated and linked: payments may be accepted and transferred.
    pub fn is_settlement_ready(&self) -> bool {
        self.settlement_status == SettlementStatus::Activated
            && self
                .linked_account_id
                .as_deref()
                .is_some_and(|id| !id.is_empty())
    }
}
