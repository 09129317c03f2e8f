//! Shop data model.
//!
//! One shop per `(installation, repository)` pair. Connection state is the
//! nullable `disconnected_at`; payment-account readiness is derived from the
//! gateway and cached here, never stored as a single boolean.

use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Shop {
    pub id: Uuid,
    pub installation_id: i64,
    pub repo_full_name: String,
    pub owner_login: String,
    /// Optional designated manager, assigned to escalation issues.
    pub manager_login: Option<String>,
    pub stripe_account_id: Option<String>,
    pub details_submitted: bool,
    pub charges_enabled: bool,
    pub payouts_enabled: bool,
    pub account_checked_at: Option<OffsetDateTime>,
    /// Null means connected. A disconnected shop rejects new orders.
    pub disconnected_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl Shop {
    pub fn is_connected(&self) -> bool {
        self.disconnected_at.is_none()
    }

    /// Readiness from the last cached gateway snapshot. Payouts are not
    /// required to take orders; charges are.
    pub fn account_ready(&self) -> bool {
        self.stripe_account_id.is_some() && self.details_submitted && self.charges_enabled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop() -> Shop {
        Shop {
            id: Uuid::new_v4(),
            installation_id: 42,
            repo_full_name: "octocat/shop".into(),
            owner_login: "octocat".into(),
            manager_login: None,
            stripe_account_id: Some("acct_123".into()),
            details_submitted: true,
            charges_enabled: true,
            payouts_enabled: false,
            account_checked_at: None,
            disconnected_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
        }
    }

    #[test]
    fn readiness_requires_charges_but_not_payouts() {
        let s = shop();
        assert!(s.account_ready());

        let mut no_charges = shop();
        no_charges.charges_enabled = false;
        assert!(!no_charges.account_ready());

        let mut no_account = shop();
        no_account.stripe_account_id = None;
        assert!(!no_account.account_ready());
    }

    #[test]
    fn disconnected_shop_is_not_connected() {
        let mut s = shop();
        assert!(s.is_connected());
        s.disconnected_at = Some(OffsetDateTime::UNIX_EPOCH);
        assert!(!s.is_connected());
    }
}
