//! Plan catalog service

use std::sync::Arc;

use tracing::info;

use crate::db::{plans, Amount, EntitlementStore, NewPlan, Plan, PlanUpdate};
use crate::error::EntitlementError;

/// Catalog seeded into an empty database: (name, local name, days, price in USDT)
const DEFAULT_PLANS: &[(&str, &str, u32, i64)] = &[
    ("Monthly", "شهري", 30, 30),
    ("Quarterly", "ربع سنوي", 90, 80),
    ("Semi-annual", "نصف سنوي", 180, 150),
    ("Annual", "سنوي", 365, 280),
];

pub struct PlanService {
    store: Arc<EntitlementStore>,
}

impl PlanService {
    pub fn new(store: Arc<EntitlementStore>) -> Self {
        Self { store }
    }

    /// Plans currently offered, in catalog order
    pub fn list_active(&self) -> Result<Vec<Plan>, EntitlementError> {
        self.store.with_conn(|conn| plans::list_plans(conn, true))
    }

    pub fn list_all(&self) -> Result<Vec<Plan>, EntitlementError> {
        self.store.with_conn(|conn| plans::list_plans(conn, false))
    }

    pub fn get(&self, plan_id: i64) -> Result<Option<Plan>, EntitlementError> {
        self.store.with_conn(|conn| plans::get_plan(conn, plan_id))
    }

    /// A plan that can be bought or trialled right now.
    ///
    /// Missing plans are `NotFound`; deactivated ones are `PlanUnavailable`.
    pub fn require_offered(&self, plan_id: i64) -> Result<Plan, EntitlementError> {
        let plan = self
            .get(plan_id)?
            .ok_or_else(|| EntitlementError::not_found("Plan", plan_id))?;
        if !plan.is_active {
            return Err(EntitlementError::PlanUnavailable { plan_id });
        }
        Ok(plan)
    }

    pub fn create(&self, input: &NewPlan) -> Result<Plan, EntitlementError> {
        let plan = self.store.with_tx(|tx| plans::insert_plan(tx, input))?;
        info!(plan_id = plan.id, name = %plan.name, price = %plan.price, "Created plan");
        Ok(plan)
    }

    pub fn update(&self, plan_id: i64, update: &PlanUpdate) -> Result<Plan, EntitlementError> {
        let plan = self.store.with_tx(|tx| plans::update_plan(tx, plan_id, update))?;
        info!(plan_id, active = plan.is_active, "Updated plan");
        Ok(plan)
    }

    /// Insert the default catalog when no plans exist. Returns how many were
    /// inserted (zero when the catalog was already populated).
    pub fn seed_defaults(&self) -> Result<usize, EntitlementError> {
        let inserted = self.store.with_tx(|tx| {
            if plans::count_plans(tx)? > 0 {
                return Ok(0);
            }
            for (name, local, days, price) in DEFAULT_PLANS {
                plans::insert_plan(
                    tx,
                    &NewPlan {
                        name: (*name).to_string(),
                        name_local: Some((*local).to_string()),
                        duration_days: *days,
                        price: Amount::from_major(*price),
                        currency: "USDT".into(),
                        is_active: true,
                    },
                )?;
            }
            Ok(DEFAULT_PLANS.len())
        })?;

        if inserted > 0 {
            info!(count = inserted, "Seeded default plans");
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn service() -> PlanService {
        PlanService::new(Arc::new(EntitlementStore::open_in_memory().unwrap()))
    }

    #[test]
    fn test_seed_only_once() {
        let service = service();
        assert_eq!(service.seed_defaults().unwrap(), 4);
        assert_eq!(service.seed_defaults().unwrap(), 0);

        let plans = service.list_active().unwrap();
        assert_eq!(plans.len(), 4);
        let monthly = plans.iter().find(|p| p.duration_days == 30).unwrap();
        assert_eq!(monthly.price, Amount::from_major(30));
        assert_eq!(monthly.currency, "USDT");
    }

    #[test]
    fn test_deactivated_plan_not_offered() {
        let service = service();
        service.seed_defaults().unwrap();
        let plan = service.list_active().unwrap().remove(0);

        service
            .update(
                plan.id,
                &PlanUpdate {
                    is_active: Some(false),
                    ..Default::default()
                },
            )
            .unwrap();

        assert!(matches!(
            service.require_offered(plan.id),
            Err(EntitlementError::PlanUnavailable { .. })
        ));
        assert_eq!(service.list_active().unwrap().len(), 3);
        assert_eq!(service.list_all().unwrap().len(), 4);
    }

    #[test]
    fn test_unknown_plan_not_found() {
        let service = service();
        assert!(matches!(
            service.require_offered(99),
            Err(EntitlementError::NotFound { entity: "Plan", .. })
        ));
    }
}
