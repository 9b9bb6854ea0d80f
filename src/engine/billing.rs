use tracing::{debug, info};
use ulid::Ulid;

use crate::model::*;

use super::{Engine, LedgerError, today};

impl Engine {
    /// Turn a completed usage record into a charge at the aircraft's current
    /// rate. A usage record is billed at most once.
    pub async fn derive_billing(&self, id: Ulid, usage_id: Ulid) -> Result<BillingRecord, LedgerError> {
        let mut scope = self.write_entity(usage_id).await?;
        let usage = scope.usage.get(&usage_id).cloned().ok_or(LedgerError::NotFound(usage_id))?;
        let end = usage.end_reading.ok_or(LedgerError::IncompleteUsage(usage_id))?;
        if let Some(existing) = scope.billed_usage.get(&usage_id).copied() {
            return Err(LedgerError::DuplicateBilling(existing));
        }
        let duration = end - usage.start_reading;
        let hourly_rate = scope.hourly_rate;
        let amount = duration
            .checked_mul(hourly_rate)
            .ok_or(LedgerError::LimitExceeded("billing amount out of range"))?;
        self.claim_id(id, usage.aircraft_id)?;

        let event = Event::BillingDerived {
            id,
            aircraft_id: usage.aircraft_id,
            holder_id: usage.holder_id,
            usage_id,
            duration,
            hourly_rate,
            amount,
            billing_date: today(),
        };
        self.commit(&mut scope, vec![event], Some(id)).await?;
        metrics::counter!(crate::observability::BILLING_DERIVED_TOTAL).increment(1);
        info!(billing = %id, usage = %usage_id, %duration, %amount, "billing derived");
        scope.billing.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Mark a billing record paid today. Paying again moves the date.
    pub async fn mark_paid(&self, id: Ulid) -> Result<BillingRecord, LedgerError> {
        let mut scope = self.write_entity(id).await?;
        let aircraft_id = scope.billing.get(&id).map(|b| b.aircraft_id).ok_or(LedgerError::NotFound(id))?;
        let event = Event::BillingPaid {
            id,
            aircraft_id,
            payment_date: today(),
        };
        self.commit(&mut scope, vec![event], None).await?;
        debug!(billing = %id, "billing paid");
        scope.billing.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Administrative removal. The usage record becomes billable again.
    pub async fn delete_billing(&self, id: Ulid) -> Result<(), LedgerError> {
        let mut scope = self.write_entity(id).await?;
        let aircraft_id = scope.billing.get(&id).map(|b| b.aircraft_id).ok_or(LedgerError::NotFound(id))?;
        self.commit(&mut scope, vec![Event::BillingDeleted { id, aircraft_id }], None)
            .await?;
        debug!(billing = %id, "billing deleted");
        Ok(())
    }

    pub async fn get_billing(&self, id: Ulid) -> Result<BillingRecord, LedgerError> {
        let guard = self.read_entity(id).await?;
        guard.billing.get(&id).cloned().ok_or(LedgerError::NotFound(id))
    }

    /// Matching billing records, newest billing date first.
    pub async fn list_billing(&self, filter: &BillingFilter) -> Vec<BillingRecord> {
        let mut out = Vec::new();
        for shared in self.snapshot_states() {
            let guard = shared.read().await;
            if guard.retired {
                continue;
            }
            out.extend(guard.billing.values().filter(|b| filter.matches(b)).cloned());
        }
        out.sort_by(|a, b| b.billing_date.cmp(&a.billing_date).then(b.id.cmp(&a.id)));
        out
    }

    /// Totals across every billing record of the holder. Zeros when there are none.
    pub async fn summarize(&self, holder_id: Ulid) -> Result<BillingSummary, LedgerError> {
        let mut summary = BillingSummary::empty(holder_id);
        for shared in self.snapshot_states() {
            let guard = shared.read().await;
            if guard.retired {
                continue;
            }
            for record in guard.billing.values().filter(|b| b.holder_id == holder_id) {
                summary = summary
                    .checked_add(record)
                    .ok_or(LedgerError::LimitExceeded("billing totals out of range"))?;
            }
        }
        Ok(summary)
    }
}
