//! Payment persistence, including the conditional updates that serialize
//! reconciliation of a single payment.

use crate::{
    entities::payment::{self, GatewayKind, PayableKind, PaymentStatus},
    errors::ServiceError,
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, Condition, ConnectionTrait, EntityTrait,
    QueryFilter, Set,
};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct NewPayment {
    pub payable_type: PayableKind,
    pub payable_id: Uuid,
    pub customer_id: Option<Uuid>,
    pub gateway: GatewayKind,
    pub external_reference: String,
    pub amount: Decimal,
    pub currency: String,
    pub details: Value,
}

/// Inserts a payment in `pending`. Called only after the provider confirmed the session.
pub async fn create_pending<C: ConnectionTrait>(
    conn: &C,
    new: NewPayment,
) -> Result<payment::Model, ServiceError> {
    let now = Utc::now();
    let model = payment::ActiveModel {
        id: Set(Uuid::new_v4()),
        payable_type: Set(new.payable_type),
        payable_id: Set(new.payable_id),
        customer_id: Set(new.customer_id),
        gateway: Set(new.gateway),
        external_reference: Set(new.external_reference),
        amount: Set(new.amount),
        currency: Set(new.currency),
        status: Set(PaymentStatus::Pending),
        details: Set(new.details),
        captured_at: Set(None),
        capture_attempts: Set(0),
        capture_started_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    }
    .insert(conn)
    .await?;
    Ok(model)
}

pub async fn find<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
) -> Result<Option<payment::Model>, ServiceError> {
    Ok(payment::Entity::find_by_id(payment_id).one(conn).await?)
}

pub async fn find_by_reference<C: ConnectionTrait>(
    conn: &C,
    gateway: GatewayKind,
    external_reference: &str,
) -> Result<Option<payment::Model>, ServiceError> {
    Ok(payment::Entity::find()
        .filter(payment::Column::Gateway.eq(gateway))
        .filter(payment::Column::ExternalReference.eq(external_reference))
        .one(conn)
        .await?)
}

/// Moves `pending` (or an abandoned `processing` claim) to `processing`.
/// Returns false when another reconciler holds the payment or it is final.
pub async fn claim<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    claim_ttl: Duration,
) -> Result<bool, ServiceError> {
    let now = Utc::now();
    let stale_before = now - ttl(claim_ttl);
    let result = payment::Entity::update_many()
        .set(payment::ActiveModel {
            status: Set(PaymentStatus::Processing),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(payment::Column::Id.eq(payment_id))
        .filter(
            Condition::any()
                .add(payment::Column::Status.eq(PaymentStatus::Pending))
                .add(
                    Condition::all()
                        .add(payment::Column::Status.eq(PaymentStatus::Processing))
                        .add(payment::Column::UpdatedAt.lt(stale_before)),
                ),
        )
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Returns a held claim to `pending` so a later event can retry.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    details: Value,
) -> Result<(), ServiceError> {
    payment::Entity::update_many()
        .set(payment::ActiveModel {
            status: Set(PaymentStatus::Pending),
            details: Set(details),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(payment::Column::Id.eq(payment_id))
        .filter(payment::Column::Status.eq(PaymentStatus::Processing))
        .exec(conn)
        .await?;
    Ok(())
}

/// Fields written when a claim resolves.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub status: PaymentStatus,
    pub details: Value,
    pub amount: Option<Decimal>,
    pub captured_at: Option<DateTime<Utc>>,
}

/// Writes the outcome of a claim. Fails with a conflict if the claim was lost.
pub async fn resolve<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    resolution: Resolution,
) -> Result<payment::Model, ServiceError> {
    let mut update = payment::ActiveModel {
        status: Set(resolution.status),
        details: Set(resolution.details),
        updated_at: Set(Utc::now()),
        ..Default::default()
    };
    if let Some(amount) = resolution.amount {
        update.amount = Set(amount);
    }
    if let Some(captured_at) = resolution.captured_at {
        update.captured_at = Set(Some(captured_at));
    }

    let result = payment::Entity::update_many()
        .set(update)
        .filter(payment::Column::Id.eq(payment_id))
        .filter(payment::Column::Status.eq(PaymentStatus::Processing))
        .exec(conn)
        .await?;
    if result.rows_affected != 1 {
        return Err(ServiceError::Conflict(format!(
            "payment {} was no longer claimed",
            payment_id
        )));
    }
    get(conn, payment_id).await
}

/// Reserves one capture attempt on a paid, uncaptured payment and takes the
/// capture lease.
///
/// The increment only applies while the counter still equals `observed` and
/// no other capture holds a live lease, so a retry cannot overlap a capture
/// request that has not answered yet. A lease older than `lease_ttl` is
/// treated as abandoned.
pub async fn claim_capture<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    observed: i32,
    max_attempts: i32,
    lease_ttl: Duration,
) -> Result<bool, ServiceError> {
    if observed >= max_attempts {
        return Ok(false);
    }
    let now = Utc::now();
    let result = payment::Entity::update_many()
        .col_expr(payment::Column::CaptureAttempts, Expr::value(observed + 1))
        .col_expr(payment::Column::CaptureStartedAt, Expr::value(Some(now)))
        .col_expr(payment::Column::UpdatedAt, Expr::value(now))
        .filter(payment::Column::Id.eq(payment_id))
        .filter(payment::Column::Status.eq(PaymentStatus::Paid))
        .filter(payment::Column::CapturedAt.is_null())
        .filter(payment::Column::CaptureAttempts.eq(observed))
        .filter(
            Condition::any()
                .add(payment::Column::CaptureStartedAt.is_null())
                .add(payment::Column::CaptureStartedAt.lt(now - ttl(lease_ttl))),
        )
        .exec(conn)
        .await?;
    Ok(result.rows_affected == 1)
}

/// Drops the capture lease after a failed attempt and records the error.
pub async fn release_capture<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    details: Value,
) -> Result<(), ServiceError> {
    payment::Entity::update_many()
        .set(payment::ActiveModel {
            details: Set(details),
            capture_started_at: Set(None),
            updated_at: Set(Utc::now()),
            ..Default::default()
        })
        .filter(payment::Column::Id.eq(payment_id))
        .filter(payment::Column::CapturedAt.is_null())
        .exec(conn)
        .await?;
    Ok(())
}

/// Sets `captured_at` once and stores the provider-confirmed amount.
pub async fn mark_captured<C: ConnectionTrait>(
    conn: &C,
    payment_id: Uuid,
    amount: Decimal,
    details: Value,
) -> Result<payment::Model, ServiceError> {
    let now = Utc::now();
    payment::Entity::update_many()
        .set(payment::ActiveModel {
            amount: Set(amount),
            details: Set(details),
            captured_at: Set(Some(now)),
            capture_started_at: Set(None),
            updated_at: Set(now),
            ..Default::default()
        })
        .filter(payment::Column::Id.eq(payment_id))
        .filter(payment::Column::CapturedAt.is_null())
        .exec(conn)
        .await?;
    get(conn, payment_id).await
}

async fn get<C: ConnectionTrait>(conn: &C, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
    find(conn, payment_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
}

/// Shallow merge of `patch` into `details`; non-object details are replaced.
pub fn merge_details(details: &Value, patch: Map<String, Value>) -> Value {
    let mut merged = match details {
        Value::Object(map) => map.clone(),
        _ => Map::new(),
    };
    merged.extend(patch);
    Value::Object(merged)
}

fn ttl(duration: Duration) -> ChronoDuration {
    ChronoDuration::from_std(duration).unwrap_or_else(|_| ChronoDuration::seconds(120))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn merge_keeps_existing_keys() {
        let details = json!({"checkout_id": "abc", "integrity": "sha384-x"});
        let mut patch = Map::new();
        patch.insert("result_code".into(), json!("000.000.000"));
        patch.insert("integrity".into(), json!("sha384-y"));

        let merged = merge_details(&details, patch);
        assert_eq!(merged["checkout_id"], "abc");
        assert_eq!(merged["integrity"], "sha384-y");
        assert_eq!(merged["result_code"], "000.000.000");
    }

    #[test]
    fn merge_replaces_non_object_details() {
        let mut patch = Map::new();
        patch.insert("status_response".into(), json!({"status": "CLOSED"}));
        let merged = merge_details(&Value::Null, patch);
        assert_eq!(merged["status_response"]["status"], "CLOSED");
    }
}
