use anyhow::{Context, Result};
use chrono::Utc;
use futures_util::StreamExt;
use redis::Msg;
use serde_json::json;
use sqlx::{PgPool, Row};
use tracing::{error, info};
use uuid::Uuid;

use conreg_core::{DomainEvent, DomainEventKind, ReservationState};
use conreg_eventstore::PgEventStore;
use conreg_payments::amount_owed;
use conreg_platform::{
    ChargeSettledEvent, RedisBus, ReservationPaidEvent, ServiceConfig, connect_database,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "conreg_ops=info".to_string()),
        )
        .init();

    let config = ServiceConfig::worker_from_env()?;
    let pool = connect_database(&config.database_url).await?;
    let redis = RedisBus::connect(&config.redis_url)?;

    let mut pubsub = redis.subscribe("charges.settled").await?;
    let mut messages = pubsub.on_message();

    info!("settlement worker subscribed to charges.settled");

    loop {
        let msg = messages
            .next()
            .await
            .context("charges.settled stream ended unexpectedly")?;
        if let Err(err) = handle_message(&pool, &redis, msg).await {
            error!("failed to process message: {err:#}");
        }
    }
}

async fn handle_message(pool: &PgPool, redis: &RedisBus, msg: Msg) -> Result<()> {
    let payload: String = msg.get_payload()?;
    let event: ChargeSettledEvent = serde_json::from_str(&payload)?;

    if let Some(paid) = roll_up_reservation(pool, event.reservation_id).await? {
        redis.publish_json("reservations.paid", &paid).await?;
        info!("reservation {} paid in full", paid.membership_number);
    }

    Ok(())
}

/// Flip an instalment reservation to paid once successful charges cover the
/// active tier's price. Idempotent: already-paid and disabled reservations
/// pass through untouched, so replayed events are harmless.
async fn roll_up_reservation(
    pool: &PgPool,
    reservation_id: Uuid,
) -> Result<Option<ReservationPaidEvent>> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(
        "SELECT membership_number, state FROM reservations WHERE id = $1 FOR UPDATE",
    )
    .bind(reservation_id)
    .fetch_optional(&mut *tx)
    .await?
    .context("reservation not found")?;

    let membership_number: i64 = row.try_get("membership_number")?;
    let state_raw: String = row.try_get("state")?;
    let state = ReservationState::parse(&state_raw)?;

    if state != ReservationState::Instalment {
        return Ok(None);
    }

    let price: i64 = sqlx::query_scalar(
        r#"
        SELECT m.price_cents
        FROM orders o
        JOIN memberships m ON m.id = o.membership_id
        WHERE o.reservation_id = $1 AND o.active
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(&mut *tx)
    .await?
    .context("reservation has no active order")?;

    let paid: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0)::BIGINT
        FROM charges
        WHERE reservation_id = $1 AND state = 'successful'
        "#,
    )
    .bind(reservation_id)
    .fetch_one(&mut *tx)
    .await?;

    if amount_owed(price, paid) > 0 {
        return Ok(None);
    }

    sqlx::query("UPDATE reservations SET state = $2, updated_at = $3 WHERE id = $1")
        .bind(reservation_id)
        .bind(ReservationState::Paid.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

    let event = DomainEvent::new(
        reservation_id,
        DomainEventKind::ReservationPaid,
        json!({ "membership_number": membership_number, "paid_cents": paid }),
    );
    PgEventStore::append_in_tx(&mut tx, &event).await?;

    tx.commit().await?;

    Ok(Some(ReservationPaidEvent {
        reservation_id,
        membership_number,
    }))
}
