use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conreg_core::{DomainEvent, EventEnvelope, EventStore};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tokio::sync::RwLock;
use uuid::Uuid;

/// Audit log backed by the `reservation_events` table. Appends outside a
/// transaction go through [`EventStore::append`]; mutations that must land
/// atomically with their row changes use [`PgEventStore::append_in_tx`].
pub struct PgEventStore {
    pool: PgPool,
}

impl PgEventStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append inside an open transaction so the audit entry commits or rolls
    /// back together with the state change it records.
    pub async fn append_in_tx(
        tx: &mut Transaction<'_, Postgres>,
        event: &DomainEvent,
    ) -> anyhow::Result<i64> {
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO reservation_events (stream_id, kind, payload, stored_at)
            VALUES ($1, $2, $3, $4)
            RETURNING sequence
            "#,
        )
        .bind(event.aggregate_id)
        .bind(event.kind.as_str())
        .bind(serde_json::to_value(event)?)
        .bind(Utc::now())
        .fetch_one(&mut **tx)
        .await?;

        Ok(sequence)
    }
}

#[async_trait]
impl EventStore for PgEventStore {
    async fn append(&self, stream_id: Uuid, event: DomainEvent) -> anyhow::Result<EventEnvelope> {
        let stored_at = Utc::now();
        let sequence: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO reservation_events (stream_id, kind, payload, stored_at)
            VALUES ($1, $2, $3, $4)
            RETURNING sequence
            "#,
        )
        .bind(stream_id)
        .bind(event.kind.as_str())
        .bind(serde_json::to_value(&event)?)
        .bind(stored_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(EventEnvelope {
            sequence,
            stream_id,
            event,
            stored_at,
        })
    }

    async fn stream(&self, stream_id: Uuid) -> anyhow::Result<Vec<EventEnvelope>> {
        let rows = sqlx::query(
            r#"
            SELECT sequence, stream_id, payload, stored_at
            FROM reservation_events
            WHERE stream_id = $1
            ORDER BY sequence
            "#,
        )
        .bind(stream_id)
        .fetch_all(&self.pool)
        .await?;

        let mut envelopes = Vec::with_capacity(rows.len());
        for row in rows {
            let payload: serde_json::Value = row.try_get("payload")?;
            envelopes.push(EventEnvelope {
                sequence: row.try_get("sequence")?,
                stream_id: row.try_get("stream_id")?,
                event: serde_json::from_value(payload)?,
                stored_at: row.try_get::<DateTime<Utc>, _>("stored_at")?,
            });
        }

        Ok(envelopes)
    }
}

#[derive(Default)]
pub struct InMemoryEventStore {
    streams: RwLock<HashMap<Uuid, Vec<EventEnvelope>>>,
    sequence: RwLock<i64>,
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(&self, stream_id: Uuid, event: DomainEvent) -> anyhow::Result<EventEnvelope> {
        let mut sequence_guard = self.sequence.write().await;
        *sequence_guard += 1;

        let envelope = EventEnvelope {
            sequence: *sequence_guard,
            stream_id,
            event,
            stored_at: Utc::now(),
        };

        let mut streams = self.streams.write().await;
        streams.entry(stream_id).or_default().push(envelope.clone());

        Ok(envelope)
    }

    async fn stream(&self, stream_id: Uuid) -> anyhow::Result<Vec<EventEnvelope>> {
        let streams = self.streams.read().await;
        Ok(streams.get(&stream_id).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conreg_core::DomainEventKind;
    use serde_json::json;

    #[tokio::test]
    async fn sequences_increase_across_streams() {
        let store = InMemoryEventStore::default();
        let first_stream = Uuid::new_v4();
        let second_stream = Uuid::new_v4();

        let first = store
            .append(
                first_stream,
                DomainEvent::new(first_stream, DomainEventKind::ReservationCreated, json!({})),
            )
            .await
            .unwrap();
        let second = store
            .append(
                second_stream,
                DomainEvent::new(second_stream, DomainEventKind::ClaimActivated, json!({})),
            )
            .await
            .unwrap();

        assert!(second.sequence > first.sequence);
    }

    #[tokio::test]
    async fn streams_are_isolated_and_ordered() {
        let store = InMemoryEventStore::default();
        let stream_id = Uuid::new_v4();
        let other = Uuid::new_v4();

        for kind in [
            DomainEventKind::ReservationCreated,
            DomainEventKind::ClaimActivated,
            DomainEventKind::OrderActivated,
        ] {
            store
                .append(stream_id, DomainEvent::new(stream_id, kind, json!({})))
                .await
                .unwrap();
        }
        store
            .append(
                other,
                DomainEvent::new(other, DomainEventKind::ReservationCreated, json!({})),
            )
            .await
            .unwrap();

        let events = store.stream(stream_id).await.unwrap();
        assert_eq!(events.len(), 3);
        assert!(events.windows(2).all(|w| w[0].sequence < w[1].sequence));
        assert_eq!(
            events[0].event.kind,
            DomainEventKind::ReservationCreated
        );

        assert_eq!(store.stream(other).await.unwrap().len(), 1);
        assert!(store.stream(Uuid::new_v4()).await.unwrap().is_empty());
    }
}
