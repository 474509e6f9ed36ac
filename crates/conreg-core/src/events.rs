use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::InvalidEnumValue;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum DomainEventKind {
    ReservationCreated,
    ClaimActivated,
    ClaimReleased,
    OrderActivated,
    OrderReleased,
    ChargeRecorded,
    ChargeSettled,
    ReservationPaid,
    ReservationDisabled,
}

impl DomainEventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            DomainEventKind::ReservationCreated => "ReservationCreated",
            DomainEventKind::ClaimActivated => "ClaimActivated",
            DomainEventKind::ClaimReleased => "ClaimReleased",
            DomainEventKind::OrderActivated => "OrderActivated",
            DomainEventKind::OrderReleased => "OrderReleased",
            DomainEventKind::ChargeRecorded => "ChargeRecorded",
            DomainEventKind::ChargeSettled => "ChargeSettled",
            DomainEventKind::ReservationPaid => "ReservationPaid",
            DomainEventKind::ReservationDisabled => "ReservationDisabled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "ReservationCreated" => Ok(DomainEventKind::ReservationCreated),
            "ClaimActivated" => Ok(DomainEventKind::ClaimActivated),
            "ClaimReleased" => Ok(DomainEventKind::ClaimReleased),
            "OrderActivated" => Ok(DomainEventKind::OrderActivated),
            "OrderReleased" => Ok(DomainEventKind::OrderReleased),
            "ChargeRecorded" => Ok(DomainEventKind::ChargeRecorded),
            "ChargeSettled" => Ok(DomainEventKind::ChargeSettled),
            "ReservationPaid" => Ok(DomainEventKind::ReservationPaid),
            "ReservationDisabled" => Ok(DomainEventKind::ReservationDisabled),
            other => Err(InvalidEnumValue {
                field: "event kind",
                value: other.to_string(),
            }),
        }
    }
}

/// One entry in a reservation's audit trail. The stream id is the
/// reservation id; payloads are small JSON documents naming the actors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainEvent {
    pub id: Uuid,
    pub aggregate_id: Uuid,
    pub kind: DomainEventKind,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

impl DomainEvent {
    pub fn new(aggregate_id: Uuid, kind: DomainEventKind, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            aggregate_id,
            kind,
            occurred_at: Utc::now(),
            payload,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_kind_round_trips() {
        let kinds = [
            DomainEventKind::ReservationCreated,
            DomainEventKind::ClaimActivated,
            DomainEventKind::ClaimReleased,
            DomainEventKind::OrderActivated,
            DomainEventKind::OrderReleased,
            DomainEventKind::ChargeRecorded,
            DomainEventKind::ChargeSettled,
            DomainEventKind::ReservationPaid,
            DomainEventKind::ReservationDisabled,
        ];
        for kind in kinds {
            assert_eq!(DomainEventKind::parse(kind.as_str()).unwrap(), kind);
        }
        assert!(DomainEventKind::parse("Unknown").is_err());
    }
}
