use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
#[error("'{value}' is not a valid {field}")]
pub struct InvalidEnumValue {
    pub field: &'static str,
    pub value: String,
}

/// Lifecycle state of a reservation. Rows are never deleted; `disabled` is an
/// administrative override that revokes transferability.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    Paid,
    Instalment,
    Disabled,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Paid => "paid",
            ReservationState::Instalment => "instalment",
            ReservationState::Disabled => "disabled",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "paid" => Ok(ReservationState::Paid),
            "instalment" => Ok(ReservationState::Instalment),
            "disabled" => Ok(ReservationState::Disabled),
            other => Err(InvalidEnumValue {
                field: "reservation state",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferKind {
    Stripe,
    Cash,
}

impl TransferKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferKind::Stripe => "stripe",
            TransferKind::Cash => "cash",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "stripe" => Ok(TransferKind::Stripe),
            "cash" => Ok(TransferKind::Cash),
            other => Err(InvalidEnumValue {
                field: "transfer",
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChargeState {
    Pending,
    Successful,
    Failed,
}

impl ChargeState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChargeState::Pending => "pending",
            ChargeState::Successful => "successful",
            ChargeState::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "pending" => Ok(ChargeState::Pending),
            "successful" => Ok(ChargeState::Successful),
            "failed" => Ok(ChargeState::Failed),
            other => Err(InvalidEnumValue {
                field: "charge state",
                value: other.to_string(),
            }),
        }
    }

    /// Terminal charges are immutable; only pending ones may settle.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ChargeState::Pending)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PublicationFormat {
    SendMeEmail,
    SendMePost,
    SendMeEmailAndPost,
    NoPaperPubs,
}

impl PublicationFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublicationFormat::SendMeEmail => "send_me_email",
            PublicationFormat::SendMePost => "send_me_post",
            PublicationFormat::SendMeEmailAndPost => "send_me_email_and_post",
            PublicationFormat::NoPaperPubs => "no_paper_pubs",
        }
    }

    pub fn parse(value: &str) -> Result<Self, InvalidEnumValue> {
        match value {
            "send_me_email" => Ok(PublicationFormat::SendMeEmail),
            "send_me_post" => Ok(PublicationFormat::SendMePost),
            "send_me_email_and_post" => Ok(PublicationFormat::SendMeEmailAndPost),
            "no_paper_pubs" => Ok(PublicationFormat::NoPaperPubs),
            other => Err(InvalidEnumValue {
                field: "publication format",
                value: other.to_string(),
            }),
        }
    }

    pub fn wants_email(&self) -> bool {
        matches!(
            self,
            PublicationFormat::SendMeEmail | PublicationFormat::SendMeEmailAndPost
        )
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CartItemKind {
    Membership,
}

impl CartItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CartItemKind::Membership => "membership",
        }
    }
}

/// A purchasable membership tier and the capabilities it grants.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Membership {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub can_attend: bool,
    pub can_site_select: bool,
    pub can_nominate: bool,
    pub can_vote: bool,
    pub active_from: DateTime<Utc>,
    pub active_to: Option<DateTime<Utc>>,
    pub display_order: i32,
}

impl Membership {
    /// A tier may only be offered inside its availability window.
    pub fn offered_at(&self, now: DateTime<Utc>) -> bool {
        if now < self.active_from {
            return false;
        }
        match self.active_to {
            Some(until) => now < until,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub id: Uuid,
    pub membership_number: i64,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reservation {
    pub fn paid(&self) -> bool {
        self.state == ReservationState::Paid
    }

    pub fn instalment(&self) -> bool {
        self.state == ReservationState::Instalment
    }

    pub fn disabled(&self) -> bool {
        self.state == ReservationState::Disabled
    }

    pub fn transferable(&self) -> bool {
        self.state != ReservationState::Disabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub id: Uuid,
    pub user_id: Uuid,
    pub reservation_id: Uuid,
    pub amount_cents: i64,
    pub transfer: TransferKind,
    pub state: ChargeState,
    pub comment: String,
    pub provider_ref: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Charge {
    pub fn stripe(&self) -> bool {
        self.transfer == TransferKind::Stripe
    }

    pub fn cash(&self) -> bool {
        self.transfer == TransferKind::Cash
    }

    pub fn successful(&self) -> bool {
        self.state == ChargeState::Successful
    }

    pub fn pending(&self) -> bool {
        self.state == ChargeState::Pending
    }

    pub fn failed(&self) -> bool {
        self.state == ChargeState::Failed
    }
}

/// Per-claim contact details as members enter them on the membership form.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub id: Uuid,
    pub claim_id: Uuid,
    pub title: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub preferred_first_name: Option<String>,
    pub preferred_last_name: Option<String>,
    pub badge_title: Option<String>,
    pub address_line_1: Option<String>,
    pub address_line_2: Option<String>,
    pub city: Option<String>,
    pub province: Option<String>,
    pub postal: Option<String>,
    pub country: Option<String>,
    pub email: Option<String>,
    pub publication_format: PublicationFormat,
    pub show_in_listings: bool,
    pub share_with_future_conventions: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contact {
    /// Preferred name when present, legal name otherwise.
    pub fn display_name(&self) -> String {
        let preferred = join_names(&[&self.preferred_first_name, &self.preferred_last_name]);
        if !preferred.is_empty() {
            return preferred;
        }
        self.legal_name()
    }

    pub fn legal_name(&self) -> String {
        join_names(&[&self.title, &self.first_name, &self.last_name])
    }
}

fn join_names(parts: &[&Option<String>]) -> String {
    let joined: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.as_deref())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    joined.join(" ")
}

/// A pending, not-yet-paid intent to acquire a membership for a recipient.
/// Carries the recipient's contact form as a snapshot; destroyed on checkout
/// or explicit removal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItem {
    pub id: Uuid,
    pub user_id: Uuid,
    pub membership_id: Uuid,
    pub kind: CartItemKind,
    pub price_cents: i64,
    pub contact: crate::validate::ContactForm,
    pub later: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_state_round_trips() {
        for state in ["paid", "instalment", "disabled"] {
            assert_eq!(ReservationState::parse(state).unwrap().as_str(), state);
        }
        assert!(ReservationState::parse("cancelled").is_err());
    }

    #[test]
    fn disabled_reservations_are_not_transferable() {
        let reservation = Reservation {
            id: Uuid::new_v4(),
            membership_number: 100,
            state: ReservationState::Disabled,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(!reservation.transferable());
        assert!(reservation.disabled());
    }

    #[test]
    fn terminal_charge_states() {
        assert!(!ChargeState::Pending.is_terminal());
        assert!(ChargeState::Successful.is_terminal());
        assert!(ChargeState::Failed.is_terminal());
    }

    #[test]
    fn display_name_prefers_preferred_names() {
        let mut contact = Contact {
            id: Uuid::new_v4(),
            claim_id: Uuid::new_v4(),
            title: Some("Dr".to_string()),
            first_name: Some("Ursula".to_string()),
            last_name: Some("Vernon".to_string()),
            preferred_first_name: Some("T".to_string()),
            preferred_last_name: Some("Kingfisher".to_string()),
            badge_title: None,
            address_line_1: None,
            address_line_2: None,
            city: None,
            province: None,
            postal: None,
            country: None,
            email: None,
            publication_format: PublicationFormat::NoPaperPubs,
            show_in_listings: true,
            share_with_future_conventions: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert_eq!(contact.display_name(), "T Kingfisher");

        contact.preferred_first_name = None;
        contact.preferred_last_name = None;
        assert_eq!(contact.display_name(), "Dr Ursula Vernon");
    }

    #[test]
    fn tier_availability_window() {
        let now = Utc::now();
        let membership = Membership {
            id: Uuid::new_v4(),
            name: "adult".to_string(),
            price_cents: 340_00,
            can_attend: true,
            can_site_select: true,
            can_nominate: true,
            can_vote: true,
            active_from: now - chrono::Duration::days(7),
            active_to: None,
            display_order: 0,
        };
        assert!(membership.offered_at(now));
        assert!(!membership.offered_at(now - chrono::Duration::days(8)));
    }
}
