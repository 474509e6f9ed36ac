use chrono::{DateTime, Utc};
use conreg_core::{ChargeState, Contact, ContactForm, ReservationState, TransferKind};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipOfferView {
    pub membership: String,
    pub price_cents: i64,
    pub price: String,
    pub can_attend: bool,
    pub can_site_select: bool,
    pub can_nominate: bool,
    pub can_vote: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipListResponse {
    pub offers: Vec<MembershipOfferView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateReservationRequest {
    pub customer_email: String,
    pub offer: String,
    pub contact: ContactForm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationCreatedResponse {
    pub reservation_id: Uuid,
    pub membership_number: i64,
    pub membership: String,
    pub state: ReservationState,
    pub outstanding_cents: i64,
    pub outstanding: String,
    pub payment_amounts: Vec<i64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationSummary {
    pub membership_number: i64,
    pub membership: String,
    pub member_name: String,
    pub state: ReservationState,
    pub outstanding_cents: i64,
    pub outstanding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationListResponse {
    pub reservations: Vec<ReservationSummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeView {
    pub charge_id: Uuid,
    pub amount_cents: i64,
    pub amount: String,
    pub transfer: TransferKind,
    pub state: ChargeState,
    pub comment: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationDetailResponse {
    pub reservation_id: Uuid,
    pub membership_number: i64,
    pub membership: String,
    pub price_cents: i64,
    pub state: ReservationState,
    pub outstanding_cents: i64,
    pub outstanding: String,
    pub has_paid_supporting: bool,
    pub rights: Vec<String>,
    pub contact: Option<Contact>,
    pub charges: Vec<ChargeView>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationHistoryEntry {
    pub sequence: i64,
    pub kind: String,
    pub occurred_at: DateTime<Utc>,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationHistoryResponse {
    pub membership_number: i64,
    pub events: Vec<ReservationHistoryEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactUpdatedResponse {
    pub membership_number: i64,
    pub member_name: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub to_email: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferResponse {
    pub membership_number: i64,
    pub previous_holder: Option<String>,
    pub new_holder: String,
    pub transferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpgradeRequest {
    pub membership: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationStateResponse {
    pub membership_number: i64,
    pub state: ReservationState,
    pub outstanding_cents: i64,
    pub outstanding: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentOptionsResponse {
    pub membership_number: i64,
    pub outstanding_cents: i64,
    pub outstanding: String,
    pub amounts: Vec<i64>,
    pub amounts_display: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateChargeRequest {
    pub customer_email: String,
    pub amount_cents: i64,
    pub transfer: String,
    pub comment: String,
    pub provider_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeCreatedResponse {
    pub charge_id: Uuid,
    pub state: ChargeState,
    pub amount_cents: i64,
    pub outstanding_cents: i64,
    pub reservation_state: ReservationState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleChargeRequest {
    pub outcome: String,
    pub provider_ref: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SettleChargeResponse {
    pub charge_id: Uuid,
    pub state: ChargeState,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLoginRequest {
    pub token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenLoginResponse {
    pub user_id: Uuid,
    pub email: String,
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddCartItemRequest {
    pub customer_email: String,
    pub membership: String,
    pub contact: ContactForm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartItemView {
    pub cart_item_id: Uuid,
    pub membership: String,
    pub price_cents: i64,
    pub price: String,
    pub recipient: String,
    pub later: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CartResponse {
    pub items: Vec<CartItemView>,
    pub total_cents: i64,
    pub total: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub customer_email: String,
    #[serde(default = "default_payment_kind")]
    pub payment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckoutResponse {
    pub reservations: Vec<ReservationCreatedResponse>,
    pub total_cents: i64,
    pub total: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportSummaryResponse {
    pub rows: i64,
    pub created: i64,
    pub errors: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationCreatedEvent {
    pub reservation_id: Uuid,
    pub membership_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeSettledEvent {
    pub charge_id: Uuid,
    pub reservation_id: Uuid,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationPaidEvent {
    pub reservation_id: Uuid,
    pub membership_number: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReservationUpgradedEvent {
    pub reservation_id: Uuid,
    pub membership_number: i64,
    pub membership: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChequeRequestedEvent {
    pub reservation_id: Uuid,
    pub membership_number: i64,
    pub outstanding_cents: i64,
}

fn default_payment_kind() -> String {
    "online".to_string()
}
