pub mod config;
pub mod contracts;
pub mod db;
pub mod redis_bus;

pub use config::{RegistrationConfig, ServiceConfig};
pub use contracts::{
    AddCartItemRequest, CartItemView, CartResponse, ChargeCreatedResponse, ChargeSettledEvent,
    ChargeView, ChequeRequestedEvent, CheckoutRequest, CheckoutResponse, ContactUpdatedResponse,
    CreateChargeRequest,
    CreateReservationRequest, ImportSummaryResponse, MembershipListResponse, MembershipOfferView,
    PaymentOptionsResponse,
    ReservationCreatedEvent, ReservationCreatedResponse, ReservationDetailResponse,
    ReservationHistoryEntry, ReservationHistoryResponse, ReservationListResponse,
    ReservationPaidEvent, ReservationStateResponse, ReservationSummary, ReservationUpgradedEvent,
    SettleChargeRequest, SettleChargeResponse, TokenLoginRequest, TokenLoginResponse,
    TransferRequest, TransferResponse, UpgradeRequest,
};
pub use db::connect_database;
pub use redis_bus::RedisBus;
