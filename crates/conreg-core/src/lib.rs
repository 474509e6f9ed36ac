pub mod events;
pub mod models;
pub mod money;
pub mod storage;
pub mod validate;

pub use events::{DomainEvent, DomainEventKind};
pub use models::{
    CartItem, CartItemKind, Charge, ChargeState, Contact, InvalidEnumValue, Membership,
    PublicationFormat, Reservation, ReservationState, TransferKind,
};
pub use money::{cents_to_decimal, format_usd};
pub use storage::{EventEnvelope, EventStore};
pub use validate::{validate_contact, ContactForm, ContactMode, FieldError, ValidationErrors};
