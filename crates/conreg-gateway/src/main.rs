use std::{net::SocketAddr, sync::Arc};

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{delete, get, patch, post, put},
};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode, errors::ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sqlx::{PgPool, Postgres, Row, Transaction, postgres::PgRow};
use tracing::{error, info};
use uuid::Uuid;

use conreg_core::{
    CartItem, CartItemKind, Charge, ChargeState, Contact, ContactForm, ContactMode, DomainEvent,
    DomainEventKind, EventStore, Membership, PublicationFormat, ReservationState, TransferKind,
    format_usd, validate_contact,
};
use conreg_entitlements::active_rights;
use conreg_eventstore::PgEventStore;
use conreg_payments::{amount_owed, has_paid_supporting, paid_cents, payment_amount_options};
use conreg_platform::{
    AddCartItemRequest, CartItemView, CartResponse, ChargeCreatedResponse, ChargeSettledEvent,
    ChargeView, ChequeRequestedEvent, CheckoutRequest, CheckoutResponse, ContactUpdatedResponse,
    CreateChargeRequest, CreateReservationRequest, MembershipListResponse, MembershipOfferView,
    PaymentOptionsResponse, RedisBus, RegistrationConfig, ReservationCreatedEvent,
    ReservationCreatedResponse, ReservationDetailResponse, ReservationHistoryEntry,
    ReservationHistoryResponse, ReservationListResponse, ReservationStateResponse,
    ReservationSummary, ReservationUpgradedEvent, ServiceConfig, SettleChargeRequest,
    SettleChargeResponse, TokenLoginRequest, TokenLoginResponse, TransferRequest,
    TransferResponse, UpgradeRequest, connect_database,
};

/// Paths a login token may redirect to. Anything else falls back to the
/// default location.
const REDIRECT_PATH_LIST: [&str; 2] = ["/reservations/new?", "/reservations"];
const DEFAULT_REDIRECT_PATH: &str = "/reservations";

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    redis: RedisBus,
    registration: RegistrationConfig,
    events: Arc<PgEventStore>,
}

#[derive(Debug, Clone, Deserialize)]
struct CustomerQuery {
    customer_email: String,
}

/// Claims carried by a signed login token.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TokenClaims {
    email: String,
    #[serde(default)]
    path: Option<String>,
    exp: i64,
}

struct ClaimedReservation {
    reservation_id: Uuid,
    membership_number: i64,
    state: ReservationState,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "conreg_gateway=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8080")?;
    let registration = RegistrationConfig::from_env()?;
    let pool = connect_database(&config.database_url).await?;
    let redis = RedisBus::connect(&config.redis_url)?;
    let events = Arc::new(PgEventStore::new(pool.clone()));

    let state = AppState {
        pool,
        redis,
        registration,
        events,
    };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/memberships", get(list_memberships))
        .route("/login/token", post(token_login))
        .route("/reservations", get(list_reservations).post(create_reservation))
        .route("/reservations/{membership_number}", get(show_reservation))
        .route(
            "/reservations/{membership_number}/history",
            get(reservation_history),
        )
        .route(
            "/reservations/{membership_number}/contact",
            put(update_contact),
        )
        .route(
            "/reservations/{membership_number}/transfer",
            post(transfer_reservation),
        )
        .route(
            "/reservations/{membership_number}/upgrade",
            post(upgrade_reservation),
        )
        .route(
            "/reservations/{membership_number}/disable",
            post(disable_reservation),
        )
        .route(
            "/reservations/{membership_number}/cheque",
            post(reserve_with_cheque),
        )
        .route(
            "/reservations/{membership_number}/payment-options",
            get(payment_options),
        )
        .route(
            "/reservations/{membership_number}/charges",
            post(create_charge),
        )
        .route("/charges/{charge_id}/settle", post(settle_charge))
        .route("/cart", get(show_cart).delete(empty_cart))
        .route("/cart/items", post(add_cart_item))
        .route("/cart/items/{item_id}", delete(remove_cart_item))
        .route(
            "/cart/items/{item_id}/save-for-later",
            patch(save_cart_item_for_later),
        )
        .route("/cart/items/{item_id}/activate", patch(activate_cart_item))
        .route("/cart/checkout", post(checkout_cart))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("gateway listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn list_memberships(
    State(state): State<AppState>,
) -> Result<Json<MembershipListResponse>, (StatusCode, String)> {
    let now = Utc::now();
    let rows = sqlx::query(
        r#"
        SELECT id, name, price_cents, can_attend, can_site_select, can_nominate, can_vote,
               active_from, active_to, display_order
        FROM memberships
        WHERE active_from <= $1 AND (active_to IS NULL OR active_to > $1)
        ORDER BY display_order, name
        "#,
    )
    .bind(now)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut offers = Vec::with_capacity(rows.len());
    for row in rows {
        let membership = membership_from_row(&row).map_err(internal_error)?;
        offers.push(MembershipOfferView {
            membership: membership.name,
            price_cents: membership.price_cents,
            price: format_usd(membership.price_cents),
            can_attend: membership.can_attend,
            can_site_select: membership.can_site_select,
            can_nominate: membership.can_nominate,
            can_vote: membership.can_vote,
        });
    }

    Ok(Json(MembershipListResponse { offers }))
}

async fn create_reservation(
    State(state): State<AppState>,
    Json(payload): Json<CreateReservationRequest>,
) -> Result<(StatusCode, Json<ReservationCreatedResponse>), (StatusCode, String)> {
    let format = validate_contact(&payload.contact, ContactMode::Member)
        .map_err(|errors| (StatusCode::UNPROCESSABLE_ENTITY, errors.to_string()))?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let membership = lookup_offered_membership(&mut tx, &payload.offer).await?;
    let (user_id, user_email) = find_or_create_user(&mut tx, &payload.customer_email)
        .await
        .map_err(invalid_request)?;

    let claimed = claim_membership(
        &mut tx,
        user_id,
        &user_email,
        &membership,
        Some((&payload.contact, format)),
    )
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    publish_reservation_created(&state, &claimed).await;

    let outstanding = match claimed.state {
        ReservationState::Paid => 0,
        _ => membership.price_cents,
    };

    Ok((
        StatusCode::CREATED,
        Json(ReservationCreatedResponse {
            reservation_id: claimed.reservation_id,
            membership_number: claimed.membership_number,
            membership: membership.name,
            state: claimed.state,
            outstanding_cents: outstanding,
            outstanding: format_usd(outstanding),
            payment_amounts: payment_amount_options(outstanding),
        }),
    ))
}

async fn list_reservations(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<ReservationListResponse>, (StatusCode, String)> {
    let email = normalize_email(&query.customer_email).map_err(invalid_request)?;

    let rows = sqlx::query(
        r#"
        SELECT r.membership_number, r.state, m.name AS membership, m.price_cents,
               COALESCE((SELECT SUM(ch.amount_cents) FROM charges ch
                         WHERE ch.reservation_id = r.id AND ch.state = 'successful'), 0)::BIGINT
                   AS paid_cents,
               u.email,
               ct.title, ct.first_name, ct.last_name,
               ct.preferred_first_name, ct.preferred_last_name
        FROM reservations r
        JOIN claims c ON c.reservation_id = r.id AND c.active
        JOIN users u ON u.id = c.user_id
        JOIN orders o ON o.reservation_id = r.id AND o.active
        JOIN memberships m ON m.id = o.membership_id
        LEFT JOIN contacts ct ON ct.claim_id = c.id
        WHERE u.email = $1
        ORDER BY r.membership_number
        "#,
    )
    .bind(&email)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut reservations = Vec::with_capacity(rows.len());
    for row in rows {
        let state_raw: String = row.try_get("state").map_err(internal_error)?;
        let reservation_state =
            ReservationState::parse(&state_raw).map_err(internal_error)?;
        let price_cents: i64 = row.try_get("price_cents").map_err(internal_error)?;
        let paid: i64 = row.try_get("paid_cents").map_err(internal_error)?;
        let outstanding = amount_owed(price_cents, paid);

        let member_name = member_display_name(
            row.try_get("title").map_err(internal_error)?,
            row.try_get("first_name").map_err(internal_error)?,
            row.try_get("last_name").map_err(internal_error)?,
            row.try_get("preferred_first_name").map_err(internal_error)?,
            row.try_get("preferred_last_name").map_err(internal_error)?,
            row.try_get("email").map_err(internal_error)?,
        );

        reservations.push(ReservationSummary {
            membership_number: row.try_get("membership_number").map_err(internal_error)?,
            membership: row.try_get("membership").map_err(internal_error)?,
            member_name,
            state: reservation_state,
            outstanding_cents: outstanding,
            outstanding: format_usd(outstanding),
        });
    }

    Ok(Json(ReservationListResponse { reservations }))
}

async fn show_reservation(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
) -> Result<Json<ReservationDetailResponse>, (StatusCode, String)> {
    let (reservation_id, reservation_state) =
        lookup_reservation(&state.pool, membership_number).await?;

    let active = sqlx::query(
        r#"
        SELECT m.id, m.name, m.price_cents, m.can_attend, m.can_site_select,
               m.can_nominate, m.can_vote, m.active_from, m.active_to, m.display_order
        FROM orders o
        JOIN memberships m ON m.id = o.membership_id
        WHERE o.reservation_id = $1 AND o.active
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "reservation has no active order".to_string(),
        )
    })?;
    let active_membership = membership_from_row(&active).map_err(internal_error)?;

    let held = memberships_ever_held(&state.pool, reservation_id)
        .await
        .map_err(internal_error)?;

    let charges = fetch_charges(&state.pool, reservation_id)
        .await
        .map_err(internal_error)?;
    let outstanding = amount_owed(active_membership.price_cents, paid_cents(&charges));

    let contact = fetch_active_contact(&state.pool, reservation_id)
        .await
        .map_err(internal_error)?;

    let rights = active_rights(&held, Utc::now(), &state.registration.award_cycle)
        .iter()
        .map(|right| right.as_str().to_string())
        .collect();

    let charge_views = charges
        .iter()
        .map(|charge| ChargeView {
            charge_id: charge.id,
            amount_cents: charge.amount_cents,
            amount: format_usd(charge.amount_cents),
            transfer: charge.transfer,
            state: charge.state,
            comment: charge.comment.clone(),
            created_at: charge.created_at,
        })
        .collect();

    Ok(Json(ReservationDetailResponse {
        reservation_id,
        membership_number,
        membership: active_membership.name,
        price_cents: active_membership.price_cents,
        state: reservation_state,
        outstanding_cents: outstanding,
        outstanding: format_usd(outstanding),
        has_paid_supporting: has_paid_supporting(&charges),
        rights,
        contact,
        charges: charge_views,
    }))
}

async fn reservation_history(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
) -> Result<Json<ReservationHistoryResponse>, (StatusCode, String)> {
    let (reservation_id, _) = lookup_reservation(&state.pool, membership_number).await?;

    let envelopes = state
        .events
        .stream(reservation_id)
        .await
        .map_err(internal_error)?;

    let events = envelopes
        .into_iter()
        .map(|envelope| ReservationHistoryEntry {
            sequence: envelope.sequence,
            kind: envelope.event.kind.as_str().to_string(),
            occurred_at: envelope.event.occurred_at,
            payload: envelope.event.payload,
        })
        .collect();

    Ok(Json(ReservationHistoryResponse {
        membership_number,
        events,
    }))
}

async fn update_contact(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
    Json(payload): Json<ContactForm>,
) -> Result<Json<ContactUpdatedResponse>, (StatusCode, String)> {
    let format = validate_contact(&payload, ContactMode::Member)
        .map_err(|errors| (StatusCode::UNPROCESSABLE_ENTITY, errors.to_string()))?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let claim_id: Uuid = sqlx::query_scalar(
        r#"
        SELECT c.id
        FROM claims c
        JOIN reservations r ON r.id = c.reservation_id
        WHERE r.membership_number = $1 AND c.active
        "#,
    )
    .bind(membership_number)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| (StatusCode::NOT_FOUND, "reservation not found".to_string()))?;

    let now = Utc::now();
    upsert_contact(&mut tx, claim_id, &payload, format, true)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    let member_name = member_display_name(
        clean(&payload.title),
        clean(&payload.first_name),
        clean(&payload.last_name),
        clean(&payload.preferred_first_name),
        clean(&payload.preferred_last_name),
        String::new(),
    );

    Ok(Json(ContactUpdatedResponse {
        membership_number,
        member_name,
        updated_at: now,
    }))
}

async fn transfer_reservation(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
    Json(payload): Json<TransferRequest>,
) -> Result<Json<TransferResponse>, (StatusCode, String)> {
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let (reservation_id, reservation_state) =
        lock_reservation(&mut tx, membership_number).await?;

    if reservation_state == ReservationState::Disabled {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "reservation is disabled and cannot be transferred".to_string(),
        ));
    }

    let (new_user_id, new_email) = find_or_create_user(&mut tx, &payload.to_email)
        .await
        .map_err(invalid_request)?;

    let previous_holder: Option<String> = sqlx::query_scalar(
        r#"
        SELECT u.email
        FROM claims c
        JOIN users u ON u.id = c.user_id
        WHERE c.reservation_id = $1 AND c.active
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?;

    let now = Utc::now();
    sqlx::query(
        "UPDATE claims SET active = FALSE, deactivated_at = $2 WHERE reservation_id = $1 AND active",
    )
    .bind(reservation_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    if let Err(err) = sqlx::query(
        r#"
        INSERT INTO claims (id, reservation_id, user_id, active, created_at)
        VALUES ($1, $2, $3, TRUE, $4)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(reservation_id)
    .bind(new_user_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    {
        if is_unique_violation(&err) {
            return Err((
                StatusCode::CONFLICT,
                "another transfer is in flight for this reservation; re-read and retry"
                    .to_string(),
            ));
        }
        error!("failed to insert claim: {err}");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to transfer reservation".to_string(),
        ));
    }

    if let Some(previous) = &previous_holder {
        record_event(
            &mut tx,
            reservation_id,
            DomainEventKind::ClaimReleased,
            json!({ "user": previous }),
        )
        .await
        .map_err(internal_error)?;
    }
    record_event(
        &mut tx,
        reservation_id,
        DomainEventKind::ClaimActivated,
        json!({ "user": new_email }),
    )
    .await
    .map_err(internal_error)?;

    sqlx::query("UPDATE reservations SET updated_at = $2 WHERE id = $1")
        .bind(reservation_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok(Json(TransferResponse {
        membership_number,
        previous_holder,
        new_holder: new_email,
        transferred_at: now,
    }))
}

async fn upgrade_reservation(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
    Json(payload): Json<UpgradeRequest>,
) -> Result<Json<ReservationStateResponse>, (StatusCode, String)> {
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let (reservation_id, reservation_state) =
        lock_reservation(&mut tx, membership_number).await?;

    if reservation_state == ReservationState::Disabled {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "reservation is disabled and cannot be upgraded".to_string(),
        ));
    }

    let current = sqlx::query(
        r#"
        SELECT m.id AS membership_id, m.name, m.price_cents
        FROM orders o
        JOIN memberships m ON m.id = o.membership_id
        WHERE o.reservation_id = $1 AND o.active
        FOR UPDATE OF o
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "reservation has no active order".to_string(),
        )
    })?;
    let current_membership_id: Uuid = current.try_get("membership_id").map_err(internal_error)?;
    let current_name: String = current.try_get("name").map_err(internal_error)?;
    let current_price: i64 = current.try_get("price_cents").map_err(internal_error)?;

    let target = lookup_offered_membership(&mut tx, &payload.membership).await?;

    if target.id == current_membership_id {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("reservation already holds a {current_name} membership"),
        ));
    }
    if target.price_cents < current_price {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "cannot change {} ({}) to the cheaper {} ({})",
                current_name,
                format_usd(current_price),
                target.name,
                format_usd(target.price_cents)
            ),
        ));
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE orders SET active = FALSE, deactivated_at = $2 WHERE reservation_id = $1 AND active",
    )
    .bind(reservation_id)
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    if let Err(err) = sqlx::query(
        r#"
        INSERT INTO orders (id, reservation_id, membership_id, active, created_at)
        VALUES ($1, $2, $3, TRUE, $4)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(reservation_id)
    .bind(target.id)
    .bind(now)
    .execute(&mut *tx)
    .await
    {
        if is_unique_violation(&err) {
            return Err((
                StatusCode::CONFLICT,
                "another upgrade is in flight for this reservation; re-read and retry".to_string(),
            ));
        }
        error!("failed to insert order: {err}");
        return Err((
            StatusCode::INTERNAL_SERVER_ERROR,
            "failed to upgrade reservation".to_string(),
        ));
    }

    record_event(
        &mut tx,
        reservation_id,
        DomainEventKind::OrderReleased,
        json!({ "membership": current_name }),
    )
    .await
    .map_err(internal_error)?;
    record_event(
        &mut tx,
        reservation_id,
        DomainEventKind::OrderActivated,
        json!({ "membership": target.name }),
    )
    .await
    .map_err(internal_error)?;

    let paid = successful_charge_total(&mut tx, reservation_id)
        .await
        .map_err(internal_error)?;
    let outstanding = amount_owed(target.price_cents, paid);
    let new_state = if outstanding <= 0 {
        ReservationState::Paid
    } else {
        ReservationState::Instalment
    };

    sqlx::query("UPDATE reservations SET state = $2, updated_at = $3 WHERE id = $1")
        .bind(reservation_id)
        .bind(new_state.as_str())
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    let event = ReservationUpgradedEvent {
        reservation_id,
        membership_number,
        membership: target.name.clone(),
    };
    if let Err(err) = state.redis.publish_json("reservations.upgraded", &event).await {
        error!("failed to publish upgrade event: {err}");
    }

    Ok(Json(ReservationStateResponse {
        membership_number,
        state: new_state,
        outstanding_cents: outstanding,
        outstanding: format_usd(outstanding),
    }))
}

async fn disable_reservation(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
) -> Result<Json<ReservationStateResponse>, (StatusCode, String)> {
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let (reservation_id, reservation_state) =
        lock_reservation(&mut tx, membership_number).await?;

    if reservation_state != ReservationState::Disabled {
        sqlx::query("UPDATE reservations SET state = $2, updated_at = $3 WHERE id = $1")
            .bind(reservation_id)
            .bind(ReservationState::Disabled.as_str())
            .bind(Utc::now())
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;

        record_event(
            &mut tx,
            reservation_id,
            DomainEventKind::ReservationDisabled,
            json!({ "membership_number": membership_number }),
        )
        .await
        .map_err(internal_error)?;
    }

    let outstanding = outstanding_in_tx(&mut tx, reservation_id).await?;
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(ReservationStateResponse {
        membership_number,
        state: ReservationState::Disabled,
        outstanding_cents: outstanding,
        outstanding: format_usd(outstanding),
    }))
}

async fn reserve_with_cheque(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
) -> Result<Json<ReservationStateResponse>, (StatusCode, String)> {
    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let (reservation_id, reservation_state) =
        lock_reservation(&mut tx, membership_number).await?;

    if reservation_state == ReservationState::Disabled {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "reservation is disabled".to_string(),
        ));
    }

    let outstanding = outstanding_in_tx(&mut tx, reservation_id).await?;
    if outstanding <= 0 {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "reservation is already paid in full".to_string(),
        ));
    }

    sqlx::query("UPDATE reservations SET state = $2, updated_at = $3 WHERE id = $1")
        .bind(reservation_id)
        .bind(ReservationState::Instalment.as_str())
        .bind(Utc::now())
        .execute(&mut *tx)
        .await
        .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    let event = ChequeRequestedEvent {
        reservation_id,
        membership_number,
        outstanding_cents: outstanding,
    };
    if let Err(err) = state
        .redis
        .publish_json("payments.cheque_requested", &event)
        .await
    {
        error!("failed to publish cheque event: {err}");
    }

    Ok(Json(ReservationStateResponse {
        membership_number,
        state: ReservationState::Instalment,
        outstanding_cents: outstanding,
        outstanding: format_usd(outstanding),
    }))
}

async fn payment_options(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
) -> Result<Json<PaymentOptionsResponse>, (StatusCode, String)> {
    let (reservation_id, _) = lookup_reservation(&state.pool, membership_number).await?;

    let charges = fetch_charges(&state.pool, reservation_id)
        .await
        .map_err(internal_error)?;
    let price = active_price(&state.pool, reservation_id)
        .await
        .map_err(internal_error)?;
    let outstanding = amount_owed(price, paid_cents(&charges));
    let amounts = payment_amount_options(outstanding);

    Ok(Json(PaymentOptionsResponse {
        membership_number,
        outstanding_cents: outstanding,
        outstanding: format_usd(outstanding),
        amounts_display: amounts.iter().map(|amount| format_usd(*amount)).collect(),
        amounts,
    }))
}

async fn create_charge(
    State(state): State<AppState>,
    Path(membership_number): Path<i64>,
    Json(payload): Json<CreateChargeRequest>,
) -> Result<(StatusCode, Json<ChargeCreatedResponse>), (StatusCode, String)> {
    let transfer = validate_charge_request(&payload).map_err(invalid_request)?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let (reservation_id, reservation_state) =
        lock_reservation(&mut tx, membership_number).await?;

    let outstanding = outstanding_in_tx(&mut tx, reservation_id).await?;
    if outstanding <= 0 {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            "reservation has no outstanding balance".to_string(),
        ));
    }

    let options = payment_amount_options(outstanding);
    if !options.contains(&payload.amount_cents) {
        let allowed: Vec<String> = options.iter().map(|amount| format_usd(*amount)).collect();
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!(
                "{} is not an allowed payment amount; choose one of {}",
                format_usd(payload.amount_cents),
                allowed.join(", ")
            ),
        ));
    }

    let (user_id, _) = find_or_create_user(&mut tx, &payload.customer_email)
        .await
        .map_err(invalid_request)?;

    let charge_state = match transfer {
        TransferKind::Cash => ChargeState::Successful,
        TransferKind::Stripe => ChargeState::Pending,
    };
    let charge_id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO charges (
            id, user_id, reservation_id, amount_cents, transfer, state, comment,
            provider_ref, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
        "#,
    )
    .bind(charge_id)
    .bind(user_id)
    .bind(reservation_id)
    .bind(payload.amount_cents)
    .bind(transfer.as_str())
    .bind(charge_state.as_str())
    .bind(payload.comment.trim())
    .bind(payload.provider_ref.as_deref().map(str::trim))
    .bind(now)
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    record_event(
        &mut tx,
        reservation_id,
        DomainEventKind::ChargeRecorded,
        json!({
            "charge_id": charge_id,
            "amount_cents": payload.amount_cents,
            "transfer": transfer.as_str(),
            "state": charge_state.as_str(),
        }),
    )
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    if charge_state == ChargeState::Successful {
        publish_charge_settled(&state, charge_id, reservation_id).await;
    }

    let remaining = match charge_state {
        ChargeState::Successful => outstanding - payload.amount_cents,
        _ => outstanding,
    };

    Ok((
        StatusCode::CREATED,
        Json(ChargeCreatedResponse {
            charge_id,
            state: charge_state,
            amount_cents: payload.amount_cents,
            outstanding_cents: remaining,
            reservation_state,
        }),
    ))
}

async fn settle_charge(
    State(state): State<AppState>,
    Path(charge_id): Path<Uuid>,
    Json(payload): Json<SettleChargeRequest>,
) -> Result<Json<SettleChargeResponse>, (StatusCode, String)> {
    let outcome = ChargeState::parse(payload.outcome.trim())
        .map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?;
    if !outcome.is_terminal() {
        return Err((
            StatusCode::BAD_REQUEST,
            "outcome must be successful or failed".to_string(),
        ));
    }

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let row = sqlx::query("SELECT reservation_id, state FROM charges WHERE id = $1 FOR UPDATE")
        .bind(charge_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "charge not found".to_string()))?;

    let reservation_id: Uuid = row.try_get("reservation_id").map_err(internal_error)?;
    let state_raw: String = row.try_get("state").map_err(internal_error)?;
    let current = ChargeState::parse(&state_raw).map_err(internal_error)?;

    // Terminal charges are immutable.
    if current.is_terminal() {
        return Err((
            StatusCode::CONFLICT,
            format!("charge is already {state_raw} and cannot change"),
        ));
    }

    sqlx::query(
        r#"
        UPDATE charges
        SET state = $2, provider_ref = COALESCE($3, provider_ref), updated_at = $4
        WHERE id = $1
        "#,
    )
    .bind(charge_id)
    .bind(outcome.as_str())
    .bind(payload.provider_ref.as_deref().map(str::trim))
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    record_event(
        &mut tx,
        reservation_id,
        DomainEventKind::ChargeSettled,
        json!({ "charge_id": charge_id, "outcome": outcome.as_str() }),
    )
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    if outcome == ChargeState::Successful {
        publish_charge_settled(&state, charge_id, reservation_id).await;
    }

    Ok(Json(SettleChargeResponse {
        charge_id,
        state: outcome,
    }))
}

async fn token_login(
    State(state): State<AppState>,
    Json(payload): Json<TokenLoginRequest>,
) -> Result<Json<TokenLoginResponse>, (StatusCode, String)> {
    if payload.token.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "missing token".to_string()));
    }

    let claims = decode_login_token(payload.token.trim(), &state.registration.token_secret)?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;
    let (user_id, email) = find_or_create_user(&mut tx, &claims.email)
        .await
        .map_err(invalid_request)?;
    tx.commit().await.map_err(internal_error)?;

    Ok(Json(TokenLoginResponse {
        user_id,
        email,
        path: redirect_path(claims.path.as_deref()),
    }))
}

async fn add_cart_item(
    State(state): State<AppState>,
    Json(payload): Json<AddCartItemRequest>,
) -> Result<(StatusCode, Json<CartItemView>), (StatusCode, String)> {
    validate_contact(&payload.contact, ContactMode::Member)
        .map_err(|errors| (StatusCode::UNPROCESSABLE_ENTITY, errors.to_string()))?;

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let membership = lookup_offered_membership(&mut tx, &payload.membership).await?;
    let (user_id, _) = find_or_create_user(&mut tx, &payload.customer_email)
        .await
        .map_err(invalid_request)?;

    let item_id = Uuid::new_v4();
    let contact_snapshot = serde_json::to_value(&payload.contact).map_err(internal_error)?;
    sqlx::query(
        r#"
        INSERT INTO cart_items (id, user_id, membership_id, kind, price_cents, contact, later, created_at)
        VALUES ($1, $2, $3, $4, $5, $6, FALSE, $7)
        "#,
    )
    .bind(item_id)
    .bind(user_id)
    .bind(membership.id)
    .bind(CartItemKind::Membership.as_str())
    .bind(membership.price_cents)
    .bind(contact_snapshot)
    .bind(Utc::now())
    .execute(&mut *tx)
    .await
    .map_err(internal_error)?;

    tx.commit().await.map_err(internal_error)?;

    Ok((
        StatusCode::CREATED,
        Json(CartItemView {
            cart_item_id: item_id,
            membership: membership.name,
            price_cents: membership.price_cents,
            price: format_usd(membership.price_cents),
            recipient: recipient_name(&payload.contact),
            later: false,
        }),
    ))
}

async fn show_cart(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> Result<Json<CartResponse>, (StatusCode, String)> {
    let email = normalize_email(&query.customer_email).map_err(invalid_request)?;

    let rows = sqlx::query(
        r#"
        SELECT ci.id, ci.user_id, ci.membership_id, ci.price_cents, ci.contact, ci.later,
               ci.created_at, m.name AS membership
        FROM cart_items ci
        JOIN memberships m ON m.id = ci.membership_id
        JOIN users u ON u.id = ci.user_id
        WHERE u.email = $1
        ORDER BY ci.created_at
        "#,
    )
    .bind(&email)
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut items = Vec::with_capacity(rows.len());
    let mut total_cents = 0;
    for row in rows {
        let contact_raw: serde_json::Value = row.try_get("contact").map_err(internal_error)?;
        let item = CartItem {
            id: row.try_get("id").map_err(internal_error)?,
            user_id: row.try_get("user_id").map_err(internal_error)?,
            membership_id: row.try_get("membership_id").map_err(internal_error)?,
            kind: CartItemKind::Membership,
            price_cents: row.try_get("price_cents").map_err(internal_error)?,
            contact: serde_json::from_value(contact_raw).map_err(internal_error)?,
            later: row.try_get("later").map_err(internal_error)?,
            created_at: row.try_get("created_at").map_err(internal_error)?,
        };
        if !item.later {
            total_cents += item.price_cents;
        }
        items.push(CartItemView {
            cart_item_id: item.id,
            membership: row.try_get("membership").map_err(internal_error)?,
            price_cents: item.price_cents,
            price: format_usd(item.price_cents),
            recipient: recipient_name(&item.contact),
            later: item.later,
        });
    }

    Ok(Json(CartResponse {
        items,
        total_cents,
        total: format_usd(total_cents),
    }))
}

async fn remove_cart_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Query(query): Query<CustomerQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    let email = normalize_email(&query.customer_email).map_err(invalid_request)?;

    let result = sqlx::query(
        r#"
        DELETE FROM cart_items ci
        USING users u
        WHERE ci.id = $1 AND ci.user_id = u.id AND u.email = $2
        "#,
    )
    .bind(item_id)
    .bind(&email)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "cart item not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn empty_cart(
    State(state): State<AppState>,
    Query(query): Query<CustomerQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    let email = normalize_email(&query.customer_email).map_err(invalid_request)?;

    sqlx::query(
        r#"
        DELETE FROM cart_items ci
        USING users u
        WHERE ci.user_id = u.id AND u.email = $1 AND NOT ci.later
        "#,
    )
    .bind(&email)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    Ok(StatusCode::NO_CONTENT)
}

async fn save_cart_item_for_later(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Query(query): Query<CustomerQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    set_cart_item_later(&state, item_id, &query.customer_email, true).await
}

async fn activate_cart_item(
    State(state): State<AppState>,
    Path(item_id): Path<Uuid>,
    Query(query): Query<CustomerQuery>,
) -> Result<StatusCode, (StatusCode, String)> {
    set_cart_item_later(&state, item_id, &query.customer_email, false).await
}

async fn set_cart_item_later(
    state: &AppState,
    item_id: Uuid,
    customer_email: &str,
    later: bool,
) -> Result<StatusCode, (StatusCode, String)> {
    let email = normalize_email(customer_email).map_err(invalid_request)?;

    let result = sqlx::query(
        r#"
        UPDATE cart_items ci
        SET later = $3
        FROM users u
        WHERE ci.id = $1 AND ci.user_id = u.id AND u.email = $2
        "#,
    )
    .bind(item_id)
    .bind(&email)
    .bind(later)
    .execute(&state.pool)
    .await
    .map_err(internal_error)?;

    if result.rows_affected() == 0 {
        return Err((StatusCode::NOT_FOUND, "cart item not found".to_string()));
    }

    Ok(StatusCode::NO_CONTENT)
}

async fn checkout_cart(
    State(state): State<AppState>,
    Json(payload): Json<CheckoutRequest>,
) -> Result<(StatusCode, Json<CheckoutResponse>), (StatusCode, String)> {
    let by_cheque = match payload.payment.trim() {
        "online" => false,
        "cheque" => true,
        other => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("payment must be 'online' or 'cheque', got '{other}'"),
            ));
        }
    };

    let mut tx = state.pool.begin().await.map_err(internal_error)?;

    let (user_id, user_email) = find_or_create_user(&mut tx, &payload.customer_email)
        .await
        .map_err(invalid_request)?;

    let rows = sqlx::query(
        r#"
        SELECT ci.id, ci.price_cents, ci.contact,
               m.id AS membership_id, m.name, m.price_cents AS current_price_cents,
               m.can_attend, m.can_site_select, m.can_nominate, m.can_vote,
               m.active_from, m.active_to, m.display_order
        FROM cart_items ci
        JOIN memberships m ON m.id = ci.membership_id
        WHERE ci.user_id = $1 AND NOT ci.later
        ORDER BY ci.created_at
        FOR UPDATE OF ci
        "#,
    )
    .bind(user_id)
    .fetch_all(&mut *tx)
    .await
    .map_err(internal_error)?;

    if rows.is_empty() {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, "cart is empty".to_string()));
    }

    let now = Utc::now();
    let mut created = Vec::with_capacity(rows.len());
    let mut total_cents = 0;
    for row in rows {
        let item_id: Uuid = row.try_get("id").map_err(internal_error)?;
        let snapshot_price: i64 = row.try_get("price_cents").map_err(internal_error)?;
        let contact_raw: serde_json::Value = row.try_get("contact").map_err(internal_error)?;
        let contact: ContactForm =
            serde_json::from_value(contact_raw).map_err(internal_error)?;

        let membership = Membership {
            id: row.try_get("membership_id").map_err(internal_error)?,
            name: row.try_get("name").map_err(internal_error)?,
            price_cents: row.try_get("current_price_cents").map_err(internal_error)?,
            can_attend: row.try_get("can_attend").map_err(internal_error)?,
            can_site_select: row.try_get("can_site_select").map_err(internal_error)?,
            can_nominate: row.try_get("can_nominate").map_err(internal_error)?,
            can_vote: row.try_get("can_vote").map_err(internal_error)?,
            active_from: row.try_get("active_from").map_err(internal_error)?,
            active_to: row.try_get("active_to").map_err(internal_error)?,
            display_order: row.try_get("display_order").map_err(internal_error)?,
        };

        if !membership.offered_at(now) {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("{} memberships are no longer offered", membership.name),
            ));
        }
        if membership.price_cents != snapshot_price {
            return Err((
                StatusCode::UNPROCESSABLE_ENTITY,
                format!(
                    "the price of a {} membership has changed since it was added; remove and re-add it",
                    membership.name
                ),
            ));
        }

        let format = validate_contact(&contact, ContactMode::Member).map_err(|errors| {
            (
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("cart item for {}: {errors}", recipient_name(&contact)),
            )
        })?;

        let claimed = claim_membership(
            &mut tx,
            user_id,
            &user_email,
            &membership,
            Some((&contact, format)),
        )
        .await
        .map_err(internal_error)?;

        sqlx::query("DELETE FROM cart_items WHERE id = $1")
            .bind(item_id)
            .execute(&mut *tx)
            .await
            .map_err(internal_error)?;

        let outstanding = match claimed.state {
            ReservationState::Paid => 0,
            _ => membership.price_cents,
        };
        total_cents += outstanding;
        created.push((claimed, membership.name.clone(), outstanding));
    }

    tx.commit().await.map_err(internal_error)?;

    let mut reservations = Vec::with_capacity(created.len());
    for (claimed, membership_name, outstanding) in created {
        publish_reservation_created(&state, &claimed).await;
        if by_cheque && outstanding > 0 {
            let event = ChequeRequestedEvent {
                reservation_id: claimed.reservation_id,
                membership_number: claimed.membership_number,
                outstanding_cents: outstanding,
            };
            if let Err(err) = state
                .redis
                .publish_json("payments.cheque_requested", &event)
                .await
            {
                error!("failed to publish cheque event: {err}");
            }
        }
        reservations.push(ReservationCreatedResponse {
            reservation_id: claimed.reservation_id,
            membership_number: claimed.membership_number,
            membership: membership_name,
            state: claimed.state,
            outstanding_cents: outstanding,
            outstanding: format_usd(outstanding),
            payment_amounts: payment_amount_options(outstanding),
        });
    }

    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            total_cents,
            total: format_usd(total_cents),
            reservations,
        }),
    ))
}

/// Allocate a membership number and create the reservation with its first
/// active claim and order. Runs inside the caller's transaction so a failed
/// contact insert rolls the whole purchase back.
async fn claim_membership(
    tx: &mut Transaction<'_, Postgres>,
    user_id: Uuid,
    user_email: &str,
    membership: &Membership,
    contact: Option<(&ContactForm, PublicationFormat)>,
) -> AnyResult<ClaimedReservation> {
    let membership_number: i64 =
        sqlx::query_scalar("SELECT nextval('membership_number_seq')")
            .fetch_one(&mut **tx)
            .await?;

    let state = if membership.price_cents == 0 {
        ReservationState::Paid
    } else {
        ReservationState::Instalment
    };
    let reservation_id = Uuid::new_v4();
    let now = Utc::now();

    sqlx::query(
        r#"
        INSERT INTO reservations (id, membership_number, state, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $4)
        "#,
    )
    .bind(reservation_id)
    .bind(membership_number)
    .bind(state.as_str())
    .bind(now)
    .execute(&mut **tx)
    .await?;

    let claim_id = Uuid::new_v4();
    sqlx::query(
        r#"
        INSERT INTO claims (id, reservation_id, user_id, active, created_at)
        VALUES ($1, $2, $3, TRUE, $4)
        "#,
    )
    .bind(claim_id)
    .bind(reservation_id)
    .bind(user_id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO orders (id, reservation_id, membership_id, active, created_at)
        VALUES ($1, $2, $3, TRUE, $4)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(reservation_id)
    .bind(membership.id)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    if let Some((form, format)) = contact {
        upsert_contact(tx, claim_id, form, format, false).await?;
    }

    record_event(
        tx,
        reservation_id,
        DomainEventKind::ReservationCreated,
        json!({
            "membership_number": membership_number,
            "membership": membership.name,
            "state": state.as_str(),
        }),
    )
    .await?;
    record_event(
        tx,
        reservation_id,
        DomainEventKind::ClaimActivated,
        json!({ "user": user_email }),
    )
    .await?;
    record_event(
        tx,
        reservation_id,
        DomainEventKind::OrderActivated,
        json!({ "membership": membership.name }),
    )
    .await?;

    Ok(ClaimedReservation {
        reservation_id,
        membership_number,
        state,
    })
}

async fn upsert_contact(
    tx: &mut Transaction<'_, Postgres>,
    claim_id: Uuid,
    form: &ContactForm,
    format: PublicationFormat,
    update_existing: bool,
) -> AnyResult<()> {
    let now = Utc::now();
    let conflict_action = if update_existing {
        r#"
        DO UPDATE SET
            title = EXCLUDED.title,
            first_name = EXCLUDED.first_name,
            last_name = EXCLUDED.last_name,
            preferred_first_name = EXCLUDED.preferred_first_name,
            preferred_last_name = EXCLUDED.preferred_last_name,
            badge_title = EXCLUDED.badge_title,
            address_line_1 = EXCLUDED.address_line_1,
            address_line_2 = EXCLUDED.address_line_2,
            city = EXCLUDED.city,
            province = EXCLUDED.province,
            postal = EXCLUDED.postal,
            country = EXCLUDED.country,
            email = EXCLUDED.email,
            publication_format = EXCLUDED.publication_format,
            show_in_listings = EXCLUDED.show_in_listings,
            share_with_future_conventions = EXCLUDED.share_with_future_conventions,
            updated_at = EXCLUDED.updated_at
        "#
    } else {
        "DO NOTHING"
    };

    let query = format!(
        r#"
        INSERT INTO contacts (
            id, claim_id, title, first_name, last_name, preferred_first_name,
            preferred_last_name, badge_title, address_line_1, address_line_2, city,
            province, postal, country, email, publication_format, show_in_listings,
            share_with_future_conventions, created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $19)
        ON CONFLICT (claim_id) {conflict_action}
        "#
    );

    sqlx::query(&query)
        .bind(Uuid::new_v4())
        .bind(claim_id)
        .bind(clean(&form.title))
        .bind(clean(&form.first_name))
        .bind(clean(&form.last_name))
        .bind(clean(&form.preferred_first_name))
        .bind(clean(&form.preferred_last_name))
        .bind(clean(&form.badge_title))
        .bind(clean(&form.address_line_1))
        .bind(clean(&form.address_line_2))
        .bind(clean(&form.city))
        .bind(clean(&form.province))
        .bind(clean(&form.postal))
        .bind(clean(&form.country))
        .bind(clean(&form.email))
        .bind(format.as_str())
        .bind(form.show_in_listings.unwrap_or(true))
        .bind(form.share_with_future_conventions.unwrap_or(true))
        .bind(now)
        .execute(&mut **tx)
        .await?;

    Ok(())
}

async fn record_event(
    tx: &mut Transaction<'_, Postgres>,
    reservation_id: Uuid,
    kind: DomainEventKind,
    payload: serde_json::Value,
) -> AnyResult<()> {
    let event = DomainEvent::new(reservation_id, kind, payload);
    PgEventStore::append_in_tx(tx, &event).await?;
    Ok(())
}

async fn lookup_reservation(
    pool: &PgPool,
    membership_number: i64,
) -> Result<(Uuid, ReservationState), (StatusCode, String)> {
    let row = sqlx::query("SELECT id, state FROM reservations WHERE membership_number = $1")
        .bind(membership_number)
        .fetch_optional(pool)
        .await
        .map_err(internal_error)?
        .ok_or_else(|| (StatusCode::NOT_FOUND, "reservation not found".to_string()))?;

    reservation_parts(&row)
}

async fn lock_reservation(
    tx: &mut Transaction<'_, Postgres>,
    membership_number: i64,
) -> Result<(Uuid, ReservationState), (StatusCode, String)> {
    let row =
        sqlx::query("SELECT id, state FROM reservations WHERE membership_number = $1 FOR UPDATE")
            .bind(membership_number)
            .fetch_optional(&mut **tx)
            .await
            .map_err(internal_error)?
            .ok_or_else(|| (StatusCode::NOT_FOUND, "reservation not found".to_string()))?;

    reservation_parts(&row)
}

fn reservation_parts(row: &PgRow) -> Result<(Uuid, ReservationState), (StatusCode, String)> {
    let id: Uuid = row.try_get("id").map_err(internal_error)?;
    let state_raw: String = row.try_get("state").map_err(internal_error)?;
    let state = ReservationState::parse(&state_raw).map_err(internal_error)?;
    Ok((id, state))
}

async fn lookup_offered_membership(
    tx: &mut Transaction<'_, Postgres>,
    name: &str,
) -> Result<Membership, (StatusCode, String)> {
    let row = sqlx::query(
        r#"
        SELECT id, name, price_cents, can_attend, can_site_select, can_nominate, can_vote,
               active_from, active_to, display_order
        FROM memberships
        WHERE name = $1
        "#,
    )
    .bind(name.trim())
    .fetch_optional(&mut **tx)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("membership '{name}' is not offered"),
        )
    })?;

    let membership = membership_from_row(&row).map_err(internal_error)?;
    if !membership.offered_at(Utc::now()) {
        return Err((
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("{} memberships are no longer offered", membership.name),
        ));
    }

    Ok(membership)
}

fn membership_from_row(row: &PgRow) -> AnyResult<Membership> {
    Ok(Membership {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        price_cents: row.try_get("price_cents")?,
        can_attend: row.try_get("can_attend")?,
        can_site_select: row.try_get("can_site_select")?,
        can_nominate: row.try_get("can_nominate")?,
        can_vote: row.try_get("can_vote")?,
        active_from: row.try_get("active_from")?,
        active_to: row.try_get("active_to")?,
        display_order: row.try_get("display_order")?,
    })
}

async fn memberships_ever_held(pool: &PgPool, reservation_id: Uuid) -> AnyResult<Vec<Membership>> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT m.id, m.name, m.price_cents, m.can_attend, m.can_site_select,
               m.can_nominate, m.can_vote, m.active_from, m.active_to, m.display_order
        FROM memberships m
        JOIN orders o ON o.membership_id = m.id
        WHERE o.reservation_id = $1
        "#,
    )
    .bind(reservation_id)
    .fetch_all(pool)
    .await?;

    rows.iter().map(membership_from_row).collect()
}

async fn fetch_charges(pool: &PgPool, reservation_id: Uuid) -> AnyResult<Vec<Charge>> {
    let rows = sqlx::query(
        r#"
        SELECT id, user_id, reservation_id, amount_cents, transfer, state, comment,
               provider_ref, created_at, updated_at
        FROM charges
        WHERE reservation_id = $1
        ORDER BY created_at DESC
        "#,
    )
    .bind(reservation_id)
    .fetch_all(pool)
    .await?;

    let mut charges = Vec::with_capacity(rows.len());
    for row in rows {
        let transfer_raw: String = row.try_get("transfer")?;
        let state_raw: String = row.try_get("state")?;
        charges.push(Charge {
            id: row.try_get("id")?,
            user_id: row.try_get("user_id")?,
            reservation_id: row.try_get("reservation_id")?,
            amount_cents: row.try_get("amount_cents")?,
            transfer: TransferKind::parse(&transfer_raw)?,
            state: ChargeState::parse(&state_raw)?,
            comment: row.try_get("comment")?,
            provider_ref: row.try_get("provider_ref")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        });
    }

    Ok(charges)
}

async fn fetch_active_contact(
    pool: &PgPool,
    reservation_id: Uuid,
) -> AnyResult<Option<Contact>> {
    let row = sqlx::query(
        r#"
        SELECT ct.id, ct.claim_id, ct.title, ct.first_name, ct.last_name,
               ct.preferred_first_name, ct.preferred_last_name, ct.badge_title,
               ct.address_line_1, ct.address_line_2, ct.city, ct.province, ct.postal,
               ct.country, ct.email, ct.publication_format, ct.show_in_listings,
               ct.share_with_future_conventions, ct.created_at, ct.updated_at
        FROM contacts ct
        JOIN claims c ON c.id = ct.claim_id
        WHERE c.reservation_id = $1 AND c.active
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(pool)
    .await?;

    let Some(row) = row else {
        return Ok(None);
    };

    let format_raw: String = row.try_get("publication_format")?;
    Ok(Some(Contact {
        id: row.try_get("id")?,
        claim_id: row.try_get("claim_id")?,
        title: row.try_get("title")?,
        first_name: row.try_get("first_name")?,
        last_name: row.try_get("last_name")?,
        preferred_first_name: row.try_get("preferred_first_name")?,
        preferred_last_name: row.try_get("preferred_last_name")?,
        badge_title: row.try_get("badge_title")?,
        address_line_1: row.try_get("address_line_1")?,
        address_line_2: row.try_get("address_line_2")?,
        city: row.try_get("city")?,
        province: row.try_get("province")?,
        postal: row.try_get("postal")?,
        country: row.try_get("country")?,
        email: row.try_get("email")?,
        publication_format: PublicationFormat::parse(&format_raw)?,
        show_in_listings: row.try_get("show_in_listings")?,
        share_with_future_conventions: row.try_get("share_with_future_conventions")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    }))
}

async fn active_price(pool: &PgPool, reservation_id: Uuid) -> AnyResult<i64> {
    let price: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT m.price_cents
        FROM orders o
        JOIN memberships m ON m.id = o.membership_id
        WHERE o.reservation_id = $1 AND o.active
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(pool)
    .await?;

    price.ok_or_else(|| anyhow::anyhow!("reservation has no active order"))
}

async fn successful_charge_total(
    tx: &mut Transaction<'_, Postgres>,
    reservation_id: Uuid,
) -> AnyResult<i64> {
    let paid: i64 = sqlx::query_scalar(
        r#"
        SELECT COALESCE(SUM(amount_cents), 0)::BIGINT
        FROM charges
        WHERE reservation_id = $1 AND state = 'successful'
        "#,
    )
    .bind(reservation_id)
    .fetch_one(&mut **tx)
    .await?;

    Ok(paid)
}

async fn outstanding_in_tx(
    tx: &mut Transaction<'_, Postgres>,
    reservation_id: Uuid,
) -> Result<i64, (StatusCode, String)> {
    let price: Option<i64> = sqlx::query_scalar(
        r#"
        SELECT m.price_cents
        FROM orders o
        JOIN memberships m ON m.id = o.membership_id
        WHERE o.reservation_id = $1 AND o.active
        "#,
    )
    .bind(reservation_id)
    .fetch_optional(&mut **tx)
    .await
    .map_err(internal_error)?;

    let price = price.ok_or_else(|| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "reservation has no active order".to_string(),
        )
    })?;

    let paid = successful_charge_total(tx, reservation_id)
        .await
        .map_err(internal_error)?;

    Ok(amount_owed(price, paid))
}

async fn find_or_create_user(
    tx: &mut Transaction<'_, Postgres>,
    email: &str,
) -> AnyResult<(Uuid, String)> {
    let email = normalize_email(email)?;

    let user_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO users (id, email, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&email)
    .bind(Utc::now())
    .fetch_one(&mut **tx)
    .await?;

    Ok((user_id, email))
}

async fn publish_reservation_created(state: &AppState, claimed: &ClaimedReservation) {
    let event = ReservationCreatedEvent {
        reservation_id: claimed.reservation_id,
        membership_number: claimed.membership_number,
    };
    if let Err(err) = state.redis.publish_json("reservations.created", &event).await {
        error!("failed to publish reservation event: {err}");
    }
}

async fn publish_charge_settled(state: &AppState, charge_id: Uuid, reservation_id: Uuid) {
    let event = ChargeSettledEvent {
        charge_id,
        reservation_id,
    };
    if let Err(err) = state.redis.publish_json("charges.settled", &event).await {
        error!("failed to publish charge event: {err}");
    }
}

fn validate_charge_request(payload: &CreateChargeRequest) -> AnyResult<TransferKind> {
    let transfer = TransferKind::parse(payload.transfer.trim())?;

    if payload.amount_cents <= 0 {
        anyhow::bail!("amount_cents must be positive");
    }
    if payload.comment.trim().is_empty() {
        anyhow::bail!("comment is required");
    }
    if transfer == TransferKind::Stripe
        && payload
            .provider_ref
            .as_deref()
            .map(str::trim)
            .unwrap_or("")
            .is_empty()
    {
        anyhow::bail!("provider_ref is required for stripe transfers");
    }

    Ok(transfer)
}

fn decode_login_token(token: &str, secret: &str) -> Result<TokenClaims, (StatusCode, String)> {
    let validation = Validation::new(Algorithm::HS256);
    match decode::<TokenClaims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    ) {
        Ok(data) => Ok(data.claims),
        Err(err) => match err.kind() {
            ErrorKind::ExpiredSignature => Err((
                StatusCode::UNAUTHORIZED,
                "token has expired".to_string(),
            )),
            _ => Err((StatusCode::UNAUTHORIZED, "token is malformed".to_string())),
        },
    }
}

fn redirect_path(requested: Option<&str>) -> String {
    if let Some(path) = requested {
        if REDIRECT_PATH_LIST
            .iter()
            .any(|legal| path.starts_with(legal))
        {
            return path.to_string();
        }
    }
    DEFAULT_REDIRECT_PATH.to_string()
}

fn normalize_email(email: &str) -> AnyResult<String> {
    let email = email.trim().to_lowercase();
    let mut parts = email.split('@');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(local), Some(domain), None) if !local.is_empty() && !domain.is_empty() => Ok(email),
        _ => anyhow::bail!("'{email}' is not a valid email address"),
    }
}

fn member_display_name(
    title: Option<String>,
    first_name: Option<String>,
    last_name: Option<String>,
    preferred_first_name: Option<String>,
    preferred_last_name: Option<String>,
    fallback: String,
) -> String {
    let preferred = join_present(&[&preferred_first_name, &preferred_last_name]);
    if !preferred.is_empty() {
        return preferred;
    }
    let legal = join_present(&[&title, &first_name, &last_name]);
    if !legal.is_empty() {
        return legal;
    }
    fallback
}

fn recipient_name(form: &ContactForm) -> String {
    let name = join_present(&[&form.first_name, &form.last_name]);
    if name.is_empty() {
        "unnamed recipient".to_string()
    } else {
        name
    }
}

fn join_present(parts: &[&Option<String>]) -> String {
    let joined: Vec<&str> = parts
        .iter()
        .filter_map(|part| part.as_deref())
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect();
    joined.join(" ")
}

fn clean(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.code().as_deref() == Some("23505"))
}

fn invalid_request(err: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, err.to_string())
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use jsonwebtoken::{EncodingKey, Header, encode};

    fn issue_token(claims: &TokenClaims, secret: &str) -> String {
        encode(
            &Header::default(),
            claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn decodes_a_valid_login_token() {
        let claims = TokenClaims {
            email: "member@example.com".to_string(),
            path: Some("/reservations/new?offer=adult".to_string()),
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        };
        let token = issue_token(&claims, "sekrit");

        let decoded = decode_login_token(&token, "sekrit").unwrap();
        assert_eq!(decoded.email, "member@example.com");
        assert_eq!(decoded.path.as_deref(), Some("/reservations/new?offer=adult"));
    }

    #[test]
    fn expired_tokens_are_rejected_with_a_distinct_message() {
        let claims = TokenClaims {
            email: "member@example.com".to_string(),
            path: None,
            exp: (Utc::now() - Duration::hours(2)).timestamp(),
        };
        let token = issue_token(&claims, "sekrit");

        let (status, message) = decode_login_token(&token, "sekrit").unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(message, "token has expired");
    }

    #[test]
    fn tampered_tokens_are_malformed() {
        let claims = TokenClaims {
            email: "member@example.com".to_string(),
            path: None,
            exp: (Utc::now() + Duration::hours(1)).timestamp(),
        };
        let token = issue_token(&claims, "sekrit");

        let (status, message) = decode_login_token(&token, "other-secret").unwrap_err();
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(message, "token is malformed");

        let (_, message) = decode_login_token("not-a-token", "sekrit").unwrap_err();
        assert_eq!(message, "token is malformed");
    }

    #[test]
    fn redirects_only_to_allow_listed_paths() {
        assert_eq!(redirect_path(Some("/reservations")), "/reservations");
        assert_eq!(
            redirect_path(Some("/reservations/new?offer=adult")),
            "/reservations/new?offer=adult"
        );
        assert_eq!(redirect_path(Some("/operator/users")), DEFAULT_REDIRECT_PATH);
        assert_eq!(redirect_path(None), DEFAULT_REDIRECT_PATH);
    }

    #[test]
    fn emails_are_normalized_and_checked() {
        assert_eq!(
            normalize_email("  Member@Example.COM ").unwrap(),
            "member@example.com"
        );
        assert!(normalize_email("not-an-email").is_err());
        assert!(normalize_email("@example.com").is_err());
        assert!(normalize_email("member@").is_err());
        assert!(normalize_email("a@b@c").is_err());
    }

    #[test]
    fn charge_requests_are_validated() {
        let mut payload = CreateChargeRequest {
            customer_email: "member@example.com".to_string(),
            amount_cents: 40_00,
            transfer: "cash".to_string(),
            comment: "paid at the registration desk".to_string(),
            provider_ref: None,
        };
        assert_eq!(
            validate_charge_request(&payload).unwrap(),
            TransferKind::Cash
        );

        payload.transfer = "stripe".to_string();
        let err = validate_charge_request(&payload).unwrap_err();
        assert!(err.to_string().contains("provider_ref"));

        payload.provider_ref = Some("ch_123".to_string());
        assert_eq!(
            validate_charge_request(&payload).unwrap(),
            TransferKind::Stripe
        );

        payload.amount_cents = 0;
        assert!(validate_charge_request(&payload).is_err());

        payload.amount_cents = 40_00;
        payload.comment = "  ".to_string();
        assert!(validate_charge_request(&payload).is_err());

        payload.comment = "cheque 42".to_string();
        payload.transfer = "barter".to_string();
        assert!(validate_charge_request(&payload).is_err());
    }

    #[test]
    fn member_names_fall_back_through_preferred_and_legal() {
        assert_eq!(
            member_display_name(
                Some("Dr".to_string()),
                Some("Ursula".to_string()),
                Some("Vernon".to_string()),
                Some("T".to_string()),
                Some("Kingfisher".to_string()),
                "member@example.com".to_string(),
            ),
            "T Kingfisher"
        );
        assert_eq!(
            member_display_name(
                None,
                Some("Ursula".to_string()),
                Some("Vernon".to_string()),
                None,
                None,
                "member@example.com".to_string(),
            ),
            "Ursula Vernon"
        );
        assert_eq!(
            member_display_name(None, None, None, None, None, "member@example.com".to_string()),
            "member@example.com"
        );
    }
}
