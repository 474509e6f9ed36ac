use std::net::SocketAddr;

use anyhow::Result as AnyResult;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{StatusCode, header},
    routing::{get, post},
};
use chrono::Utc;
use csv::StringRecord;
use serde::Deserialize;
use serde_json::json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{error, info};
use uuid::Uuid;

use conreg_core::{DomainEvent, DomainEventKind, PublicationFormat, ReservationState};
use conreg_eventstore::PgEventStore;
use conreg_payments::amount_owed;
use conreg_platform::{ImportSummaryResponse, ServiceConfig, connect_database};

/// Column layout the roster spreadsheet must arrive in. Anything else is
/// rejected before a single row is touched.
const IMPORT_HEADINGS: [&str; 12] = [
    "eligibility",
    "PREV#",
    "MEMBER#",
    "Class Type",
    "FNAME",
    "LNAME",
    "combined",
    "EMAIL",
    "CITY",
    "STATE",
    "COUNTRY",
    "notes",
];

const EXPORT_HEADINGS: [&str; 12] = [
    "membership_number",
    "membership",
    "first_name",
    "last_name",
    "preferred_first_name",
    "preferred_last_name",
    "email",
    "city",
    "country",
    "publication_format",
    "state",
    "paid",
];

#[derive(Clone)]
struct AppState {
    pool: PgPool,
}

#[derive(Debug, Clone, Deserialize)]
struct ImportQuery {
    membership: String,
}

#[derive(Debug)]
struct RosterRow {
    first_name: String,
    last_name: String,
    email: String,
    city: String,
    province: String,
    country: String,
}

#[tokio::main]
async fn main() -> AnyResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "conreg_roster=info".to_string()),
        )
        .init();

    let config = ServiceConfig::from_env("0.0.0.0:8100")?;
    let pool = connect_database(&config.database_url).await?;

    let state = AppState { pool };
    let router = Router::new()
        .route("/healthz", get(healthz))
        .route("/roster/import", post(import_roster))
        .route("/roster/export", get(export_roster))
        .with_state(state);

    let addr: SocketAddr = config.http_addr.parse()?;
    info!("roster service listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn import_roster(
    State(state): State<AppState>,
    Query(query): Query<ImportQuery>,
    body: String,
) -> Result<Json<ImportSummaryResponse>, (StatusCode, String)> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .from_reader(body.as_bytes());
    let mut records = Vec::new();
    for record in reader.records() {
        records.push(record.map_err(|err| (StatusCode::BAD_REQUEST, err.to_string()))?);
    }

    let Some(headings) = records.first() else {
        return Ok(Json(ImportSummaryResponse {
            rows: 0,
            created: 0,
            errors: Vec::new(),
        }));
    };
    if let Err(message) = check_headings(headings) {
        return Err((StatusCode::UNPROCESSABLE_ENTITY, message));
    }

    let tier = sqlx::query(
        "SELECT id, name, price_cents FROM memberships WHERE name = $1",
    )
    .bind(query.membership.trim())
    .fetch_optional(&state.pool)
    .await
    .map_err(internal_error)?
    .ok_or_else(|| {
        (
            StatusCode::UNPROCESSABLE_ENTITY,
            format!("membership '{}' does not exist", query.membership),
        )
    })?;
    let tier_id: Uuid = tier.try_get("id").map_err(internal_error)?;
    let tier_name: String = tier.try_get("name").map_err(internal_error)?;
    let tier_price: i64 = tier.try_get("price_cents").map_err(internal_error)?;

    let mut created = 0;
    let mut errors = Vec::new();
    for (index, record) in records.iter().skip(1).enumerate() {
        let line = index + 2;
        match roster_row(record) {
            Ok(row) => {
                if let Err(err) =
                    import_row(&state.pool, &row, tier_id, &tier_name, tier_price).await
                {
                    error!("import line {line} failed: {err:#}");
                    errors.push(format!("line {line}: {err:#}"));
                } else {
                    created += 1;
                }
            }
            Err(message) => errors.push(format!("line {line}: {message}")),
        }
    }

    Ok(Json(ImportSummaryResponse {
        rows: (records.len() - 1) as i64,
        created,
        errors,
    }))
}

async fn export_roster(
    State(state): State<AppState>,
) -> Result<(StatusCode, [(header::HeaderName, &'static str); 1], String), (StatusCode, String)> {
    let rows = sqlx::query(
        r#"
        SELECT r.membership_number, r.state, m.name AS membership, m.price_cents,
               ct.first_name, ct.last_name, ct.preferred_first_name, ct.preferred_last_name,
               ct.email, ct.city, ct.country, ct.publication_format,
               COALESCE((SELECT SUM(ch.amount_cents) FROM charges ch
                         WHERE ch.reservation_id = r.id AND ch.state = 'successful'), 0)::BIGINT
                   AS paid_cents
        FROM contacts ct
        JOIN claims c ON c.id = ct.claim_id AND c.active
        JOIN reservations r ON r.id = c.reservation_id
        JOIN orders o ON o.reservation_id = r.id AND o.active
        JOIN memberships m ON m.id = o.membership_id
        ORDER BY r.membership_number
        "#,
    )
    .fetch_all(&state.pool)
    .await
    .map_err(internal_error)?;

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer
        .write_record(EXPORT_HEADINGS)
        .map_err(internal_error)?;

    for row in rows {
        let membership_number: i64 = row.try_get("membership_number").map_err(internal_error)?;
        let price_cents: i64 = row.try_get("price_cents").map_err(internal_error)?;
        let paid_cents: i64 = row.try_get("paid_cents").map_err(internal_error)?;
        let record = export_record(
            membership_number,
            row.try_get("membership").map_err(internal_error)?,
            row.try_get("first_name").map_err(internal_error)?,
            row.try_get("last_name").map_err(internal_error)?,
            row.try_get("preferred_first_name").map_err(internal_error)?,
            row.try_get("preferred_last_name").map_err(internal_error)?,
            row.try_get("email").map_err(internal_error)?,
            row.try_get("city").map_err(internal_error)?,
            row.try_get("country").map_err(internal_error)?,
            row.try_get("publication_format").map_err(internal_error)?,
            row.try_get("state").map_err(internal_error)?,
            price_cents,
            paid_cents,
        );
        writer.write_record(&record).map_err(internal_error)?;
    }

    let bytes = writer.into_inner().map_err(internal_error)?;
    let body = String::from_utf8(bytes).map_err(internal_error)?;

    Ok((
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/csv; charset=utf-8")],
        body,
    ))
}

/// One reservation per roster row: find-or-create the user, claim the tier,
/// and record an import-mode contact hidden from public listings.
async fn import_row(
    pool: &PgPool,
    row: &RosterRow,
    tier_id: Uuid,
    tier_name: &str,
    tier_price: i64,
) -> AnyResult<()> {
    let mut tx = pool.begin().await?;

    let user_id: Uuid = sqlx::query_scalar(
        r#"
        INSERT INTO users (id, email, created_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (email) DO UPDATE SET email = EXCLUDED.email
        RETURNING id
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&row.email)
    .bind(Utc::now())
    .fetch_one(&mut *tx)
    .await?;

    let membership_number: i64 = sqlx::query_scalar("SELECT nextval('membership_number_seq')")
        .fetch_one(&mut *tx)
        .await?;

    let state = if tier_price == 0 {
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
    .execute(&mut *tx)
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
    .execute(&mut *tx)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO orders (id, reservation_id, membership_id, active, created_at)
        VALUES ($1, $2, $3, TRUE, $4)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(reservation_id)
    .bind(tier_id)
    .bind(now)
    .execute(&mut *tx)
    .await?;

    // Roster rows carry no street address; the city stands in, as on the
    // source spreadsheet.
    sqlx::query(
        r#"
        INSERT INTO contacts (
            id, claim_id, first_name, last_name, address_line_1, city, province, country,
            email, publication_format, show_in_listings, share_with_future_conventions,
            created_at, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $5, $6, $7, $8, $9, FALSE, FALSE, $10, $10)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(claim_id)
    .bind(blank_to_null(&row.first_name))
    .bind(blank_to_null(&row.last_name))
    .bind(blank_to_null(&row.city))
    .bind(blank_to_null(&row.province))
    .bind(blank_to_null(&row.country))
    .bind(blank_to_null(&row.email))
    .bind(PublicationFormat::SendMeEmail.as_str())
    .bind(now)
    .execute(&mut *tx)
    .await?;

    for (kind, payload) in [
        (
            DomainEventKind::ReservationCreated,
            json!({
                "membership_number": membership_number,
                "membership": tier_name,
                "state": state.as_str(),
                "source": "roster-import",
            }),
        ),
        (
            DomainEventKind::ClaimActivated,
            json!({ "user": row.email, "source": "roster-import" }),
        ),
        (
            DomainEventKind::OrderActivated,
            json!({ "membership": tier_name, "source": "roster-import" }),
        ),
    ] {
        record_event(&mut tx, reservation_id, kind, payload).await?;
    }

    tx.commit().await?;

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

fn check_headings(got: &StringRecord) -> Result<(), String> {
    let got: Vec<&str> = got.iter().collect();
    if got != IMPORT_HEADINGS {
        return Err(format!(
            "headings don't match. Got {got:?}, want {IMPORT_HEADINGS:?}"
        ));
    }
    Ok(())
}

fn roster_row(record: &StringRecord) -> Result<RosterRow, String> {
    if record.len() != IMPORT_HEADINGS.len() {
        return Err(format!(
            "expected {} columns, got {}",
            IMPORT_HEADINGS.len(),
            record.len()
        ));
    }

    let field = |index: usize| record.get(index).unwrap_or("").trim().to_string();

    let email = field(7).to_lowercase();
    if email.is_empty() || !email.contains('@') {
        return Err(format!("'{email}' is not a valid email address"));
    }

    Ok(RosterRow {
        first_name: field(4),
        last_name: field(5),
        email,
        city: field(8),
        province: field(9),
        country: field(10),
    })
}

fn export_record(
    membership_number: i64,
    membership: String,
    first_name: Option<String>,
    last_name: Option<String>,
    preferred_first_name: Option<String>,
    preferred_last_name: Option<String>,
    email: Option<String>,
    city: Option<String>,
    country: Option<String>,
    publication_format: String,
    state: String,
    price_cents: i64,
    paid_cents: i64,
) -> Vec<String> {
    let paid = amount_owed(price_cents, paid_cents) <= 0;
    vec![
        membership_number.to_string(),
        membership,
        first_name.unwrap_or_default(),
        last_name.unwrap_or_default(),
        preferred_first_name.unwrap_or_default(),
        preferred_last_name.unwrap_or_default(),
        email.unwrap_or_default(),
        city.unwrap_or_default(),
        country.unwrap_or_default(),
        publication_format,
        state,
        paid.to_string(),
    ]
}

fn blank_to_null(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

fn internal_error<E: std::fmt::Display>(err: E) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(fields: &[&str]) -> StringRecord {
        StringRecord::from(fields.to_vec())
    }

    #[test]
    fn accepts_the_expected_heading_row() {
        assert!(check_headings(&record(&IMPORT_HEADINGS)).is_ok());
    }

    #[test]
    fn rejects_mismatched_headings_naming_both_sides() {
        let mut headings = IMPORT_HEADINGS.to_vec();
        headings[0] = "ELIGIBILITY";
        let message = check_headings(&record(&headings)).unwrap_err();
        assert!(message.contains("ELIGIBILITY"));
        assert!(message.contains("eligibility"));
    }

    #[test]
    fn parses_a_roster_row() {
        let row = roster_row(&record(&[
            "eligible",
            "1234",
            "",
            "Adult Attending",
            "Nnedi",
            "Okorafor",
            "Nnedi Okorafor",
            " Nnedi@Example.COM ",
            "Chicago",
            "IL",
            "USA",
            "",
        ]))
        .unwrap();
        assert_eq!(row.first_name, "Nnedi");
        assert_eq!(row.last_name, "Okorafor");
        assert_eq!(row.email, "nnedi@example.com");
        assert_eq!(row.city, "Chicago");
        assert_eq!(row.province, "IL");
        assert_eq!(row.country, "USA");
    }

    #[test]
    fn rejects_rows_with_bad_emails_or_shape() {
        let mut fields = vec![""; IMPORT_HEADINGS.len()];
        fields[7] = "not-an-email";
        assert!(roster_row(&record(&fields)).is_err());

        assert!(roster_row(&record(&["too", "short"])).is_err());
    }

    #[test]
    fn export_rows_report_paid_in_full() {
        let row = export_record(
            107,
            "adult".to_string(),
            Some("Nnedi".to_string()),
            Some("Okorafor".to_string()),
            None,
            None,
            Some("nnedi@example.com".to_string()),
            Some("Chicago".to_string()),
            Some("USA".to_string()),
            "send_me_email".to_string(),
            "paid".to_string(),
            340_00,
            340_00,
        );
        assert_eq!(row[0], "107");
        assert_eq!(row[1], "adult");
        assert_eq!(row[11], "true");

        let row = export_record(
            108,
            "adult".to_string(),
            None,
            None,
            None,
            None,
            None,
            None,
            None,
            "no_paper_pubs".to_string(),
            "instalment".to_string(),
            340_00,
            80_00,
        );
        assert_eq!(row[11], "false");
    }
}
