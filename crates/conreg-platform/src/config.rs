use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use conreg_entitlements::AwardCycle;

#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub database_url: String,
    pub redis_url: String,
    pub http_addr: String,
}

impl ServiceConfig {
    pub fn from_env(default_http_addr: &str) -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;
        let http_addr =
            std::env::var("HTTP_ADDR").unwrap_or_else(|_| default_http_addr.to_string());

        Ok(Self {
            database_url,
            redis_url,
            http_addr,
        })
    }

    pub fn worker_from_env() -> Result<Self> {
        let database_url = std::env::var("DATABASE_URL").context("DATABASE_URL is required")?;
        let redis_url = std::env::var("REDIS_URL").context("REDIS_URL is required")?;

        Ok(Self {
            database_url,
            redis_url,
            http_addr: String::new(),
        })
    }
}

/// Registration-specific settings: the login-token secret and the award
/// cycle instants. All required; the service refuses to start without them
/// rather than defaulting deep inside a request.
#[derive(Clone, Debug)]
pub struct RegistrationConfig {
    pub token_secret: String,
    pub award_cycle: AwardCycle,
}

impl RegistrationConfig {
    pub fn from_env() -> Result<Self> {
        let token_secret = std::env::var("TOKEN_SECRET").context("TOKEN_SECRET is required")?;
        if token_secret.trim().is_empty() {
            anyhow::bail!("TOKEN_SECRET must not be empty");
        }

        let award_cycle = AwardCycle::new(
            instant_from_env("NOMINATION_OPENS_AT")?,
            instant_from_env("VOTING_OPENS_AT")?,
            instant_from_env("VOTING_CLOSES_AT")?,
        )?;

        Ok(Self {
            token_secret,
            award_cycle,
        })
    }
}

fn instant_from_env(name: &'static str) -> Result<DateTime<Utc>> {
    let raw = std::env::var(name).with_context(|| format!("{name} is required"))?;
    let parsed = DateTime::parse_from_rfc3339(raw.trim())
        .with_context(|| format!("{name} must be an RFC3339 timestamp, got '{raw}'"))?;
    Ok(parsed.with_timezone(&Utc))
}
