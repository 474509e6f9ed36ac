use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::PublicationFormat;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Error)]
#[error("{}", to_sentence(.errors))]
pub struct ValidationErrors {
    pub errors: Vec<FieldError>,
}

fn to_sentence(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(|error| format!("{} {}", error.field, error.message))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Contact details as submitted on the membership form. Doubles as the wire
/// shape for reservation and contact-update requests.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContactForm {
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
    pub publication_format: Option<String>,
    pub show_in_listings: Option<bool>,
    pub share_with_future_conventions: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContactMode {
    /// Full validation for member-entered forms.
    Member,
    /// Roster imports carry partial data; name and address become optional.
    Import,
}

/// Field-level validation. Returns the parsed publication format so callers
/// bind the canonical value, not the raw input.
pub fn validate_contact(
    form: &ContactForm,
    mode: ContactMode,
) -> Result<PublicationFormat, ValidationErrors> {
    let mut errors = Vec::new();

    if mode == ContactMode::Member {
        for (field, value) in [
            ("first_name", &form.first_name),
            ("last_name", &form.last_name),
            ("address_line_1", &form.address_line_1),
            ("country", &form.country),
        ] {
            if is_blank(value) {
                errors.push(FieldError {
                    field: field.to_string(),
                    message: "can't be blank".to_string(),
                });
            }
        }
    }

    let format = match &form.publication_format {
        Some(raw) => match PublicationFormat::parse(raw) {
            Ok(format) => Some(format),
            Err(_) => {
                errors.push(FieldError {
                    field: "publication_format".to_string(),
                    message: format!("'{raw}' is not a recognised option"),
                });
                None
            }
        },
        None => {
            errors.push(FieldError {
                field: "publication_format".to_string(),
                message: "can't be blank".to_string(),
            });
            None
        }
    };

    if let Some(format) = format {
        if format.wants_email() && is_blank(&form.email) {
            errors.push(FieldError {
                field: "email".to_string(),
                message: "is required to send you publications electronically".to_string(),
            });
        }
    }

    match format {
        Some(format) if errors.is_empty() => Ok(format),
        _ => Err(ValidationErrors { errors }),
    }
}

fn is_blank(value: &Option<String>) -> bool {
    value
        .as_deref()
        .map(|value| value.trim().is_empty())
        .unwrap_or(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled_form() -> ContactForm {
        ContactForm {
            first_name: Some("Mary".to_string()),
            last_name: Some("Robinette".to_string()),
            address_line_1: Some("1 Lady Astronaut Way".to_string()),
            country: Some("US".to_string()),
            email: Some("mary@example.com".to_string()),
            publication_format: Some("send_me_email".to_string()),
            ..ContactForm::default()
        }
    }

    #[test]
    fn accepts_a_complete_member_form() {
        let format = validate_contact(&filled_form(), ContactMode::Member).unwrap();
        assert_eq!(format, PublicationFormat::SendMeEmail);
    }

    #[test]
    fn requires_name_and_address_for_members() {
        let form = ContactForm {
            publication_format: Some("no_paper_pubs".to_string()),
            ..ContactForm::default()
        };
        let errors = validate_contact(&form, ContactMode::Member).unwrap_err();
        let fields: Vec<&str> = errors.errors.iter().map(|e| e.field.as_str()).collect();
        assert_eq!(
            fields,
            vec!["first_name", "last_name", "address_line_1", "country"]
        );
    }

    #[test]
    fn import_mode_relaxes_name_and_address() {
        let form = ContactForm {
            publication_format: Some("no_paper_pubs".to_string()),
            ..ContactForm::default()
        };
        assert!(validate_contact(&form, ContactMode::Import).is_ok());
    }

    #[test]
    fn electronic_pubs_require_an_email() {
        let mut form = filled_form();
        form.email = None;
        let errors = validate_contact(&form, ContactMode::Member).unwrap_err();
        assert_eq!(errors.errors.len(), 1);
        assert_eq!(errors.errors[0].field, "email");

        form.publication_format = Some("send_me_post".to_string());
        assert!(validate_contact(&form, ContactMode::Member).is_ok());
    }

    #[test]
    fn rejects_unknown_publication_formats() {
        let mut form = filled_form();
        form.publication_format = Some("carrier_pigeon".to_string());
        let errors = validate_contact(&form, ContactMode::Member).unwrap_err();
        assert!(errors.to_string().contains("publication_format"));
    }
}
