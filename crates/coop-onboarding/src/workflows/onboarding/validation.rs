//! Field-level and cross-field rules gating stage completion.
//!
//! Every rule is a pure function of the payload and the evaluation date, so the same input
//! always produces the same list of errors.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};

use super::domain::{
    DocumentType, IdDocuments, KycDetails, LivenessConsent, PersonalInfo, PhotoSubmission,
    StagePayload,
};

const MINIMUM_AGE_YEARS: i32 = 18;
const MAX_PHOTO_BYTES: u64 = 5 * 1024 * 1024;
const ACCEPTED_PHOTO_TYPES: [&str; 2] = ["image/jpeg", "image/png"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldErrorCode {
    Required,
    InvalidFormat,
    InFuture,
    NotAfterIssue,
    Expired,
    Underage,
    ConsentRequired,
    OutOfRange,
}

/// A single failed rule, addressed to the payload field the applicant must fix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{field}: {message}")]
pub struct FieldError {
    pub field: String,
    pub code: FieldErrorCode,
    pub message: String,
}

impl FieldError {
    fn new(field: &str, code: FieldErrorCode, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code,
            message: message.into(),
        }
    }

    fn required(field: &str) -> Self {
        Self::new(field, FieldErrorCode::Required, "is required")
    }
}

/// Validate a stage payload as of `today`. An empty list means the payload is acceptable.
pub fn validate(payload: &StagePayload, today: NaiveDate) -> Vec<FieldError> {
    let mut errors = Vec::new();
    match payload {
        StagePayload::PersonalInfo(info) => personal_info(info, today, &mut errors),
        StagePayload::Kyc(details) => kyc(details, today, &mut errors),
        StagePayload::IdVerification(documents) => id_documents(documents, &mut errors),
        StagePayload::Liveness(consent) => liveness(consent, &mut errors),
        StagePayload::PhotoUpload(photo) => photo_upload(photo, &mut errors),
    }
    errors
}

fn personal_info(info: &PersonalInfo, today: NaiveDate, errors: &mut Vec<FieldError>) {
    require_text("full_name", &info.full_name, errors);
    require_text("address", &info.address, errors);

    match info.date_of_birth {
        None => errors.push(FieldError::required("date_of_birth")),
        Some(dob) if dob > today => errors.push(FieldError::new(
            "date_of_birth",
            FieldErrorCode::InFuture,
            "cannot be in the future",
        )),
        Some(dob) if age_on(dob, today) < MINIMUM_AGE_YEARS => errors.push(FieldError::new(
            "date_of_birth",
            FieldErrorCode::Underage,
            format!("applicant must be at least {MINIMUM_AGE_YEARS} years old"),
        )),
        Some(_) => {}
    }

    if require_text("email", &info.email, errors) && !is_email(&info.email) {
        errors.push(FieldError::new(
            "email",
            FieldErrorCode::InvalidFormat,
            "must be a valid e-mail address",
        ));
    }

    if require_text("phone", &info.phone, errors) && !is_phone(&info.phone) {
        errors.push(FieldError::new(
            "phone",
            FieldErrorCode::InvalidFormat,
            "must contain 7 to 15 digits",
        ));
    }

    if require_text("national_id", &info.national_id, errors)
        && !is_identifier(&info.national_id)
    {
        errors.push(FieldError::new(
            "national_id",
            FieldErrorCode::InvalidFormat,
            "must be 6-20 characters of A-Z, 0-9 or '-'",
        ));
    }
}

fn kyc(details: &KycDetails, today: NaiveDate, errors: &mut Vec<FieldError>) {
    if details.document_type.is_none() {
        errors.push(FieldError::required("document_type"));
    }

    if require_text("document_number", &details.document_number, errors)
        && !is_identifier(&details.document_number)
    {
        errors.push(FieldError::new(
            "document_number",
            FieldErrorCode::InvalidFormat,
            "must be 6-20 characters of A-Z, 0-9 or '-'",
        ));
    }

    if require_text("issuing_country", &details.issuing_country, errors)
        && !is_country_code(&details.issuing_country)
    {
        errors.push(FieldError::new(
            "issuing_country",
            FieldErrorCode::InvalidFormat,
            "must be a two-letter country code",
        ));
    }

    require_text("occupation", &details.occupation, errors);
    require_text("source_of_funds", &details.source_of_funds, errors);
    document_dates(details.issue_date, details.expiry_date, today, errors);

    if !details.consent_confirmed {
        errors.push(FieldError::new(
            "consent_confirmed",
            FieldErrorCode::ConsentRequired,
            "verification consent must be confirmed",
        ));
    }
}

fn document_dates(
    issue_date: Option<NaiveDate>,
    expiry_date: Option<NaiveDate>,
    today: NaiveDate,
    errors: &mut Vec<FieldError>,
) {
    match issue_date {
        None => errors.push(FieldError::required("issue_date")),
        Some(issued) if issued > today => errors.push(FieldError::new(
            "issue_date",
            FieldErrorCode::InFuture,
            "cannot be in the future",
        )),
        Some(_) => {}
    }

    let Some(expiry) = expiry_date else {
        errors.push(FieldError::required("expiry_date"));
        return;
    };

    if let Some(issued) = issue_date {
        if expiry <= issued {
            errors.push(FieldError::new(
                "expiry_date",
                FieldErrorCode::NotAfterIssue,
                "must be after the issue date",
            ));
            return;
        }
    }

    if expiry <= today {
        errors.push(FieldError::new(
            "expiry_date",
            FieldErrorCode::Expired,
            "document has expired",
        ));
    }
}

fn id_documents(documents: &IdDocuments, errors: &mut Vec<FieldError>) {
    require_text("front_image", &documents.front_image, errors);
    require_text("selfie_image", &documents.selfie_image, errors);

    match documents.document_type {
        None => errors.push(FieldError::required("document_type")),
        Some(DocumentType::Passport) => {}
        Some(_) => {
            let back = documents.back_image.as_deref().unwrap_or_default();
            if back.trim().is_empty() {
                errors.push(FieldError::new(
                    "back_image",
                    FieldErrorCode::Required,
                    "is required for two-sided documents",
                ));
            }
        }
    }
}

fn liveness(consent: &LivenessConsent, errors: &mut Vec<FieldError>) {
    require_text("device_id", &consent.device_id, errors);
    if !consent.capture_consent {
        errors.push(FieldError::new(
            "capture_consent",
            FieldErrorCode::ConsentRequired,
            "camera capture consent must be confirmed",
        ));
    }
}

fn photo_upload(photo: &PhotoSubmission, errors: &mut Vec<FieldError>) {
    require_text("photo_ref", &photo.photo_ref, errors);

    let content_type = photo.content_type.trim().to_ascii_lowercase();
    if !ACCEPTED_PHOTO_TYPES.contains(&content_type.as_str()) {
        errors.push(FieldError::new(
            "content_type",
            FieldErrorCode::InvalidFormat,
            "photo must be a JPEG or PNG image",
        ));
    }

    if photo.size_bytes == 0 || photo.size_bytes > MAX_PHOTO_BYTES {
        errors.push(FieldError::new(
            "size_bytes",
            FieldErrorCode::OutOfRange,
            "photo must be between 1 byte and 5 MiB",
        ));
    }
}

fn require_text(field: &str, value: &str, errors: &mut Vec<FieldError>) -> bool {
    if value.trim().is_empty() {
        errors.push(FieldError::required(field));
        false
    } else {
        true
    }
}

fn age_on(dob: NaiveDate, today: NaiveDate) -> i32 {
    let mut age = today.year() - dob.year();
    if (today.month(), today.day()) < (dob.month(), dob.day()) {
        age -= 1;
    }
    age
}

fn is_email(value: &str) -> bool {
    let value = value.trim();
    let Some((local, domain)) = value.split_once('@') else {
        return false;
    };
    !local.is_empty()
        && !value.contains(char::is_whitespace)
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

fn is_phone(value: &str) -> bool {
    let value = value.trim();
    let body = value.strip_prefix('+').unwrap_or(value);
    if !body
        .chars()
        .all(|c| c.is_ascii_digit() || c == ' ' || c == '-')
    {
        return false;
    }
    let digits = body.chars().filter(char::is_ascii_digit).count();
    (7..=15).contains(&digits)
}

fn is_identifier(value: &str) -> bool {
    let value = value.trim();
    (6..=20).contains(&value.len())
        && value
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '-')
}

fn is_country_code(value: &str) -> bool {
    let value = value.trim();
    value.len() == 2 && value.chars().all(|c| c.is_ascii_uppercase())
}
