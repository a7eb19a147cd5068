//! Protected attributes that may never be used as model inputs.
//!
//! A column matches an attribute when it is the attribute itself or carries it
//! as an underscore-separated part (`race`, `race_code`, `customer_religion`).

use crate::error::{Error, Result};

pub const PROHIBITED_FEATURES: &[&str] = &[
    "race",
    "ethnicity",
    "national_origin",
    "religion",
    "sexual_orientation",
    "marital_status",
    "disability",
    "political_affiliation",
    "military_status",
];

// Allowed, but likely to stand in for a protected attribute
pub const PROXY_FEATURES: &[&str] = &[
    "zip_code",
    "income",
    "education_level",
    "first_name",
    "last_name",
];

fn carries(column: &str, attribute: &str) -> bool {
    let column = column.to_ascii_lowercase();
    column == attribute
        || column.starts_with(&format!("{attribute}_"))
        || column.ends_with(&format!("_{attribute}"))
        || column.contains(&format!("_{attribute}_"))
}

pub fn prohibited<'a>(columns: impl IntoIterator<Item = &'a str>) -> Vec<&'a str> {
    let mut found: Vec<&str> = columns
        .into_iter()
        .filter(|c| PROHIBITED_FEATURES.iter().any(|a| carries(c, a)))
        .collect();
    found.sort_unstable();
    found
}

/// Rejects any protected column; proxy columns are only logged.
pub fn check_columns<'a>(columns: impl IntoIterator<Item = &'a str> + Clone) -> Result<()> {
    let found = prohibited(columns.clone());
    if !found.is_empty() {
        return Err(Error::InvalidInput(format!(
            "prohibited features present: {}",
            found.join(", ")
        )));
    }

    let proxies: Vec<&str> = columns
        .into_iter()
        .filter(|c| PROXY_FEATURES.iter().any(|a| carries(c, a)))
        .collect();
    if !proxies.is_empty() {
        tracing::debug!(?proxies, "scoring with proxy features");
    }
    Ok(())
}
