//! Filter construction for catalog lookups.
//!
//! The local table path binds every value as a query parameter and only ever
//! splices validated, double-quoted identifiers. The remote service accepts a
//! `where` string, so every literal goes through [`escape_literal`].

use std::sync::LazyLock;

use regex::Regex;
use rollcall_core::{GeocodeRequest, ProviderError};
use serde::Deserialize;
use sqlx::{Postgres, QueryBuilder};

static IDENTIFIER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strictness {
    /// Case-insensitive equality.
    Exact,
    /// Case-insensitive substring.
    Fuzzy,
}

/// Which catalog columns hold each address part.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    pub address_field: String,
    #[serde(default)]
    pub city_field: Option<String>,
    #[serde(default)]
    pub state_field: Option<String>,
    #[serde(default)]
    pub zip_field: Option<String>,
}

impl FieldMapping {
    /// `(column, value)` pairs for the parts of `request` that are mapped and
    /// non-blank.
    pub fn terms<'a>(&'a self, request: &'a GeocodeRequest) -> Vec<(&'a str, &'a str)> {
        let candidates = [
            (Some(&self.address_field), request.street.as_str()),
            (self.city_field.as_ref(), request.city.as_str()),
            (self.state_field.as_ref(), request.state.as_str()),
            (self.zip_field.as_ref(), request.zip.as_str()),
        ];
        candidates
            .into_iter()
            .filter_map(|(field, value)| {
                let field = field.filter(|f| !f.trim().is_empty())?;
                let value = value.trim();
                (!value.is_empty()).then_some((field.as_str(), value))
            })
            .collect()
    }

    pub fn validate(&self) -> Result<(), ProviderError> {
        check_identifier(&self.address_field)?;
        for field in [&self.city_field, &self.state_field, &self.zip_field]
            .into_iter()
            .flatten()
            .filter(|f| !f.trim().is_empty())
        {
            check_identifier(field)?;
        }
        Ok(())
    }
}

pub fn check_identifier(name: &str) -> Result<(), ProviderError> {
    if IDENTIFIER.is_match(name) {
        Ok(())
    } else {
        Err(ProviderError::Config(format!("invalid identifier: {:?}", name)))
    }
}

/// Double-quote a column name, or a `schema.table` path part by part.
pub fn quote_identifier(name: &str) -> Result<String, ProviderError> {
    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 2 {
        return Err(ProviderError::Config(format!("invalid identifier: {:?}", name)));
    }
    parts
        .into_iter()
        .map(|part| {
            check_identifier(part)?;
            Ok(format!("\"{}\"", part))
        })
        .collect::<Result<Vec<_>, _>>()
        .map(|parts| parts.join("."))
}

/// Escape a string literal for a remote `where` clause by doubling quotes.
pub fn escape_literal(value: &str) -> String {
    value.replace('\'', "''")
}

/// Escape LIKE wildcards so user text only ever matches literally.
fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | '%' | '_') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Build the `where` clause sent to a remote feature-query service.
pub fn remote_where(
    mapping: &FieldMapping,
    strictness: Strictness,
    request: &GeocodeRequest,
) -> Result<String, ProviderError> {
    mapping.validate()?;
    let terms = mapping.terms(request);
    if terms.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "request has no mapped address parts".to_string(),
        ));
    }

    let clauses: Vec<String> = terms
        .into_iter()
        .map(|(field, value)| match strictness {
            Strictness::Exact => {
                format!("UPPER({}) = UPPER('{}')", field, escape_literal(value))
            }
            Strictness::Fuzzy => {
                format!("UPPER({}) LIKE UPPER('%{}%')", field, escape_literal(value))
            }
        })
        .collect();
    Ok(clauses.join(" AND "))
}

/// Build a parameterized point lookup against a local PostGIS table.
pub fn local_query<'a>(
    table: &str,
    geometry_column: &str,
    mapping: &'a FieldMapping,
    strictness: Strictness,
    request: &'a GeocodeRequest,
) -> Result<QueryBuilder<'a, Postgres>, ProviderError> {
    mapping.validate()?;
    let table = quote_identifier(table)?;
    let geometry = quote_identifier(geometry_column)?;
    let address = quote_identifier(&mapping.address_field)?;

    let terms = mapping.terms(request);
    if terms.is_empty() {
        return Err(ProviderError::InvalidResponse(
            "request has no mapped address parts".to_string(),
        ));
    }

    let mut builder = QueryBuilder::new(format!(
        "SELECT ST_Y(ST_Centroid({geometry})) AS latitude, \
         ST_X(ST_Centroid({geometry})) AS longitude, \
         {address}::text AS matched_address FROM {table} WHERE "
    ));

    for (i, (field, value)) in terms.into_iter().enumerate() {
        if i > 0 {
            builder.push(" AND ");
        }
        let column = quote_identifier(field)?;
        match strictness {
            Strictness::Exact => {
                builder.push(format!("lower({}::text) = lower(", column));
                builder.push_bind(value.to_string());
                builder.push(")");
            }
            Strictness::Fuzzy => {
                builder.push(format!("lower({}::text) LIKE lower(", column));
                builder.push_bind(format!("%{}%", escape_like(value)));
                builder.push(") ESCAPE '\\'");
            }
        }
    }
    builder.push(" LIMIT 1");
    Ok(builder)
}
