//! Minimal view of the household records geocode jobs update.
//!
//! The full household schema belongs to the record-management side of the
//! application; the job subsystem only reads addresses and writes coordinates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ResourceId;
use crate::geocode::GeocodeRequest;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Household {
    pub id: ResourceId,
    pub address_line: String,
    pub city: String,
    pub state: String,
    pub zip: String,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub geocoded_at: Option<DateTime<Utc>>,
    pub geocode_source: Option<String>,
}

impl Household {
    pub fn is_geocoded(&self) -> bool {
        self.latitude.is_some() && self.longitude.is_some()
    }

    /// Whether there is enough of an address to look up.
    pub fn has_address(&self) -> bool {
        !self.address_line.trim().is_empty()
            && (!self.zip.trim().is_empty() || !self.city.trim().is_empty())
    }

    pub fn to_request(&self) -> GeocodeRequest {
        GeocodeRequest {
            id: self.id.to_string(),
            street: self.address_line.clone(),
            city: self.city.clone(),
            state: self.state.clone(),
            zip: self.zip.clone(),
        }
    }
}

/// Selection of households a geocode job targets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HouseholdFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zip: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub household_ids: Vec<ResourceId>,
}

impl HouseholdFilter {
    /// Whether a household is selected, ignoring geocoded state.
    pub fn matches(&self, household: &Household) -> bool {
        fn eq(want: &Option<String>, have: &str) -> bool {
            want.as_deref()
                .map(|w| w.eq_ignore_ascii_case(have.trim()))
                .unwrap_or(true)
        }
        eq(&self.city, &household.city)
            && eq(&self.state, &household.state)
            && eq(&self.zip, &household.zip)
            && (self.household_ids.is_empty() || self.household_ids.contains(&household.id))
    }
}
