//! REST collaborator client: location updates and nearby-user snapshots.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use vicinity_shared::constants::{LOCATION_PATH, NEARBY_PATH};
use vicinity_shared::types::{fallback_name, Coordinates, NearbyUser, UserId};

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Server rejected request: {0}")]
    Status(reqwest::StatusCode),
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocationBody<'a> {
    user_id: &'a str,
    latitude: f64,
    longitude: f64,
}

/// Nearby-user entry as the server reports it; names are optional.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NearbyUserWire {
    user_id: String,
    name: Option<String>,
    location: Coordinates,
}

/// Client for the proximity REST endpoints on the base service URL.
#[derive(Debug, Clone)]
pub struct ProximityApi {
    http: reqwest::Client,
    base_url: String,
}

impl ProximityApi {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    /// Posts the device's current coordinates.
    pub async fn save_location(
        &self,
        user_id: &UserId,
        coords: Coordinates,
    ) -> Result<(), ApiError> {
        let url = format!("{}{}", self.base_url.trim_end_matches('/'), LOCATION_PATH);
        let body = LocationBody {
            user_id: &user_id.0,
            latitude: coords.latitude,
            longitude: coords.longitude,
        };
        let resp = self.http.post(&url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        debug!(user = %user_id, "Location saved");
        Ok(())
    }

    /// Fetches the nearby-user snapshot, excluding the local user. The
    /// returned list replaces any previous snapshot wholesale.
    pub async fn nearby_users(
        &self,
        coords: Coordinates,
        radius_m: u32,
        exclude: &UserId,
    ) -> Result<Vec<NearbyUser>, ApiError> {
        let url = nearby_url(&self.base_url, coords, radius_m);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(ApiError::Status(resp.status()));
        }
        let raw: Vec<NearbyUserWire> = resp.json().await?;
        let users = shape_nearby(raw, exclude);
        debug!(count = users.len(), "Nearby snapshot fetched");
        Ok(users)
    }
}

fn nearby_url(base: &str, coords: Coordinates, radius_m: u32) -> String {
    format!(
        "{}{}?latitude={}&longitude={}&radius={}",
        base.trim_end_matches('/'),
        NEARBY_PATH,
        coords.latitude,
        coords.longitude,
        radius_m
    )
}

fn shape_nearby(raw: Vec<NearbyUserWire>, exclude: &UserId) -> Vec<NearbyUser> {
    raw.into_iter()
        .filter(|u| u.user_id != exclude.0)
        .map(|u| {
            let user_id = UserId(u.user_id);
            let name = u.name.unwrap_or_else(|| fallback_name(&user_id));
            NearbyUser {
                user_id,
                name,
                location: u.location,
            }
        })
        .collect()
}
