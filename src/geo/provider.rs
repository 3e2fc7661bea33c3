//! Geocoder abstraction, match scoring, and a Nominatim-compatible HTTP provider.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;

use crate::config::GeocoderConfig;

/// One candidate returned by a geocoder, best first.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GeocodeMatch {
    pub lat: f64,
    pub lon: f64,
    pub formatted_address: Option<String>,
    pub city: Option<String>,
    pub country: Option<String>,
    /// Set when the match resolved down to a street.
    pub street: Option<String>,
}

/// Confidence in `[0, 1]`: base 0.5, +0.2 city, +0.15 country, +0.15 street level.
pub fn confidence(m: &GeocodeMatch) -> f64 {
    let mut c = 0.5;
    if m.city.is_some() {
        c += 0.2;
    }
    if m.country.is_some() {
        c += 0.15;
    }
    if m.street.is_some() {
        c += 0.15;
    }
    f64::min(c, 1.0)
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    async fn geocode(&self, text: &str) -> Result<Vec<GeocodeMatch>>;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Deserialize)]
struct NominatimPlace {
    lat: String,
    lon: String,
    display_name: Option<String>,
    #[serde(default)]
    address: NominatimAddress,
}

#[derive(Debug, Default, Deserialize)]
struct NominatimAddress {
    city: Option<String>,
    town: Option<String>,
    village: Option<String>,
    municipality: Option<String>,
    country: Option<String>,
    road: Option<String>,
}

/// Parse a Nominatim `/search?format=json&addressdetails=1` body.
pub fn parse_nominatim(body: &str) -> Result<Vec<GeocodeMatch>> {
    let places: Vec<NominatimPlace> =
        serde_json::from_str(body).context("parsing nominatim response")?;

    places
        .into_iter()
        .map(|p| {
            let lat = p
                .lat
                .trim()
                .parse::<f64>()
                .with_context(|| format!("bad lat {:?}", p.lat))?;
            let lon = p
                .lon
                .trim()
                .parse::<f64>()
                .with_context(|| format!("bad lon {:?}", p.lon))?;
            let a = p.address;
            Ok(GeocodeMatch {
                lat,
                lon,
                formatted_address: p.display_name,
                city: a.city.or(a.town).or(a.village).or(a.municipality),
                country: a.country,
                street: a.road,
            })
        })
        .collect()
}

pub struct NominatimGeocoder {
    http: reqwest::Client,
    base_url: String,
}

impl NominatimGeocoder {
    pub fn new(cfg: &GeocoderConfig, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .user_agent(cfg.user_agent.as_str())
            .connect_timeout(Duration::from_secs(4))
            .timeout(timeout)
            .build()
            .context("building geocoder http client")?;
        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
        })
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, text: &str) -> Result<Vec<GeocodeMatch>> {
        let url = reqwest::Url::parse_with_params(
            &format!("{}/search", self.base_url),
            &[
                ("q", text),
                ("format", "json"),
                ("addressdetails", "1"),
                ("limit", "1"),
            ],
        )
        .context("building geocoder url")?;

        let body = self
            .http
            .get(url)
            .send()
            .await
            .context("geocoder http get()")?
            .error_for_status()
            .context("geocoder http status")?
            .text()
            .await
            .context("geocoder http .text()")?;
        parse_nominatim(&body)
    }

    fn name(&self) -> &'static str {
        "nominatim"
    }
}
