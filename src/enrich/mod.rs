//! Weather and taxonomy enrichment: best-effort, non-blocking calls
//! whose failures are logged and leave fields null.
//! Neither facade ever blocks persistence or causes a detection to be
//! dropped.

use std::time::Duration;

use serde::Deserialize;

use crate::model::TaxonomyEntry;
use crate::storage::EventStore;
use crate::time;

const ENRICHMENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug, Default)]
pub struct WeatherSnapshot {
    pub temperature: Option<f64>,
    pub condition: Option<String>,
    pub wind_speed: Option<f64>,
    pub cloud_cover: Option<f64>,
    pub precipitation: Option<f64>,
}

pub struct Enrichment {
    client: reqwest::Client,
    weather_base_url: Option<String>,
    taxonomy_base_url: Option<String>,
    latitude: f64,
    longitude: f64,
}

impl Enrichment {
    pub fn new(
        weather_base_url: Option<String>,
        taxonomy_base_url: Option<String>,
        latitude: f64,
        longitude: f64,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            weather_base_url,
            taxonomy_base_url,
            latitude,
            longitude,
        }
    }

    /// Fetches current conditions; any failure (disabled config, network
    /// error, bad payload) yields an all-null snapshot rather than
    /// propagating.
    pub async fn fetch_weather(&self) -> WeatherSnapshot {
        match self.try_fetch_weather().await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                tracing::warn!(error = %err, "weather enrichment failed");
                WeatherSnapshot::default()
            }
        }
    }

    async fn try_fetch_weather(&self) -> anyhow::Result<WeatherSnapshot> {
        let base = self
            .weather_base_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("weather enrichment disabled"))?;

        let response = self
            .client
            .get(base)
            .query(&[
                ("latitude", self.latitude.to_string()),
                ("longitude", self.longitude.to_string()),
                ("current", "temperature_2m,wind_speed_10m,cloud_cover,precipitation,weather_code".to_string()),
            ])
            .timeout(ENRICHMENT_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let body: OpenMeteoResponse = response.json().await?;
        Ok(body.into_snapshot())
    }

    /// Resolves a scientific name to display metadata. Consults the
    /// taxonomy cache in the event store first; on a miss, calls the
    /// upstream facade and writes the result back to the cache.
    pub async fn fetch_taxonomy(
        &self,
        store: &dyn EventStore,
        scientific_name: &str,
    ) -> Option<TaxonomyEntry> {
        if let Ok(Some(cached)) = store.get_taxonomy(scientific_name) {
            return Some(cached);
        }

        match self.try_fetch_taxonomy(scientific_name).await {
            Ok(entry) => {
                if let Err(err) = store.upsert_taxonomy(&entry) {
                    tracing::warn!(error = %err, "failed to cache taxonomy entry");
                }
                Some(entry)
            }
            Err(err) => {
                tracing::warn!(error = %err, scientific_name, "taxonomy enrichment failed");
                None
            }
        }
    }

    async fn try_fetch_taxonomy(&self, scientific_name: &str) -> anyhow::Result<TaxonomyEntry> {
        let base = self
            .taxonomy_base_url
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("taxonomy enrichment disabled"))?;

        let response = self
            .client
            .get(base)
            .query(&[("scientificName", scientific_name)])
            .timeout(ENRICHMENT_TIMEOUT)
            .send()
            .await?
            .error_for_status()?;

        let body: TaxonomyApiResponse = response.json().await?;
        Ok(TaxonomyEntry {
            scientific_name: scientific_name.to_string(),
            common_name: body.common_name,
            taxa_id: body.taxa_id,
            updated_at: time::to_canonical(time::now()),
        })
    }
}

#[derive(Deserialize)]
struct OpenMeteoResponse {
    current: OpenMeteoCurrent,
}

#[derive(Deserialize)]
struct OpenMeteoCurrent {
    temperature_2m: Option<f64>,
    wind_speed_10m: Option<f64>,
    cloud_cover: Option<f64>,
    precipitation: Option<f64>,
    weather_code: Option<u32>,
}

impl OpenMeteoResponse {
    fn into_snapshot(self) -> WeatherSnapshot {
        WeatherSnapshot {
            temperature: self.current.temperature_2m,
            condition: self.current.weather_code.map(weather_code_to_condition),
            wind_speed: self.current.wind_speed_10m,
            cloud_cover: self.current.cloud_cover,
            precipitation: self.current.precipitation,
        }
    }
}

fn weather_code_to_condition(code: u32) -> String {
    match code {
        0 => "clear",
        1..=3 => "partly_cloudy",
        45 | 48 => "fog",
        51..=57 => "drizzle",
        61..=67 => "rain",
        71..=77 => "snow",
        80..=82 => "rain_showers",
        85 | 86 => "snow_showers",
        95..=99 => "thunderstorm",
        _ => "unknown",
    }
    .to_string()
}

#[derive(Deserialize)]
struct TaxonomyApiResponse {
    #[serde(rename = "commonName")]
    common_name: String,
    #[serde(rename = "taxaId")]
    taxa_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn weather_code_mapping_covers_common_ranges() {
        assert_eq!(weather_code_to_condition(0), "clear");
        assert_eq!(weather_code_to_condition(63), "rain");
        assert_eq!(weather_code_to_condition(95), "thunderstorm");
        assert_eq!(weather_code_to_condition(200), "unknown");
    }

    #[tokio::test]
    async fn disabled_weather_facade_yields_null_snapshot() {
        let enrichment = Enrichment::new(None, None, 0.0, 0.0);
        let snapshot = enrichment.fetch_weather().await;
        assert!(snapshot.temperature.is_none());
    }
}
