//! Remote attendance store.
//!
//! The backend is a PostgREST-style `attendance` table. Inserts are keyed on
//! `idempotency_key` with `resolution=ignore-duplicates`, so replaying the same
//! check-in leaves exactly one row. Stores without upsert support can enable
//! `dedup_precheck`, which looks the key up before inserting.

use std::future::Future;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use log::{debug, warn};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{StatusCode, Url};
use serde::Serialize;
use uuid::Uuid;

use crate::db::CheckInRecord;
use crate::settings::EndpointSettings;

/// How the remote store answered one delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Accepted,
    /// The store already holds this key; counts as delivered.
    Duplicate,
    /// Network failure, timeout or server-side error. Retry later.
    Transient(String),
    /// The store refused the record. Never retried.
    Rejected(String),
}

pub trait RemoteStore: Send + Sync + 'static {
    fn deliver(&self, record: &CheckInRecord) -> impl Future<Output = DeliveryOutcome> + Send;
}

/// Row shape of the `attendance` table.
#[derive(Debug, Serialize)]
struct AttendanceRow<'a> {
    idempotency_key: Uuid,
    employee_id: &'a str,
    bcvh_code: &'a str,
    status: &'static str,
    lat: f64,
    lng: f64,
    photo_url: &'a str,
    photo_content_type: &'a str,
    captured_at: DateTime<Utc>,
}

impl<'a> From<&'a CheckInRecord> for AttendanceRow<'a> {
    fn from(record: &'a CheckInRecord) -> Self {
        Self {
            idempotency_key: record.idempotency_key,
            employee_id: &record.subject_id,
            bcvh_code: &record.unit_code,
            status: "present",
            lat: record.coordinates.latitude,
            lng: record.coordinates.longitude,
            photo_url: &record.photo.uri,
            photo_content_type: &record.photo.content_type,
            captured_at: record.captured_at,
        }
    }
}

/// Maps an HTTP response onto the retry taxonomy.
pub fn classify_status(status: StatusCode, body: &str) -> DeliveryOutcome {
    if status.is_success() {
        return DeliveryOutcome::Accepted;
    }

    // A unique violation on the key itself means an earlier attempt landed.
    if status == StatusCode::CONFLICT && body.contains("23505") && body.contains("idempotency_key")
    {
        return DeliveryOutcome::Duplicate;
    }

    let detail = if body.is_empty() {
        status.to_string()
    } else {
        format!("{status}: {}", truncate(body, 200))
    };

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
        || status.as_u16() == 425
    {
        DeliveryOutcome::Transient(detail)
    } else {
        DeliveryOutcome::Rejected(detail)
    }
}

fn truncate(value: &str, max_chars: usize) -> &str {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => &value[..idx],
        None => value,
    }
}

pub struct RestRemote {
    client: reqwest::Client,
    table_url: Url,
    headers: HeaderMap,
    dedup_precheck: bool,
}

impl RestRemote {
    pub fn new(endpoint: &EndpointSettings, api_key: Option<&str>) -> Result<Self> {
        if endpoint.base_url.trim().is_empty() {
            bail!("endpoint.baseUrl is not configured");
        }
        let base = endpoint.base_url.trim().trim_end_matches('/');
        let table_url = Url::parse(&format!("{base}/rest/v1/{}", endpoint.table))
            .map_err(|e| anyhow!("invalid endpoint url '{}': {e}", endpoint.base_url))?;

        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        if let Some(key) = api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|e| anyhow!("invalid api key header: {e}"))?;
            let apikey =
                HeaderValue::from_str(key).map_err(|e| anyhow!("invalid api key header: {e}"))?;
            headers.insert(AUTHORIZATION, bearer);
            headers.insert("apikey", apikey);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(endpoint.attempt_timeout_secs))
            .build()
            .context("failed to build http client")?;

        Ok(Self {
            client,
            table_url,
            headers,
            dedup_precheck: endpoint.dedup_precheck,
        })
    }

    fn insert_url(&self) -> Url {
        let mut url = self.table_url.clone();
        url.query_pairs_mut()
            .append_pair("on_conflict", "idempotency_key");
        url
    }

    fn lookup_url(&self, key: Uuid) -> Url {
        let mut url = self.table_url.clone();
        url.query_pairs_mut()
            .append_pair("idempotency_key", &format!("eq.{key}"))
            .append_pair("select", "idempotency_key");
        url
    }

    /// `Ok(true)` when the store already has a row for `key`.
    async fn exists(&self, key: Uuid) -> Result<bool, DeliveryOutcome> {
        let response = self
            .client
            .get(self.lookup_url(key))
            .headers(self.headers.clone())
            .send()
            .await
            .map_err(|e| DeliveryOutcome::Transient(format!("lookup failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(match classify_status(status, &body) {
                DeliveryOutcome::Rejected(detail) => {
                    DeliveryOutcome::Rejected(format!("lookup refused: {detail}"))
                }
                other => other,
            });
        }

        let rows: Vec<serde_json::Value> = response
            .json()
            .await
            .map_err(|e| DeliveryOutcome::Transient(format!("unreadable lookup response: {e}")))?;
        Ok(!rows.is_empty())
    }

    async fn insert(&self, record: &CheckInRecord) -> DeliveryOutcome {
        let row = AttendanceRow::from(record);
        let response = self
            .client
            .post(self.insert_url())
            .headers(self.headers.clone())
            .header("Prefer", "resolution=ignore-duplicates,return=minimal")
            .json(&row)
            .send()
            .await;

        match response {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();
                classify_status(status, &body)
            }
            Err(err) => DeliveryOutcome::Transient(format!("request failed: {err}")),
        }
    }
}

impl RemoteStore for RestRemote {
    fn deliver(&self, record: &CheckInRecord) -> impl Future<Output = DeliveryOutcome> + Send {
        async move {
            let key = record.idempotency_key;
            if self.dedup_precheck {
                match self.exists(key).await {
                    Ok(true) => {
                        debug!("check-in {key} already present remotely");
                        return DeliveryOutcome::Duplicate;
                    }
                    Ok(false) => {}
                    Err(outcome) => {
                        warn!("pre-check for {key} failed: {outcome:?}");
                        return outcome;
                    }
                }
            }
            self.insert(record).await
        }
    }
}
