//! Remote race source.
//!
//! [`RaceSource`] is the seam the sync pipeline fetches through; [`HttpSource`]
//! is the production implementation over the data API. Tests substitute a
//! scripted source.
//!
//! JSON endpoints answer `{"data": ...}` with timestamps as
//! `YYYY-MM-DD HH:MM:SS.ffffff` UTC strings. The historical endpoint serves
//! CSV.

use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderValue, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer};

use crate::config::ApiConfig;
use crate::error::{TlError, TlResult};
use crate::model::{RemoteAccount, RemoteRace, TextEntry};

/// One page request against the listing endpoint. Bounds are inclusive and
/// in epoch milliseconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListQuery {
    pub partition: String,
    pub account: String,
    pub start_ms: i64,
    pub end_ms: i64,
    pub page_size: u32,
}

/// Full record as served by the detail endpoint.
#[derive(Debug, Clone, PartialEq)]
pub struct RaceDetail {
    pub race: RemoteRace,
    pub quote: Option<String>,
}

#[async_trait]
pub trait RaceSource: Send + Sync {
    /// `None` when the account does not exist in the partition.
    async fn account_summary(&self, partition: &str, account: &str)
    -> TlResult<Option<RemoteAccount>>;

    /// Races completed within the query window, newest first.
    async fn list_races(&self, query: &ListQuery) -> TlResult<Vec<RemoteRace>>;

    /// Races whose sequence numbers fall in bucket `bucket`, i.e.
    /// `bucket * width + 1 ..= (bucket + 1) * width`.
    async fn historical_bucket(
        &self,
        partition: &str,
        account: &str,
        bucket: u64,
    ) -> TlResult<Vec<RemoteRace>>;

    async fn race_detail(
        &self,
        partition: &str,
        account: &str,
        sequence: u64,
    ) -> TlResult<Option<RaceDetail>>;

    async fn text(&self, partition: &str, text_id: u32) -> TlResult<Option<TextEntry>>;
}

/// Notified when a text is seen for the first time so leaderboards and
/// text statistics can be refreshed.
#[async_trait]
pub trait TextObserver: Send + Sync {
    async fn text_registered(&self, partition: &str, text: &TextEntry);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTextObserver;

#[async_trait]
impl TextObserver for NoopTextObserver {
    async fn text_registered(&self, _partition: &str, _text: &TextEntry) {}
}

/// Every JSON endpoint wraps its payload as `{"data": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// Timestamps on the wire are UTC wall-clock strings.
const WIRE_TIME_PARSE: &str = "%Y-%m-%d %H:%M:%S%.f";
const WIRE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

fn parse_wire_time(raw: &str) -> TlResult<i64> {
    NaiveDateTime::parse_from_str(raw.trim(), WIRE_TIME_PARSE)
        .map(|time| time.and_utc().timestamp_millis())
        .map_err(|error| TlError::Transport(format!("unreadable timestamp `{raw}`: {error}")))
}

fn format_wire_time(ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ms)
        .unwrap_or_default()
        .format(WIRE_TIME_FORMAT)
        .to_string()
}

fn deserialize_wire_time<'de, D: Deserializer<'de>>(deserializer: D) -> Result<i64, D::Error> {
    let raw = String::deserialize(deserializer)?;
    parse_wire_time(&raw).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize)]
struct WireRace {
    rn: u64,
    tid: u32,
    wpm: f64,
    #[serde(default)]
    acc: Option<f64>,
    #[serde(default)]
    pts: Option<f64>,
    #[serde(default)]
    r: u32,
    #[serde(default)]
    nr: u32,
    #[serde(default)]
    rid: String,
    #[serde(deserialize_with = "deserialize_wire_time")]
    t: i64,
    #[serde(default)]
    kl: Option<String>,
    #[serde(default)]
    q: Option<String>,
}

impl WireRace {
    fn into_race(self) -> (RemoteRace, Option<String>) {
        let race = RemoteRace {
            sequence: self.rn,
            text_id: self.tid,
            speed: self.wpm,
            accuracy: self.acc.unwrap_or(0.0),
            points: self.pts,
            rank: self.r,
            peer_count: self.nr,
            correlation_id: self.rid,
            timestamp_ms: self.t,
            log: self.kl.filter(|log| !log.is_empty()),
        };
        (race, self.q)
    }
}

#[derive(Debug, Deserialize)]
struct WireStats {
    total_races: u64,
}

#[derive(Debug, Deserialize)]
struct WireText {
    text: String,
    #[serde(default)]
    disabled: bool,
}

/// One row of the historical CSV export.
#[derive(Debug, Deserialize)]
struct HistoricalRow {
    #[serde(rename = "Race #")]
    sequence: u64,
    #[serde(rename = "Race ID", default)]
    race_id: String,
    #[serde(rename = "Text ID")]
    text_id: u32,
    #[serde(rename = "Date/Time (UTC)")]
    time: String,
    /// `None` in the export when unknown.
    #[serde(rename = "Accuracy", deserialize_with = "csv::invalid_option")]
    accuracy: Option<f64>,
    #[serde(rename = "WPM")]
    speed: f64,
    #[serde(rename = "Points", deserialize_with = "csv::invalid_option")]
    points: Option<f64>,
    #[serde(rename = "# Racers")]
    peer_count: u32,
    #[serde(rename = "Rank")]
    rank: u32,
    #[serde(rename = "Keylog", default)]
    keylog: String,
}

impl HistoricalRow {
    fn into_race(self) -> TlResult<RemoteRace> {
        Ok(RemoteRace {
            sequence: self.sequence,
            text_id: self.text_id,
            speed: self.speed,
            accuracy: self.accuracy.unwrap_or(0.0),
            points: self.points,
            rank: self.rank,
            peer_count: self.peer_count,
            correlation_id: self.race_id,
            timestamp_ms: parse_wire_time(&self.time)?,
            log: Some(self.keylog).filter(|log| !log.is_empty()),
        })
    }
}

fn decode_json<T: DeserializeOwned>(endpoint: &str, body: &[u8]) -> TlResult<T> {
    serde_json::from_slice(body).map_err(|error| {
        TlError::Transport(format!("`{endpoint}` returned an unexpected body: {error}"))
    })
}

fn parse_race_page(body: &[u8]) -> TlResult<Vec<RemoteRace>> {
    let page: Envelope<Vec<WireRace>> = decode_json("races", body)?;
    Ok(page.data.into_iter().map(|race| race.into_race().0).collect())
}

/// An account with no races in the partition has an empty `data` list.
fn parse_stats(body: &[u8]) -> TlResult<RemoteAccount> {
    let stats: Envelope<Vec<WireStats>> = decode_json("stats", body)?;
    let total_races = stats.data.first().map_or(0, |row| row.total_races);
    Ok(RemoteAccount {
        sequence_high_water: total_races,
    })
}

fn parse_race_detail(body: &[u8]) -> TlResult<Option<RaceDetail>> {
    let detail: Envelope<Option<WireRace>> = decode_json("race", body)?;
    Ok(detail.data.map(|race| {
        let (race, quote) = race.into_race();
        RaceDetail { race, quote }
    }))
}

/// The export is served as UTF-8; undecodable bytes are replaced rather than
/// failing the bucket.
fn parse_historical_csv(body: &[u8]) -> TlResult<Vec<RemoteRace>> {
    let text = String::from_utf8_lossy(body);
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    reader
        .deserialize::<HistoricalRow>()
        .map(|row| {
            row.map_err(|error| TlError::Transport(format!("`historical` csv: {error}")))
                .and_then(HistoricalRow::into_race)
        })
        .collect()
}

pub struct HttpSource {
    client: Client,
    base_url: String,
    authorizations: Vec<HeaderValue>,
    next_credential: AtomicUsize,
}

impl HttpSource {
    pub fn new(config: &ApiConfig) -> TlResult<Self> {
        let client = Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|error| TlError::Config(format!("cannot build http client: {error}")))?;

        let authorizations = config
            .credentials
            .iter()
            .map(|pair| {
                let token = STANDARD.encode(pair.as_bytes());
                HeaderValue::from_str(&format!("Basic {token}"))
                    .map_err(|error| TlError::Config(format!("invalid credential: {error}")))
            })
            .collect::<TlResult<Vec<_>>>()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            authorizations,
            next_credential: AtomicUsize::new(0),
        })
    }

    /// Credentials rotate per request so load spreads across accounts.
    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        if self.authorizations.is_empty() {
            return request;
        }
        let index = self.next_credential.fetch_add(1, Ordering::Relaxed) % self.authorizations.len();
        request.header(AUTHORIZATION, self.authorizations[index].clone())
    }

    /// Response body, or `None` on 404.
    async fn get_body(
        &self,
        endpoint: &str,
        path: &str,
        query: &[(&str, String)],
        accept: &'static str,
    ) -> TlResult<Option<Vec<u8>>> {
        let url = format!("{}{path}", self.base_url);
        tracing::debug!(endpoint, url = %url, "remote request");
        let request = self
            .authorize(self.client.get(&url).query(query))
            .header(ACCEPT, accept);
        let response = request.send().await?;
        let Some(response) = check_status(endpoint, response)? else {
            return Ok(None);
        };
        Ok(Some(response.bytes().await?.to_vec()))
    }
}

fn check_status(endpoint: &str, response: Response) -> TlResult<Option<Response>> {
    let status = response.status();
    if status == StatusCode::NOT_FOUND {
        return Ok(None);
    }
    if status == StatusCode::TOO_MANY_REQUESTS {
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok());
        return Err(TlError::rate_limited(endpoint, retry_after));
    }
    if !status.is_success() {
        return Err(TlError::Transport(format!("{endpoint} returned HTTP {status}")));
    }
    Ok(Some(response))
}

const JSON: &str = "application/json";

#[async_trait]
impl RaceSource for HttpSource {
    async fn account_summary(
        &self,
        partition: &str,
        account: &str,
    ) -> TlResult<Option<RemoteAccount>> {
        self.get_body(
            "stats",
            &format!("/racers/{account}/stats"),
            &[("universe", partition.to_owned())],
            JSON,
        )
        .await?
        .map(|body| parse_stats(&body))
        .transpose()
    }

    async fn list_races(&self, query: &ListQuery) -> TlResult<Vec<RemoteRace>> {
        let body = self
            .get_body(
                "races",
                &format!("/racers/{}/races", query.account),
                &[
                    ("universe", query.partition.clone()),
                    ("after", format_wire_time(query.start_ms)),
                    ("before", format_wire_time(query.end_ms)),
                    ("keylog", "true".to_owned()),
                    ("n", query.page_size.to_string()),
                ],
                JSON,
            )
            .await?;
        body.map_or_else(|| Ok(Vec::new()), |body| parse_race_page(&body))
    }

    async fn historical_bucket(
        &self,
        partition: &str,
        account: &str,
        bucket: u64,
    ) -> TlResult<Vec<RemoteRace>> {
        let body = self
            .get_body(
                "historical",
                &format!("/racers/{account}/historical/races"),
                &[
                    ("universe", partition.to_owned()),
                    ("bucket", bucket.to_string()),
                ],
                "text/csv",
            )
            .await?;
        body.map_or_else(|| Ok(Vec::new()), |body| parse_historical_csv(&body))
    }

    async fn race_detail(
        &self,
        partition: &str,
        account: &str,
        sequence: u64,
    ) -> TlResult<Option<RaceDetail>> {
        let body = self
            .get_body(
                "race",
                &format!("/racers/{account}/races/{sequence}"),
                &[
                    ("universe", partition.to_owned()),
                    ("keylog", "true".to_owned()),
                ],
                JSON,
            )
            .await?;
        Ok(body.map(|body| parse_race_detail(&body)).transpose()?.flatten())
    }

    async fn text(&self, partition: &str, text_id: u32) -> TlResult<Option<TextEntry>> {
        let Some(body) = self
            .get_body(
                "text",
                &format!("/texts/{text_id}"),
                &[("universe", partition.to_owned())],
                JSON,
            )
            .await?
        else {
            return Ok(None);
        };
        let envelope: Envelope<Option<WireText>> = decode_json("text", &body)?;
        Ok(envelope.data.map(|text| TextEntry {
            text_id,
            quote: text.text,
            disabled: text.disabled,
        }))
    }
}
