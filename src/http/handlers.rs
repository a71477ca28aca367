//! HTTP request handlers

use std::collections::BTreeSet;
use std::sync::Arc;

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{NaiveDate, TimeZone};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::config_file::parse_timezone;
use crate::error::DvrError;
use crate::state::AppState;
use crate::storage::StorageManager;
use crate::stream;

/// HTTP error type
#[derive(Debug)]
pub enum HttpError {
    BadRequest(String),
    NotReady(String),
    Internal(String),
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            HttpError::BadRequest(m) => (StatusCode::BAD_REQUEST, m),
            HttpError::NotReady(m) => (StatusCode::SERVICE_UNAVAILABLE, m),
            HttpError::Internal(m) => (StatusCode::INTERNAL_SERVER_ERROR, m),
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

impl From<DvrError> for HttpError {
    fn from(err: DvrError) -> Self {
        match err {
            DvrError::VolumeNotReady(m) => HttpError::NotReady(m),
            DvrError::Config(m) => HttpError::BadRequest(m),
            other => HttpError::Internal(other.to_string()),
        }
    }
}

pub async fn index_page() -> &'static str {
    concat!("dvr-server v", env!("CARGO_PKG_VERSION"))
}

pub async fn health_check() -> &'static str {
    "OK"
}

#[derive(Debug, Serialize)]
pub struct CacheStatusBody {
    pub status: &'static str,
    pub progress: u32,
    pub total: usize,
    pub current: usize,
    pub cached: usize,
}

fn cache_status_body(storage: Option<&StorageManager>) -> CacheStatusBody {
    match storage {
        None => CacheStatusBody { status: "not_loaded", progress: 0, total: 0, current: 0, cached: 0 },
        Some(storage) => {
            let s = storage.status();
            CacheStatusBody {
                status: if s.building { "building" } else { "ready" },
                progress: s.progress_percent(),
                total: s.total,
                current: s.current,
                cached: s.cached_count,
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ConfigResponse {
    pub storage_path: String,
    pub loaded: bool,
    pub timezone: String,
    pub path_history: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<CacheStatusBody>,
}

fn config_response(state: &AppState) -> ConfigResponse {
    let settings = state.settings();
    let storage = state.storage();
    ConfigResponse {
        storage_path: settings.storage_path,
        loaded: storage.is_some(),
        timezone: settings.timezone,
        path_history: settings.path_history,
        entry_count: storage.as_ref().map(|s| s.entry_count()),
        file_count: storage.as_ref().map(|s| s.file_count()),
        cache_status: storage.as_ref().map(|s| cache_status_body(Some(s))),
    }
}

/// GET /api/v1/config
pub async fn get_config(State(state): State<Arc<AppState>>) -> Json<ConfigResponse> {
    Json(config_response(&state))
}

#[derive(Debug, Deserialize)]
pub struct ConfigUpdate {
    pub storage_path: Option<String>,
    pub timezone: Option<String>,
}

/// POST /api/v1/config
///
/// Changing `storage_path` swaps the active storage manager (the old one
/// stays in the MRU pool) and kicks off cache construction asynchronously.
pub async fn post_config(
    State(state): State<Arc<AppState>>,
    Json(update): Json<ConfigUpdate>,
) -> Result<Json<ConfigResponse>, HttpError> {
    if let Some(tz) = &update.timezone {
        parse_timezone(tz)?;
        state.update_settings(|s| s.timezone = tz.clone());
    }

    if let Some(path) = &update.storage_path {
        if !path.is_empty() {
            let manager = state.mount_volume(std::path::Path::new(path))?;
            state.update_settings(|s| {
                s.storage_path = path.clone();
                s.remember_path(path);
            });
            state.spawn_cache_build(manager);
        } else {
            state.update_settings(|s| s.storage_path.clear());
        }
    }

    Ok(Json(config_response(&state)))
}

/// GET /api/v1/cache/status
pub async fn cache_status(State(state): State<Arc<AppState>>) -> Json<CacheStatusBody> {
    let storage = state.storage();
    Json(cache_status_body(storage.as_deref()))
}

#[derive(Debug, Deserialize)]
pub struct DatesQuery {
    pub channel: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct DatesResponse {
    pub dates: Vec<String>,
    pub channels: Vec<u16>,
}

/// GET /api/v1/recordings/dates?channel=N
///
/// Dates are computed in the configured zone; a segment straddling local
/// midnight contributes every day it touches.
pub async fn recordings_dates(
    State(state): State<Arc<AppState>>,
    Query(query): Query<DatesQuery>,
) -> Result<Json<DatesResponse>, HttpError> {
    let storage = state
        .storage()
        .ok_or_else(|| HttpError::NotReady("no volume mounted".into()))?;
    let tz = state.settings().tz();

    let mut dates = BTreeSet::new();
    let mut channels = BTreeSet::new();
    for segment in storage.segments() {
        channels.insert(segment.channel_id);
        if let Some(want) = query.channel {
            if segment.channel_id != want {
                continue;
            }
        }
        let mut day = tz.timestamp_opt(i64::from(segment.start_time), 0).unwrap().date_naive();
        let last = tz.timestamp_opt(i64::from(segment.end_time), 0).unwrap().date_naive();
        while day <= last {
            dates.insert(day.format("%Y-%m-%d").to_string());
            let Some(next) = day.succ_opt() else { break };
            day = next;
        }
    }

    Ok(Json(DatesResponse {
        dates: dates.into_iter().collect(),
        channels: channels.into_iter().collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct RecordingsQuery {
    pub date: String,
    pub channel: Option<u16>,
}

#[derive(Debug, Serialize)]
pub struct RecordingItem {
    pub id: u32,
    pub channel: u16,
    pub start: String,
    pub end: String,
    pub start_timestamp: u32,
    pub end_timestamp: u32,
    pub duration: u32,
    pub frame_count: u16,
}

#[derive(Debug, Serialize)]
pub struct RecordingsResponse {
    pub recordings: Vec<RecordingItem>,
}

/// GET /api/v1/recordings?date=YYYY-MM-DD&channel=N
///
/// Intervals are clipped to the requested local day. Only cached segments
/// are returned; uncached ones are not seekable yet.
pub async fn recordings(
    State(state): State<Arc<AppState>>,
    Query(query): Query<RecordingsQuery>,
) -> Result<Json<RecordingsResponse>, HttpError> {
    let storage = state
        .storage()
        .ok_or_else(|| HttpError::NotReady("no volume mounted".into()))?;
    let tz = state.settings().tz();

    let date = NaiveDate::parse_from_str(&query.date, "%Y-%m-%d")
        .map_err(|_| HttpError::BadRequest(format!("bad date {:?}", query.date)))?;
    let (day_start, day_end) = local_day_bounds(tz, date)
        .ok_or_else(|| HttpError::BadRequest(format!("date {:?} out of range", query.date)))?;

    let mut items = Vec::new();
    for cached in storage.cached_segments() {
        let segment = cached.segment();
        if let Some(want) = query.channel {
            if segment.channel_id != want {
                continue;
            }
        }
        let clip_start = segment.start_time.max(day_start);
        let clip_end = segment.end_time.min(day_end);
        if clip_start >= clip_end {
            continue;
        }
        items.push(RecordingItem {
            id: segment.file_index,
            channel: segment.channel_id,
            start: local_hms(tz, clip_start),
            end: local_hms(tz, clip_end),
            start_timestamp: clip_start,
            end_timestamp: clip_end,
            duration: clip_end - clip_start,
            frame_count: segment.frame_count,
        });
    }
    items.sort_by_key(|i| i.start_timestamp);

    Ok(Json(RecordingsResponse { recordings: items }))
}

/// UTC second bounds `[start, end)` of a local calendar day.
fn local_day_bounds(tz: Tz, date: NaiveDate) -> Option<(u32, u32)> {
    let start = tz
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .timestamp();
    let end = tz
        .from_local_datetime(&date.succ_opt()?.and_hms_opt(0, 0, 0)?)
        .earliest()?
        .timestamp();
    Some((u32::try_from(start).ok()?, u32::try_from(end).ok()?))
}

fn local_hms(tz: Tz, ts: u32) -> String {
    tz.timestamp_opt(i64::from(ts), 0).unwrap().format("%H:%M:%S").to_string()
}

/// GET /api/v1/stream — upgrade to the streaming WebSocket.
pub async fn stream_ws(State(state): State<Arc<AppState>>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| stream::handle_socket(socket, state))
}
