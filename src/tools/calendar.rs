use super::{Tool, ToolError};
use crate::config::CalendarConfig;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Local, NaiveDate, NaiveDateTime, TimeZone};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::Mutex;

const EVENTS_BASE: &str = "https://www.googleapis.com/calendar/v3/calendars";
const TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
const LOCAL_DATETIME_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Error, Debug)]
pub enum CalendarError {
    #[error("event not found")]
    NotFound,
    #[error("calendar authorization expired")]
    AuthExpired,
    #[error("calendar API quota exceeded")]
    QuotaExceeded,
    #[error("calendar API error ({status}): {message}")]
    Api { status: u16, message: String },
    #[error("calendar request failed: {0}")]
    Http(String),
    #[error("invalid date/time: {0}")]
    InvalidTime(String),
}

impl From<CalendarError> for ToolError {
    fn from(err: CalendarError) -> Self {
        match err {
            CalendarError::InvalidTime(reason) => ToolError::InvalidParameters(reason),
            other => ToolError::ExecutionFailed(other.to_string()),
        }
    }
}

impl From<reqwest::Error> for CalendarError {
    fn from(err: reqwest::Error) -> Self {
        CalendarError::Http(err.to_string())
    }
}

/// Map an API status code to the typed error surface. Auth problems and
/// quota limits are distinguished so they can be reported precisely; both
/// stay inside the tool call and never tear the conversation down.
fn classify_status(status: u16, message: String) -> CalendarError {
    match status {
        401 => CalendarError::AuthExpired,
        403 | 429 => CalendarError::QuotaExceeded,
        404 => CalendarError::NotFound,
        _ => CalendarError::Api { status, message },
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTime {
    pub date_time: Option<String>,
    pub date: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
    pub start: Option<EventTime>,
    pub end: Option<EventTime>,
}

#[derive(Debug, Deserialize)]
struct EventsResponse {
    #[serde(default)]
    items: Vec<CalendarEvent>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: u64,
}

struct CachedToken {
    access_token: String,
    expires_at: Instant,
}

/// REST client for the calendar service. Access tokens are minted from the
/// configured refresh token and cached until shortly before expiry.
pub struct CalendarClient {
    http: reqwest::Client,
    config: CalendarConfig,
    token: Mutex<Option<CachedToken>>,
}

impl CalendarClient {
    pub fn new(config: CalendarConfig) -> Self {
        Self {
            http: reqwest::Client::new(),
            config,
            token: Mutex::new(None),
        }
    }

    async fn access_token(&self) -> Result<String, CalendarError> {
        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            if token.expires_at > Instant::now() {
                return Ok(token.access_token.clone());
            }
        }

        log::info!("Refreshing calendar access token");
        let response = self
            .http
            .post(TOKEN_URL)
            .form(&[
                ("client_id", self.config.client_id.as_str()),
                ("client_secret", self.config.client_secret()),
                ("refresh_token", self.config.refresh_token()),
                ("grant_type", "refresh_token"),
            ])
            .send()
            .await?;

        if !response.status().is_success() {
            // A refresh token the auth server rejects means re-authorization
            // is needed; report it as expired credentials.
            log::warn!(
                "Calendar token refresh rejected with status {}",
                response.status()
            );
            return Err(CalendarError::AuthExpired);
        }

        let token: TokenResponse = response.json().await?;
        let access_token = token.access_token.clone();
        *cached = Some(CachedToken {
            access_token: token.access_token,
            expires_at: Instant::now() + Duration::from_secs(token.expires_in.saturating_sub(60)),
        });
        Ok(access_token)
    }

    fn events_url(&self, suffix: &str) -> String {
        format!(
            "{EVENTS_BASE}/{}/events{suffix}",
            self.config.calendar_id
        )
    }

    async fn check<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, CalendarError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), message))
    }

    pub async fn list_events(
        &self,
        time_min: &DateTime<Local>,
        time_max: &DateTime<Local>,
        query: Option<&str>,
        max_results: u32,
    ) -> Result<Vec<CalendarEvent>, CalendarError> {
        let token = self.access_token().await?;
        let mut request = self
            .http
            .get(self.events_url(""))
            .bearer_auth(token)
            .query(&[
                ("timeMin", time_min.to_rfc3339()),
                ("timeMax", time_max.to_rfc3339()),
                ("singleEvents", "true".to_string()),
                ("orderBy", "startTime".to_string()),
                ("maxResults", max_results.to_string()),
            ]);
        if let Some(query) = query {
            request = request.query(&[("q", query)]);
        }

        let response: EventsResponse = Self::check(request.send().await?).await?;
        Ok(response.items)
    }

    pub async fn insert_event(&self, body: Value) -> Result<CalendarEvent, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(self.events_url(""))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn patch_event(
        &self,
        event_id: &str,
        body: Value,
    ) -> Result<CalendarEvent, CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .patch(self.events_url(&format!("/{event_id}")))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await?;
        Self::check(response).await
    }

    pub async fn delete_event(&self, event_id: &str) -> Result<(), CalendarError> {
        let token = self.access_token().await?;
        let response = self
            .http
            .delete(self.events_url(&format!("/{event_id}")))
            .bearer_auth(token)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let message = response.text().await.unwrap_or_default();
        Err(classify_status(status.as_u16(), message))
    }
}

/// Parse the spoken-friendly `YYYY-MM-DDTHH:MM:SS` format into local time.
fn parse_local_datetime(raw: &str) -> Result<DateTime<Local>, CalendarError> {
    let naive = NaiveDateTime::parse_from_str(raw, LOCAL_DATETIME_FORMAT)
        .map_err(|_| CalendarError::InvalidTime(format!("'{raw}' is not YYYY-MM-DDTHH:MM:SS")))?;
    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| CalendarError::InvalidTime(format!("'{raw}' is not a valid local time")))
}

fn parse_date(raw: &str) -> Result<NaiveDate, CalendarError> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .map_err(|_| CalendarError::InvalidTime(format!("'{raw}' is not YYYY-MM-DD")))
}

/// Request body for event creation/update; only present fields are included
/// so PATCH semantics stay partial.
fn build_event_body(
    title: Option<&str>,
    start: Option<&DateTime<Local>>,
    end: Option<&DateTime<Local>>,
    description: Option<&str>,
    location: Option<&str>,
) -> Value {
    let mut body = serde_json::Map::new();
    if let Some(title) = title {
        body.insert("summary".to_string(), json!(title));
    }
    if let Some(start) = start {
        body.insert("start".to_string(), json!({ "dateTime": start.to_rfc3339() }));
    }
    if let Some(end) = end {
        body.insert("end".to_string(), json!({ "dateTime": end.to_rfc3339() }));
    }
    if let Some(description) = description {
        body.insert("description".to_string(), json!(description));
    }
    if let Some(location) = location {
        body.insert("location".to_string(), json!(location));
    }
    Value::Object(body)
}

fn event_to_value(event: &CalendarEvent) -> Value {
    let time_of = |t: &Option<EventTime>| {
        t.as_ref()
            .and_then(|t| t.date_time.clone().or_else(|| t.date.clone()))
    };
    json!({
        "id": event.id,
        "title": event.summary.clone().unwrap_or_else(|| "(untitled)".to_string()),
        "start": time_of(&event.start),
        "end": time_of(&event.end),
        "location": event.location,
    })
}

fn events_to_value(events: &[CalendarEvent]) -> Value {
    json!({
        "count": events.len(),
        "events": events.iter().map(event_to_value).collect::<Vec<_>>(),
    })
}

/// Register the whole calendar tool family on the registry.
pub fn register_calendar_tools(
    registry: &mut super::ToolRegistry,
    client: Arc<CalendarClient>,
) {
    registry.register(Arc::new(UpcomingEventsTool {
        client: Arc::clone(&client),
    }));
    registry.register(Arc::new(EventsOnDateTool {
        client: Arc::clone(&client),
    }));
    registry.register(Arc::new(CreateEventTool {
        client: Arc::clone(&client),
    }));
    registry.register(Arc::new(UpdateEventTool {
        client: Arc::clone(&client),
    }));
    registry.register(Arc::new(DeleteEventTool {
        client: Arc::clone(&client),
    }));
    registry.register(Arc::new(SearchEventsTool { client }));
}

fn parse_args<T: serde::de::DeserializeOwned>(arguments: Value) -> Result<T, ToolError> {
    let arguments = match arguments {
        Value::Null => json!({}),
        other => other,
    };
    serde_json::from_value(arguments).map_err(|e| ToolError::InvalidParameters(e.to_string()))
}

pub struct UpcomingEventsTool {
    client: Arc<CalendarClient>,
}

#[derive(Deserialize)]
struct UpcomingEventsArgs {
    days: Option<i64>,
    max_results: Option<u32>,
}

#[async_trait]
impl Tool for UpcomingEventsTool {
    fn name(&self) -> &str {
        "get_upcoming_events"
    }

    fn description(&self) -> &str {
        "Get the next events from the calendar. Use this when the user asks about their upcoming appointments."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "days": {
                    "type": "integer",
                    "description": "Number of days to look ahead (default: 7)"
                },
                "max_results": {
                    "type": "integer",
                    "description": "Maximum number of events (default: 10)"
                }
            },
            "required": []
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: UpcomingEventsArgs = parse_args(arguments)?;
        let now = Local::now();
        let until = now + ChronoDuration::days(args.days.unwrap_or(7));

        let events = self
            .client
            .list_events(&now, &until, None, args.max_results.unwrap_or(10))
            .await
            .map_err(ToolError::from)?;
        Ok(events_to_value(&events))
    }
}

pub struct EventsOnDateTool {
    client: Arc<CalendarClient>,
}

#[derive(Deserialize)]
struct EventsOnDateArgs {
    date: String,
}

#[async_trait]
impl Tool for EventsOnDateTool {
    fn name(&self) -> &str {
        "get_events_on_date"
    }

    fn description(&self) -> &str {
        "Get all events on a specific date. Use this when the user asks about appointments on a particular day."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "date": {
                    "type": "string",
                    "description": "The date in YYYY-MM-DD format"
                }
            },
            "required": ["date"]
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: EventsOnDateArgs = parse_args(arguments)?;
        let date = parse_date(&args.date).map_err(ToolError::from)?;

        let midnight = date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| ToolError::InvalidParameters(format!("invalid date '{}'", args.date)))?;
        let start = Local
            .from_local_datetime(&midnight)
            .earliest()
            .ok_or_else(|| ToolError::InvalidParameters(format!("invalid date '{}'", args.date)))?;
        let end = start + ChronoDuration::days(1);

        let events = self
            .client
            .list_events(&start, &end, None, 50)
            .await
            .map_err(ToolError::from)?;
        Ok(events_to_value(&events))
    }
}

pub struct CreateEventTool {
    client: Arc<CalendarClient>,
}

#[derive(Deserialize)]
struct CreateEventArgs {
    title: String,
    start_datetime: String,
    end_datetime: Option<String>,
    description: Option<String>,
    location: Option<String>,
}

#[async_trait]
impl Tool for CreateEventTool {
    fn name(&self) -> &str {
        "create_event"
    }

    fn description(&self) -> &str {
        "Create a new calendar event. Use this when the user wants to schedule an appointment."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": {
                    "type": "string",
                    "description": "Title of the event"
                },
                "start_datetime": {
                    "type": "string",
                    "description": "Start time in YYYY-MM-DDTHH:MM:SS format"
                },
                "end_datetime": {
                    "type": "string",
                    "description": "End time in YYYY-MM-DDTHH:MM:SS format (optional, default: one hour after start)"
                },
                "description": {
                    "type": "string",
                    "description": "Description of the event (optional)"
                },
                "location": {
                    "type": "string",
                    "description": "Location of the event (optional)"
                }
            },
            "required": ["title", "start_datetime"]
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: CreateEventArgs = parse_args(arguments)?;
        let start = parse_local_datetime(&args.start_datetime).map_err(ToolError::from)?;
        let end = match &args.end_datetime {
            Some(raw) => parse_local_datetime(raw).map_err(ToolError::from)?,
            None => start + ChronoDuration::hours(1),
        };

        let body = build_event_body(
            Some(&args.title),
            Some(&start),
            Some(&end),
            args.description.as_deref(),
            args.location.as_deref(),
        );
        let event = self
            .client
            .insert_event(body)
            .await
            .map_err(ToolError::from)?;

        Ok(json!({
            "result": format!("Event '{}' created", args.title),
            "event": event_to_value(&event),
        }))
    }
}

pub struct UpdateEventTool {
    client: Arc<CalendarClient>,
}

#[derive(Deserialize)]
struct UpdateEventArgs {
    event_id: String,
    title: Option<String>,
    start_datetime: Option<String>,
    end_datetime: Option<String>,
    description: Option<String>,
    location: Option<String>,
}

#[async_trait]
impl Tool for UpdateEventTool {
    fn name(&self) -> &str {
        "update_event"
    }

    fn description(&self) -> &str {
        "Update an existing calendar event. Use this when the user wants to change an appointment."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "event_id": {
                    "type": "string",
                    "description": "The id of the event to change"
                },
                "title": {
                    "type": "string",
                    "description": "New title (optional)"
                },
                "start_datetime": {
                    "type": "string",
                    "description": "New start time in YYYY-MM-DDTHH:MM:SS format (optional)"
                },
                "end_datetime": {
                    "type": "string",
                    "description": "New end time in YYYY-MM-DDTHH:MM:SS format (optional)"
                },
                "description": {
                    "type": "string",
                    "description": "New description (optional)"
                },
                "location": {
                    "type": "string",
                    "description": "New location (optional)"
                }
            },
            "required": ["event_id"]
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: UpdateEventArgs = parse_args(arguments)?;
        let start = args
            .start_datetime
            .as_deref()
            .map(parse_local_datetime)
            .transpose()
            .map_err(ToolError::from)?;
        let end = args
            .end_datetime
            .as_deref()
            .map(parse_local_datetime)
            .transpose()
            .map_err(ToolError::from)?;

        let body = build_event_body(
            args.title.as_deref(),
            start.as_ref(),
            end.as_ref(),
            args.description.as_deref(),
            args.location.as_deref(),
        );
        let event = self
            .client
            .patch_event(&args.event_id, body)
            .await
            .map_err(ToolError::from)?;

        Ok(json!({
            "result": "Event updated",
            "event": event_to_value(&event),
        }))
    }
}

pub struct DeleteEventTool {
    client: Arc<CalendarClient>,
}

#[derive(Deserialize)]
struct DeleteEventArgs {
    event_id: String,
}

#[async_trait]
impl Tool for DeleteEventTool {
    fn name(&self) -> &str {
        "delete_event"
    }

    fn description(&self) -> &str {
        "Delete an event from the calendar. Use this when the user wants to cancel an appointment."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "event_id": {
                    "type": "string",
                    "description": "The id of the event to delete"
                }
            },
            "required": ["event_id"]
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: DeleteEventArgs = parse_args(arguments)?;
        self.client
            .delete_event(&args.event_id)
            .await
            .map_err(ToolError::from)?;
        Ok(json!({ "result": "Event deleted" }))
    }
}

pub struct SearchEventsTool {
    client: Arc<CalendarClient>,
}

#[derive(Deserialize)]
struct SearchEventsArgs {
    query: String,
    days: Option<i64>,
}

#[async_trait]
impl Tool for SearchEventsTool {
    fn name(&self) -> &str {
        "search_events"
    }

    fn description(&self) -> &str {
        "Search for events matching a phrase. Use this when the user is looking for a specific appointment."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": {
                    "type": "string",
                    "description": "Search phrase"
                },
                "days": {
                    "type": "integer",
                    "description": "Number of days to search (default: 30)"
                }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, arguments: Value) -> Result<Value, ToolError> {
        let args: SearchEventsArgs = parse_args(arguments)?;
        let now = Local::now();
        let until = now + ChronoDuration::days(args.days.unwrap_or(30));

        let events = self
            .client
            .list_events(&now, &until, Some(&args.query), 50)
            .await
            .map_err(ToolError::from)?;
        Ok(events_to_value(&events))
    }
}
