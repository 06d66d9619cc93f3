use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::ACCEPT;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use wheel_core::{dedup_in_order, Email, Session};

use crate::store::{SessionStore, StoreError};

pub const DEFAULT_TABLE: &str = "game_sessions";

const SINGLE_OBJECT: &str = "application/vnd.pgrst.object+json";
const RETURN_ROWS: &str = "return=representation";
const NO_ROWS: &str = "PGRST116";

#[derive(Clone)]
pub struct RestStore {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    table: String,
}

#[derive(Deserialize)]
struct ApiError {
    code: Option<String>,
}

// Columns are nullable on the hosted table.
#[derive(Deserialize)]
struct Row {
    email: Email,
    selected_emojis: Option<Vec<String>>,
    updated_at: Option<DateTime<Utc>>,
}

impl From<Row> for Session {
    fn from(row: Row) -> Self {
        Session {
            email: row.email,
            selected_emojis: row
                .selected_emojis
                .map(|emojis| dedup_in_order(&emojis))
                .unwrap_or_default(),
            updated_at: row.updated_at.unwrap_or_else(Utc::now),
        }
    }
}

#[derive(Serialize)]
struct NewRow<'a> {
    email: &'a Email,
    selected_emojis: &'a [String],
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct RowUpdate<'a> {
    selected_emojis: &'a [String],
    updated_at: DateTime<Utc>,
}

impl RestStore {
    pub fn new(
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        table: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            table: table.into(),
        }
    }

    fn request(&self, method: Method) -> RequestBuilder {
        self.client
            .request(method, format!("{}/rest/v1/{}", self.base_url, self.table))
            .header("apikey", &self.api_key)
            .bearer_auth(&self.api_key)
    }

    fn by_email(builder: RequestBuilder, email: &Email) -> RequestBuilder {
        builder.query(&[("email", format!("eq.{email}"))])
    }
}

fn unavailable(err: reqwest::Error) -> StoreError {
    StoreError::BackendUnavailable(err.to_string())
}

async fn failure(action: &str, res: Response) -> StoreError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    StoreError::BackendUnavailable(format!("{action} failed with {status}: {body}"))
}

async fn first_row(res: Response) -> Result<Option<Session>, StoreError> {
    let rows = res.json::<Vec<Row>>().await.map_err(unavailable)?;
    Ok(rows.into_iter().next().map(Session::from))
}

#[async_trait]
impl SessionStore for RestStore {
    async fn find(&self, email: &Email) -> Result<Session, StoreError> {
        let res = Self::by_email(self.request(Method::GET), email)
            .query(&[("select", "*")])
            .header(ACCEPT, SINGLE_OBJECT)
            .send()
            .await
            .map_err(unavailable)?;

        let status = res.status();
        if status.is_success() {
            return res.json::<Row>().await.map(Session::from).map_err(unavailable);
        }
        let body = res.text().await.unwrap_or_default();
        let no_rows = status == StatusCode::NOT_ACCEPTABLE
            && serde_json::from_str::<ApiError>(&body)
                .ok()
                .and_then(|e| e.code)
                .is_some_and(|code| code == NO_ROWS);
        if no_rows {
            return Err(StoreError::NotFound);
        }
        Err(StoreError::BackendUnavailable(format!(
            "lookup failed with {status}: {body}"
        )))
    }

    async fn create(&self, email: &Email) -> Result<Session, StoreError> {
        let res = self
            .request(Method::POST)
            .header("Prefer", RETURN_ROWS)
            .json(&NewRow {
                email,
                selected_emojis: &[],
                updated_at: Utc::now(),
            })
            .send()
            .await
            .map_err(unavailable)?;

        if !res.status().is_success() {
            return Err(failure("insert", res).await);
        }
        first_row(res).await?.ok_or_else(|| {
            StoreError::BackendUnavailable("insert returned no rows".to_string())
        })
    }

    async fn update(&self, email: &Email, selections: &[String]) -> Result<Session, StoreError> {
        let res = Self::by_email(self.request(Method::PATCH), email)
            .header("Prefer", RETURN_ROWS)
            .json(&RowUpdate {
                selected_emojis: selections,
                updated_at: Utc::now(),
            })
            .send()
            .await
            .map_err(unavailable)?;

        if !res.status().is_success() {
            return Err(failure("update", res).await);
        }
        first_row(res).await?.ok_or(StoreError::NotFound)
    }
}
