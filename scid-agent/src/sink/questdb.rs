use super::{validate_table_name, TickSink};
use crate::error::SinkError;
use crate::format::TickRecord;
use async_trait::async_trait;
use reqwest::StatusCode;
use std::fmt::Write;
use std::time::Duration;
use tracing::{debug, info};

#[derive(Debug, Clone)]
pub struct QuestDbConfig {
    /// HTTP endpoint, e.g. `http://localhost:9000`.
    pub url: String,
    pub table: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

/// QuestDB over its HTTP interface.
///
/// The table is created with `DEDUP UPSERT KEYS(time, symbol, symbol_period)`, which
/// turns repeated line-protocol writes of the same key into upserts. Each batch is one
/// `/write` request, which QuestDB commits as a single transaction.
#[derive(Debug, Clone)]
pub struct QuestDbSink {
    client: reqwest::Client,
    config: QuestDbConfig,
}

impl QuestDbSink {
    pub fn new(config: QuestDbConfig) -> Result<Self, SinkError> {
        validate_table_name(&config.table)?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|err| SinkError::Transient(format!("failed to build http client: {err}")))?;
        Ok(Self { client, config })
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}/{path}", self.config.url.trim_end_matches('/'))
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.username {
            Some(user) => request.basic_auth(user, self.config.password.as_deref()),
            None => request,
        }
    }

    fn create_table_sql(&self) -> String {
        format!(
            "CREATE TABLE IF NOT EXISTS {} (
                time TIMESTAMP,
                open DOUBLE,
                high DOUBLE,
                low DOUBLE,
                close DOUBLE,
                volume INT,
                number_of_trades INT,
                bid_volume INT,
                ask_volume INT,
                symbol SYMBOL CAPACITY 256,
                symbol_period SYMBOL CAPACITY 256,
                front_contract BOOLEAN
            ) TIMESTAMP(time)
            PARTITION BY DAY WAL
            DEDUP UPSERT KEYS(time, symbol, symbol_period);",
            self.config.table
        )
    }
}

#[async_trait]
impl TickSink for QuestDbSink {
    async fn ensure_schema(&self) -> Result<(), SinkError> {
        let request = self
            .client
            .get(self.endpoint("exec"))
            .query(&[("query", self.create_table_sql())]);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        info!(table = %self.config.table, url = %self.config.url, "questdb table ensured");
        Ok(())
    }

    async fn upsert_batch(&self, records: &[TickRecord]) -> Result<(), SinkError> {
        if records.is_empty() {
            return Ok(());
        }
        let body = encode_batch(&self.config.table, records)?;
        let request = self
            .client
            .post(self.endpoint("write"))
            .query(&[("precision", "u")])
            .body(body);
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;
        check_status(response).await?;
        debug!(
            record_count = records.len(),
            table = %self.config.table,
            "upserted batch into questdb"
        );
        Ok(())
    }
}

fn transport_error(err: reqwest::Error) -> SinkError {
    SinkError::Transient(format!("questdb request failed: {err}"))
}

async fn check_status(response: reqwest::Response) -> Result<(), SinkError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }
    let body = response.text().await.unwrap_or_default();
    let message = format!("questdb responded {status}: {}", body.trim());
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Err(SinkError::Transient(message))
    } else {
        Err(SinkError::Rejected(message))
    }
}

/// Encode records as InfluxDB line protocol with microsecond timestamps.
pub(crate) fn encode_batch(table: &str, records: &[TickRecord]) -> Result<String, SinkError> {
    let mut body = String::with_capacity(records.len() * 160);
    for record in records {
        if record.symbol.is_empty() {
            return Err(SinkError::Rejected(format!(
                "record at {} has an empty symbol",
                record.timestamp_us
            )));
        }
        // Writing into a String cannot fail.
        let _ = writeln!(
            body,
            "{table},symbol={},symbol_period={} open={},high={},low={},close={},volume={}i,number_of_trades={}i,bid_volume={}i,ask_volume={}i {}",
            escape_tag(&record.symbol)?,
            escape_tag(&record.symbol_period)?,
            record.open,
            record.high,
            record.low,
            record.close,
            record.volume,
            record.number_of_trades,
            record.bid_volume,
            record.ask_volume,
            record.timestamp_us,
        );
    }
    Ok(body)
}

fn escape_tag(value: &str) -> Result<String, SinkError> {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        match ch {
            '\n' | '\r' => {
                return Err(SinkError::Rejected(format!(
                    "tag value {value:?} contains a line break"
                )))
            }
            ',' | '=' | ' ' | '\\' => {
                escaped.push('\\');
                escaped.push(ch);
            }
            _ => escaped.push(ch),
        }
    }
    Ok(escaped)
}
