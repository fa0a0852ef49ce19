//! PostgREST (Supabase) implementation of [`RemoteStore`].

use super::{RemoteStore, scope_rows};
use crate::error::{Error, ErrorKind, Result};
use crate::models::{BackupRun, DEVICE_COLUMN, Device, DeviceId, NativeKey, RUN_COLUMN, Row, SetupCredential, Table};
use async_trait::async_trait;
use exn::ResultExt;
use reqwest::header::{AUTHORIZATION, CONTENT_RANGE, HeaderMap, HeaderValue};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::collections::HashSet;
use std::time::Duration;
use tracing::instrument;

const RUNS_TABLE: &str = "backup_history";
const DEVICES_TABLE: &str = "devices";
const CREDENTIALS_TABLE: &str = "setup_credentials";
const PAGE_SIZE: usize = 1000;
const MERGE: &str = "resolution=merge-duplicates,return=minimal";
const IGNORE: &str = "resolution=ignore-duplicates,return=minimal";
// Error bodies can echo the request; keep only the start for messages.
const MAX_MESSAGE_LEN: usize = 300;

/// Talks to `<url>/rest/v1` with the service-role key.
pub struct PostgrestStore {
    name: String,
    client: Client,
    base: String,
    schema: Option<String>,
}

impl PostgrestStore {
    pub fn new(url: &str, service_key: &str, schema: Option<String>, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut apikey =
            HeaderValue::from_str(service_key).or_raise(|| ErrorKind::Config("service key is not a valid header".into()))?;
        apikey.set_sensitive(true);
        let mut bearer = HeaderValue::from_str(&format!("Bearer {service_key}"))
            .or_raise(|| ErrorKind::Config("service key is not a valid header".into()))?;
        bearer.set_sensitive(true);
        headers.insert("apikey", apikey);
        headers.insert(AUTHORIZATION, bearer);

        let client = Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .or_raise(|| ErrorKind::Config("could not build HTTP client".into()))?;
        let base = format!("{}/rest/v1", url.trim_end_matches('/'));
        let name = reqwest::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_else(|| "postgrest".to_string());
        Ok(Self { name, client, base, schema: schema.filter(|s| !s.trim().is_empty()) })
    }

    fn endpoint(&self, table: &str) -> String {
        format!("{}/{table}", self.base)
    }

    fn write(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.schema {
            Some(schema) => request.header("Content-Profile", schema),
            None => request,
        }
    }

    fn read(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.schema {
            Some(schema) => request.header("Accept-Profile", schema),
            None => request,
        }
    }

    /// `prefer` decides what happens to rows already holding the conflict key.
    async fn post_rows(&self, table: &str, on_conflict: &str, prefer: &'static str, rows: &[Row]) -> Result<()> {
        let request = self
            .client
            .post(self.endpoint(table))
            .json(rows)
            .query(&[("on_conflict", on_conflict)])
            .header("Prefer", prefer);
        send(self.write(request)).await?;
        Ok(())
    }

    async fn get_rows(&self, request: RequestBuilder) -> Result<Vec<Row>> {
        let response = send(self.read(request)).await?;
        response.json::<Vec<Row>>().await.or_raise(|| ErrorKind::InvalidResponse)
    }
}

#[async_trait]
impl RemoteStore for PostgrestStore {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self, table, rows), fields(table = table.name, rows = rows.len()))]
    async fn upsert(&self, table: &Table, device: DeviceId, rows: &[Row]) -> Result<u64> {
        if rows.is_empty() {
            return Ok(0);
        }
        let scoped = scope_rows(device, rows)?;
        self.post_rows(table.name, &table.conflict_target(), MERGE, &scoped).await?;
        Ok(scoped.len() as u64)
    }

    #[instrument(skip(self, table, keys), fields(table = table.name, keys = keys.len()))]
    async fn delete(&self, table: &Table, device: DeviceId, keys: &[NativeKey]) -> Result<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        let mut query = vec![(DEVICE_COLUMN.to_string(), format!("eq.{device}"))];
        query.push(key_filter(table, keys));
        let request = self
            .client
            .delete(self.endpoint(table.name))
            .query(&query)
            .header("Prefer", "return=minimal,count=exact");
        let response = send(self.write(request)).await?;
        // `Content-Range: */3` when the server honours `count=exact`.
        let deleted = response
            .headers()
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(keys.len() as u64);
        Ok(deleted)
    }

    #[instrument(skip(self, table), fields(table = table.name))]
    async fn fetch_keys(&self, table: &Table, device: DeviceId) -> Result<HashSet<NativeKey>> {
        let columns = table.key_columns.join(",");
        let mut keys = HashSet::new();
        let mut offset = 0usize;
        loop {
            let request = self.client.get(self.endpoint(table.name)).query(&[
                ("select", columns.clone()),
                (DEVICE_COLUMN, format!("eq.{device}")),
                ("order", columns.clone()),
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
            ]);
            let page = self.get_rows(request).await?;
            for row in &page {
                match NativeKey::from_row(row, table.key_columns) {
                    Some(key) => {
                        keys.insert(key);
                    },
                    None => tracing::warn!(table = table.name, "Remote row without a usable native key"),
                }
            }
            if page.len() < PAGE_SIZE {
                break;
            }
            offset += page.len();
        }
        Ok(keys)
    }

    #[instrument(skip(self, run), fields(status = %run.status))]
    async fn insert_run_record(&self, run: &BackupRun) -> Result<()> {
        self.post_rows(RUNS_TABLE, RUN_COLUMN, IGNORE, &[run.to_row()?]).await
    }

    #[instrument(skip(self, device), fields(device = %device.device_id))]
    async fn upsert_device(&self, device: &Device) -> Result<()> {
        self.post_rows(DEVICES_TABLE, DEVICE_COLUMN, MERGE, &[device.to_row()?]).await
    }

    #[instrument(skip(self))]
    async fn fetch_setup_credential(&self, device: DeviceId) -> Result<Option<SetupCredential>> {
        let request = self
            .client
            .get(self.endpoint(CREDENTIALS_TABLE))
            .query(&[(DEVICE_COLUMN, format!("eq.{device}")), ("limit", "1".to_string())]);
        let rows = self.get_rows(request).await?;
        Ok(rows.into_iter().next().map(|values| SetupCredential { values }))
    }
}

async fn send(request: RequestBuilder) -> Result<Response> {
    let response = request.send().await.map_err(transport_error)?;
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = truncate(body.trim());
    if is_transient(status) {
        exn::bail!(ErrorKind::Transient(format!("HTTP {}: {message}", status.as_u16())));
    }
    exn::bail!(ErrorKind::Rejected { status: status.as_u16(), message })
}

fn transport_error(err: reqwest::Error) -> Error {
    let kind = if err.is_decode() {
        ErrorKind::InvalidResponse
    } else if err.is_builder() {
        ErrorKind::Config(err.to_string())
    } else {
        // Timeouts, refused connections, resets: the server may be back soon.
        ErrorKind::Transient(err.to_string())
    };
    exn::Exn::from(err).raise(kind)
}

fn is_transient(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS || status == StatusCode::REQUEST_TIMEOUT
}

fn truncate(message: &str) -> String {
    match message.char_indices().nth(MAX_MESSAGE_LEN) {
        Some((end, _)) => format!("{}...", &message[..end]),
        None => message.to_string(),
    }
}

/// PostgREST filter selecting exactly `keys`.
///
/// Single-column keys use `col=in.("a","b")`; composite keys use
/// `or=(and(c1.eq."a",c2.eq."b"),...)`.
fn key_filter(table: &Table, keys: &[NativeKey]) -> (String, String) {
    if let [column] = table.key_columns {
        let values = keys.iter().filter_map(|k| k.parts().first()).map(|v| quote(v)).collect::<Vec<_>>();
        return (column.to_string(), format!("in.({})", values.join(",")));
    }
    let clauses = keys
        .iter()
        .map(|key| {
            let terms = table
                .key_columns
                .iter()
                .zip(key.parts())
                .map(|(column, value)| format!("{column}.eq.{}", quote(value)))
                .collect::<Vec<_>>();
            format!("and({})", terms.join(","))
        })
        .collect::<Vec<_>>();
    ("or".to_string(), format!("({})", clauses.join(",")))
}

fn quote(value: &str) -> String {
    format!("\"{}\"", value.replace('\\', "\\\\").replace('"', "\\\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_single_column_filter() {
        let table = Table::new("movies", &["radarr_id"]);
        let (column, filter) = key_filter(&table, &[NativeKey::new(["1"]), NativeKey::new(["7"])]);
        assert_eq!(column, "radarr_id");
        assert_eq!(filter, r#"in.("1","7")"#);
    }

    #[test]
    fn test_composite_filter() {
        let table = Table::new("service_configs", &["service_name", "config_type"]);
        let (column, filter) = key_filter(&table, &[NativeKey::new(["jellyfin", "system"])]);
        assert_eq!(column, "or");
        assert_eq!(filter, r#"(and(service_name.eq."jellyfin",config_type.eq."system"))"#);
    }

    #[test]
    fn test_quote_escapes() {
        assert_eq!(quote(r#"a"b\c"#), r#""a\"b\\c""#);
    }

    #[rstest]
    #[case(StatusCode::INTERNAL_SERVER_ERROR, true)]
    #[case(StatusCode::BAD_GATEWAY, true)]
    #[case(StatusCode::TOO_MANY_REQUESTS, true)]
    #[case(StatusCode::REQUEST_TIMEOUT, true)]
    #[case(StatusCode::BAD_REQUEST, false)]
    #[case(StatusCode::UNAUTHORIZED, false)]
    #[case(StatusCode::CONFLICT, false)]
    fn test_status_classification(#[case] status: StatusCode, #[case] transient: bool) {
        assert_eq!(is_transient(status), transient);
    }

    #[test]
    fn test_truncate_long_messages() {
        let long = "x".repeat(1000);
        assert_eq!(truncate(&long).len(), MAX_MESSAGE_LEN + 3);
        assert_eq!(truncate("short"), "short");
    }
}
