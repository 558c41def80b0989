//! HTTP client for the cluster's SQL endpoint.
//!
//! The database is queried over its HTTP interface: SQL text in the request
//! body, basic auth, `FORMAT JSON` responses parsed by the callers. Connect
//! failures are retried with exponential backoff since a busy cluster can
//! take a while to accept new connections.

use async_trait::async_trait;
use base64::prelude::*;
use http_body_util::BodyExt;
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Request, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::{connect::HttpConnector, Client};
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::debug;

const BACKOFF_START_MILLIS: u64 = 250;
const MAX_RETRIES: u8 = 3;

/// Connection details for the cluster's SQL endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct DbConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub use_ssl: bool,
}

/// An exclusively-leasable database handle.
///
/// The production implementation is `HttpSqlClient`; the pool and the task
/// tests substitute fakes through this seam.
#[async_trait]
pub trait DbHandle: Send + Sync {
    /// Execute a statement and return the raw response body.
    async fn execute_sql(&self, sql: &str) -> anyhow::Result<String>;

    /// Liveness probe used before a pooled handle is reused.
    async fn ping(&self) -> bool;

    /// Tear the handle down. Best-effort, never surfaced to callers.
    async fn close(&self);
}

#[async_trait]
pub trait DbHandleFactory: Send + Sync {
    async fn connect(&self) -> anyhow::Result<Box<dyn DbHandle>>;
}

pub struct HttpSqlClient {
    client: Client<HttpConnector, Full<Bytes>>,
    ssl_client: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    config: DbConfig,
}

impl HttpSqlClient {
    pub fn new(config: &DbConfig) -> anyhow::Result<Self> {
        let client_builder = Client::builder(hyper_util::rt::TokioExecutor::new());

        let https = HttpsConnector::new();
        let http = HttpConnector::new();

        Ok(Self {
            client: client_builder.build(http),
            ssl_client: client_builder.build(https),
            config: config.clone(),
        })
    }

    fn auth_header(&self) -> String {
        let username_and_password = format!("{}:{}", self.config.user, self.config.password);
        let encoded = BASE64_STANDARD.encode(username_and_password);
        format!("Basic {encoded}")
    }

    fn uri(&self, path: &str) -> anyhow::Result<Uri> {
        let scheme = if self.config.use_ssl { "https" } else { "http" };
        let uri = format!(
            "{}://{}:{}{}",
            scheme, self.config.host, self.config.port, path
        );
        Ok(uri.parse()?)
    }

    fn build_request(&self, uri: &Uri, body: &Bytes) -> anyhow::Result<Request<Full<Bytes>>> {
        Ok(Request::builder()
            .method("POST")
            .uri(uri.clone())
            .header("Authorization", self.auth_header())
            .body(Full::new(body.clone()))?)
    }

    async fn request(
        &self,
        uri: &Uri,
        body: &Bytes,
    ) -> anyhow::Result<hyper::Response<hyper::body::Incoming>> {
        let mut retries = MAX_RETRIES;
        let mut backoff_millis = BACKOFF_START_MILLIS;

        loop {
            let attempt = self.build_request(uri, body)?;
            let res = if self.config.use_ssl {
                self.ssl_client.request(attempt).await
            } else {
                self.client.request(attempt).await
            };

            match res {
                Ok(res) => return Ok(res),
                Err(e) if e.is_connect() && retries > 0 => {
                    debug!("connect failed, retrying in {backoff_millis}ms: {e}");
                    sleep(Duration::from_millis(backoff_millis)).await;
                    retries -= 1;
                    backoff_millis *= 2;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl DbHandle for HttpSqlClient {
    async fn execute_sql(&self, sql: &str) -> anyhow::Result<String> {
        debug!("executing sql: {sql}");
        let uri = self.uri("/")?;
        let body = Bytes::from(sql.to_string());

        let res = self.request(&uri, &body).await?;
        let status = res.status();
        let body = res.collect().await?.to_bytes();
        let body = String::from_utf8(body.to_vec())?;

        if !status.is_success() {
            anyhow::bail!("query failed with status {status}: {body}");
        }
        Ok(body)
    }

    async fn ping(&self) -> bool {
        match self.execute_sql("SELECT 1").await {
            Ok(_) => true,
            Err(e) => {
                debug!("db ping failed: {e}");
                false
            }
        }
    }

    async fn close(&self) {
        // HTTP handles hold no server-side state to tear down.
    }
}

/// Factory handed to the DB pool.
pub struct HttpSqlFactory {
    config: DbConfig,
}

impl HttpSqlFactory {
    pub fn new(config: DbConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl DbHandleFactory for HttpSqlFactory {
    async fn connect(&self) -> anyhow::Result<Box<dyn DbHandle>> {
        Ok(Box::new(HttpSqlClient::new(&self.config)?))
    }
}

/// Shape of a `FORMAT JSON` query response; tasks deserialize `data` rows
/// into their own row structs.
#[derive(Debug, Deserialize)]
pub struct JsonQueryResponse<T> {
    pub data: Vec<T>,
}

pub fn parse_json_rows<T: serde::de::DeserializeOwned>(body: &str) -> anyhow::Result<Vec<T>> {
    let response: JsonQueryResponse<T> = serde_json::from_str(body)?;
    Ok(response.data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Deserialize)]
    struct Row {
        name: String,
        value: u64,
    }

    #[test]
    fn parses_format_json_rows() {
        let body = r#"{"meta":[],"data":[{"name":"a","value":1},{"name":"b","value":2}],"rows":2}"#;
        let rows: Vec<Row> = parse_json_rows(body).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].name, "a");
        assert_eq!(rows[1].value, 2);
    }

    #[test]
    fn rejects_body_without_data() {
        let body = r#"{"rows": 0}"#;
        assert!(parse_json_rows::<Row>(body).is_err());
    }

    #[test]
    fn uri_respects_ssl_flag() {
        let config = DbConfig {
            host: "db.internal".to_string(),
            port: 8443,
            user: "root".to_string(),
            password: String::new(),
            use_ssl: true,
        };
        let client = HttpSqlClient::new(&config).unwrap();
        assert_eq!(
            client.uri("/").unwrap().to_string(),
            "https://db.internal:8443/"
        );
    }
}
