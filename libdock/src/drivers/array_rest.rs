//! REST session shared by the Huawei array drivers.
//!
//! Every reply has the shape `{"data": ..., "error": {"code": n, "description": s}}`.
//! Logging in posts credentials to `<endpoint>/xxxxx/sessions`; the reply
//! carries the device id that prefixes every later call plus an `iBaseToken`
//! sent back as a header. Endpoints are tried in order. A call answered with
//! `-401`/`-403` drops the session, logs in again and is sent once more.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use reqwest::header::{CONTENT_TYPE, COOKIE, SET_COOKIE};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::AuthOptions;
use crate::error::DockError;
use crate::utils::retry;

pub const ERROR_UNAUTHORIZED: i64 = -401;
pub const ERROR_CONNECT: i64 = -403;
/// Generic "object does not exist".
pub const ERROR_OBJECT_NOT_EXIST: i64 = 1077948996;
/// Generic "object name already exists".
pub const ERROR_OBJECT_NAME_EXISTS: i64 = 1077948993;

const PWD_EXPIRED: i64 = 3;
const PWD_RESET: i64 = 4;
const LOGIN_ATTEMPTS: usize = 3;
const LOGIN_RETRY_DELAY: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);
const TOKEN_HEADER: &str = "iBaseToken";

/// Vendor codes a driver wants surfaced as a specific kind.
#[derive(Debug, Clone, Copy)]
pub struct ErrorCodes {
    pub not_found: &'static [i64],
    pub already_exists: &'static [i64],
}

impl ErrorCodes {
    pub fn classify(&self, code: i64, description: &str, what: &str) -> DockError {
        let msg = format!("{what}: array error {code}: {description}");
        if code == ERROR_OBJECT_NOT_EXIST || self.not_found.contains(&code) {
            DockError::NotFound(msg)
        } else if code == ERROR_OBJECT_NAME_EXISTS || self.already_exists.contains(&code) {
            DockError::AlreadyExists(msg)
        } else if code == ERROR_UNAUTHORIZED || code == ERROR_CONNECT {
            DockError::Auth(msg)
        } else {
            DockError::Backend(msg)
        }
    }
}

/// JSON call surface of an array, relative to the device prefix.
#[async_trait]
pub trait ArrayRest: Send + Sync {
    /// Send one request and return the reply's `data` member.
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DockError>;

    /// End the session. Harmless without one.
    async fn close(&self) -> Result<(), DockError>;
}

/// Decode `data` into `T`; `null` decodes as `T::default()`.
pub fn decode<T: DeserializeOwned + Default>(data: Value, what: &str) -> Result<T, DockError> {
    if data.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(data).map_err(|e| DockError::Backend(format!("malformed {what} reply: {e}")))
}

/// Decode a list reply; arrays answer an empty filter with no `data` at all.
pub fn decode_list<T: DeserializeOwned>(data: Value, what: &str) -> Result<Vec<T>, DockError> {
    match data {
        Value::Null => Ok(Vec::new()),
        Value::Array(_) => {
            serde_json::from_value(data).map_err(|e| DockError::Backend(format!("malformed {what} reply: {e}")))
        }
        single => Ok(vec![
            serde_json::from_value(single).map_err(|e| DockError::Backend(format!("malformed {what} reply: {e}")))?,
        ]),
    }
}

/// Arrays report numbers as strings, but echo back whatever was posted.
pub fn string_or_number<'de, D: serde::Deserializer<'de>>(d: D) -> Result<String, D::Error> {
    Ok(match Value::deserialize(d)? {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// 512-byte sectors per GiB; array capacities are reported in sectors.
pub const SECTORS_PER_GB: u64 = 2 * 1024 * 1024;

pub fn gb_to_sectors(gb: u64) -> u64 {
    gb * SECTORS_PER_GB
}

pub fn sectors_to_gb(sectors: &str) -> u64 {
    sectors.parse::<u64>().unwrap_or(0) / SECTORS_PER_GB
}

/// `GET /storagepool` entry.
#[derive(Debug, Clone, Deserialize, Default, PartialEq)]
pub struct StoragePool {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "NAME", default)]
    pub name: String,
    #[serde(rename = "USERTOTALCAPACITY", default, deserialize_with = "string_or_number")]
    pub total_capacity: String,
    #[serde(rename = "USERFREECAPACITY", default, deserialize_with = "string_or_number")]
    pub free_capacity: String,
}

#[derive(Debug, Deserialize, Default)]
struct Reply {
    #[serde(default)]
    data: Value,
    #[serde(default)]
    error: ReplyError,
}

#[derive(Debug, Deserialize, Default)]
struct ReplyError {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Deserialize, Default)]
struct LoginData {
    #[serde(default)]
    deviceid: String,
    #[serde(default, rename = "iBaseToken")]
    ibase_token: String,
    #[serde(default)]
    accountstate: i64,
}

#[derive(Debug, Clone)]
struct Session {
    prefix: String,
    token: String,
    cookie: Option<String>,
}

pub struct RestSession {
    http: reqwest::Client,
    endpoints: Vec<String>,
    username: String,
    password: String,
    codes: ErrorCodes,
    login_delay: Duration,
    session: Mutex<Option<Session>>,
}

impl RestSession {
    pub fn new(opts: &AuthOptions, codes: ErrorCodes) -> Result<Self, DockError> {
        let endpoints = opts.endpoint_list();
        if endpoints.is_empty() {
            return Err(DockError::Config("authOptions has no endpoints".into()));
        }
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .danger_accept_invalid_certs(opts.insecure)
            .build()
            .map_err(DockError::config)?;
        Ok(Self {
            http,
            endpoints,
            username: opts.username.clone(),
            password: opts.resolve_password()?,
            codes,
            login_delay: LOGIN_RETRY_DELAY,
            session: Mutex::new(None),
        })
    }

    /// Log in now rather than on the first call.
    pub async fn connect(&self) -> Result<(), DockError> {
        let mut session = self.session.lock().await;
        if session.is_none() {
            *session = Some(self.login().await?);
        }
        Ok(())
    }

    async fn current(&self) -> Result<Session, DockError> {
        let mut session = self.session.lock().await;
        if let Some(s) = session.as_ref() {
            return Ok(s.clone());
        }
        let fresh = self.login().await?;
        *session = Some(fresh.clone());
        Ok(fresh)
    }

    async fn send(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        session: Option<&Session>,
    ) -> Result<(Reply, Option<String>), DockError> {
        debug!(%method, %url, "array request");
        let mut req = self
            .http
            .request(method, url)
            .header(CONTENT_TYPE, "application/json;charset=utf-8");
        if let Some(s) = session {
            req = req.header(TOKEN_HEADER, &s.token);
            if let Some(cookie) = &s.cookie {
                req = req.header(COOKIE, cookie);
            }
        }
        if let Some(body) = body {
            req = req.json(body);
        }
        let resp = req.send().await.map_err(DockError::transport)?;
        let cookie = resp
            .headers()
            .get(SET_COOKIE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);
        let status = resp.status();
        let text = resp.text().await.map_err(DockError::transport)?;
        if !status.is_success() && text.is_empty() {
            return Err(DockError::Transport(format!("{url} answered {status}")));
        }
        let reply: Reply = serde_json::from_str(&text)
            .map_err(|e| DockError::Transport(format!("{url} answered {status} with malformed body: {e}")))?;
        Ok((reply, cookie))
    }

    /// Try every endpoint, up to three rounds five seconds apart.
    async fn login(&self) -> Result<Session, DockError> {
        retry("array login", LOGIN_ATTEMPTS, self.login_delay, |_| self.login_once()).await
    }

    #[instrument(skip(self), fields(user = %self.username))]
    async fn login_once(&self) -> Result<Session, DockError> {
        let body = json!({
            "username": self.username,
            "password": self.password,
            "scope": "0",
        });
        let mut last = DockError::Transport("no endpoint answered".into());
        for ep in &self.endpoints {
            let (reply, cookie) = match self.send(Method::POST, &format!("{ep}/xxxxx/sessions"), Some(&body), None).await {
                Ok(r) => r,
                Err(e) => {
                    warn!(endpoint = %ep, error = %e, "login failed");
                    last = e;
                    continue;
                }
            };
            if reply.error.code != 0 {
                warn!(endpoint = %ep, code = reply.error.code, "login rejected");
                last = DockError::Auth(format!(
                    "{ep} rejected {}: {} {}",
                    self.username, reply.error.code, reply.error.description
                ));
                continue;
            }
            let data: LoginData = decode(reply.data, "login")?;
            if data.accountstate == PWD_EXPIRED || data.accountstate == PWD_RESET {
                return Err(DockError::Auth(format!(
                    "password of {} has expired or must be reset",
                    self.username
                )));
            }
            if data.deviceid.is_empty() {
                last = DockError::Auth(format!("{ep} returned no device id"));
                continue;
            }
            info!(endpoint = %ep, device = %data.deviceid, "logged in");
            return Ok(Session {
                prefix: format!("{ep}/{}", data.deviceid),
                token: data.ibase_token,
                cookie,
            });
        }
        Err(last)
    }
}

#[async_trait]
impl ArrayRest for RestSession {
    async fn call(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value, DockError> {
        let mut relogged = false;
        loop {
            let session = self.current().await?;
            let url = format!("{}{path}", session.prefix);
            let (reply, _) = self.send(method.clone(), &url, body.as_ref(), Some(&session)).await?;
            match reply.error.code {
                0 => return Ok(reply.data),
                ERROR_UNAUTHORIZED | ERROR_CONNECT if !relogged => {
                    warn!(%path, code = reply.error.code, "session rejected, logging in again");
                    relogged = true;
                    let mut guard = self.session.lock().await;
                    *guard = Some(self.login().await?);
                }
                code => {
                    return Err(self
                        .codes
                        .classify(code, &reply.error.description, &format!("{method} {path}")));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), DockError> {
        let Some(session) = self.session.lock().await.take() else {
            return Ok(());
        };
        let url = format!("{}/sessions", session.prefix);
        if let Err(e) = self.send(Method::DELETE, &url, None, Some(&session)).await {
            debug!(error = %e, "logout failed");
        }
        Ok(())
    }
}
