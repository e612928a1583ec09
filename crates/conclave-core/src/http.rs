//! `ConferenceApi` over the node's client REST API.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde_json::{Value, json};
use tracing::{debug, info};
use url::Url;

use crate::api::{
    CallAnswer, CallContext, CallHandle, CandidateSubmission, ConferenceApi, TokenGrant,
};
use crate::errors::ConclaveError;
use crate::token::{MAX_EXPIRES_IN_SECS, Token};

/// Default HTTP request timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

const NO_SUCH_CONFERENCE: &str = "Neither conference nor gateway found";

/// Every response body is wrapped as `{"status": ..., "result": ...}`.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

/// Nodes send token lifetimes as either numbers or numeric strings.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Expires {
    Secs(u64),
    Text(String),
}

impl Expires {
    /// Lifetime in seconds; must be positive and at most a day.
    fn secs(&self) -> Result<u64, ConclaveError> {
        let secs = match self {
            Expires::Secs(secs) => *secs,
            Expires::Text(text) => text
                .trim()
                .parse()
                .map_err(|_| ConclaveError::Protocol(format!("invalid token expiry '{text}'")))?,
        };
        if secs == 0 || secs > MAX_EXPIRES_IN_SECS {
            return Err(ConclaveError::Protocol(format!(
                "token expiry out of range: {secs}s"
            )));
        }
        Ok(secs)
    }
}

#[derive(Debug, Deserialize)]
struct TokenResult {
    token: String,
    expires: Expires,
    #[serde(default)]
    participant_uuid: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CallResult {
    call_uuid: String,
    sdp: String,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum UpdateResult {
    Sdp(String),
    Described { sdp: String },
}

/// Build the conference base URL from a node address and alias.
///
/// Accepts `https://node.example.com`, `node.example.com` or a node URL with
/// a path prefix. The alias is percent-encoded.
pub fn conference_url(node: &str, alias: &str) -> Result<Url, ConclaveError> {
    let alias = alias.trim();
    if alias.is_empty() {
        return Err(ConclaveError::Config("conference alias is empty".into()));
    }

    let node = node.trim().trim_end_matches('/');
    if node.is_empty() {
        return Err(ConclaveError::Config("node url is empty".into()));
    }
    let node = if node.contains("://") {
        node.to_string()
    } else {
        format!("https://{node}")
    };

    let base = Url::parse(&format!("{node}/"))
        .map_err(|e| ConclaveError::Config(format!("invalid node url '{node}': {e}")))?;
    base.join(&format!(
        "api/client/v2/conferences/{}/",
        urlencoding::encode(alias)
    ))
    .map_err(|e| ConclaveError::Config(format!("invalid conference alias '{alias}': {e}")))
}

/// Map a non-success response onto a typed error.
fn classify_failure(status: StatusCode, body: &str) -> ConclaveError {
    if status.is_server_error() {
        return ConclaveError::Http(format!("server returned {status}"));
    }

    let result = serde_json::from_str::<Envelope<Value>>(body)
        .map(|envelope| envelope.result)
        .unwrap_or(Value::Null);

    match status.as_u16() {
        401 | 403 => classify_forbidden(&result),
        404 => match result.as_str() {
            Some(NO_SUCH_CONFERENCE) => {
                ConclaveError::NoSuchConference(NO_SUCH_CONFERENCE.into())
            }
            Some(message) => ConclaveError::NoSuchNode(message.to_string()),
            None => ConclaveError::NoSuchNode(status.to_string()),
        },
        _ => ConclaveError::Protocol(format!("unexpected status {status}: {result}")),
    }
}

fn classify_forbidden(result: &Value) -> ConclaveError {
    match result {
        Value::String(message) if message == "Invalid token" => ConclaveError::InvalidToken,
        Value::String(message) if message == "Invalid PIN" => ConclaveError::InvalidPin,
        Value::Object(fields) => {
            if fields.get("pin").and_then(Value::as_str) == Some("required") {
                return ConclaveError::RequiredPin {
                    guest_pin_required: fields.get("guest_pin").and_then(Value::as_str)
                        == Some("required"),
                };
            }
            if let Some(idps) = fields.get("idp").and_then(Value::as_array) {
                let idps = idps
                    .iter()
                    .filter_map(|idp| match idp {
                        Value::String(name) => Some(name.clone()),
                        Value::Object(idp) => idp
                            .get("name")
                            .or_else(|| idp.get("uuid"))
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        _ => None,
                    })
                    .collect();
                return ConclaveError::RequiredSso { idps };
            }
            if let Some(url) = fields.get("redirect_url").and_then(Value::as_str) {
                return ConclaveError::SsoRedirect {
                    url: url.to_string(),
                };
            }
            ConclaveError::Protocol(format!("forbidden: {result}"))
        }
        other => ConclaveError::Protocol(format!("forbidden: {other}")),
    }
}

/// REST client bound to one conference on one node.
#[derive(Debug, Clone)]
pub struct HttpConferenceApi {
    client: reqwest::Client,
    base: Url,
}

impl HttpConferenceApi {
    pub fn new(node: &str, alias: &str, timeout: Duration) -> Result<Self, ConclaveError> {
        let base = conference_url(node, alias)?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| ConclaveError::Http(format!("failed to build http client: {e}")))?;
        Ok(Self { client, base })
    }

    pub fn base_url(&self) -> &Url {
        &self.base
    }

    fn endpoint(&self, path: &str) -> Result<Url, ConclaveError> {
        self.base
            .join(path)
            .map_err(|e| ConclaveError::Protocol(format!("invalid endpoint '{path}': {e}")))
    }

    fn call_path(context: &CallContext, call: &CallHandle, action: &str) -> String {
        format!(
            "participants/{}/calls/{}/{action}",
            urlencoding::encode(&context.participant_id),
            urlencoding::encode(&call.0)
        )
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &Value,
        token: Option<&Token>,
        pin: Option<&str>,
    ) -> Result<T, ConclaveError> {
        let url = self.endpoint(path)?;
        debug!(target: "conclave.http", %url, "POST");

        let mut request = self.client.post(url).json(body);
        if let Some(token) = token {
            request = request.header("token", token.value());
        }
        if let Some(pin) = pin {
            request = request.header("pin", pin);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ConclaveError::Http(e.to_string()))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ConclaveError::Http(e.to_string()))?;

        if !status.is_success() {
            let error = classify_failure(status, &text);
            debug!(target: "conclave.http", path, %status, error = %error, "request rejected");
            return Err(error);
        }

        serde_json::from_str::<Envelope<T>>(&text)
            .map(|envelope| envelope.result)
            .map_err(|e| ConclaveError::Protocol(format!("invalid response to {path}: {e}")))
    }
}

#[async_trait]
impl ConferenceApi for HttpConferenceApi {
    async fn request_token(
        &self,
        display_name: &str,
        pin: Option<&str>,
    ) -> Result<TokenGrant, ConclaveError> {
        let result: TokenResult = self
            .post(
                "request_token",
                &json!({ "display_name": display_name }),
                None,
                pin,
            )
            .await?;
        let participant_id = result
            .participant_uuid
            .ok_or_else(|| ConclaveError::Protocol("token grant without participant".into()))?;
        info!(target: "conclave.http", participant = %participant_id, "token granted");
        Ok(TokenGrant {
            token: Token::new(result.token, result.expires.secs()?),
            participant_id,
            display_name: result.display_name,
        })
    }

    async fn refresh_token(&self, token: &Token) -> Result<Token, ConclaveError> {
        let result: TokenResult = self
            .post("refresh_token", &json!({}), Some(token), None)
            .await?;
        Ok(Token::new(result.token, result.expires.secs()?))
    }

    async fn release_token(&self, token: &Token) -> Result<(), ConclaveError> {
        self.post::<IgnoredAny>("release_token", &json!({}), Some(token), None)
            .await
            .map(|_| ())
    }

    async fn create_call(
        &self,
        context: &CallContext,
        offer: &str,
        presentation_in_mix: bool,
        token: &Token,
    ) -> Result<CallAnswer, ConclaveError> {
        let mut body = json!({ "call_type": "WEBRTC", "sdp": offer });
        if presentation_in_mix {
            body["present"] = json!("main");
        }
        let path = format!(
            "participants/{}/calls",
            urlencoding::encode(&context.participant_id)
        );
        let result: CallResult = self.post(&path, &body, Some(token), None).await?;
        Ok(CallAnswer {
            call: CallHandle(result.call_uuid),
            sdp: result.sdp,
        })
    }

    async fn update_call(
        &self,
        context: &CallContext,
        call: &CallHandle,
        offer: &str,
        token: &Token,
    ) -> Result<String, ConclaveError> {
        let path = Self::call_path(context, call, "update");
        let result: UpdateResult = self
            .post(&path, &json!({ "sdp": offer }), Some(token), None)
            .await?;
        Ok(match result {
            UpdateResult::Sdp(sdp) | UpdateResult::Described { sdp } => sdp,
        })
    }

    async fn new_candidate(
        &self,
        context: &CallContext,
        call: &CallHandle,
        candidate: &CandidateSubmission,
        token: &Token,
    ) -> Result<(), ConclaveError> {
        let path = Self::call_path(context, call, "new_candidate");
        let body = json!({
            "candidate": candidate.candidate,
            "mid": candidate.mid,
            "ufrag": candidate.ufrag,
            "pwd": candidate.pwd,
        });
        self.post::<IgnoredAny>(&path, &body, Some(token), None)
            .await
            .map(|_| ())
    }

    async fn ack_call(
        &self,
        context: &CallContext,
        call: &CallHandle,
        token: &Token,
    ) -> Result<(), ConclaveError> {
        let path = Self::call_path(context, call, "ack");
        self.post::<IgnoredAny>(&path, &json!({}), Some(token), None)
            .await
            .map(|_| ())
    }

    async fn send_message(&self, text: &str, token: &Token) -> Result<(), ConclaveError> {
        let body = json!({ "type": "text/plain", "payload": text });
        self.post::<IgnoredAny>("message", &body, Some(token), None)
            .await
            .map(|_| ())
    }
}
