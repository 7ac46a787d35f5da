//! Webhook verification and dispatch
//!
//! Inbound callbacks are authenticated by an HMAC digest over the raw,
//! unparsed body, compared in constant time. Verification happens before
//! any payload parsing. Dispatch is a lookup table from event type to
//! handler; unknown event types are accepted and dropped, since upstream
//! may introduce new ones without notice.

use crate::error::{GatewayError, Result};
use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;
use std::collections::HashMap;

/// Header carrying the declared event type.
pub const EVENT_TYPE_HEADER: &str = "x-github-event";

/// Digest scheme expected in the signature header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    Sha1,
    Sha256,
}

impl SignatureScheme {
    pub fn header_name(self) -> &'static str {
        match self {
            SignatureScheme::Sha1 => "x-hub-signature",
            SignatureScheme::Sha256 => "x-hub-signature-256",
        }
    }

    fn prefix(self) -> &'static str {
        match self {
            SignatureScheme::Sha1 => "sha1=",
            SignatureScheme::Sha256 => "sha256=",
        }
    }
}

/// One inbound callback, captured before any parsing.
pub struct WebhookEnvelope {
    pub raw_body: Bytes,
    pub signature_header: Option<String>,
    pub event_type: Option<String>,
}

impl WebhookEnvelope {
    /// Capture the raw body and the relevant headers. The event type comes
    /// from a header, never from the body.
    pub fn from_request(headers: &HeaderMap, body: Bytes, scheme: SignatureScheme) -> Self {
        let signature_header = headers
            .get(scheme.header_name())
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let event_type = headers
            .get(EVENT_TYPE_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);

        Self {
            raw_body: body,
            signature_header,
            event_type,
        }
    }
}

/// Validates callback authenticity with a shared secret.
pub struct WebhookVerifier {
    secret: String,
    scheme: SignatureScheme,
}

impl WebhookVerifier {
    pub fn new(secret: impl Into<String>, scheme: SignatureScheme) -> Self {
        Self {
            secret: secret.into(),
            scheme,
        }
    }

    pub fn scheme(&self) -> SignatureScheme {
        self.scheme
    }

    /// Verify the envelope and return the declared event type.
    ///
    /// A missing signature header is rejected outright, same as a bad one.
    pub fn verify(&self, envelope: &WebhookEnvelope) -> Result<String> {
        let header = envelope
            .signature_header
            .as_deref()
            .ok_or(GatewayError::InvalidSignature)?;

        let hex_digest = header
            .strip_prefix(self.scheme.prefix())
            .ok_or(GatewayError::InvalidSignature)?;
        let expected = hex::decode(hex_digest).map_err(|_| GatewayError::InvalidSignature)?;

        // verify_slice is a constant-time comparison; string equality here
        // would open a timing side channel.
        let valid = match self.scheme {
            SignatureScheme::Sha1 => Hmac::<Sha1>::new_from_slice(self.secret.as_bytes())
                .map(|mut mac| {
                    mac.update(&envelope.raw_body);
                    mac.verify_slice(&expected).is_ok()
                })
                .unwrap_or(false),
            SignatureScheme::Sha256 => Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
                .map(|mut mac| {
                    mac.update(&envelope.raw_body);
                    mac.verify_slice(&expected).is_ok()
                })
                .unwrap_or(false),
        };

        if !valid {
            return Err(GatewayError::InvalidSignature);
        }

        envelope
            .event_type
            .clone()
            .ok_or(GatewayError::InvalidSignature)
    }

    /// Produce the signature header value for `body`.
    pub fn sign(&self, body: &[u8]) -> String {
        let digest = match self.scheme {
            SignatureScheme::Sha1 => Hmac::<Sha1>::new_from_slice(self.secret.as_bytes())
                .map(|mut mac| {
                    mac.update(body);
                    hex::encode(mac.finalize().into_bytes())
                })
                .unwrap_or_default(),
            SignatureScheme::Sha256 => Hmac::<Sha256>::new_from_slice(self.secret.as_bytes())
                .map(|mut mac| {
                    mac.update(body);
                    hex::encode(mac.finalize().into_bytes())
                })
                .unwrap_or_default(),
        };
        format!("{}{}", self.scheme.prefix(), digest)
    }
}

/// Context handed to an event handler after verification.
pub struct EventContext {
    pub owner: String,
    pub name: String,
    pub payload: serde_json::Value,
}

/// One capability per event type.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &EventContext) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Handled,
    Ignored,
}

/// Lookup table from event type to handler; unknown types are a no-op.
#[derive(Default)]
pub struct EventDispatcher {
    handlers: HashMap<String, Box<dyn EventHandler>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock handler set: push, issues, pull_request.
    pub fn with_default_handlers() -> Self {
        Self::new()
            .register("push", Box::new(PushHandler))
            .register("issues", Box::new(IssuesHandler))
            .register("pull_request", Box::new(PullRequestHandler))
    }

    pub fn register(mut self, event_type: &str, handler: Box<dyn EventHandler>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    pub async fn dispatch(&self, event_type: &str, ctx: &EventContext) -> Result<DispatchOutcome> {
        match self.handlers.get(event_type) {
            Some(handler) => {
                handler.handle(ctx).await?;
                Ok(DispatchOutcome::Handled)
            }
            None => {
                tracing::info!(event_type, "no handler registered, ignoring event");
                Ok(DispatchOutcome::Ignored)
            }
        }
    }
}

struct PushHandler;

#[async_trait]
impl EventHandler for PushHandler {
    async fn handle(&self, ctx: &EventContext) -> Result<()> {
        let git_ref = ctx.payload.get("ref").and_then(|v| v.as_str()).unwrap_or("");
        let commits = ctx
            .payload
            .get("commits")
            .and_then(|v| v.as_array())
            .map_or(0, Vec::len);
        tracing::info!(
            owner = %ctx.owner,
            repo = %ctx.name,
            git_ref,
            commits,
            "push event received"
        );
        Ok(())
    }
}

struct IssuesHandler;

#[async_trait]
impl EventHandler for IssuesHandler {
    async fn handle(&self, ctx: &EventContext) -> Result<()> {
        let action = ctx
            .payload
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let number = ctx
            .payload
            .pointer("/issue/number")
            .and_then(serde_json::Value::as_u64);
        tracing::info!(
            owner = %ctx.owner,
            repo = %ctx.name,
            action,
            issue = ?number,
            "issues event received"
        );
        Ok(())
    }
}

struct PullRequestHandler;

#[async_trait]
impl EventHandler for PullRequestHandler {
    async fn handle(&self, ctx: &EventContext) -> Result<()> {
        let action = ctx
            .payload
            .get("action")
            .and_then(|v| v.as_str())
            .unwrap_or("unknown");
        let number = ctx
            .payload
            .pointer("/pull_request/number")
            .and_then(serde_json::Value::as_u64);
        tracing::info!(
            owner = %ctx.owner,
            repo = %ctx.name,
            action,
            pull_request = ?number,
            "pull_request event received"
        );
        Ok(())
    }
}
