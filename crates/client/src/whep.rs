//! WHEP session management: the server endpoint this controller drives.
//! Abstracted behind a trait so controller tests can treat it as an oracle
//! instead of driving a real browser `fetch`.

use async_trait::async_trait;
use thiserror::Error;
use wasm_bindgen::{JsCast, JsValue};
use wasm_bindgen_futures::JsFuture;
use web_sys::{Headers, Request, RequestInit, RequestMode, Response, Url};

#[derive(Debug, Error)]
pub enum WhepError {
    #[error("WHEP request failed: {0}")]
    RequestFailed(String),
    #[error("WHEP endpoint returned unexpected status {0}")]
    UnexpectedStatus(u16),
    #[error("WHEP response missing Location header")]
    MissingLocation,
}

/// A live WHEP session: the resolved session URL plus the SDP answer
/// received from the 201 Created response.
#[derive(Debug, Clone)]
pub struct WhepSession {
    pub location: String,
    pub answer_sdp: String,
}

/// The WHEP endpoint surface the controller drives: open a session with an
/// SDP offer, trickle ICE candidates, tear the session down. Mirrors
/// spec.md §4.G's "OPTIONS / POST / PATCH" wire contract.
#[async_trait(?Send)]
pub trait WhepEndpoint {
    async fn post_offer(&self, offer_sdp: &str) -> Result<WhepSession, WhepError>;
    async fn patch_ice(&self, session: &WhepSession, fragment: &str) -> Result<(), WhepError>;
    async fn delete_session(&self, session: &WhepSession) -> Result<(), WhepError>;
}

/// `fetch`-backed implementation against a real WHEP endpoint URL.
pub struct HttpWhepEndpoint {
    base_url: String,
}

impl HttpWhepEndpoint {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self { base_url: base_url.into() }
    }

    async fn fetch(&self, url: &str, method: &str, content_type: &str, body: Option<&str>) -> Result<Response, WhepError> {
        let opts = RequestInit::new();
        opts.set_method(method);
        opts.set_mode(RequestMode::Cors);
        if let Some(body) = body {
            opts.set_body(&JsValue::from_str(body));
        }

        let headers = Headers::new().map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?;
        headers
            .set("Content-Type", content_type)
            .map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?;
        opts.set_headers(&headers);

        let request = Request::new_with_str_and_init(url, &opts).map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?;

        let window = crate::util::window();
        let response_value = JsFuture::from(window.fetch_with_request(&request))
            .await
            .map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?;
        response_value
            .dyn_into::<Response>()
            .map_err(|e| WhepError::RequestFailed(format!("{e:?}")))
    }
}

#[async_trait(?Send)]
impl WhepEndpoint for HttpWhepEndpoint {
    async fn post_offer(&self, offer_sdp: &str) -> Result<WhepSession, WhepError> {
        let response = self.fetch(&self.base_url, "POST", "application/sdp", Some(offer_sdp)).await?;
        if response.status() != 201 {
            return Err(WhepError::UnexpectedStatus(response.status()));
        }
        let location = response
            .headers()
            .get("Location")
            .map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?
            .ok_or(WhepError::MissingLocation)?;
        let session_url = Url::new_with_base(&location, &self.base_url).ok().map(|u| u.href()).unwrap_or(location);

        let body_value = JsFuture::from(response.text().map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?)
            .await
            .map_err(|e| WhepError::RequestFailed(format!("{e:?}")))?;
        let answer_sdp = body_value.as_string().unwrap_or_default();

        Ok(WhepSession { location: session_url, answer_sdp })
    }

    async fn patch_ice(&self, session: &WhepSession, fragment: &str) -> Result<(), WhepError> {
        let response = self.fetch(&session.location, "PATCH", "application/trickle-ice-sdpfrag", Some(fragment)).await?;
        if response.status() != 204 && response.status() != 200 {
            return Err(WhepError::UnexpectedStatus(response.status()));
        }
        Ok(())
    }

    async fn delete_session(&self, session: &WhepSession) -> Result<(), WhepError> {
        let _ = self.fetch(&session.location, "DELETE", "text/plain", None).await?;
        Ok(())
    }
}
