use crate::{DEFAULT_ENDPOINT_PATH, EIO_PROTOCOL_VERSION};
use thiserror::Error;
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EndpointError {
    #[error("invalid base URL: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("unsupported URL scheme: {0}")]
    UnsupportedScheme(String),
}

/// Location of a server's Engine.IO endpoint, used to derive the handshake and upgrade URLs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    base_url: Url,
    path: String,
}

impl Endpoint {
    /// Creates an endpoint for the given base URL, mounted under [`DEFAULT_ENDPOINT_PATH`].
    ///
    /// Accepts `http`, `https`, `ws` and `wss` base URLs; the handshake always uses the HTTP scheme
    /// and the upgrade the matching WebSocket scheme.
    pub fn new(base_url: &str) -> Result<Self, EndpointError> {
        let base_url = Url::parse(base_url)?;
        match base_url.scheme() {
            "http" | "https" | "ws" | "wss" => {}
            other => return Err(EndpointError::UnsupportedScheme(other.to_string())),
        }
        Ok(Self {
            base_url,
            path: DEFAULT_ENDPOINT_PATH.to_string(),
        })
    }

    pub fn with_path(mut self, path: &str) -> Self {
        self.path = path.trim_matches('/').to_string();
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// `{base}/{path}/?EIO=3&transport=polling&t={cache_buster}`
    pub fn handshake_url(&self, cache_buster: &str) -> Result<Url, EndpointError> {
        let scheme = match self.base_url.scheme() {
            "ws" | "http" => "http",
            _ => "https",
        };
        let mut url = self.endpoint_url(scheme)?;
        url.query_pairs_mut()
            .append_pair("EIO", &EIO_PROTOCOL_VERSION.to_string())
            .append_pair("transport", "polling")
            .append_pair("t", cache_buster);
        Ok(url)
    }

    /// `{base with http mapped to ws}/{path}/?EIO=3&transport=websocket&sid={sid}`
    pub fn upgrade_url(&self, sid: &str) -> Result<Url, EndpointError> {
        let scheme = match self.base_url.scheme() {
            "ws" | "http" => "ws",
            _ => "wss",
        };
        let mut url = self.endpoint_url(scheme)?;
        url.query_pairs_mut()
            .append_pair("EIO", &EIO_PROTOCOL_VERSION.to_string())
            .append_pair("transport", "websocket")
            .append_pair("sid", sid);
        Ok(url)
    }

    fn endpoint_url(&self, scheme: &str) -> Result<Url, EndpointError> {
        let mut url = self.base_url.clone();
        url.set_scheme(scheme)
            .map_err(|_| EndpointError::UnsupportedScheme(scheme.to_string()))?;

        let base_path = url.path().trim_end_matches('/').to_string();
        if self.path.is_empty() {
            url.set_path(&format!("{base_path}/"));
        } else {
            url.set_path(&format!("{base_path}/{}/", self.path));
        }
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}
