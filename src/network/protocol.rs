//! Control and bundle transfer protocol definitions
//!
//! Control payloads are plain strings: the bare probe token `"c"`, its
//! acknowledgement `"p"`, or JSON objects discriminated by `get`. They are
//! carried verbatim inside `WireRequest::Control` so clients see exactly
//! what a proxy sent and can discard anything malformed.

use futures::prelude::*;
use libp2p::{request_response::Codec, StreamProtocol};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

use crate::content::{Bundle, ContentId};

/// Protocol name for control and bundle requests
pub const WIKI_PROTOCOL: StreamProtocol = StreamProtocol::new("/p2p-wiki/control/1.0.0");

/// "Are you a proxy?"
pub const PROBE_TOKEN: &str = "c";

/// "Yes, I'm a proxy"
pub const PROXY_ACK_TOKEN: &str = "p";

/// Upper bound on a single encoded message
pub const MAX_MESSAGE_SIZE: u64 = 64 * 1024 * 1024;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("Invalid JSON: {0}")]
    Json(String),
    #[error("Invalid content identifier: {0}")]
    InvalidContentId(String),
}

/// A control message sent to a peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    /// Handshake probe
    Probe,
    /// Resolve the feed for a locale
    Feed { lang: String },
    /// Resolve an article by name
    Article { article_name: String },
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "get", rename_all = "lowercase")]
enum ResourceRequest {
    Feed {
        lang: String,
    },
    Article {
        #[serde(rename = "articleName")]
        article_name: String,
    },
}

impl ControlRequest {
    pub fn encode(&self) -> String {
        let resource = match self {
            ControlRequest::Probe => return PROBE_TOKEN.to_string(),
            ControlRequest::Feed { lang } => ResourceRequest::Feed { lang: lang.clone() },
            ControlRequest::Article { article_name } => ResourceRequest::Article {
                article_name: article_name.clone(),
            },
        };
        // Serializing a plain struct of strings cannot fail
        serde_json::to_string(&resource).unwrap_or_default()
    }

    pub fn decode(raw: &str) -> Result<Self, ParseError> {
        if raw == PROBE_TOKEN {
            return Ok(ControlRequest::Probe);
        }
        let resource: ResourceRequest =
            serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;
        Ok(match resource {
            ResourceRequest::Feed { lang } => ControlRequest::Feed { lang },
            ResourceRequest::Article { article_name } => ControlRequest::Article { article_name },
        })
    }
}

/// A proxy's answer to a feed or article request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentResponse {
    /// Hex content identifier; the consensus trust key
    #[serde(rename = "infoHash")]
    pub info_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl ContentResponse {
    pub fn new(content_id: ContentId, name: impl Into<String>) -> Self {
        Self {
            info_hash: content_id.to_hex(),
            name: Some(name.into()),
        }
    }

    pub fn encode(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Parse and validate a raw response
    pub fn parse(raw: &str) -> Result<Self, ParseError> {
        let response: Self =
            serde_json::from_str(raw).map_err(|e| ParseError::Json(e.to_string()))?;
        response.content_id()?;
        Ok(response)
    }

    pub fn content_id(&self) -> Result<ContentId, ParseError> {
        ContentId::from_hex(&self.info_hash)
            .map_err(|_| ParseError::InvalidContentId(self.info_hash.clone()))
    }
}

#[derive(Serialize)]
struct ErrorResponse<'a> {
    error: &'a str,
}

/// Encode a failure answer; clients treat it as malformed
pub fn encode_error(message: &str) -> String {
    serde_json::to_string(&ErrorResponse { error: message }).unwrap_or_default()
}

/// Request on the wiki protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireRequest {
    /// Control payload (probe, feed or article request)
    Control(String),
    /// Fetch a bundle by identifier
    Bundle { content_id: ContentId },
}

/// Response on the wiki protocol
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireResponse {
    Control(String),
    Bundle(Bundle),
    NotFound { content_id: ContentId },
}

/// JSON codec for the wiki protocol
#[derive(Debug, Clone, Default)]
pub struct WikiCodec;

async fn read_json<T, R>(io: &mut R) -> io::Result<T>
where
    T: serde::de::DeserializeOwned,
    R: AsyncRead + Unpin + Send,
{
    let mut buf = Vec::new();
    io.take(MAX_MESSAGE_SIZE).read_to_end(&mut buf).await?;
    serde_json::from_slice(&buf).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

async fn write_json<T, W>(io: &mut W, value: &T) -> io::Result<()>
where
    T: Serialize,
    W: AsyncWrite + Unpin + Send,
{
    let buf = serde_json::to_vec(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    io.write_all(&buf).await?;
    io.close().await?;
    Ok(())
}

#[async_trait::async_trait]
impl Codec for WikiCodec {
    type Protocol = StreamProtocol;
    type Request = WireRequest;
    type Response = WireResponse;

    async fn read_request<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Request>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_json(io).await
    }

    async fn read_response<T>(&mut self, _: &Self::Protocol, io: &mut T) -> io::Result<Self::Response>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_json(io).await
    }

    async fn write_request<T>(&mut self, _: &Self::Protocol, io: &mut T, req: Self::Request) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_json(io, &req).await
    }

    async fn write_response<T>(&mut self, _: &Self::Protocol, io: &mut T, res: Self::Response) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_json(io, &res).await
    }
}
