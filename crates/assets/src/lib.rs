//! Binary asset storage and `asset://` reference resolution.
//!
//! Messages carry opaque `asset://` references; the store turns them
//! back into bytes or URLs right before a provider call. Two backends:
//! content-addressed filesystem ([`fs::FsAssetStore`]) and S3/MinIO
//! ([`s3::S3AssetStore`]).

pub mod fs;
pub mod s3;

use base64::Engine;

use cf_domain::chat::{ChatMessage, ContentPart, MessageContent};
use cf_domain::error::{Error, Result};

/// A stored asset's identity and size.
#[derive(Debug, Clone)]
pub struct SavedAsset {
    pub asset_id: String,
    pub size: u64,
}

/// Raw asset bytes plus their MIME type.
#[derive(Debug, Clone)]
pub struct AssetData {
    pub bytes: Vec<u8>,
    pub mime: String,
}

/// Contract every asset backend implements. Implementations never
/// mutate caller data; writes are atomic per asset.
#[async_trait::async_trait]
pub trait AssetStore: Send + Sync {
    /// Store bytes; returns a content-addressed asset id. Saving the
    /// same bytes twice yields the same id.
    async fn save(&self, bytes: &[u8], mime: &str) -> Result<SavedAsset>;

    /// Fetch an asset by id.
    async fn get(&self, asset_id: &str) -> Result<AssetData>;

    /// A URL the asset can be fetched from without credentials, when
    /// the backend supports one (public base or pre-signed).
    async fn public_url(&self, asset_id: &str) -> Result<Option<String>> {
        let _ = asset_id;
        Ok(None)
    }

    fn store_id(&self) -> &str;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Asset references
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

const SCHEME: &str = "asset://";

/// The three shapes a media reference can take in message parts.
#[derive(Debug, Clone, PartialEq)]
pub enum AssetRef {
    /// `asset://<id>` or `asset://<namespace>/<id>`.
    Asset {
        id: String,
        namespace: Option<String>,
    },
    /// Any other URL, passed through untouched.
    Url(String),
    /// Inline data (a `data:` URL).
    Inline { mime: String, bytes: Vec<u8> },
}

impl AssetRef {
    /// Parse a message-part URL into a reference.
    pub fn parse(url: &str) -> Result<Self> {
        if let Some(rest) = url.strip_prefix(SCHEME) {
            if rest.is_empty() {
                return Err(Error::Asset("empty asset reference".into()));
            }
            return Ok(match rest.split_once('/') {
                Some((ns, id)) if !id.is_empty() => AssetRef::Asset {
                    id: id.to_string(),
                    namespace: Some(ns.to_string()),
                },
                _ => AssetRef::Asset {
                    id: rest.trim_end_matches('/').to_string(),
                    namespace: None,
                },
            });
        }
        if let Some(rest) = url.strip_prefix("data:") {
            let (header, data) = rest
                .split_once(',')
                .ok_or_else(|| Error::Asset("malformed data URL".into()))?;
            let mime = header
                .strip_suffix(";base64")
                .ok_or_else(|| Error::Asset("only base64 data URLs are supported".into()))?;
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(data)
                .map_err(|e| Error::Asset(format!("invalid base64 in data URL: {e}")))?;
            return Ok(AssetRef::Inline {
                mime: mime.to_string(),
                bytes,
            });
        }
        Ok(AssetRef::Url(url.to_string()))
    }

    pub fn is_asset(&self) -> bool {
        matches!(self, AssetRef::Asset { .. })
    }
}

/// Build an `asset://` reference string.
pub fn build_asset_ref(namespace: Option<&str>, asset_id: &str) -> String {
    match namespace {
        Some(ns) if !ns.is_empty() => format!("{SCHEME}{ns}/{asset_id}"),
        _ => format!("{SCHEME}{asset_id}"),
    }
}

/// Encode bytes as a base64 `data:` URL.
pub fn to_data_url(mime: &str, bytes: &[u8]) -> String {
    format!(
        "data:{mime};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    )
}

/// Resolve every `asset://` reference in `messages` to something a
/// provider accepts: a public URL when the store offers one, otherwise
/// an inline `data:` URL. Input is untouched; a resolved copy returns.
///
/// Unresolvable references degrade to a text placeholder rather than
/// failing the whole call.
pub async fn resolve_asset_refs_in_messages(
    messages: &[ChatMessage],
    store: &dyn AssetStore,
) -> Vec<ChatMessage> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        let MessageContent::Parts(parts) = &message.content else {
            out.push(message.clone());
            continue;
        };
        let mut resolved_parts = Vec::with_capacity(parts.len());
        for part in parts {
            resolved_parts.push(resolve_part(part, store).await);
        }
        let mut resolved = message.clone();
        resolved.content = MessageContent::Parts(resolved_parts);
        out.push(resolved);
    }
    out
}

async fn resolve_part(part: &ContentPart, store: &dyn AssetStore) -> ContentPart {
    let url = match part {
        ContentPart::Image { url, .. } | ContentPart::File { url, .. } => url.clone(),
        ContentPart::Text { .. } => return part.clone(),
    };
    let Ok(AssetRef::Asset { id, .. }) = AssetRef::parse(&url) else {
        return part.clone();
    };

    let resolved_url = match store.public_url(&id).await {
        Ok(Some(public)) => public,
        _ => match store.get(&id).await {
            Ok(data) => to_data_url(&data.mime, &data.bytes),
            Err(e) => {
                tracing::warn!(asset_id = %id, error = %e, "asset resolution failed");
                return ContentPart::Text {
                    text: format!("[unavailable asset {id}]"),
                };
            }
        },
    };

    match part {
        ContentPart::Image { media_type, .. } => ContentPart::Image {
            url: resolved_url,
            media_type: media_type.clone(),
        },
        ContentPart::File { mime_type, .. } => ContentPart::File {
            url: resolved_url,
            mime_type: mime_type.clone(),
        },
        ContentPart::Text { .. } => unreachable!("text parts return early"),
    }
}

/// Strip multimodal parts entirely (used when inline resolution is
/// disabled and the agent is expected to fetch assets via a tool).
pub fn strip_media_parts(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    messages
        .iter()
        .map(|m| {
            let MessageContent::Parts(parts) = &m.content else {
                return m.clone();
            };
            let kept: Vec<ContentPart> = parts
                .iter()
                .filter(|p| matches!(p, ContentPart::Text { .. }))
                .cloned()
                .collect();
            let mut stripped = m.clone();
            stripped.content = if kept.is_empty() {
                MessageContent::Text(m.content.extract_all_text())
            } else {
                MessageContent::Parts(kept)
            };
            stripped
        })
        .collect()
}
