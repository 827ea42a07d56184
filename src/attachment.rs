use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{json, Map, Value as Json};

use crate::error::{OdmError, Result};

/// Attachments of a document, keyed by file name.
pub type Attachments = BTreeMap<String, Attachment>;

/// A binary attachment. Attachments read from the store are stubs that
/// carry metadata only; new ones carry their payload and are sent inline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attachment {
    content_type: String,
    data: Option<Vec<u8>>,
    length: Option<u64>,
    digest: Option<String>,
    revpos: Option<u64>,
}

impl Attachment {
    pub fn new(content_type: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        let data = data.into();
        Self {
            content_type: content_type.into(),
            length: Some(data.len() as u64),
            data: Some(data),
            digest: None,
            revpos: None,
        }
    }

    pub fn content_type(&self) -> &str {
        &self.content_type
    }

    /// Inline payload. `None` for stubs.
    pub fn data(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    pub fn is_stub(&self) -> bool {
        self.data.is_none()
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn digest(&self) -> Option<&str> {
        self.digest.as_deref()
    }

    /// Store representation: inline base64 payload, or a stub.
    pub(crate) fn to_json(&self) -> Json {
        match &self.data {
            Some(data) => json!({
                "content_type": self.content_type,
                "data": STANDARD.encode(data),
            }),
            None => {
                let mut stub = Map::new();
                stub.insert("stub".into(), Json::Bool(true));
                stub.insert("content_type".into(), Json::String(self.content_type.clone()));
                if let Some(length) = self.length {
                    stub.insert("length".into(), Json::from(length));
                }
                if let Some(digest) = &self.digest {
                    stub.insert("digest".into(), Json::String(digest.clone()));
                }
                if let Some(revpos) = self.revpos {
                    stub.insert("revpos".into(), Json::from(revpos));
                }
                Json::Object(stub)
            }
        }
    }

    pub(crate) fn from_json(name: &str, json: &Json) -> Result<Self> {
        let Json::Object(map) = json else {
            return Err(OdmError::InvalidDocument(format!(
                "attachment {name} is not an object"
            )));
        };
        let content_type = map
            .get("content_type")
            .and_then(Json::as_str)
            .unwrap_or("application/octet-stream")
            .to_string();
        let data = match map.get("data").and_then(Json::as_str) {
            Some(encoded) => Some(STANDARD.decode(encoded).map_err(|e| {
                OdmError::InvalidDocument(format!("attachment {name} payload: {e}"))
            })?),
            None => None,
        };
        Ok(Self {
            content_type,
            length: map
                .get("length")
                .and_then(Json::as_u64)
                .or_else(|| data.as_ref().map(|d| d.len() as u64)),
            data,
            digest: map.get("digest").and_then(Json::as_str).map(str::to_string),
            revpos: map.get("revpos").and_then(Json::as_u64),
        })
    }
}

pub(crate) fn attachments_to_json(attachments: &Attachments) -> Json {
    Json::Object(
        attachments
            .iter()
            .map(|(name, attachment)| (name.clone(), attachment.to_json()))
            .collect(),
    )
}

pub(crate) fn attachments_from_json(json: &Json) -> Result<Attachments> {
    match json {
        Json::Null => Ok(Attachments::new()),
        Json::Object(map) => map
            .iter()
            .map(|(name, value)| Ok((name.clone(), Attachment::from_json(name, value)?)))
            .collect(),
        _ => Err(OdmError::InvalidDocument("_attachments is not an object".into())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inline_payload_is_base64() {
        let attachment = Attachment::new("text/plain", b"hello".to_vec());
        assert_eq!(
            attachment.to_json(),
            json!({"content_type": "text/plain", "data": "aGVsbG8="})
        );
        assert_eq!(attachment.length(), Some(5));
    }

    #[test]
    fn stubs_keep_metadata() {
        let stored = json!({
            "logo.png": {
                "stub": true,
                "content_type": "image/png",
                "length": 42,
                "digest": "md5-x",
                "revpos": 2
            }
        });
        let attachments = attachments_from_json(&stored).unwrap();
        let logo = &attachments["logo.png"];
        assert!(logo.is_stub());
        assert_eq!(logo.length(), Some(42));
        assert_eq!(logo.digest(), Some("md5-x"));
        assert_eq!(attachments_to_json(&attachments), stored);
    }

    #[test]
    fn bad_payload_is_rejected() {
        let stored = json!({"a": {"content_type": "text/plain", "data": "***"}});
        assert!(matches!(
            attachments_from_json(&stored),
            Err(OdmError::InvalidDocument(_))
        ));
    }
}
