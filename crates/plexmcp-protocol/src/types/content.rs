//! Content blocks carried in tool results, prompt messages, and sampling.

use serde::{Deserialize, Serialize};

use super::resources::ResourceContents;

/// A single content block, discriminated by `type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text
    Text(TextContent),
    /// Base64-encoded image
    Image(ImageContent),
    /// Base64-encoded audio
    Audio(AudioContent),
    /// A reference to a server resource
    ResourceLink(ResourceLink),
    /// Inline resource contents
    Resource(EmbeddedResource),
}

impl ContentBlock {
    /// Text content block
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(TextContent { text: text.into() })
    }

    /// The text, if this is a text block
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(t) => Some(&t.text),
            _ => None,
        }
    }
}

/// Text content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    /// The text
    pub text: String,
}

/// Image content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageContent {
    /// Base64-encoded image data
    pub data: String,
    /// Image MIME type
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// Audio content
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AudioContent {
    /// Base64-encoded audio data
    pub data: String,
    /// Audio MIME type
    #[serde(rename = "mimeType")]
    pub mime_type: String,
}

/// A link to a resource the client can read later
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLink {
    /// Resource URI
    pub uri: String,
    /// Resource name
    pub name: String,
    /// Display title
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// Resource description
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Resource MIME type
    #[serde(rename = "mimeType", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Resource contents embedded directly in a message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedResource {
    /// The embedded contents
    pub resource: ResourceContents,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_block_wire_shape() {
        let block = ContentBlock::text("hi");
        assert_eq!(
            serde_json::to_value(&block).unwrap(),
            json!({"type": "text", "text": "hi"})
        );
    }

    #[test]
    fn discriminates_on_type() {
        let block: ContentBlock =
            serde_json::from_value(json!({"type": "image", "data": "AA==", "mimeType": "image/png"}))
                .unwrap();
        assert!(matches!(block, ContentBlock::Image(_)));
    }
}
