//! Observer payload validation
//!
//! Turns raw command fields into [`OutboundPayload`] values. Anything malformed
//! is rejected here with a [`PayloadError`] and never reaches the session.

use base64::engine::general_purpose;
use serde::{Deserialize, Serialize};

use crate::error::PayloadError;
use crate::types::{ButtonSpec, MediaInput};

/// JID suffix for individual users
pub const USER_JID_SUFFIX: &str = "@s.whatsapp.net";

/// Most quick-reply buttons a single message may carry
pub const MAX_BUTTONS: usize = 3;

/// Media category, derived from the mime type prefix
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Image,
    Video,
    Audio,
    Document,
}

impl MediaKind {
    pub fn from_mime(mime: &str) -> Self {
        let mime = mime.to_ascii_lowercase();
        if mime.starts_with("image/") {
            Self::Image
        } else if mime.starts_with("video/") {
            Self::Video
        } else if mime.starts_with("audio/") {
            Self::Audio
        } else {
            Self::Document
        }
    }
}

/// Decoded media attachment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Media {
    pub bytes: Vec<u8>,
    pub mime_type: String,
    pub kind: MediaKind,
    pub caption: Option<String>,
    pub file_name: Option<String>,
}

/// Validated quick-reply button
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Button {
    pub id: String,
    pub text: String,
}

/// Content handed to the protocol session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundPayload {
    Text(String),
    Media(Media),
    Buttons {
        text: String,
        buttons: Vec<Button>,
        media: Option<Media>,
    },
}

impl OutboundPayload {
    /// Text recorded in history for this payload
    pub fn history_text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Media(media) => media
                .caption
                .clone()
                .filter(|c| !c.is_empty())
                .unwrap_or_else(|| "(media)".to_string()),
            Self::Buttons { text, media, .. } => {
                if text.is_empty() {
                    media
                        .as_ref()
                        .and_then(|m| m.caption.clone())
                        .unwrap_or_default()
                } else {
                    text.clone()
                }
            }
        }
    }
}

/// Add the user JID suffix to bare numbers
pub fn normalize_jid(target: &str) -> Result<String, PayloadError> {
    let target = target.trim();
    if target.is_empty() {
        return Err(PayloadError::EmptyRecipient);
    }

    if target.contains('@') {
        Ok(target.to_string())
    } else {
        Ok(format!("{}{}", target, USER_JID_SUFFIX))
    }
}

/// Decode `data:<mime>;base64,<payload>`, or raw base64 with an explicit mime type
pub fn decode_media_bytes(
    media_bytes: &str,
    mime_type: Option<&str>,
    max_bytes: usize,
) -> Result<(Vec<u8>, String), PayloadError> {
    let (mime, encoded) = match media_bytes.strip_prefix("data:") {
        Some(rest) => {
            let (header, data) = rest.split_once(',').ok_or(PayloadError::InvalidDataUrl)?;
            let mime = header
                .strip_suffix(";base64")
                .filter(|m| !m.is_empty())
                .ok_or(PayloadError::InvalidDataUrl)?;
            (mime.to_string(), data)
        }
        None => {
            let mime = mime_type
                .map(str::trim)
                .filter(|m| !m.is_empty())
                .ok_or(PayloadError::MissingMimeType)?;
            (mime.to_string(), media_bytes)
        }
    };

    // Reject early on encoded length; 4 base64 chars carry 3 bytes
    let estimated = encoded.len() / 4 * 3;
    if estimated > max_bytes + 3 {
        return Err(PayloadError::MediaTooLarge {
            size: estimated,
            max: max_bytes,
        });
    }

    let bytes = base64::Engine::decode(&general_purpose::STANDARD, encoded.trim())
        .map_err(|_| PayloadError::InvalidBase64)?;

    if bytes.len() > max_bytes {
        return Err(PayloadError::MediaTooLarge {
            size: bytes.len(),
            max: max_bytes,
        });
    }

    Ok((bytes, mime))
}

/// Decode an attached media object
pub fn decode_media(input: &MediaInput, max_bytes: usize) -> Result<Media, PayloadError> {
    let (bytes, mime_type) =
        decode_media_bytes(&input.media_bytes, input.mime_type.as_deref(), max_bytes)?;
    let kind = MediaKind::from_mime(&mime_type);

    Ok(Media {
        bytes,
        mime_type,
        kind,
        caption: input.caption.clone(),
        file_name: match kind {
            MediaKind::Document => Some(
                input
                    .file_name
                    .clone()
                    .filter(|f| !f.is_empty())
                    .unwrap_or_else(|| "file".to_string()),
            ),
            _ => input.file_name.clone(),
        },
    })
}

/// Validate quick-reply buttons and assign ids to those without one
pub fn validate_buttons(buttons: &[ButtonSpec]) -> Result<Vec<Button>, PayloadError> {
    if buttons.is_empty() {
        return Err(PayloadError::InvalidButtons(
            "at least one button is required".to_string(),
        ));
    }
    if buttons.len() > MAX_BUTTONS {
        return Err(PayloadError::InvalidButtons(format!(
            "at most {} buttons are allowed, got {}",
            MAX_BUTTONS,
            buttons.len()
        )));
    }

    buttons
        .iter()
        .enumerate()
        .map(|(index, spec)| {
            let text = spec.text.trim();
            if text.is_empty() {
                return Err(PayloadError::InvalidButtons(format!(
                    "button {} has no text",
                    index + 1
                )));
            }
            Ok(Button {
                id: spec
                    .id
                    .clone()
                    .filter(|id| !id.trim().is_empty())
                    .unwrap_or_else(|| format!("btn-{}", index + 1)),
                text: text.to_string(),
            })
        })
        .collect()
}

/// Build a button message; attached media must be an image or a video
pub fn button_payload(
    text: String,
    buttons: &[ButtonSpec],
    media: Option<&MediaInput>,
    max_bytes: usize,
) -> Result<OutboundPayload, PayloadError> {
    let buttons = validate_buttons(buttons)?;
    let media = match media {
        Some(input) => {
            let media = decode_media(input, max_bytes)?;
            if !matches!(media.kind, MediaKind::Image | MediaKind::Video) {
                return Err(PayloadError::InvalidButtons(format!(
                    "button media must be an image or video, got {}",
                    media.mime_type
                )));
            }
            Some(media)
        }
        None => None,
    };

    Ok(OutboundPayload::Buttons {
        text,
        buttons,
        media,
    })
}

/// Content of a broadcast: buttons win over media, media over plain text
pub fn broadcast_payload(
    text: Option<String>,
    media: Option<&MediaInput>,
    buttons: &[ButtonSpec],
    max_bytes: usize,
) -> Result<OutboundPayload, PayloadError> {
    let caption = media.and_then(|m| m.caption.clone());
    let text = text
        .filter(|t| !t.is_empty())
        .or(caption)
        .unwrap_or_default();

    if !buttons.is_empty() {
        return button_payload(text, buttons, media, max_bytes);
    }

    match media {
        Some(input) => {
            let mut media = decode_media(input, max_bytes)?;
            if !text.is_empty() {
                media.caption = Some(text);
            }
            Ok(OutboundPayload::Media(media))
        }
        None => Ok(OutboundPayload::Text(text)),
    }
}
