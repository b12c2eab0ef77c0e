//! Wire frames. Every message is a JSON object wrapped under a single fixed
//! key, so non-protocol traffic on the same channel is trivially ignored.

use serde::{Deserialize, Serialize};

/// The single key protocol frames live under in the message-event data.
pub const WIRE_KEY: &str = "__postRobot__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FrameType {
    Request,
    Ack,
    Response,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AckStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WindowType {
    Popup,
    Iframe,
    Fullpage,
}

impl From<crate::win::WindowKind> for WindowType {
    fn from(kind: crate::win::WindowKind) -> Self {
        match kind {
            crate::win::WindowKind::Popup => WindowType::Popup,
            crate::win::WindowKind::Iframe => WindowType::Iframe,
            crate::win::WindowKind::TopLevel => WindowType::Fullpage,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireFrame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,
    /// Unique per frame; the receive side deduplicates on it.
    pub id: String,
    /// Correlation: REQUEST generates, ACK and RESPONSE echo.
    pub hash: String,
    pub name: String,
    /// The sender's origin as the sender knows it; authoritative for mock
    /// and file schemes where the event origin is opaque.
    #[serde(rename = "sourceDomain")]
    pub source_domain: String,
    #[serde(rename = "windowType")]
    pub window_type: WindowType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ack: Option<AckStatus>,
}

/// Serialize a frame into message-event data.
pub fn emit(frame: &WireFrame) -> String {
    serde_json::json!({ WIRE_KEY: frame }).to_string()
}

/// Parse message-event data into a frame. Anything that is not a protocol
/// frame yields `None` and is ignored by the caller.
pub fn parse(raw: &str) -> Option<WireFrame> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    let inner = value.get(WIRE_KEY)?;
    serde_json::from_value(inner.clone()).ok()
}
