//! Child-window-name codec. A component child context carries its descriptor
//! packed into the window's `name` attribute:
//!
//! ```text
//! XC__<name>__<version>__<payload>
//! ```
//!
//! where `payload` is base32-of-JSON, lowercase, unpadded. Any window whose
//! name does not start with the sentinel is not a component.

use base32::Alphabet;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub const WINDOW_NAME_PREFIX: &str = "XC";
const DELIMITER: &str = "__";
const BASE32: Alphabet = Alphabet::Rfc4648Lower { padding: false };

/// How the child should locate the window that controls it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ParentRef {
    /// The child's immediate parent (or opener).
    DirectParent,
    /// The parent of the child's immediate parent; used when the child sits
    /// inside a sandbox sub-frame the controller owns.
    ParentParent,
    /// Look the render window up in the controller window's process-wide
    /// windows map, keyed by the instance uid.
    ParentUid,
    /// A literal window name to search the ancestor frame tree for.
    Name(String),
}

const REF_DIRECT_PARENT: &str = "__direct_parent__";
const REF_PARENT_PARENT: &str = "__parent_parent__";
const REF_PARENT_UID: &str = "__parent_uid__";

impl From<String> for ParentRef {
    fn from(value: String) -> Self {
        match value.as_str() {
            REF_DIRECT_PARENT => ParentRef::DirectParent,
            REF_PARENT_PARENT => ParentRef::ParentParent,
            REF_PARENT_UID => ParentRef::ParentUid,
            _ => ParentRef::Name(value),
        }
    }
}

impl From<ParentRef> for String {
    fn from(value: ParentRef) -> Self {
        match value {
            ParentRef::DirectParent => REF_DIRECT_PARENT.to_string(),
            ParentRef::ParentParent => REF_PARENT_PARENT.to_string(),
            ParentRef::ParentUid => REF_PARENT_UID.to_string(),
            ParentRef::Name(name) => name,
        }
    }
}

/// How the child recovers its initial props.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PropRef {
    /// Serialized props embedded inline.
    Raw { value: serde_json::Value },
    /// Look the props up in the controller window's process-wide props map,
    /// keyed by the instance uid.
    Uid,
}

/// The structured descriptor packed into a child window's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowNamePayload {
    pub name: String,
    pub version: String,
    pub tag: String,
    /// Random per instance.
    pub id: String,
    /// Origin of the parent that opened the child.
    pub domain: String,
    pub parent: ParentRef,
    #[serde(rename = "renderParent")]
    pub render_parent: ParentRef,
    /// Instance id, used for uid-addressed lookups.
    pub uid: String,
    pub props: PropRef,
}

/// Strip non-alphanumerics from the edges and collapse interior runs to a
/// single underscore, so segments can never contain the `__` delimiter.
fn normalize_segment(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut pending_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(ch);
        } else {
            pending_sep = true;
        }
    }
    out
}

/// Encode a descriptor into a child window name.
pub fn build_child_window_name(payload: &WindowNamePayload) -> Result<String, Error> {
    let json = serde_json::to_vec(payload)
        .map_err(|err| Error::Fatal(format!("failed to serialize window name payload: {err}")))?;
    let encoded = base32::encode(BASE32, &json);
    Ok(format!(
        "{prefix}{d}{name}{d}{version}{d}{encoded}",
        prefix = WINDOW_NAME_PREFIX,
        d = DELIMITER,
        name = normalize_segment(&payload.name),
        version = normalize_segment(&payload.version),
    ))
}

/// Decode a window name back into its descriptor. Returns `None` for
/// anything that is not a component window name: wrong sentinel, bad shape,
/// undecodable payload. The window is then simply "not a component".
pub fn decode_child_window_name(window_name: &str) -> Option<WindowNamePayload> {
    let mut segments = window_name.split(DELIMITER);
    if segments.next() != Some(WINDOW_NAME_PREFIX) {
        return None;
    }
    let _name = segments.next()?;
    let _version = segments.next()?;
    let encoded = segments.next()?;
    if segments.next().is_some() {
        return None;
    }
    let bytes = base32::decode(BASE32, encoded)?;
    serde_json::from_slice(&bytes).ok()
}

/// Whether a window name marks a component child context.
pub fn is_child_window_name(window_name: &str) -> bool {
    window_name.starts_with(&format!("{WINDOW_NAME_PREFIX}{DELIMITER}"))
}
