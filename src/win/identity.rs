//! Window-identity utilities. Every operation is total with respect to
//! cross-origin denials: where a browser would throw on foreign access, these
//! return conservative answers (`is_same_domain` → false, `is_window_closed`
//! → true) instead of propagating.

use regex::Regex;

use crate::error::Error;

use super::WindowHandle;

/// An origin pattern: exact origin, wildcard, regex, or an ordered list of
/// any of these. A list matches if any element matches.
#[derive(Clone)]
pub enum DomainPattern {
    Wildcard,
    Literal(String),
    Regex(Regex),
    Any(Vec<DomainPattern>),
}

impl DomainPattern {
    pub fn literal(origin: impl Into<String>) -> Self {
        DomainPattern::Literal(origin.into())
    }

    pub fn matches(&self, origin: &str) -> bool {
        match self {
            DomainPattern::Wildcard => true,
            DomainPattern::Literal(expected) => expected == "*" || expected == origin,
            DomainPattern::Regex(re) => re.is_match(origin),
            DomainPattern::Any(patterns) => patterns.iter().any(|p| p.matches(origin)),
        }
    }

    /// The `targetOrigin` to pass to `postMessage` for this pattern. Only an
    /// exact origin can be enforced at the transport; everything else
    /// devolves to `*` and is checked on receipt.
    pub fn as_target_origin(&self) -> String {
        match self {
            DomainPattern::Literal(origin) if origin != "*" => origin.clone(),
            _ => "*".to_string(),
        }
    }
}

impl std::fmt::Debug for DomainPattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DomainPattern::Wildcard => write!(f, "*"),
            DomainPattern::Literal(s) => write!(f, "{s:?}"),
            DomainPattern::Regex(re) => write!(f, "/{}/", re.as_str()),
            DomainPattern::Any(list) => f.debug_list().entries(list).finish(),
        }
    }
}

impl From<&str> for DomainPattern {
    fn from(value: &str) -> Self {
        if value == "*" {
            DomainPattern::Wildcard
        } else {
            DomainPattern::Literal(value.to_string())
        }
    }
}

/// Match an origin against a pattern.
pub fn match_domain(pattern: &DomainPattern, origin: &str) -> bool {
    pattern.matches(origin)
}

/// The window's real origin, as the engine knows it.
pub fn get_actual_domain(win: &WindowHandle) -> Result<String, Error> {
    win.raw_origin()
        .ok_or_else(|| Error::Fatal("can not determine domain of window with no location".into()))
}

/// The window's origin, honoring a mock-domain override when one was set.
pub fn get_domain(win: &WindowHandle) -> Result<String, Error> {
    if let Some(mock) = win.mock_domain() {
        return Ok(mock);
    }
    get_actual_domain(win)
}

/// Whether `win` and `other` share an origin. False on any denial or when
/// either window cannot report one.
pub fn is_same_domain(win: &WindowHandle, other: &WindowHandle) -> bool {
    if !win.same_browser(other) {
        return false;
    }
    match (win.raw_origin(), other.raw_origin()) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

/// The opener if the window has one, otherwise the parent.
pub fn get_ancestor(win: &WindowHandle) -> Option<WindowHandle> {
    win.opener().or_else(|| win.parent())
}

/// Whether the window should be treated as gone. A dropped browser or any
/// state the engine can no longer reach counts as closed.
pub fn is_window_closed(win: &WindowHandle) -> bool {
    win.is_closed()
}

/// Like [`is_window_closed`], treating an absent handle as closed.
pub fn is_window_closed_opt(win: Option<&WindowHandle>) -> bool {
    match win {
        Some(win) => is_window_closed(win),
        None => true,
    }
}

/// Search `root` and its descendants for a frame named `name`. Same-origin
/// matches (relative to `current`) are preferred over cross-origin ones,
/// mirroring how named lookup behaves across frame boundaries.
pub fn find_frame_by_name(
    root: &WindowHandle,
    name: &str,
    current: &WindowHandle,
) -> Option<WindowHandle> {
    if name.is_empty() {
        return None;
    }
    let mut cross_origin_match: Option<WindowHandle> = None;
    let mut queue = vec![root.clone()];
    while let Some(win) = queue.pop() {
        for frame in win.frames() {
            if frame.is_closed() {
                continue;
            }
            if frame.name() == name {
                if is_same_domain(&frame, current) {
                    return Some(frame);
                }
                if cross_origin_match.is_none() {
                    cross_origin_match = Some(frame.clone());
                }
            }
            queue.push(frame);
        }
    }
    cross_origin_match
}
