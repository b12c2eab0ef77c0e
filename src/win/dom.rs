//! A lite document tree: just enough DOM for the component core's contract:
//! lookup by id, append/remove, attached frames, visibility, dimensions, and
//! document ready state.

use std::sync::{Arc, Mutex};

use super::WindowHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Loading,
    Interactive,
    Complete,
}

struct ElementInner {
    tag: String,
    id: Option<String>,
    class_name: Option<String>,
    children: Vec<ElementHandle>,
    frames: Vec<WindowHandle>,
    visible: bool,
    width: Option<u32>,
    height: Option<u32>,
    detached: bool,
}

/// Cheap-clone handle to an element. Identity is pointer identity.
#[derive(Clone)]
pub struct ElementHandle {
    inner: Arc<Mutex<ElementInner>>,
}

impl PartialEq for ElementHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for ElementHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.lock().unwrap();
        f.debug_struct("Element")
            .field("tag", &inner.tag)
            .field("id", &inner.id)
            .field("class", &inner.class_name)
            .finish()
    }
}

impl ElementHandle {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(ElementInner {
                tag: tag.into(),
                id: None,
                class_name: None,
                children: Vec::new(),
                frames: Vec::new(),
                visible: true,
                width: None,
                height: None,
                detached: false,
            })),
        }
    }

    pub fn with_id(self, id: impl Into<String>) -> Self {
        self.inner.lock().unwrap().id = Some(id.into());
        self
    }

    pub fn with_class(self, class: impl Into<String>) -> Self {
        self.inner.lock().unwrap().class_name = Some(class.into());
        self
    }

    pub fn tag(&self) -> String {
        self.inner.lock().unwrap().tag.clone()
    }

    pub fn id(&self) -> Option<String> {
        self.inner.lock().unwrap().id.clone()
    }

    pub fn class_name(&self) -> Option<String> {
        self.inner.lock().unwrap().class_name.clone()
    }

    pub fn append_child(&self, child: &ElementHandle) {
        self.inner.lock().unwrap().children.push(child.clone());
    }

    pub fn remove_child(&self, child: &ElementHandle) {
        self.inner.lock().unwrap().children.retain(|c| c != child);
    }

    pub fn children(&self) -> Vec<ElementHandle> {
        self.inner.lock().unwrap().children.clone()
    }

    pub fn attach_frame(&self, frame: &WindowHandle) {
        self.inner.lock().unwrap().frames.push(frame.clone());
    }

    pub fn detach_frame(&self, frame: &WindowHandle) {
        self.inner.lock().unwrap().frames.retain(|f| !f.ptr_eq(frame));
    }

    pub fn frames(&self) -> Vec<WindowHandle> {
        self.inner.lock().unwrap().frames.clone()
    }

    pub fn set_visible(&self, visible: bool) {
        self.inner.lock().unwrap().visible = visible;
    }

    pub fn visible(&self) -> bool {
        self.inner.lock().unwrap().visible
    }

    pub fn set_dimensions(&self, width: u32, height: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.width = Some(width);
        inner.height = Some(height);
    }

    pub fn dimensions(&self) -> Option<(u32, u32)> {
        let inner = self.inner.lock().unwrap();
        match (inner.width, inner.height) {
            (Some(w), Some(h)) => Some((w, h)),
            _ => None,
        }
    }

    /// Mark the element removed from the document and drop its subtree.
    pub fn detach(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.detached = true;
        inner.children.clear();
        inner.frames.clear();
    }

    pub fn is_detached(&self) -> bool {
        self.inner.lock().unwrap().detached
    }

    /// Depth-first id lookup through this element's subtree.
    pub fn find_by_id(&self, id: &str) -> Option<ElementHandle> {
        if self.id().as_deref() == Some(id) {
            return Some(self.clone());
        }
        for child in self.children() {
            if let Some(found) = child.find_by_id(id) {
                return Some(found);
            }
        }
        None
    }
}

struct DocumentInner {
    body: ElementHandle,
    ready_state: ReadyState,
}

#[derive(Clone)]
pub struct Document {
    inner: Arc<Mutex<DocumentInner>>,
}

impl Document {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(DocumentInner {
                body: ElementHandle::new("body"),
                ready_state: ReadyState::Complete,
            })),
        }
    }

    pub fn body(&self) -> ElementHandle {
        self.inner.lock().unwrap().body.clone()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.inner.lock().unwrap().ready_state
    }

    pub fn set_ready_state(&self, state: ReadyState) {
        self.inner.lock().unwrap().ready_state = state;
    }

    pub fn get_element_by_id(&self, id: &str) -> Option<ElementHandle> {
        self.body().find_by_id(id)
    }
}

impl Default for Document {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("ready_state", &self.ready_state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn find_by_id_searches_subtree() {
        let doc = Document::new();
        let outer = ElementHandle::new("div").with_id("outer");
        let inner = ElementHandle::new("div").with_id("inner");
        outer.append_child(&inner);
        doc.body().append_child(&outer);
        assert_eq!(doc.get_element_by_id("inner"), Some(inner));
        assert!(doc.get_element_by_id("missing").is_none());
    }

    #[test]
    fn detach_clears_subtree() {
        let el = ElementHandle::new("div");
        el.append_child(&ElementHandle::new("span"));
        el.detach();
        assert!(el.is_detached());
        assert!(el.children().is_empty());
    }
}
