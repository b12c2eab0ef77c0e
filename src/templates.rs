//! Container and component templates. The core treats these as opaque
//! render functions: given an instance context they produce the element the
//! child frame mounts into, or the interstitial shown while it loads.

use std::sync::Arc;

use crate::component::RenderContext;
use crate::error::Error;
use crate::win::ElementHandle;

/// Fixed width/height for a rendered component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Everything a template gets to see about the instance being rendered.
#[derive(Debug, Clone)]
pub struct TemplateContext {
    pub tag: String,
    pub uid: String,
    pub context: RenderContext,
    pub dimensions: Option<Dimensions>,
}

pub type ContainerTemplateFn =
    Arc<dyn Fn(&TemplateContext) -> Result<ElementHandle, Error> + Send + Sync>;
pub type ComponentTemplateFn =
    Arc<dyn Fn(&TemplateContext) -> Result<ElementHandle, Error> + Send + Sync>;

/// A plain container div, classed by tag, sized from the declared
/// dimensions when present.
pub fn default_container_template() -> ContainerTemplateFn {
    Arc::new(|ctx: &TemplateContext| {
        let el = ElementHandle::new("div")
            .with_class(format!("xcomponent-container-{}", ctx.tag))
            .with_id(format!("xcomponent-{}", ctx.uid));
        if let Some(dimensions) = ctx.dimensions {
            el.set_dimensions(dimensions.width, dimensions.height);
        }
        Ok(el)
    })
}

/// A loading interstitial shown until the child reports ready.
pub fn default_component_template() -> ComponentTemplateFn {
    Arc::new(|ctx: &TemplateContext| {
        let el = ElementHandle::new("div").with_class(format!("xcomponent-loading-{}", ctx.tag));
        Ok(el)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_container_carries_tag_and_dimensions() {
        let template = default_container_template();
        let el = template(&TemplateContext {
            tag: "demo-comp".into(),
            uid: "u1".into(),
            context: RenderContext::Iframe,
            dimensions: Some(Dimensions {
                width: 300,
                height: 150,
            }),
        })
        .unwrap();
        assert_eq!(
            el.class_name().as_deref(),
            Some("xcomponent-container-demo-comp")
        );
        assert_eq!(el.dimensions(), Some((300, 150)));
    }
}
