//! Cross-origin component runtime: a typed request/ack/response message bus
//! over `postMessage`, parent/child lifecycle controllers, and render
//! delegation between sibling frames, all running against an in-process,
//! headless window substrate.

pub mod bus;
pub mod component;
pub mod config;
pub mod error;
pub mod name;
pub mod props;
pub mod task;
pub mod templates;
pub mod timers;
pub mod win;

pub use bus::{
    Bus, BusClient, Data, ListenOptions, MessageEvent, MethodHandle, SendOptions, Timeout,
};
pub use component::{
    ChildController, CloseReason, Component, ComponentOptions, Contexts, DomainConfig,
    ParentController, RenderContext, UrlConfig,
};
pub use config::{LogLevel, RuntimeConfig, SendStrategy};
pub use error::Error;
pub use props::{NormalizeOptions, PropDefinition, PropType, Props, Serialization};
pub use templates::{Dimensions, TemplateContext};
pub use win::identity::DomainPattern;
pub use win::{Browser, ElementHandle, WindowHandle};
