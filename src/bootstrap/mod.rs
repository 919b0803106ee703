//! Component lifecycle: the open/close state machine every long-lived part
//! of the pipeline shares, trees of components, and background run loops.

mod component;
mod manager;
mod runner;

pub use component::{
    BaseComponent, Component, ComponentError, ComponentEvent, ComponentEvents, ComponentState,
    ListenerId,
};
pub use manager::ComponentManager;
pub use runner::{run_loops, NamedLoop, RunAsyncComponent, Runnable};
