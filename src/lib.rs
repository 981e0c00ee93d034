pub use ubcore;

pub mod auth;
pub mod completion;
pub mod config;
pub mod control;
pub mod http;
pub mod listener;
pub mod presence;
pub mod provider;
pub mod session;
pub mod store;

pub use control::{ControlPlane, ControlPlaneBuilder};
