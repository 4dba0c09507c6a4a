pub mod api;
pub mod domain;
pub mod engine;
pub mod error;
pub mod logger;
pub mod net;
pub mod persistence;
pub mod protocol;
pub mod resources;
pub mod settings;

pub use engine::Engine;
pub use error::{Error, Result};
pub use settings::Settings;
