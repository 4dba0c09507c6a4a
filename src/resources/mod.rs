pub mod accountant;
pub mod executor;
pub mod monitor;

pub use accountant::{Accountant, Free};
pub use executor::{Executor, SimExecutor};
pub use monitor::{MeasureSource, Measures, Monitor, StaticSource};
