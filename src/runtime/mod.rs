//! Background execution and callback marshalling

pub mod dispatcher;
pub mod executor;

pub use dispatcher::{UiDispatcher, UiLoop};
pub use executor::{TaskExecutor, TaskHandle, TaskOutcome};
