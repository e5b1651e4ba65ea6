//! Observable snapshot store core.

pub mod observable;

pub use observable::{ObservableStore, Subscription};
