pub mod data;
pub mod dataset;
pub mod error;
pub mod inference;
pub mod logging;
pub mod model;
pub mod split;
pub mod training;
pub mod transform;
pub mod view;

pub use error::{ClassifierError, Result};
