pub mod tensor;
pub mod classification;
pub mod model;
pub mod config;
pub mod outcome;
pub mod errors;

pub use tensor::*;
pub use classification::*;
pub use model::*;
pub use config::*;
pub use outcome::*;
pub use errors::*;
