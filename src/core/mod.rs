// Core modules implementing wire encoding, file formats, and error modeling.
pub mod error;
pub mod image;
pub mod model;
pub mod name;
pub mod wire;
