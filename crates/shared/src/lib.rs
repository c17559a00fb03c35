pub mod attachment;
pub mod domain;
pub mod error;
pub mod protocol;
