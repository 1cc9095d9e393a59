pub mod protocol;
pub mod tools;
