pub mod defs;
pub mod manifest;
