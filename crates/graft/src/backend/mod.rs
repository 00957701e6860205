pub mod dce;
pub mod spec;
