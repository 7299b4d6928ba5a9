//! Route registration and dispatch.

mod core;
mod params;
mod tree;


pub use self::core::{Handler, Router};
pub use self::params::PathParams;
