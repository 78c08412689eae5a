//! Command-line interface module.

mod args;
pub mod token;

pub use args::{Cli, Commands};

use crate::view::LiveRoutes;

/// Print every routed pattern, one per line.
pub fn list_routes(routes: &LiveRoutes) {
    for pattern in routes.patterns() {
        println!("{pattern}");
    }
}
