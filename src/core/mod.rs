//! Process-wide state shared by the server and the CLI.

mod state;

pub use state::{is_listening, is_shutdown, set_listening, setup_shutdown_handler};
