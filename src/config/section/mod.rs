//! Configuration section definitions.
//!
//! Each module corresponds to a section in `lumen.toml`:
//!
//! | Module     | TOML Section   | Purpose                                |
//! |------------|----------------|----------------------------------------|
//! | `server`   | `[server]`     | Websocket listener                     |
//! | `session`  | `[session]`    | Per-session limits and protocol        |
//! | `security` | `[security]`   | Signing secret and credential lifetime |

mod security;
mod server;
mod session;

pub use security::SecurityConfig;
pub use server::ServerConfig;
pub use session::SessionConfig;
