//! CLI command implementations.
//!
//! | Module   | Commands handled |
//! |----------|------------------|
//! | `serve`  | `Serve`          |
//! | `info`   | `Agents`, `Config`, `ParseLimits` |

pub mod info;
pub mod serve;

pub use info::{cmd_agents, cmd_config, cmd_parse_limits};
pub use serve::cmd_serve;
