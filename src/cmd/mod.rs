//! CLI command implementations.
//!
//! | Module    | Commands handled   |
//! |-----------|--------------------|
//! | `serve`   | `Serve`            |
//! | `run`     | `Run`              |
//! | `history` | `History`, `Show`  |
//! | `phases`  | `Phases`           |
//! | `config`  | `Config`           |

pub mod config;
pub mod history;
pub mod phases;
pub mod run;
pub mod serve;

pub use config::cmd_config;
pub use history::{cmd_history, cmd_show};
pub use phases::cmd_phases;
pub use run::{cmd_run, read_requirement};
pub use serve::cmd_serve;
