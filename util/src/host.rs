//! Host platform utility functions

use std::{env, path::PathBuf};

/// Name of the environment variable pointing at the root of the software checkout.
pub const SW_ROOT_ENV_VAR: &str = "VEH_SW_ROOT";

/// Get the root directory of the software, as set by the `VEH_SW_ROOT` environment variable.
///
/// Parameter files are found in `<root>/params` and sessions are created under the root.
pub fn get_sw_root() -> Result<PathBuf, env::VarError> {
    env::var(SW_ROOT_ENV_VAR).map(PathBuf::from)
}
