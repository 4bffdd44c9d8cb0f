use crate::cli::actions::{code, inspect, Action};
use anyhow::Result;

/// Execute the provided action.
/// # Errors
/// Returns an error if the action fails.
pub fn execute(action: Action) -> Result<()> {
    match action {
        Action::Inspect(args) => inspect::execute(&args),
        Action::Code(args) => code::execute(&args),
    }
}
