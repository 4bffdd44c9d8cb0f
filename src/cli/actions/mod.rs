pub mod code;
pub mod inspect;

mod run;

#[derive(Debug)]
pub enum Action {
    Inspect(inspect::Args),
    Code(code::Args),
}

impl Action {
    /// Execute the action.
    /// # Errors
    /// Returns an error if the action fails.
    pub fn execute(self) -> anyhow::Result<()> {
        run::execute(self)
    }
}
