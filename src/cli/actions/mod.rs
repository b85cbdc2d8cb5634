pub mod profile;
pub mod run;

use anyhow::Result;

#[derive(Debug)]
pub enum Action {
    Run(run::Args),
}

impl Action {
    /// # Errors
    /// Returns an error if the action fails.
    pub async fn execute(self) -> Result<()> {
        match self {
            Self::Run(args) => run::execute(args).await,
        }
    }
}
