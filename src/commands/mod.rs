pub mod extract;
pub mod run;
pub mod schema;

use crate::consumer::queue_name;

/// Print the queue a consumer for `deployment` binds to.
pub fn run_queue_name(deployment: &str) -> anyhow::Result<()> {
    crate::config::validate_deployment(deployment)?;
    println!("{}", queue_name(deployment));
    Ok(())
}
