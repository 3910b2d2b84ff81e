mod cli;

use zentro_core::error::AgentError;

use crate::cli::interrupt::InterruptedError;

fn main() {
    if let Err(e) = cli::run() {
        if e.downcast_ref::<InterruptedError>().is_some()
            || matches!(e.downcast_ref::<AgentError>(), Some(AgentError::Cancelled))
        {
            std::process::exit(130);
        }
        eprintln!("{e:#}"); // pretty anyhow chain
        std::process::exit(1);
    }
}
