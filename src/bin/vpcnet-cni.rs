use anyhow::Result;
use tracing::error;
use vpcnet::commands::{error_result, run_cni};

fn main() -> Result<()> {
    // Logging is set up once the network configuration has been read.
    if let Err(err) = run_cni() {
        error!("CNI plugin error: {:#}", err);

        // Output error in CNI format
        error_result(&err).print()?;
        std::process::exit(1);
    }

    Ok(())
}
