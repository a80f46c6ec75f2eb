//! cassandra-sidecar - runs next to the database in every member pod.

use kube::Client;
use tracing::{error, info};

use cassandra_operator::sidecar::{MemberController, SidecarEnv};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("cassandra_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .json()
        .init();

    info!("Starting cassandra-sidecar");

    let client = Client::try_default().await?;
    let env = SidecarEnv::from_env()?;
    let controller = MemberController::new(client, env)?;

    if let Err(e) = controller.run().await {
        error!(error = %e, "Sidecar stopped");
        return Err(e.into());
    }
    Ok(())
}
