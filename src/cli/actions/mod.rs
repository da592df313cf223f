pub mod cluster;
pub mod devices;
pub mod firewall;
pub mod registration;
pub mod server;
pub mod webadmin;

use anyhow::Result;

pub enum Action {
    Start(server::Args),
    Devices(devices::Args),
    Registration(registration::Args),
    Cluster(cluster::Args),
    Firewall(firewall::Args),
    Webadmin(webadmin::Args),
}

impl Action {
    /// Execute the selected action.
    ///
    /// # Errors
    ///
    /// Returns the action's error; the binary prints it to stderr and
    /// exits 1.
    pub async fn execute(self) -> Result<()> {
        match self {
            Self::Start(args) => server::execute(args).await,
            Self::Devices(args) => devices::execute(args).await,
            Self::Registration(args) => registration::execute(args).await,
            Self::Cluster(args) => cluster::execute(args).await,
            Self::Firewall(args) => firewall::execute(args).await,
            Self::Webadmin(args) => webadmin::execute(args).await,
        }
    }
}
