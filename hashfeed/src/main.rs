use hashfeed::{daemon::Daemon, tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing::init_journald_or_stdout();

    let daemon = Daemon::new();
    daemon.run().await
}
