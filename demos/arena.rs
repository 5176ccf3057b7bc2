use combat_tracker::simulation::ArenaApp;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    ArenaApp::run().await.inspect_err(|err| {
        eprintln!("Application errored out: {err:?}");
    })?;
    Ok(())
}
