use std::sync::{atomic::AtomicBool, Arc};

use resilient_http::{ClientOptions, LogSink, Request, ResilientClient};
use tracing_subscriber::EnvFilter;

/// Probes every URL given on the command line with the spraying preset.
///
/// Options can be tuned through `RESILIENT_HTTP_*` environment variables.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,resilient_http=debug")),
        )
        .init();

    let targets: Vec<String> = std::env::args().skip(1).collect();
    if targets.is_empty() {
        anyhow::bail!("usage: spray <url>...");
    }

    let (sink, writer) = LogSink::spawn(1024);
    let client = ResilientClient::new(ClientOptions::from_env()?)?.with_log_sink(sink);
    let cancelled = Arc::new(AtomicBool::new(false));

    let handles: Vec<_> = targets
        .into_iter()
        .map(|url| {
            let task = client.dispatch(Request::get(url));
            let unit = Arc::clone(&cancelled);
            tokio::spawn(async move { task.run(&unit).await })
        })
        .collect();

    for handle in handles {
        if let Some(outcome) = handle.await? {
            match outcome.status() {
                Some(status) => println!("{status} after {} attempt(s)", outcome.attempts()),
                None => println!("failed after {} attempt(s)", outcome.attempts()),
            }
        }
    }

    drop(client);
    writer.await?;
    Ok(())
}
