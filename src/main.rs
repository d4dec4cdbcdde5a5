//! Demo application for pathwatch.
//!
//! Watches a path (argument or current directory) and prints the normalized
//! event stream until Ctrl-C.

use anyhow::Result;
use pathwatch::{WatchConfig, Watcher};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pathwatch=debug".parse()?),
        )
        .init();

    let watch_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| ".".to_string());

    let config = WatchConfig::builder().cwd(std::env::current_dir()?).build();
    let (watcher, mut events) = Watcher::new(config)?;
    let mut errors = watcher.errors();

    watcher.add([watch_path.as_str()]).await?;
    watcher.ready().await;

    println!("Watching {watch_path} (backend: {:?})", watcher.backend_kind());
    println!("Press Ctrl+C to exit\n");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!("\nShutting down...");
                break;
            }
            event = events.recv() => {
                match event {
                    Ok(event) => println!("{:?}: {}", event.kind, event.path.display()),
                    Err(_) => break,
                }
            }
            err = errors.recv() => {
                if let Ok(err) = err {
                    eprintln!("error: {err}");
                }
            }
        }
    }

    watcher.close().await;
    Ok(())
}
