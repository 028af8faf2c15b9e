mod roster;
mod session;

use std::net::TcpListener;
use std::thread;

use tracing_subscriber::EnvFilter;

use crate::roster::Roster;

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("parley_text_server=debug"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let port = std::env::var("PORT")
        .ok()
        .and_then(|port| port.parse::<u16>().ok())
        .unwrap_or(8080);
    let listener = TcpListener::bind(("0.0.0.0", port))?;
    tracing::info!("serving on port {port}");

    let roster = Roster::default();
    loop {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) => {
                tracing::error!("accept failed: {err}");
                continue;
            }
        };
        let roster = roster.clone();
        thread::spawn(move || session::run(roster, stream));
    }
}
