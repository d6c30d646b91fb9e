mod account;
mod agents;
mod app;
mod auth;
mod config;
mod conversations;
mod crypto;
mod dispatch;
mod error;
mod ingress;
mod pipeline;
mod prompting;
mod public_api;
mod realtime;
mod reply;
mod resolver;
mod storage;
mod store;
mod types;
mod validation;
mod webhook;

#[tokio::main]
async fn main() {
    if let Err(err) = app::run().await {
        tracing::error!(error = %err, "support desk failed to start");
        eprintln!("support desk failed: {err}");
        std::process::exit(1);
    }
}
