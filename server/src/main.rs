use clap::Parser;
use log::info;
use server::accounts::AccountStore;
use server::question_bank::QuestionBank;
use server::server::Server;
use std::path::PathBuf;
use tokio::sync::watch;

/// QuizNet multiplayer quiz game server
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// TCP port for game connections
    #[arg(long = "tcp", default_value_t = shared::DEFAULT_TCP_PORT)]
    tcp_port: u16,

    /// UDP port for LAN discovery
    #[arg(long = "udp", default_value_t = shared::DEFAULT_UDP_PORT)]
    udp_port: u16,

    /// Server name advertised to LAN clients
    #[arg(long, default_value = "quiznet")]
    name: String,

    /// Question data file
    #[arg(long, default_value = "data/questions.dat")]
    questions: PathBuf,

    /// Account data file
    #[arg(long, default_value = "data/accounts.dat")]
    accounts: PathBuf,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    if std::env::var("RUST_LOG").is_err() {
        eprintln!("Warning: RUST_LOG environment variable not set. Set it to display logs!");
        eprintln!("Recommended: RUST_LOG=info cargo run");
    }

    let args = Args::parse();
    info!("Starting QuizNet server '{}'", args.name);

    let bank = QuestionBank::load(&args.questions)?;
    if bank.is_empty() {
        return Err(format!("no questions loaded from {}", args.questions.display()).into());
    }
    let accounts = AccountStore::load(&args.accounts);

    let server = Server::init(args.name, args.tcp_port, args.udp_port, bank, accounts).await?;

    // First signal shuts down cooperatively, a second one forces exit
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("Shutdown signal received...");
        let _ = shutdown_tx.send(true);
        wait_for_signal().await;
        eprintln!("Force shutdown");
        std::process::exit(1);
    });

    server.run(shutdown_rx).await;
    info!("Server stopped cleanly");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
