//! TCP connection management: the listener, per-connection line framing and
//! dispatch, disconnect cleanup, and graceful shutdown.
//!
//! Each accepted connection is served by one task that owns both halves of
//! its socket. A `select!` loop interleaves reads with drains of the
//! client's bounded outbound queue; responses and broadcasts go through the
//! same queue, so lines never interleave on the wire. Framing follows the
//! protocol strictly: a `GET` header dispatches immediately, a `POST` header
//! is held until its single JSON body line arrives.

use crate::accounts::AccountStore;
use crate::client_manager::{ClientManager, MAX_CLIENTS, SEND_QUEUE_LEN};
use crate::discover;
use crate::protocol;
use crate::question_bank::QuestionBank;
use crate::session_manager::SessionManager;
use log::{debug, error, info, warn};
use shared::MAX_LINE_LEN;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, Notify, RwLock};

/// Process-wide state shared by the dispatcher's handlers and the session
/// engine tasks.
pub struct ServerContext {
    pub server_name: String,
    /// The bound TCP port, as advertised by discovery
    pub tcp_port: u16,
    pub clients: Arc<RwLock<ClientManager>>,
    pub sessions: Mutex<SessionManager>,
    pub accounts: Mutex<AccountStore>,
    pub bank: Arc<QuestionBank>,
}

/// The quiz server: both listening sockets plus the shared state
pub struct Server {
    ctx: Arc<ServerContext>,
    tcp_listener: TcpListener,
    udp_socket: UdpSocket,
}

impl Server {
    /// Binds both listening sockets and assembles the shared state.
    pub async fn init(
        server_name: String,
        tcp_port: u16,
        udp_port: u16,
        bank: QuestionBank,
        accounts: AccountStore,
    ) -> Result<Self, Box<dyn std::error::Error>> {
        let tcp_listener = TcpListener::bind(("0.0.0.0", tcp_port)).await?;
        let udp_socket = UdpSocket::bind(("0.0.0.0", udp_port)).await?;
        let bound_tcp = tcp_listener.local_addr()?.port();
        let bound_udp = udp_socket.local_addr()?.port();

        let clients = Arc::new(RwLock::new(ClientManager::new(MAX_CLIENTS)));
        let bank = Arc::new(bank);
        let sessions = Mutex::new(SessionManager::new(clients.clone(), bank.clone()));

        info!("Server '{}' initialized:", server_name);
        info!("  TCP port: {}", bound_tcp);
        info!("  UDP port: {}", bound_udp);
        info!("  Themes: {}", bank.themes().len());
        info!("  Questions: {}", bank.len());
        info!("  Accounts: {}", accounts.len());

        Ok(Self {
            ctx: Arc::new(ServerContext {
                server_name,
                tcp_port: bound_tcp,
                clients,
                sessions,
                accounts: Mutex::new(accounts),
                bank,
            }),
            tcp_listener,
            udp_socket,
        })
    }

    /// Bound TCP address, mainly for tests binding port 0
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.tcp_listener.local_addr()
    }

    /// Bound UDP address
    pub fn udp_addr(&self) -> std::io::Result<SocketAddr> {
        self.udp_socket.local_addr()
    }

    /// Accepts connections until shutdown is signalled, then drains the
    /// per-connection tasks so readers exit before we return.
    pub async fn run(self, shutdown: watch::Receiver<bool>) {
        let discovery = tokio::spawn(discover::run_discovery(
            self.udp_socket,
            self.ctx.server_name.clone(),
            self.ctx.tcp_port,
            shutdown.clone(),
        ));

        let mut connections = tokio::task::JoinSet::new();
        let mut shutdown_rx = shutdown.clone();
        info!("Waiting for connections on port {}...", self.ctx.tcp_port);

        loop {
            tokio::select! {
                accepted = self.tcp_listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        connections.spawn(handle_connection(
                            self.ctx.clone(),
                            stream,
                            addr,
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => error!("Accept failed: {}", e),
                },
                _ = shutdown_rx.changed() => break,
            }
        }

        // Close the listener first, then let connection tasks finish
        drop(self.tcp_listener);
        info!("Listener closed, draining {} connection task(s)", connections.len());
        while connections.join_next().await.is_some() {}
        let _ = discovery.await;
        info!("Server stopped");
    }
}

async fn handle_connection(
    ctx: Arc<ServerContext>,
    stream: TcpStream,
    addr: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(SEND_QUEUE_LEN);
    let kick = Arc::new(Notify::new());
    let client_id = {
        let mut clients = ctx.clients.write().await;
        clients.add_client(addr, outbound_tx.clone(), kick.clone())
    };
    let Some(client_id) = client_id else {
        warn!("Refusing connection from {}: client table full", addr);
        return;
    };

    let (mut reader, writer) = stream.into_split();
    let mut writer = BufWriter::new(writer);
    let mut buf: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 2048];
    // A POST header waiting for its body line
    let mut pending_header: Option<String> = None;

    'conn: loop {
        tokio::select! {
            read = reader.read(&mut chunk) => {
                match read {
                    Ok(0) => {
                        debug!("Client {}: connection closed by peer", client_id);
                        break 'conn;
                    }
                    Ok(n) => {
                        buf.extend_from_slice(&chunk[..n]);
                        let mut oversized = false;
                        while let Some(pos) = buf.iter().position(|b| *b == b'\n') {
                            if pos > MAX_LINE_LEN {
                                oversized = true;
                                break;
                            }
                            let raw: Vec<u8> = buf.drain(..=pos).collect();
                            let line = String::from_utf8_lossy(&raw[..pos]);
                            let line = line.trim();
                            if line.is_empty() {
                                continue;
                            }
                            if !process_line(&ctx, client_id, line, &mut pending_header, &outbound_tx).await {
                                break 'conn;
                            }
                        }
                        if oversized || buf.len() > MAX_LINE_LEN {
                            warn!("Client {}: line exceeds {} bytes, disconnecting", client_id, MAX_LINE_LEN);
                            break 'conn;
                        }
                    }
                    Err(e) => {
                        debug!("Client {}: read error: {}", client_id, e);
                        break 'conn;
                    }
                }
            }
            outbound = outbound_rx.recv() => match outbound {
                Some(line) => {
                    if write_line(&mut writer, &line).await.is_err() {
                        debug!("Client {}: write failed", client_id);
                        break 'conn;
                    }
                }
                None => break 'conn,
            },
            _ = kick.notified() => {
                warn!("Client {}: kicked", client_id);
                break 'conn;
            }
            _ = shutdown.changed() => {
                debug!("Client {}: server shutting down", client_id);
                break 'conn;
            }
        }
    }

    // Disconnect cleanup: leave any joined session, then unregister
    let session_id = ctx.clients.read().await.session_of(client_id);
    if let Some(session_id) = session_id {
        let handle = ctx.sessions.lock().await.find(session_id);
        if let Some(handle) = handle {
            handle.leave(client_id).await;
        }
    }
    ctx.clients.write().await.remove_client(client_id);
}

/// Frames one line into a request: a held POST header is completed by its
/// body line, a GET dispatches immediately. Returns false when the client
/// should be disconnected.
async fn process_line(
    ctx: &ServerContext,
    client_id: u32,
    line: &str,
    pending_header: &mut Option<String>,
    outbound_tx: &mpsc::Sender<String>,
) -> bool {
    let response = if let Some(header) = pending_header.take() {
        protocol::handle_request(ctx, client_id, &header, Some(line)).await
    } else if line.starts_with("POST ") {
        *pending_header = Some(line.to_string());
        return true;
    } else {
        protocol::handle_request(ctx, client_id, line, None).await
    };

    // Responses share the broadcast queue; a client too slow to drain
    // its own responses gets the same treatment as any slow client
    outbound_tx.try_send(response).is_ok()
}

async fn write_line(writer: &mut BufWriter<OwnedWriteHalf>, line: &str) -> std::io::Result<()> {
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}
