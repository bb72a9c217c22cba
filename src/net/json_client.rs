// JSON client handler
// Drives one voice client: handshake, then control and voice messages

use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::time;
use tracing::{debug, info, warn};

use super::connection::Connection;
use super::messages::{ClientMessage, HandshakeRequest, ServerMessage};
use crate::coordinator::Coordinator;
use crate::routing::UserId;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(15);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(150);

/// Random value in [0.9*t, 1.1*t] rounded to an integer, so clients told
/// to reconnect do not all come back at once.
fn fuzzy(t: f64) -> u32 {
    let r = rand::thread_rng().gen_range(0.9 * t..=1.1 * t);
    r.round() as u32
}

/// Usernames keep `[A-Za-z0-9_.-]`, everything else becomes `_`, and are
/// cut to 40 characters.
fn sanitize_user(user: &str) -> String {
    user.chars()
        .map(|c| if c.is_ascii_alphanumeric() || "_.-".contains(c) { c } else { '_' })
        .take(40)
        .collect()
}

/// State of a JSON client connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// Waiting for initial handshake
    AwaitingHandshake,
    /// Authenticated and ready to receive messages
    Authenticated,
    /// Connection closed
    Closed,
}

pub struct JsonClient {
    connection: Connection,
    state: ClientState,
    user_id: Option<UserId>,
    last_message_time: Instant,
    motd: String,
    coordinator: Arc<Coordinator>,
}

impl JsonClient {
    pub fn new(connection: Connection, motd: String, coordinator: Arc<Coordinator>) -> Self {
        JsonClient {
            connection,
            state: ClientState::AwaitingHandshake,
            user_id: None,
            last_message_time: Instant::now(),
            motd,
            coordinator,
        }
    }

    pub fn state(&self) -> ClientState {
        self.state
    }

    pub fn user_id(&self) -> Option<UserId> {
        self.user_id
    }

    /// Run the client handler loop
    ///
    /// This processes the handshake, then enters the message loop.
    /// Returns when the connection is closed or an error occurs.
    pub async fn run(&mut self) -> io::Result<()> {
        let (tx, mut rx) = tokio::sync::mpsc::channel(256);

        let handshake = match self.process_handshake().await? {
            Some(h) => h,
            None => return Ok(()),
        };
        let user_id = match self.user_id {
            Some(id) => id,
            None => return Ok(()),
        };
        self.coordinator.register_client(user_id, tx).await;
        self.apply_profile(user_id, handshake).await;

        let mut heartbeat = time::interval_at(time::Instant::now() + HEARTBEAT_INTERVAL, HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(time::MissedTickBehavior::Skip);

        let result = loop {
            if self.last_message_time.elapsed() > READ_TIMEOUT {
                info!(user_id, "No recent messages seen, closing connection");
                break Ok(());
            }

            tokio::select! {
                result = self.connection.read_line() => {
                    match result {
                        Ok(line) => {
                            self.last_message_time = Instant::now();
                            if line.trim().is_empty() {
                                continue;
                            }
                            self.handle_message(user_id, &line).await;
                        }
                        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                            debug!(user_id, "Client EOF");
                            break Ok(());
                        }
                        Err(e) => {
                            warn!(user_id, "Read error: {}", e);
                            break Err(e);
                        }
                    }
                }
                Some(srv_msg) = rx.recv() => {
                    if let Err(e) = self.connection.write_json(&srv_msg).await {
                        break Err(e);
                    }
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self.send_heartbeat().await {
                        break Err(e);
                    }
                }
            }
        };

        self.state = ClientState::Closed;
        if let Some(session) = self.coordinator.get_user(user_id).await {
            info!("Disconnected: ({})", session.connection_info);
        }
        self.coordinator.unregister_client(user_id).await;
        self.coordinator.user_disconnect(user_id).await;

        result
    }

    /// Read and answer the handshake. Returns the request on success, None
    /// when the client was turned away.
    async fn process_handshake(&mut self) -> io::Result<Option<HandshakeRequest>> {
        let line = match time::timeout(HANDSHAKE_TIMEOUT, self.connection.read_line()).await {
            Ok(Ok(l)) => l,
            Ok(Err(e)) => return Err(e),
            Err(_) => {
                warn!(peer = %self.connection.peer_addr(), "Handshake failed: timeout");
                return Ok(None);
            }
        };

        let mut handshake: HandshakeRequest = match serde_json::from_str(&line) {
            Ok(h) => h,
            Err(e) => {
                warn!(peer = %self.connection.peer_addr(), "Handshake failed: {}", e);
                self.send_handshake_error("Invalid handshake format").await?;
                return Ok(None);
            }
        };

        let user = sanitize_user(&handshake.user);
        if user.is_empty() {
            self.send_handshake_error("Missing user name").await?;
            return Ok(None);
        }
        handshake.user = user.clone();

        let connection_info = format!(
            "{} {} {}",
            user,
            handshake.client_version.as_deref().unwrap_or("unknown"),
            self.connection.peer_addr()
        );

        let user_id = match self.coordinator.new_user(user, connection_info.clone()).await {
            Ok(id) => id,
            Err(e) => {
                self.send_handshake_error(&e).await?;
                return Ok(None);
            }
        };

        self.user_id = Some(user_id);
        self.connection.set_user_id(user_id);
        info!("Handshake successful ({})", connection_info);

        let response = ServerMessage::Handshake {
            motd: self.motd.clone(),
            session: user_id,
            reconnect_in: Some(fuzzy(10.0)),
            heartbeat: true,
        };
        self.connection.write_json(&response).await?;

        self.state = ClientState::Authenticated;
        self.last_message_time = Instant::now();
        Ok(Some(handshake))
    }

    /// Locator and preferred band from the handshake profile. A missing
    /// locator gets the reminder.
    async fn apply_profile(&mut self, user_id: UserId, handshake: HandshakeRequest) {
        let grid = handshake.grid.unwrap_or_default();
        // An invalid locator has already been reported to the user
        let _ = self.coordinator.set_grid_locator(user_id, &grid).await;
        if let Some(band) = handshake.preferred_band {
            self.coordinator.set_preferred_band(user_id, band).await;
        }
    }

    async fn send_handshake_error(&mut self, error: &str) -> io::Result<()> {
        let msg = serde_json::json!({
            "deny": [error],
            "reconnect_in": fuzzy(900.0)
        });
        self.connection.write_json(&msg).await
    }

    async fn handle_message(&mut self, user_id: UserId, line: &str) {
        let msg: ClientMessage = match serde_json::from_str(line) {
            Ok(m) => m,
            Err(e) => {
                warn!(user_id, "Failed to parse message: {}", e);
                return;
            }
        };

        match msg {
            ClientMessage::Heartbeat {} => {}
            ClientMessage::SetGrid { grid } => {
                let _ = self.coordinator.set_grid_locator(user_id, &grid).await;
            }
            ClientMessage::SetBand { band } => {
                self.coordinator.set_preferred_band(user_id, band).await;
            }
            ClientMessage::SetVolume { speaker, factor } => {
                self.coordinator.set_volume(user_id, speaker, factor);
            }
            ClientMessage::Voice { seq, samples } => {
                self.coordinator.handle_voice(user_id, seq, samples).await;
            }
        }
    }

    async fn send_heartbeat(&mut self) -> io::Result<()> {
        let server_time = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();
        self.connection
            .write_json(&ServerMessage::Heartbeat { server_time })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_state() {
        assert_ne!(ClientState::AwaitingHandshake, ClientState::Authenticated);
    }

    #[test]
    fn test_sanitize_user() {
        assert_eq!(sanitize_user("W1AW/p"), "W1AW_p");
        assert_eq!(sanitize_user(&"x".repeat(60)).len(), 40);
        assert_eq!(sanitize_user("g4-abc.1"), "g4-abc.1");
    }

    #[test]
    fn test_fuzzy_range() {
        for _ in 0..100 {
            let v = fuzzy(900.0);
            assert!((810..=990).contains(&v));
        }
    }
}
