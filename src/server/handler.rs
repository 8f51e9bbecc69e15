// ABOUTME: russh server handler for one client connection.
// ABOUTME: Applies the auth policy, opens shell channels and routes their requests.

use super::auth::AuthPolicy;
use super::channel::{Reply, ShellChannel, ShellSettings};
use super::request::{check_channel_type, encode_pty_req, encode_string, encode_window_change};
use crate::pty::{PtySystem, TermSize};
use crate::ssh::channel::{self as pump, PIPE_CAPACITY};
use russh::keys::ssh_key::PublicKey;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, ChannelId};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::DuplexStream;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

/// State shared by every connection of a server.
pub(crate) struct Shared {
    pub auth: AuthPolicy,
    pub settings: ShellSettings,
    pub pty: Arc<dyn PtySystem>,
    pub channels: Arc<Semaphore>,
    pub shutdown: CancellationToken,
}

pub(crate) struct ConnectionHandler {
    shared: Arc<Shared>,
    peer: Option<SocketAddr>,
    shells: HashMap<ChannelId, ShellChannel>,
}

impl ConnectionHandler {
    pub fn new(shared: Arc<Shared>, peer: Option<SocketAddr>) -> Self {
        Self {
            shared,
            peer,
            shells: HashMap::new(),
        }
    }

    fn peer(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn reject_channel(&self, kind: &str) -> bool {
        if let Err(e) = check_channel_type(kind) {
            tracing::warn!(peer = %self.peer(), "Rejecting channel: {}", e);
        }
        false
    }

    fn route(&self, channel: ChannelId, kind: &str, payload: &[u8], session: &mut Session) {
        let reply = match self.shells.get(&channel) {
            Some(shell) => shell.handle_request(kind, true, payload),
            None => {
                tracing::debug!(?channel, "{} request for unknown channel", kind);
                Reply::Failure
            }
        };
        match reply {
            Reply::Success => {
                let _ = session.channel_success(channel);
            }
            Reply::Failure => {
                let _ = session.channel_failure(channel);
            }
            Reply::None => {}
        }
    }

    fn reject_auth() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
            partial_success: false,
        }
    }
}

impl Handler for ConnectionHandler {
    type Error = russh::Error;

    async fn auth_publickey(&mut self, user: &str, key: &PublicKey) -> Result<Auth, Self::Error> {
        if self.shared.auth.check_public_key(user, key).await {
            tracing::info!(peer = %self.peer(), user, "Public key accepted");
            Ok(Auth::Accept)
        } else {
            tracing::debug!(peer = %self.peer(), user, "Public key rejected");
            Ok(Self::reject_auth())
        }
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.shared.auth.check_password(password) {
            tracing::info!(peer = %self.peer(), user, "Password accepted");
            Ok(Auth::Accept)
        } else {
            tracing::debug!(peer = %self.peer(), user, "Password rejected");
            Ok(Self::reject_auth())
        }
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let id = channel.id();
        let label = format!("{}/{}", self.peer(), id);

        let Ok(permit) = self.shared.channels.clone().try_acquire_owned() else {
            tracing::warn!(channel = %label, "Channel limit reached, rejecting session");
            return Ok(false);
        };

        let process = match ShellChannel::spawn_shell(self.shared.pty.as_ref(), &self.shared.settings)
        {
            Ok(process) => process,
            Err(e) => {
                tracing::error!(channel = %label, "Could not start shell: {}", e);
                return Ok(false);
            }
        };

        // The pump reads what the shell writes and writes what the client sends.
        let (to_client, pump_input) = tokio::io::duplex(PIPE_CAPACITY);
        let (pump_output, from_client) = tokio::io::duplex(PIPE_CAPACITY);
        let pump = pump::spawn(channel, pump_input, pump_output, None::<DuplexStream>);

        let shell = ShellChannel::start(
            label.clone(),
            process,
            self.shared.settings.hangup_grace,
            self.shared.shutdown.child_token(),
            from_client,
            to_client,
            move || pump.shutdown(),
            permit,
        );
        tracing::info!(channel = %label, "Shell session opened");
        self.shells.insert(id, shell);
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("direct-tcpip"))
    }

    async fn channel_open_forwarded_tcpip(
        &mut self,
        _channel: Channel<Msg>,
        _host_to_connect: &str,
        _port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("forwarded-tcpip"))
    }

    async fn channel_open_x11(
        &mut self,
        _channel: Channel<Msg>,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(self.reject_channel("x11"))
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload = encode_pty_req(
            term,
            TermSize::new(col_width, row_height),
            (pix_width, pix_height),
        );
        self.route(channel, "pty-req", &payload, session);
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        pix_width: u32,
        pix_height: u32,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let payload =
            encode_window_change(TermSize::new(col_width, row_height), (pix_width, pix_height));
        self.route(channel, "window-change", &payload, session);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, "shell", &[], session);
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, "exec", &encode_string(data), session);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        self.route(channel, "subsystem", &encode_string(name.as_bytes()), session);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> Result<(), Self::Error> {
        let mut payload = encode_string(variable_name.as_bytes());
        payload.extend(encode_string(variable_value.as_bytes()));
        self.route(channel, "env", &payload, session);
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> Result<(), Self::Error> {
        if let Some(shell) = self.shells.remove(&channel) {
            tracing::debug!(?channel, "Client closed channel");
            // Teardown waits for the shell; keep the connection loop responsive.
            tokio::spawn(async move {
                shell.close().await;
            });
        }
        Ok(())
    }
}
