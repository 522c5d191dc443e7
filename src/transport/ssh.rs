//! Interactive SSH shell as a [`Link`].
//!
//! The SSH session is established and authenticated by russh; a background
//! task bridges the shell channel to two mpsc queues so that reads stay
//! cancel safe.

use std::borrow::Cow;
use std::time::Duration;

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use async_trait::async_trait;
use log::debug;
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, Receiver, Sender};

use super::{Credentials, Link};
use crate::config;
use crate::error::ProtocolError;

/// Algorithm policy for the SSH handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub enum SecurityLevel {
    /// Modern algorithms only (default).
    Secure,
    /// Adds SHA-1 key exchange, CBC ciphers and DSA keys for old element
    /// managers.
    LegacyCompatible,
}

/// SSH connection settings.
#[derive(Debug, Clone)]
pub struct SshOptions {
    pub level: SecurityLevel,
    pub server_check: ServerCheckMethod,
    pub inactivity_timeout: Duration,
}

impl Default for SshOptions {
    fn default() -> Self {
        Self::secure()
    }
}

impl SshOptions {
    pub fn secure() -> Self {
        Self {
            level: SecurityLevel::Secure,
            server_check: ServerCheckMethod::DefaultKnownHostsFile,
            inactivity_timeout: Duration::from_secs(60),
        }
    }

    pub fn legacy_compatible() -> Self {
        Self {
            level: SecurityLevel::LegacyCompatible,
            server_check: ServerCheckMethod::NoCheck,
            inactivity_timeout: Duration::from_secs(60),
        }
    }

    pub(crate) fn preferred(&self) -> Preferred {
        match self.level {
            SecurityLevel::Secure => Preferred {
                kex: Cow::Borrowed(config::SECURE_KEX_ORDER),
                key: Cow::Borrowed(config::SECURE_KEY_TYPES),
                cipher: Cow::Borrowed(config::SECURE_CIPHERS),
                mac: Cow::Borrowed(config::SECURE_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::COMPRESSION_ALGORITHMS),
            },
            SecurityLevel::LegacyCompatible => Preferred {
                kex: Cow::Borrowed(config::LEGACY_KEX_ORDER),
                key: Cow::Borrowed(config::LEGACY_KEY_TYPES),
                cipher: Cow::Borrowed(config::LEGACY_CIPHERS),
                mac: Cow::Borrowed(config::LEGACY_MAC_ALGORITHMS),
                compression: Cow::Borrowed(config::COMPRESSION_ALGORITHMS),
            },
        }
    }
}

/// Shell channel on an SSH connection.
pub struct SshLink {
    host: String,
    port: u16,
    options: SshOptions,
    client: Option<Client>,
    to_shell: Option<Sender<Vec<u8>>>,
    from_shell: Option<Receiver<Vec<u8>>>,
}

impl SshLink {
    pub fn new(host: impl Into<String>, port: u16, options: SshOptions) -> Self {
        Self {
            host: host.into(),
            port,
            options,
            client: None,
            to_shell: None,
            from_shell: None,
        }
    }

    fn not_connected(&self) -> ProtocolError {
        ProtocolError::Network(format!("no SSH shell open to {}:{}", self.host, self.port))
    }
}

#[async_trait]
impl Link for SshLink {
    fn target(&self) -> String {
        self.host.clone()
    }

    async fn open(&mut self, credentials: &Credentials) -> Result<(), ProtocolError> {
        let device_addr = format!("{}@{}:{}", credentials.username, self.host, self.port);
        let config = Config {
            preferred: self.options.preferred(),
            inactivity_timeout: Some(self.options.inactivity_timeout),
            ..Default::default()
        };
        let password = credentials.password.clone().unwrap_or_default();
        let client = Client::connect_with_config(
            (self.host.clone(), self.port),
            &credentials.username,
            AuthMethod::with_password(&password),
            self.options.server_check.clone(),
            config,
        )
        .await?;
        debug!("{device_addr} TCP connection successful");

        let mut channel = client.get_channel().await?;
        channel
            .request_pty(false, "xterm", 800, 600, 0, 0, &[])
            .await?;
        channel.request_shell(false).await?;
        debug!("{device_addr} Shell request successful");

        let (to_shell, mut from_user) = mpsc::channel::<Vec<u8>>(256);
        let (to_user, from_shell) = mpsc::channel::<Vec<u8>>(256);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(data) = from_user.recv() => {
                        if let Err(e) = channel.data(data.as_slice()).await {
                            debug!("{device_addr} Failed to send data to shell: {e:?}");
                            break;
                        }
                    },
                    Some(msg) = channel.wait() => {
                        match msg {
                            ChannelMsg::Data { ref data } => {
                                if to_user.send(data.to_vec()).await.is_err() {
                                    debug!("{device_addr} Shell output receiver dropped. Closing task.");
                                    break;
                                }
                            }
                            ChannelMsg::ExitStatus { exit_status } => {
                                debug!("{device_addr} Shell exited with status code: {exit_status}");
                                let _ = channel.eof().await;
                                break;
                            }
                            ChannelMsg::Eof => {
                                debug!("{device_addr} Shell sent EOF.");
                                break;
                            }
                            _ => {}
                        }
                    },
                    else => break,
                }
            }
            debug!("{device_addr} SSH I/O task ended.");
        });

        self.client = Some(client);
        self.to_shell = Some(to_shell);
        self.from_shell = Some(from_shell);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), ProtocolError> {
        self.to_shell.take();
        if let Some(mut receiver) = self.from_shell.take() {
            receiver.close();
        }
        if let Some(client) = self.client.take() {
            client.disconnect().await?;
        }
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<(), ProtocolError> {
        let sender = self.to_shell.as_ref().ok_or_else(|| self.not_connected())?;
        sender
            .send(data.to_vec())
            .await
            .map_err(|_| ProtocolError::Network(format!("SSH shell to {} is closed", self.host)))
    }

    async fn read_chunk(&mut self) -> Result<Option<Vec<u8>>, ProtocolError> {
        let not_connected = self.not_connected();
        let receiver = self.from_shell.as_mut().ok_or(not_connected)?;
        Ok(receiver.recv().await)
    }

    fn is_open(&self) -> bool {
        self.client.as_ref().is_some_and(|client| !client.is_closed())
    }
}
