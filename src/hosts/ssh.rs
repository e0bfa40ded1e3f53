//! SSH transport for remote Docker daemons
//!
//! A tunnel owns one authenticated SSH session plus a loopback TCP listener.
//! Each connection accepted locally is forwarded over a
//! `direct-streamlocal` channel to the remote daemon socket, so bollard can
//! speak plain HTTP against `tcp://127.0.0.1:<port>`.

use std::sync::Arc;
use std::time::Duration;

use russh::client::{self, Handle};
use russh::Disconnect;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use totp_rs::{Algorithm, Secret, TOTP};
use tracing::{debug, info, warn};

use crate::error::{ErrorKind, PilotError, Result};

use super::record::{HostRecord, SecretMaterial};

/// Daemon socket path on the remote host.
const REMOTE_DOCKER_SOCKET: &str = "/var/run/docker.sock";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

struct AcceptingHost;

#[async_trait::async_trait]
impl client::Handler for AcceptingHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh_keys::key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        Ok(true)
    }
}

/// Live SSH session with a loopback forwarder for the remote daemon socket.
pub(crate) struct SshTunnel {
    handle: Arc<Handle<AcceptingHost>>,
    accept_task: JoinHandle<()>,
    local_port: u16,
}

impl SshTunnel {
    pub async fn connect(record: &HostRecord, material: &SecretMaterial) -> Result<Self> {
        if !material.matches(record.auth_kind) {
            return Err(PilotError::new(
                ErrorKind::AuthRejected,
                "secret material does not match the host's auth kind",
            ));
        }

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        let address = (record.hostname.as_str(), record.port);
        let mut handle =
            tokio::time::timeout(CONNECT_TIMEOUT, client::connect(config, address, AcceptingHost))
                .await
                .map_err(|_| {
                    PilotError::new(
                        ErrorKind::Unreachable,
                        format!("{}:{} did not answer", record.hostname, record.port),
                    )
                })?
                .map_err(|e| {
                    PilotError::new(
                        ErrorKind::Unreachable,
                        format!("{}:{}: {}", record.hostname, record.port, e),
                    )
                })?;

        authenticate(&mut handle, record, material).await?;
        info!(host = %record.id, "ssh session established");

        let handle = Arc::new(handle);
        let (accept_task, local_port) = spawn_forwarder(Arc::clone(&handle)).await?;

        Ok(Self {
            handle,
            accept_task,
            local_port,
        })
    }

    /// Endpoint bollard should dial.
    pub fn docker_endpoint(&self) -> String {
        format!("tcp://127.0.0.1:{}", self.local_port)
    }

    pub async fn close(self) {
        self.accept_task.abort();
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await;
    }
}

async fn authenticate(
    handle: &mut Handle<AcceptingHost>,
    record: &HostRecord,
    material: &SecretMaterial,
) -> Result<()> {
    let user = record.username.clone();

    match material {
        SecretMaterial::Password { password } => {
            let ok = handle
                .authenticate_password(user, password)
                .await
                .map_err(auth_transport_error)?;
            if ok {
                return Ok(());
            }
            // The server may be withholding success pending a verification
            // code over keyboard-interactive.
            match keyboard_probe(handle, &record.username, Some(password)).await? {
                KbProbe::Authenticated => Ok(()),
                KbProbe::TotpNeeded => Err(totp_required(record)),
                KbProbe::Rejected => Err(PilotError::new(
                    ErrorKind::AuthRejected,
                    format!("password rejected for {}@{}", record.username, record.hostname),
                )),
            }
        }

        SecretMaterial::Key {
            private_key_pem,
            passphrase,
        } => {
            let key = russh_keys::decode_secret_key(private_key_pem, passphrase.as_deref())
                .map_err(|e| {
                    PilotError::new(ErrorKind::AuthRejected, format!("cannot read key: {}", e))
                })?;
            let ok = handle
                .authenticate_publickey(user, Arc::new(key))
                .await
                .map_err(auth_transport_error)?;
            if ok {
                return Ok(());
            }
            match keyboard_probe(handle, &record.username, None).await? {
                KbProbe::Authenticated => Ok(()),
                KbProbe::TotpNeeded => Err(totp_required(record)),
                KbProbe::Rejected => Err(PilotError::new(
                    ErrorKind::AuthRejected,
                    format!("key rejected for {}@{}", record.username, record.hostname),
                )),
            }
        }

        SecretMaterial::PasswordTotp {
            password,
            totp_seed,
        } => authenticate_password_totp(handle, record, password, totp_seed).await,
    }
}

fn totp_required(record: &HostRecord) -> PilotError {
    PilotError::new(
        ErrorKind::TotpRequired,
        format!(
            "{}@{} requires a verification code; store password+totp material",
            record.username, record.hostname
        ),
    )
}

enum KbProbe {
    Authenticated,
    TotpNeeded,
    Rejected,
}

/// Walk the server's keyboard-interactive flow to learn what it wants:
/// prompts are answered with the password when one is available, and a
/// verification-code prompt means the stored material is missing a TOTP
/// seed.
async fn keyboard_probe(
    handle: &mut Handle<AcceptingHost>,
    user: &str,
    password: Option<&str>,
) -> Result<KbProbe> {
    use russh::client::KeyboardInteractiveAuthResponse as Kb;

    let mut response = handle
        .authenticate_keyboard_interactive_start(user.to_string(), None)
        .await
        .map_err(auth_transport_error)?;

    loop {
        match response {
            Kb::Success => return Ok(KbProbe::Authenticated),
            Kb::Failure => return Ok(KbProbe::Rejected),
            Kb::InfoRequest { prompts, .. } => {
                if prompts.iter().any(|p| is_totp_prompt(&p.prompt)) {
                    return Ok(KbProbe::TotpNeeded);
                }
                let answers: Vec<String> = prompts
                    .iter()
                    .map(|_| password.unwrap_or("").to_string())
                    .collect();
                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(auth_transport_error)?;
            }
        }
    }
}

/// Password + TOTP over keyboard-interactive: answer password prompts with
/// the password and verification-code prompts with a freshly generated code.
/// The code is consumed once per connection.
async fn authenticate_password_totp(
    handle: &mut Handle<AcceptingHost>,
    record: &HostRecord,
    password: &str,
    totp_seed: &str,
) -> Result<()> {
    use russh::client::KeyboardInteractiveAuthResponse as Kb;

    let code = generate_totp(totp_seed)?;
    let mut code_sent = false;

    let mut response = handle
        .authenticate_keyboard_interactive_start(record.username.clone(), None)
        .await
        .map_err(auth_transport_error)?;

    loop {
        match response {
            Kb::Success => return Ok(()),
            Kb::Failure => {
                let kind = if code_sent {
                    ErrorKind::TotpInvalid
                } else {
                    ErrorKind::AuthRejected
                };
                return Err(PilotError::new(
                    kind,
                    format!("authentication failed for {}@{}", record.username, record.hostname),
                ));
            }
            Kb::InfoRequest { prompts, .. } => {
                let answers: Vec<String> = prompts
                    .iter()
                    .map(|prompt| {
                        if is_totp_prompt(&prompt.prompt) {
                            code_sent = true;
                            code.clone()
                        } else {
                            password.to_string()
                        }
                    })
                    .collect();

                response = handle
                    .authenticate_keyboard_interactive_respond(answers)
                    .await
                    .map_err(auth_transport_error)?;
            }
        }
    }
}

fn is_totp_prompt(prompt: &str) -> bool {
    let p = prompt.to_ascii_lowercase();
    p.contains("code") || p.contains("token") || p.contains("otp") || p.contains("verification")
}

fn generate_totp(seed: &str) -> Result<String> {
    let secret = Secret::Encoded(seed.trim().to_string())
        .to_bytes()
        .map_err(|_| PilotError::new(ErrorKind::TotpInvalid, "TOTP seed is not valid base32"))?;

    // Seeds shorter than the RFC minimum are common in the wild.
    let totp = TOTP::new_unchecked(Algorithm::SHA1, 6, 1, 30, secret);
    totp.generate_current()
        .map_err(|e| PilotError::new(ErrorKind::TotpInvalid, e.to_string()))
}

fn auth_transport_error(e: russh::Error) -> PilotError {
    PilotError::new(ErrorKind::Unreachable, e.to_string())
}

/// Bind a loopback listener and forward each accepted connection over a
/// fresh `direct-streamlocal` channel to the remote daemon socket.
async fn spawn_forwarder(session: Arc<Handle<AcceptingHost>>) -> Result<(JoinHandle<()>, u16)> {
    let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
    let local_port = listener.local_addr()?.port();

    let task = tokio::spawn(async move {
        loop {
            let (mut tcp, peer) = match listener.accept().await {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("tunnel listener closed: {}", e);
                    break;
                }
            };
            debug!(%peer, "forwarding connection to remote docker socket");

            let channel = match session
                .channel_open_direct_streamlocal(REMOTE_DOCKER_SOCKET)
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("could not open forward channel: {}", e);
                    continue;
                }
            };

            tokio::spawn(async move {
                let mut stream = channel.into_stream();
                if let Err(e) = tokio::io::copy_bidirectional(&mut tcp, &mut stream).await {
                    debug!("forward stream ended: {}", e);
                }
            });
        }
    });

    Ok((task, local_port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn totp_prompts_are_recognized() {
        assert!(is_totp_prompt("Verification code: "));
        assert!(is_totp_prompt("One-time token"));
        assert!(is_totp_prompt("OTP: "));
        assert!(!is_totp_prompt("Password: "));
    }

    #[test]
    fn totp_rejects_bad_seed() {
        let err = generate_totp("not base32 !!!").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::TotpInvalid);
    }

    #[test]
    fn totp_generates_from_valid_seed() {
        let code = generate_totp("JBSWY3DPEHPK3PXP").unwrap();
        assert_eq!(code.len(), 6);
        assert!(code.chars().all(|c| c.is_ascii_digit()));
    }
}
