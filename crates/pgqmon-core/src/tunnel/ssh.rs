//! libssh2-backed tunnel: a local listener whose connections are relayed
//! through `direct-tcpip` channels of one authenticated session.
//!
//! The session is switched to non-blocking mode once authenticated, so that
//! several relay threads can share it; each relay polls both directions.

use std::io::{self, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use base64::Engine;
use ssh2::{ErrorCode, HashType, Session};
use tracing::{debug, info, warn};

use super::{SshSettings, Tunnel, TunnelError, TunnelOpener, TunnelTarget, TunnelTimeouts};

/// libssh2's EAGAIN.
const LIBSSH2_ERROR_EAGAIN: i32 = -37;
const ACCEPT_POLL: Duration = Duration::from_millis(50);
const RELAY_IDLE: Duration = Duration::from_millis(5);
const CHANNEL_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const RELAY_BUFFER: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Open,
    Closed,
}

/// Opens [`SshTunnel`]s.
#[derive(Debug, Default, Clone, Copy)]
pub struct SshOpener;

impl TunnelOpener for SshOpener {
    fn open(
        &self,
        ssh: &SshSettings,
        target: &TunnelTarget,
        timeouts: TunnelTimeouts,
    ) -> Result<Arc<dyn Tunnel>, TunnelError> {
        Ok(Arc::new(SshTunnel::connect(ssh, target, timeouts)?))
    }
}

pub struct SshTunnel {
    local_port: u16,
    session: Session,
    closed: Arc<AtomicBool>,
    relays: Arc<AtomicUsize>,
    acceptor: Mutex<Option<JoinHandle<()>>>,
}

impl SshTunnel {
    /// Authenticates against the SSH host and starts listening on an
    /// ephemeral local port. Returns once the session is authenticated.
    pub fn connect(
        ssh: &SshSettings,
        target: &TunnelTarget,
        timeouts: TunnelTimeouts,
    ) -> Result<Self, TunnelError> {
        let session = open_session(ssh, timeouts)?;

        let listener =
            TcpListener::bind(("127.0.0.1", 0)).map_err(|e| TunnelError::Bind(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| TunnelError::Bind(e.to_string()))?
            .port();
        listener
            .set_nonblocking(true)
            .map_err(|e| TunnelError::Bind(e.to_string()))?;

        session.set_blocking(false);

        let closed = Arc::new(AtomicBool::new(false));
        let relays = Arc::new(AtomicUsize::new(0));
        let acceptor = {
            let ctx = RelayContext {
                session: session.clone(),
                target: target.clone(),
                closed: closed.clone(),
                relays: relays.clone(),
            };
            let keepalive = timeouts.keepalive;
            thread::Builder::new()
                .name(format!("ssh-tunnel-{local_port}"))
                .spawn(move || accept_loop(listener, ctx, keepalive))
                .map_err(|e| TunnelError::Bind(e.to_string()))?
        };

        info!(
            local_port,
            ssh_host = %ssh.host,
            target_host = %target.host,
            target_port = target.port,
            "ssh tunnel listening"
        );

        Ok(Self {
            local_port,
            session,
            closed,
            relays,
            acceptor: Mutex::new(Some(acceptor)),
        })
    }

    pub fn state(&self) -> TunnelState {
        if self.closed.load(Ordering::Acquire) {
            TunnelState::Closed
        } else {
            TunnelState::Open
        }
    }

    /// Number of local connections currently being relayed.
    pub fn active_relays(&self) -> usize {
        self.relays.load(Ordering::Relaxed)
    }
}

impl Tunnel for SshTunnel {
    fn local_port(&self) -> u16 {
        self.local_port
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // Non-blocking session: the disconnect message is best effort.
        let _ = self.session.disconnect(None, "tunnel closed", None);
        let handle = self
            .acceptor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!(local_port = self.local_port, "tunnel acceptor thread panicked");
        }
        debug!(local_port = self.local_port, "ssh tunnel closed");
    }

    fn is_closed(&self) -> bool {
        self.state() == TunnelState::Closed
    }
}

impl Drop for SshTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

fn open_session(ssh: &SshSettings, timeouts: TunnelTimeouts) -> Result<Session, TunnelError> {
    let connect_err = |message: String| TunnelError::Connect {
        host: ssh.host.clone(),
        port: ssh.port,
        message,
    };

    let addr = (ssh.host.as_str(), ssh.port)
        .to_socket_addrs()
        .map_err(|e| connect_err(e.to_string()))?
        .next()
        .ok_or_else(|| connect_err("host did not resolve".to_string()))?;
    let tcp = TcpStream::connect_timeout(&addr, timeouts.handshake)
        .map_err(|e| connect_err(e.to_string()))?;

    let mut session = Session::new().map_err(|e| TunnelError::Ssh(e.to_string()))?;
    session.set_tcp_stream(tcp);
    session.set_timeout(timeouts.handshake.as_millis().min(u32::MAX as u128) as u32);
    session
        .handshake()
        .map_err(|e| TunnelError::Handshake(e.to_string()))?;

    verify_host_key(&session, ssh)?;

    let auth = if let Some(key) = ssh.private_key.as_deref() {
        session.userauth_pubkey_memory(&ssh.username, None, key, ssh.passphrase.as_deref())
    } else if let Some(password) = ssh.password.as_deref() {
        session.userauth_password(&ssh.username, password)
    } else {
        session.userauth_agent(&ssh.username)
    };
    if let Err(e) = auth {
        debug!(error = %e, user = %ssh.username, "ssh authentication rejected");
    }
    if !session.authenticated() {
        return Err(TunnelError::AuthFailed(ssh.username.clone()));
    }

    let keepalive_secs = timeouts.keepalive.as_secs().clamp(1, u32::MAX as u64) as u32;
    session.set_keepalive(true, keepalive_secs);
    session.set_timeout(0);
    Ok(session)
}

fn verify_host_key(session: &Session, ssh: &SshSettings) -> Result<(), TunnelError> {
    let Some(expected) = ssh.host_key_fingerprint.as_deref() else {
        return Ok(());
    };
    let expected = normalize_fingerprint(expected);
    let observed = session
        .host_key_hash(HashType::Sha256)
        .map(fingerprint_sha256)
        .unwrap_or_else(|| "unknown".to_string());
    if observed != expected {
        return Err(TunnelError::HostKeyMismatch { expected, observed });
    }
    Ok(())
}

fn fingerprint_sha256(hash: &[u8]) -> String {
    let encoded = base64::engine::general_purpose::STANDARD_NO_PAD.encode(hash);
    format!("SHA256:{encoded}")
}

/// Accepts `SHA256:abc=`, `sha256:abc` or bare `abc`.
fn normalize_fingerprint(value: &str) -> String {
    let trimmed = value.trim().trim_end_matches('=');
    let bare = match trimmed.get(..7) {
        Some(prefix) if prefix.eq_ignore_ascii_case("sha256:") => trimmed[7..].trim(),
        _ => trimmed,
    };
    format!("SHA256:{bare}")
}

struct RelayContext {
    session: Session,
    target: TunnelTarget,
    closed: Arc<AtomicBool>,
    relays: Arc<AtomicUsize>,
}

fn accept_loop(listener: TcpListener, ctx: RelayContext, keepalive: Duration) {
    let mut next_keepalive = Instant::now() + keepalive;

    while !ctx.closed.load(Ordering::Acquire) {
        match listener.accept() {
            Ok((stream, peer)) => {
                debug!(%peer, "tunnel connection accepted");
                spawn_relay(stream, &ctx);
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!(error = %e, "tunnel accept failed");
                thread::sleep(ACCEPT_POLL);
            }
        }

        if Instant::now() >= next_keepalive {
            match ctx.session.keepalive_send() {
                Ok(secs) => {
                    next_keepalive = Instant::now() + Duration::from_secs(u64::from(secs.max(1)));
                }
                Err(e) if is_eagain(&e) => {}
                Err(e) => {
                    warn!(error = %e, "ssh keepalive failed");
                    next_keepalive = Instant::now() + keepalive;
                }
            }
        }
    }
    debug!("tunnel listener stopped");
}

fn spawn_relay(stream: TcpStream, ctx: &RelayContext) {
    let session = ctx.session.clone();
    let target = ctx.target.clone();
    let closed = ctx.closed.clone();
    let relays = ctx.relays.clone();

    relays.fetch_add(1, Ordering::Relaxed);
    let spawned = thread::Builder::new()
        .name("ssh-relay".to_string())
        .spawn(move || {
            if let Err(e) = relay(&session, stream, &target, &closed) {
                // Only this connection is affected; the tunnel stays up.
                warn!(error = %e, target_host = %target.host, "tunnel relay failed");
            }
            relays.fetch_sub(1, Ordering::Relaxed);
        });
    if let Err(e) = spawned {
        ctx.relays.fetch_sub(1, Ordering::Relaxed);
        warn!(error = %e, "failed to spawn tunnel relay thread");
    }
}

/// Splices a local socket with a forwarded channel until either side closes.
fn relay(
    session: &Session,
    mut local: TcpStream,
    target: &TunnelTarget,
    closed: &AtomicBool,
) -> io::Result<()> {
    let deadline = Instant::now() + CHANNEL_OPEN_TIMEOUT;
    let mut channel = loop {
        match session.channel_direct_tcpip(&target.host, target.port, None) {
            Ok(channel) => break channel,
            Err(e) if is_eagain(&e) && Instant::now() < deadline => thread::sleep(RELAY_IDLE),
            Err(e) => {
                let _ = local.shutdown(Shutdown::Both);
                return Err(io::Error::other(format!("channel open failed: {e}")));
            }
        }
    };
    local.set_nonblocking(true)?;

    let mut buf = vec![0u8; RELAY_BUFFER];
    let result = loop {
        if closed.load(Ordering::Acquire) {
            break Ok(());
        }
        let mut progressed = false;

        match local.read(&mut buf) {
            Ok(0) => break Ok(()),
            Ok(n) => {
                if let Err(e) = write_fully(&mut channel, &buf[..n], closed) {
                    break Err(e);
                }
                progressed = true;
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => break Err(e),
        }

        match channel.read(&mut buf) {
            Ok(0) if channel.eof() => break Ok(()),
            Ok(0) => {}
            Ok(n) => {
                if let Err(e) = write_fully(&mut local, &buf[..n], closed) {
                    break Err(e);
                }
                progressed = true;
            }
            Err(e) if is_transient(&e) => {}
            Err(e) => break Err(e),
        }

        if !progressed {
            thread::sleep(RELAY_IDLE);
        }
    };

    let _ = channel.send_eof();
    let _ = channel.close();
    let _ = local.shutdown(Shutdown::Both);
    result
}

fn write_fully<W: Write>(w: &mut W, mut buf: &[u8], closed: &AtomicBool) -> io::Result<()> {
    while !buf.is_empty() {
        match w.write(buf) {
            Ok(0) => return Err(io::Error::from(ErrorKind::WriteZero)),
            Ok(n) => buf = &buf[n..],
            Err(e) if is_transient(&e) => {
                if closed.load(Ordering::Acquire) {
                    return Err(io::Error::other("tunnel closed"));
                }
                thread::sleep(RELAY_IDLE);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

fn is_transient(e: &io::Error) -> bool {
    matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

fn is_eagain(e: &ssh2::Error) -> bool {
    matches!(e.code(), ErrorCode::Session(code) if code == LIBSSH2_ERROR_EAGAIN)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeouts() -> TunnelTimeouts {
        TunnelTimeouts {
            handshake: Duration::from_millis(500),
            keepalive: Duration::from_secs(30),
        }
    }

    #[test]
    fn fingerprint_forms_are_equivalent() {
        assert_eq!(normalize_fingerprint("SHA256:abcDEF="), "SHA256:abcDEF");
        assert_eq!(normalize_fingerprint("sha256:abcDEF"), "SHA256:abcDEF");
        assert_eq!(normalize_fingerprint("  abcDEF  "), "SHA256:abcDEF");
    }

    #[test]
    fn fingerprint_encodes_without_padding() {
        assert_eq!(fingerprint_sha256(&[0xff, 0x00]), "SHA256:/wA");
    }

    #[test]
    fn connect_to_closed_port_is_a_connect_error() {
        // Grab a free port, then release it so nothing is listening there.
        let port = {
            let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
            listener.local_addr().unwrap().port()
        };
        let ssh = SshSettings {
            host: "127.0.0.1".into(),
            port,
            username: "deploy".into(),
            password: Some("pw".into()),
            ..SshSettings::default()
        };
        let target = TunnelTarget {
            host: "db".into(),
            port: 5432,
        };
        let err = SshTunnel::connect(&ssh, &target, timeouts()).err().unwrap();
        assert!(matches!(err, TunnelError::Connect { port: p, .. } if p == port));
    }

    #[test]
    fn non_ssh_peer_fails_handshake() {
        // A peer that accepts and immediately hangs up.
        let listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = thread::spawn(move || {
            if let Ok((stream, _)) = listener.accept() {
                drop(stream);
            }
        });
        let ssh = SshSettings {
            host: "127.0.0.1".into(),
            port,
            username: "deploy".into(),
            ..SshSettings::default()
        };
        let target = TunnelTarget {
            host: "db".into(),
            port: 5432,
        };
        let err = SshTunnel::connect(&ssh, &target, timeouts()).err().unwrap();
        assert!(matches!(err, TunnelError::Handshake(_)));
        server.join().unwrap();
    }

    #[test]
    fn write_fully_writes_everything() {
        let mut out = Vec::new();
        let closed = AtomicBool::new(false);
        write_fully(&mut out, b"select 1", &closed).unwrap();
        assert_eq!(out, b"select 1");
    }
}
