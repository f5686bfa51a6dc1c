//! SSH port forwarding for instances that are only reachable through a bastion.
//!
//! ## Ownership
//!
//! ```text
//!   ConnectionFactory ──acquire(instance)──▶ TunnelManager ──open──▶ TunnelOpener
//!          │                                     │                     (SshOpener)
//!          ▼                                     ▼
//!     TunnelLease  ──drop──▶ refcount - 1 ──0──▶ Tunnel::close()
//! ```
//!
//! One tunnel exists per instance id. Concurrent consumers of the same
//! instance share it; each holds a [`TunnelLease`]. The tunnel is closed when
//! the last lease is dropped.

mod ssh;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

pub use ssh::{SshOpener, SshTunnel};

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("failed to bind local port: {0}")]
    Bind(String),
    #[error("failed to reach ssh host {host}:{port}: {message}")]
    Connect {
        host: String,
        port: u16,
        message: String,
    },
    #[error("ssh handshake failed: {0}")]
    Handshake(String),
    #[error("ssh authentication failed for user {0}")]
    AuthFailed(String),
    #[error("ssh host key mismatch (expected {expected}, got {observed})")]
    HostKeyMismatch { expected: String, observed: String },
    #[error("ssh error: {0}")]
    Ssh(String),
}

/// SSH bastion settings of an instance.
#[derive(Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct SshSettings {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    /// PEM-encoded private key contents.
    #[serde(default)]
    pub private_key: Option<String>,
    #[serde(default)]
    pub passphrase: Option<String>,
    /// Pinned `SHA256:<base64>` host key fingerprint.
    #[serde(default)]
    pub host_key_fingerprint: Option<String>,
}

fn default_ssh_port() -> u16 {
    22
}

impl std::fmt::Debug for SshSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshSettings")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .field("private_key", &self.private_key.as_ref().map(|_| "***"))
            .field("host_key_fingerprint", &self.host_key_fingerprint)
            .finish()
    }
}

/// Where forwarded connections go, as seen from the SSH host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelTarget {
    pub host: String,
    pub port: u16,
}

/// Timeouts applied while establishing and keeping a tunnel.
#[derive(Debug, Clone, Copy)]
pub struct TunnelTimeouts {
    pub handshake: Duration,
    pub keepalive: Duration,
}

/// An established port forward.
pub trait Tunnel: Send + Sync {
    /// Port of the local listener on 127.0.0.1.
    fn local_port(&self) -> u16;

    /// Tears the tunnel down. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Opens tunnels. Implemented by [`SshOpener`]; replaced by fakes in tests.
pub trait TunnelOpener: Send + Sync {
    fn open(
        &self,
        ssh: &SshSettings,
        target: &TunnelTarget,
        timeouts: TunnelTimeouts,
    ) -> Result<Arc<dyn Tunnel>, TunnelError>;
}

struct TunnelSlot {
    tunnel: Arc<dyn Tunnel>,
    refs: usize,
}

type Slots = Arc<Mutex<HashMap<i64, TunnelSlot>>>;

fn lock_slots(slots: &Slots) -> MutexGuard<'_, HashMap<i64, TunnelSlot>> {
    slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Reference-counted registry of tunnels keyed by instance id.
pub struct TunnelManager {
    opener: Arc<dyn TunnelOpener>,
    timeouts: TunnelTimeouts,
    slots: Slots,
    /// Per-instance locks held while a tunnel is being opened.
    opening: Mutex<HashMap<i64, Arc<Mutex<()>>>>,
}

impl TunnelManager {
    pub fn new(opener: Arc<dyn TunnelOpener>, timeouts: TunnelTimeouts) -> Self {
        Self {
            opener,
            timeouts,
            slots: Arc::new(Mutex::new(HashMap::new())),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a lease on the instance's tunnel, opening it if needed.
    ///
    /// Opens are serialized per instance, so callers racing for the same
    /// instance share one tunnel. The registry itself is not locked during
    /// the SSH handshake; other instances proceed meanwhile.
    pub fn acquire(
        &self,
        instance_id: i64,
        ssh: &SshSettings,
        target: &TunnelTarget,
    ) -> Result<TunnelLease, TunnelError> {
        if let Some(lease) = self.reuse(instance_id) {
            return Ok(lease);
        }

        let gate = self.open_gate(instance_id);
        let result = {
            let _opening = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match self.reuse(instance_id) {
                Some(lease) => Ok(lease),
                None => self.open(instance_id, ssh, target),
            }
        };
        self.release_gate(instance_id, gate);
        result
    }

    /// Takes a lease on a live registered tunnel. A closed one is dropped
    /// from the registry.
    fn reuse(&self, instance_id: i64) -> Option<TunnelLease> {
        let mut slots = lock_slots(&self.slots);
        let slot = slots.get_mut(&instance_id)?;
        if slot.tunnel.is_closed() {
            warn!(instance_id, "cached ssh tunnel was closed, reopening");
            slots.remove(&instance_id);
            return None;
        }
        slot.refs += 1;
        debug!(instance_id, refs = slot.refs, "reusing ssh tunnel");
        Some(TunnelLease {
            instance_id,
            tunnel: slot.tunnel.clone(),
            slots: self.slots.clone(),
        })
    }

    fn open(
        &self,
        instance_id: i64,
        ssh: &SshSettings,
        target: &TunnelTarget,
    ) -> Result<TunnelLease, TunnelError> {
        let tunnel = self.opener.open(ssh, target, self.timeouts)?;
        info!(
            instance_id,
            local_port = tunnel.local_port(),
            ssh_host = %ssh.host,
            "ssh tunnel opened"
        );
        lock_slots(&self.slots).insert(
            instance_id,
            TunnelSlot {
                tunnel: tunnel.clone(),
                refs: 1,
            },
        );
        Ok(TunnelLease {
            instance_id,
            tunnel,
            slots: self.slots.clone(),
        })
    }

    fn lock_opening(&self) -> MutexGuard<'_, HashMap<i64, Arc<Mutex<()>>>> {
        self.opening
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn open_gate(&self, instance_id: i64) -> Arc<Mutex<()>> {
        self.lock_opening().entry(instance_id).or_default().clone()
    }

    /// Forgets the instance's gate once no other caller holds it.
    fn release_gate(&self, instance_id: i64, gate: Arc<Mutex<()>>) {
        let mut opening = self.lock_opening();
        // The map and `gate` account for two references.
        if Arc::strong_count(&gate) <= 2 {
            opening.remove(&instance_id);
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_opens(&self) -> usize {
        self.lock_opening().len()
    }

    /// Number of live leases on an instance's tunnel.
    pub fn ref_count(&self, instance_id: i64) -> usize {
        lock_slots(&self.slots)
            .get(&instance_id)
            .map(|s| s.refs)
            .unwrap_or(0)
    }

    pub fn open_tunnels(&self) -> usize {
        lock_slots(&self.slots).len()
    }

    /// Closes every tunnel regardless of outstanding leases. Used at shutdown.
    pub fn close_all(&self) {
        let drained: Vec<(i64, TunnelSlot)> = lock_slots(&self.slots).drain().collect();
        for (instance_id, slot) in drained {
            slot.tunnel.close();
            info!(instance_id, refs = slot.refs, "ssh tunnel closed at shutdown");
        }
    }
}

/// A counted reference to a shared tunnel. Dropping it releases the reference.
pub struct TunnelLease {
    instance_id: i64,
    tunnel: Arc<dyn Tunnel>,
    slots: Slots,
}

impl TunnelLease {
    pub fn local_port(&self) -> u16 {
        self.tunnel.local_port()
    }

    pub fn instance_id(&self) -> i64 {
        self.instance_id
    }
}

impl Drop for TunnelLease {
    fn drop(&mut self) {
        let mut slots = lock_slots(&self.slots);
        let Some(slot) = slots.get_mut(&self.instance_id) else {
            // Already torn down by close_all or replaced after a failure.
            self.tunnel.close();
            return;
        };
        if !Arc::ptr_eq(&slot.tunnel, &self.tunnel) {
            self.tunnel.close();
            return;
        }
        slot.refs = slot.refs.saturating_sub(1);
        if slot.refs == 0 {
            slots.remove(&self.instance_id);
            drop(slots);
            self.tunnel.close();
            info!(instance_id = self.instance_id, "ssh tunnel released and closed");
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};

    use super::*;

    pub(crate) struct FakeTunnel {
        port: u16,
        closed: AtomicBool,
        pub(crate) close_calls: AtomicUsize,
    }

    impl Tunnel for FakeTunnel {
        fn local_port(&self) -> u16 {
            self.port
        }

        fn close(&self) {
            self.close_calls.fetch_add(1, Ordering::SeqCst);
            self.closed.store(true, Ordering::SeqCst);
        }

        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    /// Hands out fake tunnels on increasing ports, or fails when told to.
    #[derive(Default)]
    pub(crate) struct FakeOpener {
        pub(crate) opened: Mutex<Vec<Arc<FakeTunnel>>>,
        pub(crate) fail_auth: AtomicBool,
        /// ssh host → time an open against it takes.
        pub(crate) delays: Mutex<HashMap<String, Duration>>,
        next_port: AtomicU16,
    }

    impl FakeOpener {
        pub(crate) fn last(&self) -> Arc<FakeTunnel> {
            self.opened.lock().unwrap().last().cloned().unwrap()
        }

        pub(crate) fn open_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    impl TunnelOpener for FakeOpener {
        fn open(
            &self,
            ssh: &SshSettings,
            _target: &TunnelTarget,
            _timeouts: TunnelTimeouts,
        ) -> Result<Arc<dyn Tunnel>, TunnelError> {
            let delay = self.delays.lock().unwrap().get(&ssh.host).copied();
            if let Some(delay) = delay {
                std::thread::sleep(delay);
            }
            if self.fail_auth.load(Ordering::SeqCst) {
                return Err(TunnelError::AuthFailed(ssh.username.clone()));
            }
            // Ports nothing listens on, so database connects through them fail fast.
            let port = 1 + self.next_port.fetch_add(1, Ordering::SeqCst);
            let tunnel = Arc::new(FakeTunnel {
                port,
                closed: AtomicBool::new(false),
                close_calls: AtomicUsize::new(0),
            });
            self.opened.lock().unwrap().push(tunnel.clone());
            Ok(tunnel)
        }
    }

    pub(crate) fn timeouts() -> TunnelTimeouts {
        TunnelTimeouts {
            handshake: Duration::from_secs(1),
            keepalive: Duration::from_secs(30),
        }
    }

    pub(crate) fn ssh_settings() -> SshSettings {
        SshSettings {
            host: "bastion.internal".into(),
            port: 22,
            username: "deploy".into(),
            password: Some("secret".into()),
            ..SshSettings::default()
        }
    }

    pub(crate) fn target() -> TunnelTarget {
        TunnelTarget {
            host: "10.0.0.5".into(),
            port: 5432,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::testing::*;
    use super::*;

    fn manager() -> (TunnelManager, Arc<FakeOpener>) {
        let opener = Arc::new(FakeOpener::default());
        (TunnelManager::new(opener.clone(), timeouts()), opener)
    }

    #[test]
    fn leases_share_one_tunnel_per_instance() {
        let (manager, opener) = manager();
        let a = manager.acquire(1, &ssh_settings(), &target()).unwrap();
        let b = manager.acquire(1, &ssh_settings(), &target()).unwrap();

        assert_eq!(opener.open_count(), 1);
        assert_eq!(a.local_port(), b.local_port());
        assert_eq!(manager.ref_count(1), 2);

        drop(a);
        assert_eq!(manager.ref_count(1), 1);
        assert!(!opener.last().is_closed());

        drop(b);
        assert_eq!(manager.ref_count(1), 0);
        assert_eq!(manager.open_tunnels(), 0);
        assert!(opener.last().is_closed());
    }

    #[test]
    fn different_instances_get_different_tunnels() {
        let (manager, opener) = manager();
        let a = manager.acquire(1, &ssh_settings(), &target()).unwrap();
        let b = manager.acquire(2, &ssh_settings(), &target()).unwrap();
        assert_eq!(opener.open_count(), 2);
        assert_ne!(a.local_port(), b.local_port());
        assert_eq!(b.instance_id(), 2);
    }

    #[test]
    fn closed_tunnel_is_reopened() {
        let (manager, opener) = manager();
        let first = manager.acquire(1, &ssh_settings(), &target()).unwrap();
        opener.last().close();

        let second = manager.acquire(1, &ssh_settings(), &target()).unwrap();
        assert_eq!(opener.open_count(), 2);
        assert_eq!(manager.ref_count(1), 1);

        // The stale lease must not decrement the new tunnel's count.
        drop(first);
        assert_eq!(manager.ref_count(1), 1);
        drop(second);
        assert_eq!(manager.open_tunnels(), 0);
    }

    #[test]
    fn auth_failure_registers_nothing() {
        let (manager, opener) = manager();
        opener.fail_auth.store(true, Ordering::SeqCst);
        let err = manager.acquire(1, &ssh_settings(), &target()).err().unwrap();
        assert!(matches!(err, TunnelError::AuthFailed(ref u) if u == "deploy"));
        assert_eq!(manager.open_tunnels(), 0);
    }

    #[test]
    fn close_all_closes_leased_tunnels() {
        let (manager, opener) = manager();
        let lease = manager.acquire(1, &ssh_settings(), &target()).unwrap();
        manager.close_all();
        assert!(opener.last().is_closed());
        drop(lease);
        assert_eq!(manager.open_tunnels(), 0);
        assert!(opener.last().close_calls.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn slow_open_does_not_block_other_instances() {
        let (manager, opener) = manager();
        let slow = SshSettings {
            host: "slow.internal".into(),
            ..ssh_settings()
        };
        opener
            .delays
            .lock()
            .unwrap()
            .insert(slow.host.clone(), Duration::from_millis(600));

        std::thread::scope(|scope| {
            let pending = scope.spawn(|| manager.acquire(1, &slow, &target()));
            std::thread::sleep(Duration::from_millis(50));

            let started = std::time::Instant::now();
            let fast = manager.acquire(2, &ssh_settings(), &target()).unwrap();
            assert!(started.elapsed() < Duration::from_millis(300));
            assert_eq!(manager.ref_count(2), 1);

            let slow_lease = pending.join().unwrap().unwrap();
            assert_eq!(slow_lease.instance_id(), 1);
            drop(fast);
        });
        assert_eq!(manager.open_tunnels(), 0);
        assert_eq!(manager.pending_opens(), 0);
    }

    #[test]
    fn racing_acquires_open_one_tunnel() {
        let (manager, opener) = manager();
        opener
            .delays
            .lock()
            .unwrap()
            .insert(ssh_settings().host, Duration::from_millis(200));

        let (a, b) = std::thread::scope(|scope| {
            let a = scope.spawn(|| manager.acquire(1, &ssh_settings(), &target()));
            let b = scope.spawn(|| manager.acquire(1, &ssh_settings(), &target()));
            (a.join().unwrap().unwrap(), b.join().unwrap().unwrap())
        });

        assert_eq!(opener.open_count(), 1);
        assert_eq!(manager.ref_count(1), 2);
        assert_eq!(a.local_port(), b.local_port());
        assert_eq!(manager.pending_opens(), 0);
    }

    #[test]
    fn ssh_settings_debug_hides_secrets() {
        let dbg = format!("{:?}", ssh_settings());
        assert!(!dbg.contains("secret"));
        assert!(dbg.contains("bastion.internal"));
    }
}
