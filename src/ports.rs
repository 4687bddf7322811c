//! Collaborator interfaces injected by the embedding application.
//!
//! The changelog does not own encryption, domain configuration,
//! monitoring or time. It consumes them through the traits below, each
//! with a default implementation suitable for tests and standalone use.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::ChangelogError;
use crate::log::RotationListener;
use crate::replication::{Dn, MultiDomainServerState, UpdateMsg};

// ------------------------------------------------------------------------------------------------
// Crypto
// ------------------------------------------------------------------------------------------------

/// Opaque encrypt/decrypt service applied to record payloads.
pub trait CryptoSuite: Send + Sync {
    /// Whether new records should be written encrypted.
    fn is_encrypted(&self) -> bool;

    /// Encrypts `data`.
    fn encrypt(&self, data: &[u8]) -> Result<Vec<u8>, ChangelogError>;

    /// Decrypts bytes previously produced by [`CryptoSuite::encrypt`].
    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, ChangelogError>;
}

/// A crypto suite that never encrypts and refuses to decrypt.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoEncryption;

impl CryptoSuite for NoEncryption {
    fn is_encrypted(&self) -> bool {
        false
    }

    fn encrypt(&self, _data: &[u8]) -> Result<Vec<u8>, ChangelogError> {
        Err(ChangelogError::Crypto("no crypto suite configured".into()))
    }

    fn decrypt(&self, _data: &[u8]) -> Result<Vec<u8>, ChangelogError> {
        Err(ChangelogError::Crypto(
            "encrypted record found but no crypto suite configured".into(),
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// External changelog enablement
// ------------------------------------------------------------------------------------------------

/// Decides which replication domains take part in the external changelog.
pub trait EclEnabledDomainPredicate: Send + Sync {
    fn is_ecl_enabled_domain(&self, base_dn: &Dn) -> bool;
}

/// Every domain is enabled.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllDomainsEnabled;

impl EclEnabledDomainPredicate for AllDomainsEnabled {
    fn is_ecl_enabled_domain(&self, _base_dn: &Dn) -> bool {
        true
    }
}

impl<F> EclEnabledDomainPredicate for F
where
    F: Fn(&Dn) -> bool + Send + Sync,
{
    fn is_ecl_enabled_domain(&self, base_dn: &Dn) -> bool {
        self(base_dn)
    }
}

// ------------------------------------------------------------------------------------------------
// Monitoring
// ------------------------------------------------------------------------------------------------

/// Source of name/value monitoring counters.
pub trait MonitorProvider: Send + Sync {
    /// Current counters, e.g. `("first-change", "<csn>")`.
    fn monitor_data(&self) -> Vec<(String, String)>;
}

/// Registry to which DB façades publish their [`MonitorProvider`].
pub trait MonitorRegistrar: Send + Sync {
    fn register(&self, name: &str, provider: Arc<dyn MonitorProvider>);
    fn deregister(&self, name: &str);
}

/// Discards every registration.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMonitorRegistrar;

impl MonitorRegistrar for NoopMonitorRegistrar {
    fn register(&self, _name: &str, _provider: Arc<dyn MonitorProvider>) {}
    fn deregister(&self, _name: &str) {}
}

// ------------------------------------------------------------------------------------------------
// Time
// ------------------------------------------------------------------------------------------------

/// Millisecond wall clock used for time-based log rotation and CSN
/// generation.
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// [`Clock`] backed by [`SystemTime`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0)
    }
}

// ------------------------------------------------------------------------------------------------
// Change-number notifications
// ------------------------------------------------------------------------------------------------

/// A change-number index entry that has just been published.
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeNumberIndexed {
    /// Domain of the indexed update.
    pub base_dn: Dn,
    /// Dense change number assigned to the update.
    pub change_number: u64,
    /// Cookie from which an external changelog reader resumes right
    /// after this change.
    pub cookie: MultiDomainServerState,
    /// The update itself.
    pub update: UpdateMsg,
}

/// Downstream hook invoked once per newly published change-number entry.
pub trait ChangeNumberIndexListener: Send + Sync {
    fn on_change_number_indexed(&self, event: &ChangeNumberIndexed);
}

/// Forwards every indexed entry into a `crossbeam` channel.
#[derive(Debug, Clone)]
pub struct ChannelListener {
    sender: crossbeam::channel::Sender<ChangeNumberIndexed>,
}

impl ChannelListener {
    /// Creates a listener and the receiving end of its unbounded channel.
    pub fn new() -> (Self, crossbeam::channel::Receiver<ChangeNumberIndexed>) {
        let (sender, receiver) = crossbeam::channel::unbounded();
        (Self { sender }, receiver)
    }
}

impl ChangeNumberIndexListener for ChannelListener {
    fn on_change_number_indexed(&self, event: &ChangeNumberIndexed) {
        if self.sender.send(event.clone()).is_err() {
            debug!(change_number = event.change_number, "change number listener has no receiver");
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Bundle
// ------------------------------------------------------------------------------------------------

/// Every collaborator a [`crate::ChangelogDb`] is opened with.
///
/// The default bundle stores records in clear, enables every domain,
/// publishes no monitor and reads the system clock. It has no listener
/// and no rotation hook.
#[derive(Clone)]
pub struct Collaborators {
    pub crypto: Arc<dyn CryptoSuite>,
    pub ecl_predicate: Arc<dyn EclEnabledDomainPredicate>,
    pub registrar: Arc<dyn MonitorRegistrar>,
    pub clock: Arc<dyn Clock>,
    pub listener: Option<Arc<dyn ChangeNumberIndexListener>>,
    /// Called with the path of every log file rotated out of a head.
    pub on_rotation: Option<RotationListener>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            crypto: Arc::new(NoEncryption),
            ecl_predicate: Arc::new(AllDomainsEnabled),
            registrar: Arc::new(NoopMonitorRegistrar),
            clock: Arc::new(SystemClock),
            listener: None,
            on_rotation: None,
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("encrypted", &self.crypto.is_encrypted())
            .field("listener", &self.listener.is_some())
            .field("on_rotation", &self.on_rotation.is_some())
            .finish_non_exhaustive()
    }
}
