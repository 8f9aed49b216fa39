use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use openssl::x509::X509Ref;

use crate::types::{PerSide, Side};

/// Verdict integer accepting the standard logic. Stable ABI with the policy layer.
pub const HS_ACCEPT: i64 = 0;
/// Verdict integer aborting the handshake. Stable ABI with the policy layer.
pub const HS_REJECT: i64 = 1;
/// Verdict integer overriding an untrusted chain error. Stable ABI with the policy layer.
pub const HS_VERIFIED: i64 = 2;

/// Type tag of a policy callback entry; the only supported entry type.
pub const CALLBACK_TYPE_POLICY: u32 = 1;

/// Result of a policy callback invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// use the standard verification logic
    Accept,
    /// abort the handshake
    Reject,
    /// the policy asserts the peer is acceptable, overriding chain errors
    Verified,
}

impl Verdict {
    /// Map a raw integer returned by a callable onto a verdict.
    ///
    /// Integers outside the ABI set reject, matching the use sites which
    /// accept only `Accept` and `Verified` explicitly.
    pub fn from_raw(raw: i64) -> Verdict {
        match raw {
            HS_ACCEPT => Verdict::Accept,
            HS_VERIFIED => Verdict::Verified,
            _ => Verdict::Reject,
        }
    }
}

/// Dynamically-typed value returned by a policy callable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyValue {
    /// no value
    None,
    /// an integer, the only type a handshake callback may return
    Int(i64),
    /// a string
    Str(String),
}

/// Opaque handle to the proxied session, passed through to policy callbacks
/// that want to call back into the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHandle(pub u64);

/// Arguments marshalled to a policy callback. The shape is fixed per
/// callback name.
pub enum CallbackArgs<'a> {
    /// `setup_key(side, peer_cert_of_other_side, sni_name, handler)`
    SetupKey {
        side: Side,
        peer_cert: Option<&'a X509Ref>,
        server_name: &'a str,
        handler: SessionHandle,
    },
    /// `verify_cert(side)`
    VerifyCert { side: Side },
    /// `verify_cert_ext(side, (trusted, verify_error), peer_cert, handler)`
    VerifyCertExt {
        side: Side,
        trusted: bool,
        verify_error: i32,
        peer_cert: &'a X509Ref,
        handler: SessionHandle,
    },
}

/// A callable configured by the policy layer.
pub trait PolicyCallable: Send + Sync {
    /// Consume the argument tuple and produce a value.
    fn call(&self, args: CallbackArgs<'_>) -> PolicyValue;
}

impl<F> PolicyCallable for F
where
    F: Fn(CallbackArgs<'_>) -> PolicyValue + Send + Sync,
{
    fn call(&self, args: CallbackArgs<'_>) -> PolicyValue {
        self(args)
    }
}

/// One configured handshake callback: a type tag and the callable itself.
#[derive(Clone)]
pub struct PolicyEntry {
    /// entry type tag; anything but [`CALLBACK_TYPE_POLICY`] is invalid
    pub tag: u32,
    /// the configured callable
    pub callable: Arc<dyn PolicyCallable>,
}

impl PolicyEntry {
    /// A well-formed policy callback entry.
    pub fn policy(callable: Arc<dyn PolicyCallable>) -> Self {
        Self {
            tag: CALLBACK_TYPE_POLICY,
            callable,
        }
    }
}

/// Failure modes of a callback invocation. Both are configuration errors,
/// reported distinctly from runtime TLS errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PolicyError {
    /// the stored entry is not a policy callback
    UnsupportedEntry,
    /// the callable returned something other than an integer
    NonIntegerReturn,
}

/// Implemented by the session so policy failures surface on the proxy.
pub(crate) trait PolicyReport {
    /// a configured callback was malformed
    fn report_invalid_policy(&self);
    /// a callback invocation failed and the handshake aborts on policy grounds
    fn report_policy_abort(&self);
}

// All policy callables run under one process-wide lock, mirroring the policy
// interpreter they wrap. Never held across I/O.
static INTERPRETER_LOCK: Mutex<()> = Mutex::new(());

/// Looks up policy callbacks by name and side, marshals arguments and
/// interprets the returned verdict.
#[derive(Clone, Default)]
pub struct PolicyBridge {
    hooks: PerSide<HashMap<String, PolicyEntry>>,
}

impl PolicyBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a callback for one side.
    pub fn set_callback(&mut self, side: Side, name: &str, entry: PolicyEntry) {
        self.hooks[side].insert(name.to_owned(), entry);
    }

    /// Whether a callback with the given name is configured on `side`.
    pub fn callback_exists(&self, side: Side, name: &str) -> bool {
        self.hooks[side].contains_key(name)
    }

    /// Invoke the named callback.
    ///
    /// A missing callback is not an error and yields `Accept`. A malformed
    /// entry or a non-integer return is a configuration error: it is logged,
    /// reported through `reporter`, and no verdict is produced.
    pub(crate) fn invoke(
        &self,
        side: Side,
        name: &str,
        args: CallbackArgs<'_>,
        reporter: &dyn PolicyReport,
    ) -> Result<Verdict, PolicyError> {
        let entry = match self.hooks[side].get(name) {
            None => return Ok(Verdict::Accept),
            Some(entry) => entry,
        };

        if entry.tag != CALLBACK_TYPE_POLICY {
            tracing::error!(
                "Invalid handshake callback entry, only policy callbacks are supported; name='{}', type='{}'",
                name,
                entry.tag
            );
            reporter.report_invalid_policy();
            return Err(PolicyError::UnsupportedEntry);
        }

        let result = {
            let _interp = INTERPRETER_LOCK.lock().unwrap();
            entry.callable.call(args)
        };

        match result {
            PolicyValue::Int(raw) => Ok(Verdict::from_raw(raw)),
            _ => {
                tracing::error!("Handshake callback returned non-int; name='{}'", name);
                reporter.report_policy_abort();
                Err(PolicyError::NonIntegerReturn)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Reports {
        invalid: AtomicUsize,
        aborts: AtomicUsize,
    }

    impl PolicyReport for Reports {
        fn report_invalid_policy(&self) {
            self.invalid.fetch_add(1, Ordering::SeqCst);
        }

        fn report_policy_abort(&self) {
            self.aborts.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn returning(value: PolicyValue) -> PolicyEntry {
        PolicyEntry::policy(Arc::new(move |_args: CallbackArgs<'_>| value.clone()))
    }

    #[test]
    fn verdict_integers_are_stable() {
        assert_eq!(Verdict::from_raw(HS_ACCEPT), Verdict::Accept);
        assert_eq!(Verdict::from_raw(HS_REJECT), Verdict::Reject);
        assert_eq!(Verdict::from_raw(HS_VERIFIED), Verdict::Verified);
        // anything outside the ABI set rejects
        assert_eq!(Verdict::from_raw(17), Verdict::Reject);
        assert_eq!(Verdict::from_raw(-1), Verdict::Reject);
    }

    #[test]
    fn missing_callback_yields_accept() {
        let bridge = PolicyBridge::new();
        let reports = Reports::default();
        let verdict = bridge
            .invoke(
                Side::Client,
                "verify_cert",
                CallbackArgs::VerifyCert { side: Side::Client },
                &reports,
            )
            .unwrap();
        assert_eq!(verdict, Verdict::Accept);
        assert_eq!(reports.invalid.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn unsupported_entry_type_reports_invalid_policy() {
        let mut bridge = PolicyBridge::new();
        let mut entry = returning(PolicyValue::Int(HS_ACCEPT));
        entry.tag = 99;
        bridge.set_callback(Side::Server, "verify_cert", entry);

        let reports = Reports::default();
        let err = bridge
            .invoke(
                Side::Server,
                "verify_cert",
                CallbackArgs::VerifyCert { side: Side::Server },
                &reports,
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::UnsupportedEntry);
        assert_eq!(reports.invalid.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn non_integer_return_reports_policy_abort() {
        let mut bridge = PolicyBridge::new();
        bridge.set_callback(
            Side::Client,
            "verify_cert",
            returning(PolicyValue::Str("ok".to_owned())),
        );

        let reports = Reports::default();
        let err = bridge
            .invoke(
                Side::Client,
                "verify_cert",
                CallbackArgs::VerifyCert { side: Side::Client },
                &reports,
            )
            .unwrap_err();
        assert_eq!(err, PolicyError::NonIntegerReturn);
        assert_eq!(reports.aborts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn callbacks_are_looked_up_per_side() {
        let mut bridge = PolicyBridge::new();
        bridge.set_callback(
            Side::Client,
            "setup_key",
            returning(PolicyValue::Int(HS_ACCEPT)),
        );
        assert!(bridge.callback_exists(Side::Client, "setup_key"));
        assert!(!bridge.callback_exists(Side::Server, "setup_key"));
    }
}
