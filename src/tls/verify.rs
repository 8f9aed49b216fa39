use std::sync::{Arc, Mutex};

use openssl::x509::{X509StoreContextRef, X509VerifyResult};
use openssl_sys as ffi;

use crate::config::VerifyType;
use crate::policy::{CallbackArgs, Verdict};
use crate::session::SessionCore;
use crate::tls::name_oneline;
use crate::types::Side;

/// The verify errors treated as policy-negotiable rather than fatal.
pub(crate) fn verify_error_is_untrusted(verify_error: i32) -> bool {
    matches!(
        verify_error,
        ffi::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT
            | ffi::X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN
            | ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY
            | ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT
            | ffi::X509_V_ERR_CERT_UNTRUSTED
            | ffi::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE
    )
}

#[allow(unsafe_code)]
fn verify_error_string(verify_error: i32) -> &'static str {
    unsafe { X509VerifyResult::from_raw(verify_error) }.error_string()
}

/// What the per-certificate stage decided for one chain element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PerCertDecision {
    /// the certificate passed untouched
    Accept,
    /// accepted, but the chain no longer counts as trusted
    AcceptUntrusted,
    /// rejected with this verify error
    Reject(i32),
}

/// Per-certificate policy: the depth/CRL/untrusted/none ladder as a pure
/// function, so the truth table is testable in isolation.
pub(crate) fn per_cert_decision(
    verify_type: VerifyType,
    verify_depth: u32,
    permit_missing_crl: bool,
    permit_invalid_certificates: bool,
    preverify_ok: bool,
    depth: u32,
    verify_error: i32,
) -> PerCertDecision {
    if verify_depth < depth {
        return PerCertDecision::Reject(ffi::X509_V_ERR_CERT_CHAIN_TOO_LONG);
    }

    if preverify_ok {
        return PerCertDecision::Accept;
    }

    if verify_error == ffi::X509_V_ERR_UNABLE_TO_GET_CRL {
        if permit_missing_crl {
            return PerCertDecision::AcceptUntrusted;
        }
    } else if verify_type.accepts_untrusted() {
        if permit_invalid_certificates || verify_error_is_untrusted(verify_error) {
            return PerCertDecision::AcceptUntrusted;
        }
    } else if verify_type == VerifyType::None {
        return PerCertDecision::AcceptUntrusted;
    }

    PerCertDecision::Reject(verify_error)
}

/// Chain-level verdict combination: `Accept` trusts the library outcome,
/// `Verified` overrides it, `Reject` aborts.
pub(crate) fn combine_verdict(verdict: Verdict, verify_failed: bool) -> bool {
    match verdict {
        Verdict::Accept => !verify_failed,
        Verdict::Verified => true,
        Verdict::Reject => false,
    }
}

#[derive(Default)]
struct Progress {
    started: bool,
    chain_error: Option<i32>,
    verdict: Option<Verdict>,
}

/// Shared state of the two verification stages of one handshake.
///
/// The TLS library invokes its verify callback once per chain certificate;
/// both the per-certificate stage and the chain-level application stage
/// trampoline through this context, sharing the trusted flag, the stashed
/// peer certificate, and the policy bridge.
///
/// A per-certificate rejection is latched rather than library-fatal, so the
/// chain stage can still consult policy and a `Verified` verdict can
/// override the failure, exactly as an application-level chain callback
/// would observe a failed `X509_verify_cert`.
pub(crate) struct VerifyContext {
    core: Arc<SessionCore>,
    side: Side,
    progress: Mutex<Progress>,
}

impl VerifyContext {
    pub(crate) fn new(core: Arc<SessionCore>, side: Side) -> Self {
        Self {
            core,
            side,
            progress: Mutex::new(Progress::default()),
        }
    }

    /// Entry point installed as the library's verify callback.
    #[allow(unsafe_code)]
    pub(crate) fn library_hook(&self, preverify_ok: bool, ctx: &mut X509StoreContextRef) -> bool {
        let depth = ctx.error_depth();
        let verify_error = ctx.error().as_raw();
        let mut progress = self.progress.lock().unwrap();

        if !progress.started {
            progress.started = true;
            // the verification target is chain[0] no matter which depth the
            // library reports first
            let leaf = ctx.chain().and_then(|c| c.iter().next()).map(|c| c.to_owned());
            if let Some(leaf) = leaf {
                self.core.set_peer_cert(self.side, Some(leaf));
            }
            self.core.set_certificate_trusted(self.side, true);
        }

        self.per_cert_stage(preverify_ok, depth, verify_error, ctx, &mut progress);

        if depth != 0 {
            return true;
        }

        let ok = self.chain_stage(verify_error, ctx, &mut progress);
        if !ok {
            let error = progress
                .chain_error
                .unwrap_or(ffi::X509_V_ERR_APPLICATION_VERIFICATION);
            ctx.set_error(unsafe { X509VerifyResult::from_raw(error) });
        }
        ok
    }

    fn per_cert_stage(
        &self,
        preverify_ok: bool,
        depth: u32,
        verify_error: i32,
        ctx: &X509StoreContextRef,
        progress: &mut Progress,
    ) {
        let cfg = &self.core.config;
        let side = self.side;

        let decision = per_cert_decision(
            cfg.verify_type[side],
            cfg.verify_depth[side],
            cfg.permit_missing_crl[side],
            cfg.permit_invalid_certificates[side],
            preverify_ok,
            depth,
            verify_error,
        );

        match decision {
            PerCertDecision::Accept => {}
            PerCertDecision::AcceptUntrusted => {
                if verify_error == ffi::X509_V_ERR_UNABLE_TO_GET_CRL {
                    tracing::debug!(
                        "Trying verification without CRL check as directed by the policy"
                    );
                } else if cfg.permit_invalid_certificates[side] {
                    tracing::info!(
                        "Accepting invalid certificate as directed by the policy; verify_error='{}'",
                        verify_error_string(verify_error)
                    );
                } else {
                    tracing::info!(
                        "Accepting untrusted certificate as directed by the policy; verify_error='{}'",
                        verify_error_string(verify_error)
                    );
                }
                self.core.set_certificate_trusted(side, false);
            }
            PerCertDecision::Reject(error) => {
                if error == ffi::X509_V_ERR_CERT_CHAIN_TOO_LONG {
                    tracing::error!(
                        "Certificate verification failed; error='{}', side='{}', max_depth='{}', depth='{}'",
                        verify_error_string(error),
                        side,
                        cfg.verify_depth[side],
                        depth
                    );
                } else {
                    let (subject, issuer) = match ctx.current_cert() {
                        Some(cert) => (
                            name_oneline(cert.subject_name()),
                            name_oneline(cert.issuer_name()),
                        ),
                        None => (String::new(), String::new()),
                    };
                    tracing::error!(
                        "Certificate verification failed; error='{}', issuer='{}', subject='{}'",
                        verify_error_string(error),
                        issuer,
                        subject
                    );
                }
                progress.chain_error.get_or_insert(error);
            }
        }
    }

    fn chain_stage(
        &self,
        current_error: i32,
        ctx: &X509StoreContextRef,
        progress: &mut Progress,
    ) -> bool {
        let side = self.side;
        let core = &self.core;
        let verify_failed = progress.chain_error.is_some();
        let verify_error = progress.chain_error.unwrap_or(current_error);

        let verdict = match progress.verdict {
            Some(verdict) => verdict,
            None => {
                let result = if core.policy.callback_exists(side, "verify_cert_ext") {
                    let peer = core
                        .peer_cert(side)
                        .or_else(|| ctx.current_cert().map(|c| c.to_owned()));
                    match peer {
                        Some(peer) => core.policy.invoke(
                            side,
                            "verify_cert_ext",
                            CallbackArgs::VerifyCertExt {
                                side,
                                trusted: !verify_failed && core.certificate_trusted(side),
                                verify_error,
                                peer_cert: &peer,
                                handler: core.handle,
                            },
                            core.as_ref(),
                        ),
                        None => core.policy.invoke(
                            side,
                            "verify_cert",
                            CallbackArgs::VerifyCert { side },
                            core.as_ref(),
                        ),
                    }
                } else {
                    core.policy.invoke(
                        side,
                        "verify_cert",
                        CallbackArgs::VerifyCert { side },
                        core.as_ref(),
                    )
                };
                match result {
                    Ok(verdict) => {
                        progress.verdict = Some(verdict);
                        verdict
                    }
                    Err(_) => return false,
                }
            }
        };

        if verify_failed {
            tracing::info!(
                "Certificate verification failed, making policy decision; error='{}'",
                verify_error_string(verify_error)
            );
        }

        let ok = combine_verdict(verdict, verify_failed);
        if ok && verdict == Verdict::Verified && verify_failed {
            // a forced accept is a policy downgrade: the chain did not verify
            core.set_certificate_trusted(side, false);
            tracing::info!(
                "Accepting untrusted certificate as directed by the policy; verify_error='{}'",
                verify_error_string(verify_error)
            );
        }
        ok
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const DEPTH: u32 = 4;

    fn decide(
        verify_type: VerifyType,
        missing_crl: bool,
        invalid: bool,
        preverify_ok: bool,
        depth: u32,
        error: i32,
    ) -> PerCertDecision {
        per_cert_decision(
            verify_type,
            DEPTH,
            missing_crl,
            invalid,
            preverify_ok,
            depth,
            error,
        )
    }

    #[test]
    fn untrusted_error_set_is_exact() {
        for error in [
            ffi::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT,
            ffi::X509_V_ERR_SELF_SIGNED_CERT_IN_CHAIN,
            ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT_LOCALLY,
            ffi::X509_V_ERR_UNABLE_TO_GET_ISSUER_CERT,
            ffi::X509_V_ERR_CERT_UNTRUSTED,
            ffi::X509_V_ERR_UNABLE_TO_VERIFY_LEAF_SIGNATURE,
        ] {
            assert!(verify_error_is_untrusted(error));
        }
        assert!(!verify_error_is_untrusted(ffi::X509_V_ERR_CERT_HAS_EXPIRED));
        assert!(!verify_error_is_untrusted(ffi::X509_V_ERR_UNABLE_TO_GET_CRL));
    }

    #[test]
    fn depth_boundary_is_inclusive() {
        // depth equal to the limit verifies, one past it fails
        assert_eq!(
            decide(VerifyType::RequiredTrusted, false, false, true, DEPTH, 0),
            PerCertDecision::Accept
        );
        assert_eq!(
            decide(VerifyType::RequiredTrusted, false, false, true, DEPTH + 1, 0),
            PerCertDecision::Reject(ffi::X509_V_ERR_CERT_CHAIN_TOO_LONG)
        );
    }

    #[test]
    fn depth_check_precedes_preverify() {
        // even a cert the library already accepted fails past the limit
        assert_eq!(
            decide(
                VerifyType::None,
                false,
                true,
                true,
                DEPTH + 1,
                0
            ),
            PerCertDecision::Reject(ffi::X509_V_ERR_CERT_CHAIN_TOO_LONG)
        );
    }

    #[test]
    fn preverified_certs_pass_untouched() {
        assert_eq!(
            decide(VerifyType::RequiredTrusted, false, false, true, 0, 0),
            PerCertDecision::Accept
        );
    }

    #[test]
    fn missing_crl_is_negotiable_only_with_the_knob() {
        let error = ffi::X509_V_ERR_UNABLE_TO_GET_CRL;
        assert_eq!(
            decide(VerifyType::RequiredTrusted, true, false, false, 1, error),
            PerCertDecision::AcceptUntrusted
        );
        assert_eq!(
            decide(VerifyType::RequiredTrusted, false, false, false, 1, error),
            PerCertDecision::Reject(error)
        );
        // the CRL arm does not fall into the untrusted arm
        assert_eq!(
            decide(VerifyType::RequiredUntrusted, false, false, false, 1, error),
            PerCertDecision::Reject(error)
        );
    }

    #[test]
    fn untrusted_modes_accept_the_untrusted_set() {
        let error = ffi::X509_V_ERR_DEPTH_ZERO_SELF_SIGNED_CERT;
        for vt in [VerifyType::OptionalUntrusted, VerifyType::RequiredUntrusted] {
            assert_eq!(
                decide(vt, false, false, false, 0, error),
                PerCertDecision::AcceptUntrusted
            );
        }
        // trusted modes reject the same error
        assert_eq!(
            decide(VerifyType::RequiredTrusted, false, false, false, 0, error),
            PerCertDecision::Reject(error)
        );
    }

    #[test]
    fn untrusted_modes_reject_errors_outside_the_set() {
        let error = ffi::X509_V_ERR_CERT_HAS_EXPIRED;
        assert_eq!(
            decide(VerifyType::RequiredUntrusted, false, false, false, 0, error),
            PerCertDecision::Reject(error)
        );
        // unless invalid certificates are permitted outright
        assert_eq!(
            decide(VerifyType::RequiredUntrusted, false, true, false, 0, error),
            PerCertDecision::AcceptUntrusted
        );
    }

    #[test]
    fn verify_none_accepts_anything_untrusted() {
        assert_eq!(
            decide(
                VerifyType::None,
                false,
                false,
                false,
                0,
                ffi::X509_V_ERR_CERT_HAS_EXPIRED
            ),
            PerCertDecision::AcceptUntrusted
        );
    }

    #[test]
    fn verdict_combination_table() {
        assert!(combine_verdict(Verdict::Accept, false));
        assert!(!combine_verdict(Verdict::Accept, true));
        assert!(combine_verdict(Verdict::Verified, false));
        assert!(combine_verdict(Verdict::Verified, true));
        assert!(!combine_verdict(Verdict::Reject, false));
        assert!(!combine_verdict(Verdict::Reject, true));
    }
}
