//! The TLS interception core of an application-layer proxy, built on
//! [Tokio](https://docs.rs/tokio) and OpenSSL.
//!
//! For each proxied connection the proxy mediates TLS between a client and
//! an upstream server: it terminates the client's TLS session, may open a
//! separate TLS session towards the server, and exposes both peers'
//! certificates and handshake facts to a policy layer that decides, per side
//! and per connection, whether to accept, substitute local credentials,
//! trust untrusted chains, or abort.
//!
//! # What this crate provides
//!
//! * a per-endpoint TLS handshake engine driving a non-blocking state
//!   machine, with blocking, cooperative semi-non-blocking, and
//!   continuation-passing modes
//! * handshake ordering between the two endpoints (client-first,
//!   server-first, with a delayed-handshake rendezvous)
//! * certificate-chain verification against a configurable trust model with
//!   policy callbacks that may override or annotate the outcome
//! * on-demand local credential loading for keybridging via the `setup_key`
//!   policy callback
//! * SNI extraction by peeking the ClientHello before the real handshake
//!
//! # Example
//!
//! Terminate TLS on the client endpoint and bridge it to the upstream:
//!
//! ```no_run
//! use std::sync::Arc;
//! use tlsbridge::*;
//!
//! # async fn run(client_stream: PhysLayer, chain: Vec<openssl::x509::X509>,
//! #              key: openssl::pkey::PKey<openssl::pkey::Private>) {
//! let mut config = EncryptionConfig::default();
//! config.security = PerSide::new(Security::ForceTls, Security::None);
//!
//! let mut policy = PolicyBridge::new();
//! policy.set_callback(
//!     Side::Client,
//!     "setup_key",
//!     PolicyEntry::policy(Arc::new(|_args: CallbackArgs<'_>| PolicyValue::Int(HS_ACCEPT))),
//! );
//!
//! let mut session = ProxySession::new(1, config, policy, DecodeLevel::default());
//! session.vars().set_local_certificate_chain(Side::Client, Some(chain));
//! session.vars().set_local_private_key(Side::Client, Some(key));
//! session.set_endpoint(Side::Client, client_stream);
//!
//! session.request_handshake(Side::Client, false).await.unwrap();
//! assert!(session.session_established(Side::Client));
//! # }
//! ```

#![deny(
    non_camel_case_types,
    non_shorthand_field_patterns,
    non_snake_case,
    non_upper_case_globals,
    unreachable_pub,
    unused_import_braces,
    unused_qualifications,
    clippy::all
)]
#![forbid(while_true, bare_trait_objects)]
#![deny(unsafe_code)]

/// TLS parameters of a proxied session
mod config;
/// log decoding knobs
mod decode;
/// per-side TLS state
mod endpoint;
/// error types of the handshake engine
mod error;
/// host-name verification interface
mod hostname;
/// policy callback bridge
mod policy;
/// the proxied session and its handshake coordinator
mod session;
/// side / per-side primitives
mod types;

// internal modules
mod common;
mod handshake;
mod tls;

pub use crate::common::phys::{PhysLayer, PollCond, StreamContext};
pub use crate::config::{EncryptionConfig, HandshakeSeq, Security, VerifyType};
pub use crate::decode::{DecodeLevel, HandshakeDecodeLevel, PhysDecodeLevel};
pub use crate::endpoint::TlsEndpointState;
pub use crate::error::HandshakeError;
pub use crate::hostname::HostNameVerifier;
pub use crate::policy::{
    CallbackArgs, PolicyBridge, PolicyCallable, PolicyEntry, PolicyError, PolicyValue,
    SessionHandle, Verdict, CALLBACK_TYPE_POLICY, HS_ACCEPT, HS_REJECT, HS_VERIFIED,
};
pub use crate::session::{ProxySession, ServerConnector, TlsVars};
pub use crate::tls::session::TlsSession;
pub use crate::types::{PerSide, Side};
