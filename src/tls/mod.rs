pub(crate) mod bio;
pub(crate) mod context;
pub(crate) mod keys;
pub(crate) mod session;
pub(crate) mod sni;
pub(crate) mod verify;

use openssl::x509::X509NameRef;

/// Render an X.509 name the way log lines expect it: `/K=V/K=V`.
pub(crate) fn name_oneline(name: &X509NameRef) -> String {
    let mut out = String::new();
    for entry in name.entries() {
        let key = entry
            .object()
            .nid()
            .short_name()
            .unwrap_or("UNKNOWN")
            .to_owned();
        let value = entry
            .data()
            .as_utf8()
            .map(|v| v.to_string())
            .unwrap_or_default();
        out.push('/');
        out.push_str(&key);
        out.push('=');
        out.push_str(&value);
    }
    out
}
