use openssl::nid::Nid;
use openssl::x509::{X509, X509Ref};

/// Host-name verification interface registered on the proxy after a
/// qualifying server-side handshake.
///
/// Higher layers use it to match the hostname they connected to against the
/// subject of the certificate the server actually presented.
#[derive(Clone)]
pub struct HostNameVerifier {
    peer_cert: X509,
}

impl HostNameVerifier {
    pub(crate) fn new(peer_cert: X509) -> Self {
        Self { peer_cert }
    }

    /// The certificate this interface verifies against.
    pub fn peer_certificate(&self) -> &X509Ref {
        &self.peer_cert
    }

    /// Whether `hostname` matches the certificate's subject.
    ///
    /// DNS subject alternative names take precedence; the common name is
    /// only consulted when the certificate carries no DNS SAN at all.
    /// Wildcards match exactly one leftmost label.
    pub fn matches(&self, hostname: &str) -> bool {
        if let Some(sans) = self.peer_cert.subject_alt_names() {
            let mut saw_dns = false;
            for san in &sans {
                if let Some(pattern) = san.dnsname() {
                    saw_dns = true;
                    if dns_name_matches(pattern, hostname) {
                        return true;
                    }
                }
            }
            if saw_dns {
                return false;
            }
        }

        self.peer_cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .any(|entry| match entry.data().as_utf8() {
                Ok(pattern) => dns_name_matches(&pattern, hostname),
                Err(_) => false,
            })
    }
}

fn dns_name_matches(pattern: &str, hostname: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        match hostname.split_once('.') {
            Some((label, rest)) => !label.is_empty() && rest.eq_ignore_ascii_case(suffix),
            None => false,
        }
    } else {
        pattern.eq_ignore_ascii_case(hostname)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_match_is_case_insensitive() {
        assert!(dns_name_matches("www.example.com", "WWW.Example.Com"));
        assert!(!dns_name_matches("www.example.com", "example.com"));
    }

    #[test]
    fn wildcard_matches_one_label() {
        assert!(dns_name_matches("*.example.com", "www.example.com"));
        assert!(dns_name_matches("*.example.com", "api.EXAMPLE.com"));
        assert!(!dns_name_matches("*.example.com", "example.com"));
        assert!(!dns_name_matches("*.example.com", "a.b.example.com"));
        assert!(!dns_name_matches("*.example.com", ".example.com"));
    }
}
