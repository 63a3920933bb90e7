use crate::address::EnvelopeAddress;

/// How a recipient address maps onto a mailbox name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MailboxNaming {
    /// Strip the domain: `bob@example.com` -> `bob`.
    #[default]
    Local,
    /// The whole address, lowercased.
    Full,
    /// The domain only: every user at a domain shares one mailbox.
    Domain,
}

impl std::str::FromStr for MailboxNaming {
    type Err = anyhow::Error;

    fn from_str(text: &str) -> anyhow::Result<Self> {
        match text.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "full" => Ok(Self::Full),
            "domain" => Ok(Self::Domain),
            _ => anyhow::bail!("invalid mailbox naming '{text}' (expected local, full or domain)"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    #[error("malformed address: {0}")]
    BadAddress(String),
}

/// What the policy decided about one recipient.
#[derive(Debug, Clone, PartialEq)]
pub struct Verdict {
    pub mailbox: String,
    /// Whether the ingress should accept the recipient at all.
    pub accept: bool,
    /// Whether a message for this recipient gets persisted. With no
    /// relaying, a recipient that cannot be stored is refused rather
    /// than silently black-holed, so the ingress requires both flags.
    pub store: bool,
}

/// Normalization and accept/reject rules applied to every recipient,
/// once by the SMTP ingress at RCPT time and once more by the manager
/// at delivery time.
#[derive(Debug, Clone)]
pub struct AddressPolicy {
    pub naming: MailboxNaming,
    pub default_accept: bool,
    pub accept_domains: Vec<String>,
    pub reject_domains: Vec<String>,
    pub default_store: bool,
    pub store_domains: Vec<String>,
}

impl Default for AddressPolicy {
    fn default() -> Self {
        Self {
            naming: MailboxNaming::Local,
            default_accept: true,
            accept_domains: vec![],
            reject_domains: vec![],
            default_store: true,
            store_domains: vec![],
        }
    }
}

impl AddressPolicy {
    /// The canonical mailbox name for an address. Two addresses that
    /// canonicalize to the same name share a mailbox.
    pub fn canonical_mailbox(&self, addr: &EnvelopeAddress) -> Result<String, PolicyError> {
        let local = addr.user();
        let domain = addr.domain().to_ascii_lowercase();
        let name = match self.naming {
            MailboxNaming::Local => local.to_lowercase(),
            MailboxNaming::Full => format!("{}@{domain}", local.to_lowercase()),
            MailboxNaming::Domain => domain,
        };
        if name.is_empty() || addr.user().is_empty() || addr.domain().is_empty() {
            return Err(PolicyError::BadAddress(addr.to_string()));
        }
        Ok(name)
    }

    /// Resolve a name supplied by a retrieval interface (REST path,
    /// POP3 USER). Full addresses go through the naming policy;
    /// anything else is taken as an already-canonical name.
    pub fn resolve_name(&self, raw: &str) -> Result<String, PolicyError> {
        if raw.contains('@') {
            let addr = EnvelopeAddress::parse(raw)
                .map_err(|_| PolicyError::BadAddress(raw.to_string()))?;
            self.canonical_mailbox(&addr)
        } else if raw.is_empty() {
            Err(PolicyError::BadAddress(raw.to_string()))
        } else {
            Ok(raw.to_lowercase())
        }
    }

    pub fn evaluate(&self, addr: &EnvelopeAddress) -> Result<Verdict, PolicyError> {
        let mailbox = self.canonical_mailbox(addr)?;
        let domain = addr.domain().to_ascii_lowercase();

        // The denylist dominates everything else.
        let denied = self
            .reject_domains
            .iter()
            .any(|d| d.eq_ignore_ascii_case(&domain) || d.eq_ignore_ascii_case(&mailbox));

        let accept = !denied
            && (self
                .accept_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&domain))
                || self.default_accept);
        let store = !denied
            && (self
                .store_domains
                .iter()
                .any(|d| d.eq_ignore_ascii_case(&domain))
                || self.default_store);

        Ok(Verdict {
            mailbox,
            accept,
            store,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use k9::assert_equal;

    fn addr(text: &str) -> EnvelopeAddress {
        EnvelopeAddress::parse(text).unwrap()
    }

    #[test]
    fn naming_modes() {
        let mut policy = AddressPolicy::default();
        assert_equal!(
            policy.canonical_mailbox(&addr("Bob@Example.COM")).unwrap(),
            "bob"
        );
        policy.naming = MailboxNaming::Full;
        assert_equal!(
            policy.canonical_mailbox(&addr("Bob@Example.COM")).unwrap(),
            "bob@example.com"
        );
        policy.naming = MailboxNaming::Domain;
        assert_equal!(
            policy.canonical_mailbox(&addr("Bob@Example.COM")).unwrap(),
            "example.com"
        );
    }

    #[test]
    fn empty_parts_are_bad_addresses() {
        let policy = AddressPolicy::default();
        assert!(policy.canonical_mailbox(&addr("@example.com")).is_err());
        assert!(policy.canonical_mailbox(&addr("bob@")).is_err());
        assert!(policy
            .canonical_mailbox(&EnvelopeAddress::null_sender())
            .is_err());
    }

    #[test]
    fn store_domains_gate_storage() {
        let policy = AddressPolicy {
            default_store: false,
            store_domains: vec!["allowed.com".to_string()],
            ..Default::default()
        };
        let ok = policy.evaluate(&addr("a@Allowed.Com")).unwrap();
        assert!(ok.accept && ok.store);
        let nope = policy.evaluate(&addr("nope@other.com")).unwrap();
        assert!(nope.accept);
        assert!(!nope.store);
    }

    #[test]
    fn reject_domains_dominate() {
        let policy = AddressPolicy {
            accept_domains: vec!["spam.example".to_string()],
            reject_domains: vec!["spam.example".to_string()],
            ..Default::default()
        };
        let verdict = policy.evaluate(&addr("x@spam.example")).unwrap();
        assert!(!verdict.accept);
        assert!(!verdict.store);
    }

    #[test]
    fn reject_list_also_matches_canonical_names() {
        let policy = AddressPolicy {
            naming: MailboxNaming::Local,
            reject_domains: vec!["noreply".to_string()],
            ..Default::default()
        };
        let verdict = policy.evaluate(&addr("NoReply@anything.example")).unwrap();
        assert!(!verdict.accept);
    }

    #[test]
    fn resolve_name_handles_addresses_and_bare_names() {
        let policy = AddressPolicy::default();
        assert_equal!(policy.resolve_name("Bob@Example.com").unwrap(), "bob");
        assert_equal!(policy.resolve_name("Bob").unwrap(), "bob");
        assert!(policy.resolve_name("").is_err());
    }
}
