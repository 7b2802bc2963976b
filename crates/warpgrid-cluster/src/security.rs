//! Join credentials.

use tracing::debug;

use crate::address::Address;
use crate::join::{Credentials, digest, digests_match};

/// Issues and checks the credentials carried by join requests.
pub trait SecurityContext: Send + Sync {
    /// Credentials this node presents when joining.
    fn new_credentials(&self, endpoint: &Address) -> Credentials;

    /// Whether a joiner's credentials are acceptable.
    fn verify(&self, credentials: &Credentials) -> bool;

    /// Release any resources held by the context.
    fn destroy(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Credentials derived from the cluster group name and password.
pub struct GroupSecurityContext {
    group_name: String,
    token: String,
}

impl GroupSecurityContext {
    pub fn new(group_name: impl Into<String>, password: &str) -> Self {
        let group_name = group_name.into();
        let token = digest(&format!("credentials:{group_name}:{password}"));
        Self { group_name, token }
    }
}

impl SecurityContext for GroupSecurityContext {
    fn new_credentials(&self, endpoint: &Address) -> Credentials {
        Credentials {
            principal: self.group_name.clone(),
            endpoint: endpoint.to_string(),
            token: self.token.clone(),
        }
    }

    fn verify(&self, credentials: &Credentials) -> bool {
        let ok = credentials.principal == self.group_name
            && digests_match(&credentials.token, &self.token);
        if !ok {
            debug!(endpoint = %credentials.endpoint, "credentials rejected");
        }
        ok
    }

    fn destroy(&self) -> anyhow::Result<()> {
        debug!(group = %self.group_name, "security context destroyed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::ConfigFingerprint;

    #[test]
    fn same_group_and_password_verify() {
        let endpoint: Address = "10.0.0.1:5701".parse().unwrap();
        let a = GroupSecurityContext::new("dev", "secret");
        let b = GroupSecurityContext::new("dev", "secret");
        assert!(b.verify(&a.new_credentials(&endpoint)));
    }

    #[test]
    fn wrong_password_fails() {
        let endpoint: Address = "10.0.0.1:5701".parse().unwrap();
        let a = GroupSecurityContext::new("dev", "secret");
        let b = GroupSecurityContext::new("dev", "other");
        assert!(!b.verify(&a.new_credentials(&endpoint)));
    }

    #[test]
    fn password_alone_does_not_carry_across_groups() {
        let endpoint: Address = "10.0.0.1:5701".parse().unwrap();
        let dev = GroupSecurityContext::new("dev", "secret");
        let prod = GroupSecurityContext::new("prod", "secret");

        let mut forged = dev.new_credentials(&endpoint);
        forged.principal = "prod".into();
        assert!(!prod.verify(&forged));
    }

    #[test]
    fn advertised_fingerprint_is_not_a_token() {
        let endpoint: Address = "10.0.0.1:5701".parse().unwrap();
        let ctx = GroupSecurityContext::new("dev", "secret");
        let fingerprint = ConfigFingerprint::new("dev", "secret", 271, Default::default());

        let mut replayed = ctx.new_credentials(&endpoint);
        replayed.token = fingerprint.password_digest;
        assert!(!ctx.verify(&replayed));
    }

    #[test]
    fn truncated_token_fails() {
        let endpoint: Address = "10.0.0.1:5701".parse().unwrap();
        let ctx = GroupSecurityContext::new("dev", "secret");
        let mut credentials = ctx.new_credentials(&endpoint);
        credentials.token.truncate(63);
        assert!(!ctx.verify(&credentials));
    }
}
