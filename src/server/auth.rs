// ABOUTME: Client authentication policy for the shell server.
// ABOUTME: A closed set of policies; each applies only to the method it names.

use russh::keys::ssh_key::PublicKey;
use russh::{MethodKind, MethodSet};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Placeholder in an authorized_keys path replaced by the login user.
pub const USER_PLACEHOLDER: &str = "{user}";

/// How clients prove who they are.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum AuthPolicy {
    /// Reject every attempt.
    #[default]
    DenyAll,
    /// Accept any public key or password. Only for tests and sealed networks.
    AcceptAll,
    /// Public keys listed in an OpenSSH authorized_keys file.
    /// `{user}` in the path is replaced by the login name.
    AuthorizedKeys { path: PathBuf },
    /// A single shared password.
    Password { password: String },
}

impl std::fmt::Debug for AuthPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthPolicy::DenyAll => f.write_str("DenyAll"),
            AuthPolicy::AcceptAll => f.write_str("AcceptAll"),
            AuthPolicy::AuthorizedKeys { path } => f
                .debug_struct("AuthorizedKeys")
                .field("path", path)
                .finish(),
            AuthPolicy::Password { .. } => f.write_str("Password(<redacted>)"),
        }
    }
}

impl AuthPolicy {
    pub async fn check_public_key(&self, user: &str, key: &PublicKey) -> bool {
        match self {
            AuthPolicy::AcceptAll => true,
            AuthPolicy::AuthorizedKeys { path } => {
                let Some(path) = user_path(path, user) else {
                    tracing::warn!(user, "Refusing key login for an unsafe user name");
                    return false;
                };
                match load_authorized_keys(&path).await {
                    Ok(keys) => keys.iter().any(|k| k.key_data() == key.key_data()),
                    Err(e) => {
                        tracing::warn!(user, "Cannot read {}: {}", path.display(), e);
                        false
                    }
                }
            }
            AuthPolicy::DenyAll | AuthPolicy::Password { .. } => false,
        }
    }

    pub fn check_password(&self, password: &str) -> bool {
        match self {
            AuthPolicy::AcceptAll => true,
            AuthPolicy::Password { password: expected } => {
                constant_time_eq(expected.as_bytes(), password.as_bytes())
            }
            AuthPolicy::DenyAll | AuthPolicy::AuthorizedKeys { .. } => false,
        }
    }

    pub fn accepts_public_keys(&self) -> bool {
        matches!(self, AuthPolicy::AcceptAll | AuthPolicy::AuthorizedKeys { .. })
    }

    pub fn accepts_passwords(&self) -> bool {
        matches!(self, AuthPolicy::AcceptAll | AuthPolicy::Password { .. })
    }

    /// Methods advertised to clients; the rest are never offered.
    pub fn methods(&self) -> MethodSet {
        let mut kinds = Vec::with_capacity(2);
        if self.accepts_public_keys() {
            kinds.push(MethodKind::PublicKey);
        }
        if self.accepts_passwords() {
            kinds.push(MethodKind::Password);
        }
        MethodSet::from(&kinds[..])
    }
}

/// Login names that may stand in for `{user}` in a path.
pub fn is_safe_user_name(user: &str) -> bool {
    !user.is_empty()
        && !user.starts_with('-')
        && !user.starts_with('.')
        && !user.contains(['/', '\\', '\0'])
}

/// Expand `{user}` in `path`, or `None` when the name could escape the directory.
fn user_path(path: &Path, user: &str) -> Option<PathBuf> {
    let raw = path.to_string_lossy();
    if !raw.contains(USER_PLACEHOLDER) {
        return Some(path.to_path_buf());
    }
    is_safe_user_name(user).then(|| PathBuf::from(raw.replace(USER_PLACEHOLDER, user)))
}

/// Parse an authorized_keys file. Blank lines and comments are skipped,
/// unparseable lines are logged and skipped.
pub async fn load_authorized_keys(path: &Path) -> std::io::Result<Vec<PublicKey>> {
    let content = tokio::fs::read_to_string(path).await?;
    Ok(parse_authorized_keys(&content))
}

fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    content
        .lines()
        .enumerate()
        .map(|(n, line)| (n, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|(n, line)| match PublicKey::from_openssh(line) {
            Ok(key) => Some(key),
            Err(e) => {
                tracing::debug!("Skipping authorized_keys line {}: {}", n + 1, e);
                None
            }
        })
        .collect()
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, PrivateKey};

    fn random_public_key() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[tokio::test]
    async fn deny_all_rejects_everything() {
        let policy = AuthPolicy::DenyAll;
        assert!(!policy.check_public_key("ops", &random_public_key()).await);
        assert!(!policy.check_password("hunter2"));
    }

    #[tokio::test]
    async fn password_policy_ignores_keys() {
        let policy = AuthPolicy::Password {
            password: "hunter2".to_string(),
        };
        assert!(policy.check_password("hunter2"));
        assert!(!policy.check_password("hunter3"));
        assert!(!policy.check_public_key("ops", &random_public_key()).await);
    }

    #[tokio::test]
    async fn authorized_keys_match_by_key_data() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = random_public_key();
        let line = allowed.to_openssh().unwrap();
        std::fs::write(
            dir.path().join("ops.keys"),
            format!("# team keys\n\nnot-a-key\n{}\n", line),
        )
        .unwrap();

        let policy = AuthPolicy::AuthorizedKeys {
            path: dir.path().join("{user}.keys"),
        };
        assert!(policy.check_public_key("ops", &allowed).await);
        assert!(!policy.check_public_key("ops", &random_public_key()).await);
        // No file for this user.
        assert!(!policy.check_public_key("guest", &allowed).await);
        assert!(!policy.check_password("anything"));
    }

    #[test]
    fn each_policy_offers_only_its_methods() {
        assert!(!AuthPolicy::DenyAll.accepts_public_keys());
        assert!(!AuthPolicy::DenyAll.accepts_passwords());
        assert!(AuthPolicy::AcceptAll.accepts_public_keys());
        assert!(AuthPolicy::AcceptAll.accepts_passwords());

        let keys = AuthPolicy::AuthorizedKeys {
            path: PathBuf::from("/etc/burrow/authorized_keys"),
        };
        assert!(keys.accepts_public_keys());
        assert!(!keys.accepts_passwords());

        let password = AuthPolicy::Password {
            password: "s3cret".to_string(),
        };
        assert!(!password.accepts_public_keys());
        assert!(password.accepts_passwords());
    }

    #[test]
    fn user_names_cannot_leave_the_key_directory() {
        let template = Path::new("/home/{user}/.ssh/authorized_keys");
        assert_eq!(
            user_path(template, "ops"),
            Some(PathBuf::from("/home/ops/.ssh/authorized_keys"))
        );
        for user in ["../../tmp/evil", "..", "a/b", "-oops", "", "nul\0byte", ".hidden"] {
            assert_eq!(user_path(template, user), None, "{:?} must be refused", user);
        }
        // Fixed paths never look at the name.
        assert!(user_path(Path::new("/etc/burrow/keys"), "../x").is_some());
    }

    #[tokio::test]
    async fn traversal_user_is_denied_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let allowed = random_public_key();
        let evil = dir.path().join("evil");
        std::fs::create_dir_all(evil.join(".ssh")).unwrap();
        std::fs::write(
            evil.join(".ssh/authorized_keys"),
            allowed.to_openssh().unwrap(),
        )
        .unwrap();
        std::fs::create_dir_all(dir.path().join("home")).unwrap();

        let policy = AuthPolicy::AuthorizedKeys {
            path: dir.path().join("home/{user}/.ssh/authorized_keys"),
        };
        assert!(!policy.check_public_key("../evil", &allowed).await);
    }

    #[test]
    fn password_is_not_printed() {
        let policy = AuthPolicy::Password {
            password: "hunter2".to_string(),
        };
        assert!(!format!("{:?}", policy).contains("hunter2"));
    }

    #[test]
    fn policy_parses_from_yaml() {
        let policy: AuthPolicy =
            serde_yaml::from_str("method: authorized_keys\npath: /home/{user}/.ssh/authorized_keys\n")
                .unwrap();
        assert_eq!(
            policy,
            AuthPolicy::AuthorizedKeys {
                path: PathBuf::from("/home/{user}/.ssh/authorized_keys")
            }
        );
        let policy: AuthPolicy = serde_yaml::from_str("method: deny_all\n").unwrap();
        assert_eq!(policy, AuthPolicy::DenyAll);
    }
}
