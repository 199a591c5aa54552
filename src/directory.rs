use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use ldap3::dn_escape;
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use tracing::{info, warn};

use crate::config::{DirectorySettings, DirectoryUser};
use crate::error::{BootstrapError, Provisioned, Result};
use crate::ldap::{DirectoryBackend, DirectoryEntry, LdapSession};

const SSHA_SALT_BYTES: usize = 8;
const HOME_DIR_PREFIX: &str = "/home/user";

/// Idempotent creation of OUs, posix groups and users.
///
/// Owns the only directory session of the run; [`DirectoryProvisioner::close`]
/// is its single teardown point.
pub struct DirectoryProvisioner<B> {
    backend: B,
    dc: String,
    groups_dn: String,
    users_dn: String,
}

impl DirectoryProvisioner<LdapSession> {
    /// Binds to the configured directory.
    ///
    /// # Errors
    /// Returns an error if the server cannot be reached or refuses the bind.
    pub async fn connect(settings: &DirectorySettings) -> Result<Self> {
        let session = LdapSession::connect(settings).await?;
        Ok(Self::new(session, settings))
    }
}

impl<B: DirectoryBackend> DirectoryProvisioner<B> {
    pub fn new(backend: B, settings: &DirectorySettings) -> Self {
        Self {
            backend,
            dc: settings.dc.clone(),
            groups_dn: settings.groups_dn(),
            users_dn: settings.users_dn(),
        }
    }

    /// # Errors
    /// Returns the directory's rejection, if any.
    pub async fn ensure_organizational_unit(&mut self, name: &str) -> Result<Provisioned> {
        let entry = DirectoryEntry::new(format!("ou={},{}", dn_escape(name), self.dc))
            .with("objectClass", &["top", "organizationalUnit"])
            .with("ou", &[name]);
        self.add("OU", name, &entry).await
    }

    /// Creates posix group `name` with `gid` under the groups OU.
    ///
    /// # Errors
    /// Returns the directory's rejection, if any.
    pub async fn ensure_group(&mut self, name: &str, gid: u32) -> Result<Provisioned> {
        let gid = gid.to_string();
        let entry = DirectoryEntry::new(format!("cn={},{}", dn_escape(name), self.groups_dn))
            .with("objectClass", &["top", "posixGroup"])
            .with("cn", &[name])
            .with("gidNumber", &[&gid]);
        self.add("group", name, &entry).await
    }

    /// Creates a posix account for `user` under the users OU.
    ///
    /// # Errors
    /// Returns an error if the password cannot be hashed or the directory
    /// rejects the entry.
    pub async fn ensure_user(
        &mut self,
        user: &DirectoryUser,
        uid_number: u32,
        gid: u32,
    ) -> Result<Provisioned> {
        let password = hash_password(&user.password)?;
        let entry = user_entry(&self.users_dn, user, &password, uid_number, gid);
        self.add("user", &user.uid, &entry).await
    }

    /// Releases the directory session.
    ///
    /// # Errors
    /// Returns an error if the unbind request fails.
    pub async fn close(mut self) -> Result<()> {
        self.backend.unbind().await
    }

    async fn add(&mut self, kind: &str, name: &str, entry: &DirectoryEntry) -> Result<Provisioned> {
        let outcome = self.backend.add_entry(entry).await?;
        match outcome {
            Provisioned::Created => info!("{kind} {name}: created ({})", entry.dn),
            Provisioned::AlreadyExists => warn!("{kind} {name}: already exists ({})", entry.dn),
        }
        Ok(outcome)
    }
}

/// Pairs each name with `base + position`. Ids depend only on declaration
/// order, so re-runs assign the same ids.
pub fn assign_ids<S: AsRef<str>>(names: &[S], base: u32) -> Vec<(&str, u32)> {
    names
        .iter()
        .zip(base..)
        .map(|(name, id)| (name.as_ref(), id))
        .collect()
}

fn user_entry(
    users_dn: &str,
    user: &DirectoryUser,
    password: &str,
    uid_number: u32,
    gid: u32,
) -> DirectoryEntry {
    let common_name = format!("{} {}", user.first_name, user.last_name);
    let uid_number = uid_number.to_string();
    let gid = gid.to_string();
    let home = format!("{HOME_DIR_PREFIX}/{}", user.uid);
    DirectoryEntry::new(format!("cn={},{users_dn}", dn_escape(common_name.as_str())))
        .with("objectClass", &["inetOrgPerson", "posixAccount", "top"])
        .with("givenName", &[&user.first_name])
        .with("sn", &[&user.last_name])
        .with("cn", &[&common_name])
        .with("uid", &[&user.uid])
        .with("userPassword", &[password])
        .with("uidNumber", &[&uid_number])
        .with("gidNumber", &[&gid])
        .with("homeDirectory", &[&home])
}

fn hash_password(password: &str) -> Result<String> {
    let mut salt = [0u8; SSHA_SALT_BYTES];
    SystemRandom::new()
        .fill(&mut salt)
        .map_err(|_| BootstrapError::precondition("Failed to generate password salt"))?;
    Ok(ssha(password, &salt))
}

/// `{SSHA}` userPassword value as understood by OpenLDAP.
fn ssha(password: &str, salt: &[u8]) -> String {
    let mut ctx = digest::Context::new(&digest::SHA1_FOR_LEGACY_USE_ONLY);
    ctx.update(password.as_bytes());
    ctx.update(salt);
    let mut payload = ctx.finish().as_ref().to_vec();
    payload.extend_from_slice(salt);
    format!("{{SSHA}}{}", STANDARD.encode(payload))
}
