//! OS identity resolution for privilege demotion.
//!
//! A student handle maps to a local OS account; the resolved identity is
//! what the process runner demotes the grading child to before any
//! submitted code executes. Identities are resolved fresh for every run —
//! account state on the host can change between submissions, so nothing
//! here is cached.

use thiserror::Error;

/// Resolved OS account for a student handle.
///
/// `groups` is the full supplementary group list, not just the primary
/// gid. The demoted child must carry exactly the group permissions the
/// real account has; dropping to the primary group alone would leave the
/// child either over- or under-privileged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OsIdentity {
    pub login: String,
    pub uid: u32,
    pub gid: u32,
    pub groups: Vec<u32>,
    pub home: std::path::PathBuf,
    pub shell: std::path::PathBuf,
}

/// Whether a run can be demoted, and to what.
#[derive(Debug, Clone)]
pub enum Demotion {
    /// Drop to this identity before executing the script.
    Drop(OsIdentity),
    /// The platform has no multi-user process separation. The run
    /// proceeds with the server's own privileges and is audit-logged as
    /// degraded-security.
    Unavailable,
}

#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("no OS account matches student handle '{0}'")]
    UnknownIdentity(String),
    #[error("failed to resolve OS account for '{handle}': {source}")]
    Lookup {
        handle: String,
        #[source]
        source: std::io::Error,
    },
}

/// Identity lookup seam, mockable in orchestrator tests.
pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, handle: &str) -> Result<Demotion, IdentityError>;
}

/// Resolver backed by the host account database.
pub struct SystemResolver;

impl IdentityResolver for SystemResolver {
    fn resolve(&self, handle: &str) -> Result<Demotion, IdentityError> {
        resolve(handle)
    }
}

/// Resolve the OS account for a student handle.
///
/// Returns `Demotion::Unavailable` on platforms without user separation
/// rather than failing — blocking grading entirely is judged worse than
/// an unsandboxed run there.
#[cfg(unix)]
pub fn resolve(handle: &str) -> Result<Demotion, IdentityError> {
    use nix::unistd::{getgrouplist, User};
    use std::ffi::CString;

    let user = User::from_name(handle)
        .map_err(|errno| IdentityError::Lookup {
            handle: handle.to_string(),
            source: errno.into(),
        })?
        .ok_or_else(|| IdentityError::UnknownIdentity(handle.to_string()))?;

    let login = CString::new(user.name.as_str()).map_err(|_| IdentityError::Lookup {
        handle: handle.to_string(),
        source: std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "login name contains NUL byte",
        ),
    })?;

    let groups = getgrouplist(&login, user.gid)
        .map_err(|errno| IdentityError::Lookup {
            handle: handle.to_string(),
            source: errno.into(),
        })?
        .into_iter()
        .map(nix::unistd::Gid::as_raw)
        .collect();

    Ok(Demotion::Drop(OsIdentity {
        login: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        groups,
        home: user.dir,
        shell: user.shell,
    }))
}

#[cfg(not(unix))]
pub fn resolve(handle: &str) -> Result<Demotion, IdentityError> {
    let _ = handle;
    tracing::warn!("Cannot demote subprocess outside of a POSIX system");
    Ok(Demotion::Unavailable)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn resolve_root_account() {
        // Every POSIX host has a root account.
        let demotion = resolve("root").unwrap();
        match demotion {
            Demotion::Drop(identity) => {
                assert_eq!(identity.uid, 0);
                assert_eq!(identity.login, "root");
                // getgrouplist always includes the primary group
                assert!(identity.groups.contains(&identity.gid));
            }
            Demotion::Unavailable => panic!("demotion should be available on unix"),
        }
    }

    #[test]
    fn unknown_handle_is_rejected() {
        let err = resolve("no-such-student-xyzzy").unwrap_err();
        assert!(matches!(err, IdentityError::UnknownIdentity(_)));
    }
}
