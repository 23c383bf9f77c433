//! Identity and privilege switching (§4.1).
//!
//! The engine runs SUID-root: it starts with an elevated effective identity,
//! does privileged setup (mounts, bundle assembly), then permanently drops
//! to the invoking user's identity before ever executing user-controlled
//! code. Every switch saves the identity in effect beforehand, so a failed
//! step can restore it rather than leave the process in a half-dropped
//! state.

use nix::sys::prctl;
use nix::unistd::{self, Gid, Uid};

use crate::error::{Error, ErrorKind};

/// A uid/gid/supplementary-groups triple to switch to or restore.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Target real/effective/saved uid.
    pub uid: Uid,
    /// Target real/effective/saved gid.
    pub gid: Gid,
    /// Supplementary group list.
    pub supplementary_gids: Vec<Gid>,
}

impl Identity {
    /// Captures the process's current real uid/gid and supplementary
    /// groups, to be restored later if a privilege switch fails partway.
    pub fn current() -> Result<Self, Error> {
        let uid = unistd::getuid();
        let gid = unistd::getgid();
        let supplementary_gids = unistd::getgroups()
            .map_err(|e| Error::from(ErrorKind::Identity(format!("getgroups: {e}"))))?;
        Ok(Self {
            uid,
            gid,
            supplementary_gids,
        })
    }

    /// Switches real, effective, and saved uid/gid and supplementary groups
    /// to this identity.
    ///
    /// On any failed step, attempts to restore `saved` before returning
    /// the original error — per §7, an `IdentityError` always leads to a
    /// restoration attempt.
    pub fn switch_to(&self, saved: &Identity) -> Result<(), Error> {
        self.try_switch().map_err(|e| {
            if let Err(restore_err) = saved.try_switch() {
                tracing::error!(
                    error = %restore_err,
                    "failed to restore identity after a failed privilege switch",
                );
            }
            e
        })
    }

    fn try_switch(&self) -> Result<(), Error> {
        unistd::setgroups(&self.supplementary_gids)
            .map_err(|e| Error::from(ErrorKind::Identity(format!("setgroups: {e}"))))?;
        unistd::setresgid(self.gid, self.gid, self.gid)
            .map_err(|e| Error::from(ErrorKind::Identity(format!("setresgid: {e}"))))?;
        unistd::setresuid(self.uid, self.uid, self.uid)
            .map_err(|e| Error::from(ErrorKind::Identity(format!("setresuid: {e}"))))?;
        Ok(())
    }
}

/// Sets the filesystem uid used for permission checks, independent of the
/// effective uid, and returns the uid that was previously in effect.
///
/// `nix` has no dedicated read-only accessor, so the previous value is
/// obtained the same way the underlying syscall itself documents: calling
/// `setfsuid` with an intentionally invalid uid and inspecting the value it
/// returns, then restoring nothing (the caller decides whether to call this
/// again to revert).
pub fn set_fsuid(uid: Uid) -> Uid {
    unistd::setfsuid(uid)
}

/// Reads the filesystem uid currently in effect without changing it.
pub fn current_fsuid() -> Uid {
    let invalid = Uid::from_raw(u32::MAX);
    let previous = unistd::setfsuid(invalid);
    unistd::setfsuid(previous);
    previous
}

/// Drops every capability from the bounding set, clears supplementary
/// groups, sets real/effective/saved uid and gid to `target`, and sets
/// `no_new_privs` — the terminal step before handing control to an
/// unprivileged external runtime (§4.14 step 9).
///
/// The bounding-set drop loop mirrors the `PR_CAPBSET_DROP` iteration
/// pattern: capability numbers are tried from 0 upward until the kernel
/// returns `EINVAL`, which marks the first value past the highest capability
/// it knows about.
pub fn drop_all_privileges_and_exec_noexec(target: &Identity) -> Result<(), Error> {
    for cap in 0.. {
        let rc = unsafe { libc::prctl(libc::PR_CAPBSET_DROP, cap, 0, 0, 0) };
        if rc == 0 {
            continue;
        }
        let errno = nix::errno::Errno::last();
        if errno == nix::errno::Errno::EINVAL {
            break;
        }
        return Err(Error::from(ErrorKind::Identity(format!(
            "prctl(PR_CAPBSET_DROP, {cap}): {errno}"
        ))));
    }

    unistd::setgroups(&[])
        .map_err(|e| Error::from(ErrorKind::Identity(format!("setgroups: {e}"))))?;
    unistd::setresgid(target.gid, target.gid, target.gid)
        .map_err(|e| Error::from(ErrorKind::Identity(format!("setresgid: {e}"))))?;
    unistd::setresuid(target.uid, target.uid, target.uid)
        .map_err(|e| Error::from(ErrorKind::Identity(format!("setresuid: {e}"))))?;

    prctl::set_no_new_privs()
        .map_err(|e| Error::from(ErrorKind::Identity(format!("set_no_new_privs: {e}"))))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn current_identity_matches_process() {
        let identity = Identity::current().unwrap();
        assert_eq!(identity.uid, unistd::getuid());
        assert_eq!(identity.gid, unistd::getgid());
    }
}
