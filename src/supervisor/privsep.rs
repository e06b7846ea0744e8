//! Privilege separation primitives (spec.md §4.I).
//!
//! Thin, testable wrappers over `nix`'s raw syscalls, grounded on
//! `original_source`'s `agentd/privsep.h` (`privsep_lookup_usergroup`,
//! `privsep_chroot`, `privsep_drop_privileges`, `privsep_setfds`,
//! `privsep_close_standard_fds`, `privsep_exec_private`). Unix-only: a
//! privilege-separated supervisor has no meaning on a platform without
//! fork/setuid/chroot.

use std::ffi::CString;
use std::os::unix::io::RawFd;

use nix::unistd::{Gid, Uid};

use crate::error::{CoreError, CoreResult, ServiceTag};

/// `privsep_lookup_usergroup`: resolves a user and group name to numeric
/// ids via the system's NSS databases.
pub fn lookup_usergroup(user: &str, group: &str) -> CoreResult<(Uid, Gid)> {
    let user_cstr = CString::new(user)
        .map_err(|_| CoreError::status(ServiceTag::Supervisor, 0x0001))?;
    let group_cstr = CString::new(group)
        .map_err(|_| CoreError::status(ServiceTag::Supervisor, 0x0001))?;

    let passwd = unsafe { libc::getpwnam(user_cstr.as_ptr()) };
    if passwd.is_null() {
        return Err(CoreError::status(ServiceTag::Supervisor, 0x0002));
    }
    let uid = Uid::from_raw(unsafe { (*passwd).pw_uid });

    let group_entry = unsafe { libc::getgrnam(group_cstr.as_ptr()) };
    if group_entry.is_null() {
        return Err(CoreError::status(ServiceTag::Supervisor, 0x0003));
    }
    let gid = Gid::from_raw(unsafe { (*group_entry).gr_gid });

    Ok((uid, gid))
}

/// `privsep_chroot`: must run as root.
pub fn chroot(dir: &str) -> CoreResult<()> {
    nix::unistd::chdir(dir).map_err(|e| CoreError::Fatal(anyhow::anyhow!("chdir: {e}")))?;
    nix::unistd::chroot(dir).map_err(|e| CoreError::Fatal(anyhow::anyhow!("chroot: {e}")))?;
    Ok(())
}

/// `privsep_drop_privileges`: sets egid, euid, gid, uid in that order
/// (spec.md §4.I).
pub fn drop_privileges(uid: Uid, gid: Gid) -> CoreResult<()> {
    nix::unistd::setegid(gid).map_err(|e| CoreError::Fatal(anyhow::anyhow!("setegid: {e}")))?;
    nix::unistd::seteuid(uid).map_err(|e| CoreError::Fatal(anyhow::anyhow!("seteuid: {e}")))?;
    nix::unistd::setgid(gid).map_err(|e| CoreError::Fatal(anyhow::anyhow!("setgid: {e}")))?;
    nix::unistd::setuid(uid).map_err(|e| CoreError::Fatal(anyhow::anyhow!("setuid: {e}")))?;
    Ok(())
}

/// `privsep_close_standard_fds`: closes stdin/stdout/stderr.
pub fn close_standard_fds() -> CoreResult<()> {
    for fd in [0, 1, 2] {
        // EBADF means the descriptor was already closed; anything else is
        // a genuine failure worth surfacing.
        if let Err(e) = nix::unistd::close(fd) {
            if e != nix::errno::Errno::EBADF {
                return Err(CoreError::Fatal(anyhow::anyhow!("close({fd}): {e}")));
            }
        }
    }
    Ok(())
}

/// `privsep_setfds`: `dup2`s each `(current, target)` pair into place.
/// Pairs are applied in order; callers pass the descriptors most likely
/// to collide with a low target number last (original_source's own
/// `protect_descriptors`/`setfds` split, collapsed here into one call
/// since this crate builds the target list explicitly rather than
/// deriving it from an inherited fd table at runtime).
pub fn setfds(pairs: &[(RawFd, RawFd)]) -> CoreResult<()> {
    for &(current, target) in pairs {
        if current < 0 || target < 0 {
            return Err(CoreError::status(ServiceTag::Supervisor, 0x0004));
        }
        nix::unistd::dup2(current, target)
            .map_err(|e| CoreError::Fatal(anyhow::anyhow!("dup2({current},{target}): {e}")))?;
    }
    Ok(())
}

/// `privsep_close_other_fds`: closes every open descriptor above `above`.
/// Approximates the original's `/proc/self/fd` (or `closefrom`) scan by
/// probing a bounded range of descriptor numbers, closing whichever are
/// actually open.
pub fn close_other_fds(above: RawFd) -> CoreResult<()> {
    let max_fd = nix::unistd::sysconf(nix::unistd::SysconfVar::OPEN_MAX)
        .map_err(|e| CoreError::Fatal(anyhow::anyhow!("sysconf(OPEN_MAX): {e}")))?
        .unwrap_or(1024);
    for fd in (above + 1)..(max_fd as RawFd) {
        let _ = nix::unistd::close(fd);
    }
    Ok(())
}

/// `privsep_exec_private`: scrubs `PATH`/`LD_LIBRARY_PATH` and execs the
/// current binary with `-P <subcommand>` appended. Does not return on
/// success.
pub fn exec_private(agentd_path: &str, subcommand: &str) -> CoreResult<()> {
    std::env::remove_var("PATH");
    std::env::remove_var("LD_LIBRARY_PATH");

    let program = CString::new(agentd_path)
        .map_err(|_| CoreError::status(ServiceTag::Supervisor, 0x0005))?;
    let arg0 = program.clone();
    let flag = CString::new("-P").unwrap();
    let sub = CString::new(subcommand)
        .map_err(|_| CoreError::status(ServiceTag::Supervisor, 0x0005))?;

    let err = nix::unistd::execv(&program, &[arg0, flag, sub]);
    // execv only returns on failure.
    Err(CoreError::Fatal(anyhow::anyhow!("execv failed: {err:?}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_usergroup_rejects_embedded_nul() {
        assert!(lookup_usergroup("bad\0user", "group").is_err());
    }

    #[test]
    fn setfds_rejects_negative_descriptors() {
        assert!(setfds(&[(-1, 5)]).is_err());
    }
}
