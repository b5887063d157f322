//! Target user resolution and ownership fix-ups.

use crate::config::types::{Result, SandboxError};
use nix::unistd::{chown, Gid, Uid, User};
use std::path::{Path, PathBuf};

/// Identity the sandboxed command runs as.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UserIdentity {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: PathBuf,
}

/// Resolve a user name, or a numeric uid, through the system user database.
pub fn lookup_user(name: &str) -> Result<UserIdentity> {
    if name.is_empty() {
        return Err(SandboxError::Credentials("user must be set".to_string()));
    }

    let found = match name.parse::<u32>() {
        Ok(uid) => User::from_uid(Uid::from_raw(uid)),
        Err(_) => User::from_name(name),
    }
    .map_err(|e| SandboxError::Credentials(format!("lookup of {} failed: {}", name, e)))?;

    let user = found.ok_or_else(|| SandboxError::Credentials(format!("no such user: {}", name)))?;

    Ok(UserIdentity {
        name: user.name,
        uid: user.uid.as_raw(),
        gid: user.gid.as_raw(),
        home: user.dir,
    })
}

/// Hand ownership of the output pipes to the sandbox user.
pub fn chown_pipes(out_pipe: &Path, err_pipe: &Path, uid: u32, gid: u32) -> Result<()> {
    for pipe in [out_pipe, err_pipe] {
        chown(pipe, Some(Uid::from_raw(uid)), Some(Gid::from_raw(gid))).map_err(|e| {
            SandboxError::Credentials(format!("chown {}: {}", pipe.display(), e))
        })?;
    }
    log::debug!("Pipes owned by {}:{}", uid, gid);
    Ok(())
}
